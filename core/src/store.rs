//! Storage traits.
//!
//! Every shared counter (`issued`, `held`, `total_donated`) changes only inside one
//! of these operations, each of which is a single atomic step in the backing store.
//! Read-modify-write outside the store is never used for those fields.
//!
//! # Implementations
//!
//! - `PostgresStore` (in `impact-postgres`): production backend, one transaction per step
//! - `InMemoryStore` (in `impact-testing`): single-lock store for tests and local runs
//!
//! # Dyn Compatibility
//!
//! Like [`LedgerClient`](crate::ledger::LedgerClient), methods return boxed futures so
//! the services can hold `Arc<dyn InventoryStore>` and friends.

use crate::error::StoreError;
use crate::ledger::ReceiptId;
use crate::records::{
    Donation, Donor, Event, ImpactRecord, Reservation, Ticket, TicketStatus,
};
use crate::types::{DonationId, EventId, RequestId, ReservationId, SourceRef, TicketId, UserId};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Result of an attempt to hold one slot of an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// A reservation exists for this `(event, request)` pair.
    Granted {
        /// The reservation (in whatever status it has reached)
        reservation: Reservation,
        /// `false` when the request was seen before and nothing changed
        fresh: bool,
    },
    /// The event was full when this request was first seen. Sticky per request.
    Denied,
    /// No such event.
    EventNotFound,
}

/// Outcome of a guarded state change.
#[derive(Clone, Debug, PartialEq)]
pub enum Transition<T> {
    /// The change was applied; this is the new value.
    Applied(T),
    /// The record was not in the required state; this is its current value.
    Unchanged(T),
}

impl<T> Transition<T> {
    /// The record after the call, whichever branch was taken.
    pub fn into_inner(self) -> T {
        match self {
            Self::Applied(value) | Self::Unchanged(value) => value,
        }
    }

    /// Borrow the record after the call.
    pub const fn value(&self) -> &T {
        match self {
            Self::Applied(value) | Self::Unchanged(value) => value,
        }
    }

    /// Whether this call performed the change.
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Events, their counters and reservations.
pub trait InventoryStore: Send + Sync {
    /// Persist a newly registered event.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if the id is taken.
    fn insert_event(&self, event: Event) -> StoreFuture<'_, ()>;

    /// Load an event with its current counters.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn event(&self, event_id: EventId) -> StoreFuture<'_, Option<Event>>;

    /// Atomically hold one slot for `request_id`.
    ///
    /// In one step: return the existing reservation or recorded denial for this
    /// request if there is one; otherwise increment `held` iff
    /// `issued + held < capacity` and create a `Held` reservation, or record a
    /// denial.
    ///
    /// # Errors
    ///
    /// Database failures. Nothing is changed on error.
    fn reserve(
        &self,
        event_id: EventId,
        request_id: RequestId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, ReserveOutcome>;

    /// Load a reservation.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn reservation(&self, reservation_id: ReservationId) -> StoreFuture<'_, Option<Reservation>>;

    /// `Held → Committed`: `held - 1, issued + 1` in the same step.
    ///
    /// A `Released` reservation is reclaimed (`issued + 1`) if capacity allows,
    /// since the admission it backs already exists on the ledger. `Committed` is
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] when a released slot cannot be reclaimed because the
    /// event is full.
    fn commit_reservation(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Transition<Reservation>>>;

    /// `Held → Released`: `held - 1` in the same step. Other statuses are
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn release_reservation(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Transition<Reservation>>>;

    /// `Held` reservations whose `expires_at <= now`, oldest first.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<Reservation>>;
}

/// Ticket records.
pub trait TicketStore: Send + Sync {
    /// Insert `ticket` unless one already exists for its reservation, and return
    /// the stored ticket either way.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn insert_ticket(&self, ticket: Ticket) -> StoreFuture<'_, Ticket>;

    /// Load a ticket.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn ticket(&self, ticket_id: TicketId) -> StoreFuture<'_, Option<Ticket>>;

    /// The ticket consuming a reservation, if any.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn ticket_for_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> StoreFuture<'_, Option<Ticket>>;

    /// Every ticket owned by `owner_id`, newest first.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn tickets_for_owner(&self, owner_id: UserId) -> StoreFuture<'_, Vec<Ticket>>;

    /// Compare-and-set: overwrite the stored ticket with `ticket` iff its stored
    /// status is still `expected`. Returns whether the write happened.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if the write would duplicate a serial number within
    /// the event or an issuance receipt id.
    fn update_ticket(&self, ticket: Ticket, expected: TicketStatus) -> StoreFuture<'_, bool>;

    /// Tickets in `status` not touched since `updated_before`, oldest first.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn stale_tickets(
        &self,
        status: TicketStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<Ticket>>;

    /// Issued tickets not touched since `updated_before` whose event donates a
    /// non-zero amount per sale but which have no `ticket:{id}` donation yet,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn unsplit_tickets(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<Ticket>>;
}

/// Donors and donations.
pub trait DonationStore: Send + Sync {
    /// Persist a newly registered donor.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if the id is taken.
    fn insert_donor(&self, donor: Donor) -> StoreFuture<'_, ()>;

    /// Load a donor with its running total.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn donor(&self, donor_id: UserId) -> StoreFuture<'_, Option<Donor>>;

    /// Insert `donation` unless one already exists for its source reference, and
    /// return the stored donation either way.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn insert_donation(&self, donation: Donation) -> StoreFuture<'_, Donation>;

    /// Load a donation.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn donation(&self, donation_id: DonationId) -> StoreFuture<'_, Option<Donation>>;

    /// The donation recorded for a source reference, if any.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn donation_by_source(&self, source_ref: &SourceRef) -> StoreFuture<'_, Option<Donation>>;

    /// Every donation of a donor, newest first.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn donations_for_donor(&self, donor_id: UserId) -> StoreFuture<'_, Vec<Donation>>;

    /// `Pending → Confirmed` and `total_donated += amount` as one step.
    ///
    /// Any other status is returned unchanged and the total is not touched.
    ///
    /// # Errors
    ///
    /// Database failures; nothing is changed on error.
    fn confirm_donation(
        &self,
        donation_id: DonationId,
        receipt_id: ReceiptId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Transition<Donation>>>;

    /// `Pending → Failed`. Any other status is returned unchanged.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn fail_donation(
        &self,
        donation_id: DonationId,
        reason: String,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Transition<Donation>>>;

    /// Attach `impact` to a confirmed, unverified donation.
    ///
    /// Already-verified and unconfirmed donations are returned unchanged.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn verify_donation(
        &self,
        donation_id: DonationId,
        impact: ImpactRecord,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Transition<Donation>>>;

    /// `Pending` donations not touched since `updated_before`, oldest first.
    ///
    /// # Errors
    ///
    /// Database failures.
    fn stale_donations(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<Donation>>;
}
