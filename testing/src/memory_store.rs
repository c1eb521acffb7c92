//! In-memory implementation of every storage trait.
//!
//! All state sits behind one mutex, so each trait operation is trivially a
//! single atomic step. Used by the service tests and by `STORE_BACKEND=memory`.

use impact_core::error::StoreError;
use impact_core::ledger::ReceiptId;
use impact_core::records::{
    Donation, DonationStatus, Donor, Event, ImpactRecord, Reservation, ReservationStatus, Ticket,
    TicketStatus,
};
use impact_core::store::{
    DonationStore, InventoryStore, ReserveOutcome, StoreFuture, TicketStore, Transition,
};
use impact_core::types::{
    DonationId, EventId, RequestId, ReservationId, SourceRef, TicketId, UserId,
};
use impact_core::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct State {
    events: HashMap<EventId, Event>,
    reservations: HashMap<ReservationId, Reservation>,
    reservations_by_request: HashMap<(EventId, RequestId), ReservationId>,
    denials: HashSet<(EventId, RequestId)>,
    tickets: HashMap<TicketId, Ticket>,
    tickets_by_reservation: HashMap<ReservationId, TicketId>,
    donors: HashMap<UserId, Donor>,
    donations: HashMap<DonationId, Donation>,
    donations_by_source: HashMap<SourceRef, DonationId>,
    failing_donation_inserts: usize,
}

impl State {
    fn ticket_conflict(&self, ticket: &Ticket) -> Option<String> {
        self.tickets.values().filter(|other| other.id != ticket.id).find_map(|other| {
            if ticket.serial_number.is_some()
                && other.event_id == ticket.event_id
                && other.serial_number == ticket.serial_number
            {
                return Some(format!(
                    "serial {:?} already issued for event {}",
                    ticket.serial_number, ticket.event_id
                ));
            }
            if ticket.issuance_receipt_id.is_some()
                && other.issuance_receipt_id == ticket.issuance_receipt_id
            {
                return Some(format!(
                    "issuance receipt {:?} already recorded on ticket {}",
                    ticket.issuance_receipt_id, other.id
                ));
            }
            None
        })
    }
}

/// Single-lock store for tests and local runs.
///
/// Clones share state.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every reservation of an event, for assertions.
    #[must_use]
    pub fn reservations_for_event(&self, event_id: EventId) -> Vec<Reservation> {
        self.lock()
            .reservations
            .values()
            .filter(|reservation| reservation.event_id == event_id)
            .cloned()
            .collect()
    }

    /// Every ticket of an event, for assertions.
    #[must_use]
    pub fn tickets_for_event(&self, event_id: EventId) -> Vec<Ticket> {
        self.lock()
            .tickets
            .values()
            .filter(|ticket| ticket.event_id == event_id)
            .cloned()
            .collect()
    }

    /// Overwrite a ticket without any guard, to stage inconsistent states in tests.
    pub fn force_ticket(&self, ticket: Ticket) {
        let mut state = self.lock();
        state.tickets_by_reservation.insert(ticket.reservation_id, ticket.id);
        state.tickets.insert(ticket.id, ticket);
    }

    /// Make the next `count` donation inserts fail with a database error.
    pub fn fail_donation_inserts(&self, count: usize) {
        self.lock().failing_donation_inserts += count;
    }

    /// Overwrite a donation without any guard, to stage inconsistent states in tests.
    pub fn force_donation(&self, donation: Donation) {
        let mut state = self.lock();
        state
            .donations_by_source
            .insert(donation.source_ref.clone(), donation.id);
        state.donations.insert(donation.id, donation);
    }
}

fn oldest_first<T: Clone>(
    items: impl Iterator<Item = T>,
    key: impl Fn(&T) -> DateTime<Utc>,
    limit: usize,
) -> Vec<T> {
    let mut items: Vec<T> = items.collect();
    items.sort_by_key(|item| key(item));
    items.truncate(limit);
    items
}

impl InventoryStore for InMemoryStore {
    fn insert_event(&self, event: Event) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.events.contains_key(&event.id) {
                return Err(StoreError::Conflict(format!("event {} exists", event.id)));
            }
            state.events.insert(event.id, event);
            Ok(())
        })
    }

    fn event(&self, event_id: EventId) -> StoreFuture<'_, Option<Event>> {
        Box::pin(async move { Ok(self.lock().events.get(&event_id).cloned()) })
    }

    fn reserve(
        &self,
        event_id: EventId,
        request_id: RequestId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreFuture<'_, ReserveOutcome> {
        Box::pin(async move {
            let mut state = self.lock();
            let key = (event_id, request_id);

            if let Some(existing) = state
                .reservations_by_request
                .get(&key)
                .and_then(|id| state.reservations.get(id))
            {
                return Ok(ReserveOutcome::Granted {
                    reservation: existing.clone(),
                    fresh: false,
                });
            }
            if state.denials.contains(&key) {
                return Ok(ReserveOutcome::Denied);
            }

            let Some(event) = state.events.get_mut(&event_id) else {
                return Ok(ReserveOutcome::EventNotFound);
            };
            if !event.try_hold(now) {
                state.denials.insert(key);
                return Ok(ReserveOutcome::Denied);
            }

            let reservation = Reservation::hold(event_id, key.1.clone(), now, expires_at);
            state.reservations_by_request.insert(key, reservation.id);
            state.reservations.insert(reservation.id, reservation.clone());
            Ok(ReserveOutcome::Granted {
                reservation,
                fresh: true,
            })
        })
    }

    fn reservation(&self, reservation_id: ReservationId) -> StoreFuture<'_, Option<Reservation>> {
        Box::pin(async move { Ok(self.lock().reservations.get(&reservation_id).cloned()) })
    }

    fn commit_reservation(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Transition<Reservation>>> {
        Box::pin(async move {
            let mut state = self.lock();
            let Some(reservation) = state.reservations.get(&reservation_id).cloned() else {
                return Ok(None);
            };
            let Some(event) = state.events.get_mut(&reservation.event_id) else {
                return Err(StoreError::Corrupt(format!(
                    "reservation {reservation_id} references a missing event"
                )));
            };
            match reservation.status {
                ReservationStatus::Committed => return Ok(Some(Transition::Unchanged(reservation))),
                ReservationStatus::Held => event.commit_hold(now),
                ReservationStatus::Released => {
                    if !event.try_hold(now) {
                        return Err(StoreError::Conflict(format!(
                            "released reservation {reservation_id} cannot be reclaimed: event {} is full",
                            event.id
                        )));
                    }
                    event.commit_hold(now);
                }
            }
            let committed = reservation.with_status(ReservationStatus::Committed, now);
            state.reservations.insert(reservation_id, committed.clone());
            Ok(Some(Transition::Applied(committed)))
        })
    }

    fn release_reservation(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Transition<Reservation>>> {
        Box::pin(async move {
            let mut state = self.lock();
            let Some(reservation) = state.reservations.get(&reservation_id).cloned() else {
                return Ok(None);
            };
            if reservation.status != ReservationStatus::Held {
                return Ok(Some(Transition::Unchanged(reservation)));
            }
            if let Some(event) = state.events.get_mut(&reservation.event_id) {
                event.release_hold(now);
            }
            let released = reservation.with_status(ReservationStatus::Released, now);
            state.reservations.insert(reservation_id, released.clone());
            Ok(Some(Transition::Applied(released)))
        })
    }

    fn expired_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<Reservation>> {
        Box::pin(async move {
            let state = self.lock();
            Ok(oldest_first(
                state
                    .reservations
                    .values()
                    .filter(|reservation| reservation.is_expired(now))
                    .cloned(),
                |reservation| reservation.expires_at,
                limit,
            ))
        })
    }
}

impl TicketStore for InMemoryStore {
    fn insert_ticket(&self, ticket: Ticket) -> StoreFuture<'_, Ticket> {
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(existing) = state
                .tickets_by_reservation
                .get(&ticket.reservation_id)
                .and_then(|id| state.tickets.get(id))
            {
                return Ok(existing.clone());
            }
            state
                .tickets_by_reservation
                .insert(ticket.reservation_id, ticket.id);
            state.tickets.insert(ticket.id, ticket.clone());
            Ok(ticket)
        })
    }

    fn ticket(&self, ticket_id: TicketId) -> StoreFuture<'_, Option<Ticket>> {
        Box::pin(async move { Ok(self.lock().tickets.get(&ticket_id).cloned()) })
    }

    fn ticket_for_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> StoreFuture<'_, Option<Ticket>> {
        Box::pin(async move {
            let state = self.lock();
            Ok(state
                .tickets_by_reservation
                .get(&reservation_id)
                .and_then(|id| state.tickets.get(id))
                .cloned())
        })
    }

    fn tickets_for_owner(&self, owner_id: UserId) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let mut tickets: Vec<Ticket> = self
                .lock()
                .tickets
                .values()
                .filter(|ticket| ticket.owner_id == owner_id)
                .cloned()
                .collect();
            tickets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(tickets)
        })
    }

    fn update_ticket(&self, ticket: Ticket, expected: TicketStatus) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut state = self.lock();
            match state.tickets.get(&ticket.id) {
                Some(stored) if stored.status == expected => {}
                _ => return Ok(false),
            }
            if let Some(conflict) = state.ticket_conflict(&ticket) {
                return Err(StoreError::Conflict(conflict));
            }
            state.tickets.insert(ticket.id, ticket);
            Ok(true)
        })
    }

    fn stale_tickets(
        &self,
        status: TicketStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let state = self.lock();
            Ok(oldest_first(
                state
                    .tickets
                    .values()
                    .filter(|ticket| ticket.status == status && ticket.updated_at < updated_before)
                    .cloned(),
                |ticket| ticket.updated_at,
                limit,
            ))
        })
    }

    fn unsplit_tickets(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let state = self.lock();
            let donates = |ticket: &Ticket| {
                state
                    .events
                    .get(&ticket.event_id)
                    .is_some_and(|event| !event.donation_per_ticket().is_zero())
            };
            Ok(oldest_first(
                state
                    .tickets
                    .values()
                    .filter(|ticket| ticket.status.is_issued() && ticket.updated_at < updated_before)
                    .filter(|ticket| donates(ticket))
                    .filter(|ticket| {
                        !state
                            .donations_by_source
                            .contains_key(&SourceRef::for_ticket(ticket.id))
                    })
                    .cloned(),
                |ticket| ticket.updated_at,
                limit,
            ))
        })
    }
}

impl DonationStore for InMemoryStore {
    fn insert_donor(&self, donor: Donor) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.donors.contains_key(&donor.id) {
                return Err(StoreError::Conflict(format!("donor {} exists", donor.id)));
            }
            state.donors.insert(donor.id, donor);
            Ok(())
        })
    }

    fn donor(&self, donor_id: UserId) -> StoreFuture<'_, Option<Donor>> {
        Box::pin(async move { Ok(self.lock().donors.get(&donor_id).cloned()) })
    }

    fn insert_donation(&self, donation: Donation) -> StoreFuture<'_, Donation> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.failing_donation_inserts > 0 {
                state.failing_donation_inserts -= 1;
                return Err(StoreError::Database("connection reset".to_string()));
            }
            if let Some(existing) = state
                .donations_by_source
                .get(&donation.source_ref)
                .and_then(|id| state.donations.get(id))
            {
                return Ok(existing.clone());
            }
            state
                .donations_by_source
                .insert(donation.source_ref.clone(), donation.id);
            state.donations.insert(donation.id, donation.clone());
            Ok(donation)
        })
    }

    fn donation(&self, donation_id: DonationId) -> StoreFuture<'_, Option<Donation>> {
        Box::pin(async move { Ok(self.lock().donations.get(&donation_id).cloned()) })
    }

    fn donation_by_source(&self, source_ref: &SourceRef) -> StoreFuture<'_, Option<Donation>> {
        let source_ref = source_ref.clone();
        Box::pin(async move {
            let state = self.lock();
            Ok(state
                .donations_by_source
                .get(&source_ref)
                .and_then(|id| state.donations.get(id))
                .cloned())
        })
    }

    fn donations_for_donor(&self, donor_id: UserId) -> StoreFuture<'_, Vec<Donation>> {
        Box::pin(async move {
            let mut donations: Vec<Donation> = self
                .lock()
                .donations
                .values()
                .filter(|donation| donation.donor_id == donor_id)
                .cloned()
                .collect();
            donations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(donations)
        })
    }

    fn confirm_donation(
        &self,
        donation_id: DonationId,
        receipt_id: ReceiptId,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Transition<Donation>>> {
        Box::pin(async move {
            let mut state = self.lock();
            let Some(donation) = state.donations.get(&donation_id).cloned() else {
                return Ok(None);
            };
            if donation.status != DonationStatus::Pending {
                return Ok(Some(Transition::Unchanged(donation)));
            }
            let Some(donor) = state.donors.get(&donation.donor_id) else {
                return Err(StoreError::Corrupt(format!(
                    "donation {donation_id} references a missing donor"
                )));
            };
            let corrupt = |err: impact_core::ImpactError| StoreError::Corrupt(err.to_string());
            let credited = donor.credit(donation.amount, now).map_err(corrupt)?;
            let confirmed = donation.confirm(receipt_id, now).map_err(corrupt)?;

            state.donors.insert(credited.id, credited);
            state.donations.insert(donation_id, confirmed.clone());
            Ok(Some(Transition::Applied(confirmed)))
        })
    }

    fn fail_donation(
        &self,
        donation_id: DonationId,
        reason: String,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Transition<Donation>>> {
        Box::pin(async move {
            let mut state = self.lock();
            let Some(donation) = state.donations.get(&donation_id).cloned() else {
                return Ok(None);
            };
            if donation.status != DonationStatus::Pending {
                return Ok(Some(Transition::Unchanged(donation)));
            }
            let failed = donation
                .fail(reason, now)
                .map_err(|err| StoreError::Corrupt(err.to_string()))?;
            state.donations.insert(donation_id, failed.clone());
            Ok(Some(Transition::Applied(failed)))
        })
    }

    fn verify_donation(
        &self,
        donation_id: DonationId,
        impact: ImpactRecord,
        now: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Transition<Donation>>> {
        Box::pin(async move {
            let mut state = self.lock();
            let Some(donation) = state.donations.get(&donation_id).cloned() else {
                return Ok(None);
            };
            match donation.verify(impact, now) {
                Ok(Some(verified)) => {
                    state.donations.insert(donation_id, verified.clone());
                    Ok(Some(Transition::Applied(verified)))
                }
                Ok(None) | Err(_) => Ok(Some(Transition::Unchanged(donation))),
            }
        })
    }

    fn stale_donations(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'_, Vec<Donation>> {
        Box::pin(async move {
            let state = self.lock();
            Ok(oldest_first(
                state
                    .donations
                    .values()
                    .filter(|donation| {
                        donation.status == DonationStatus::Pending
                            && donation.updated_at < updated_before
                    })
                    .cloned(),
                |donation| donation.updated_at,
                limit,
            ))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)] // Test code
mod tests {
    use super::*;
    use crate::mocks::epoch;
    use chrono::Duration;
    use impact_core::records::NewEvent;
    use impact_core::types::{Cause, DonationShare, LedgerAccount, Money};

    async fn seeded(capacity: u32) -> (InMemoryStore, EventId) {
        let store = InMemoryStore::new();
        let event = Event::create(
            NewEvent {
                title: "Concert".to_string(),
                capacity,
                price_per_unit: Money::from_minor(5_000),
                donation_share: DonationShare::NONE,
                cause: Cause::Community,
            },
            epoch(),
        )
        .unwrap();
        let id = event.id;
        store.insert_event(event).await.unwrap();
        (store, id)
    }

    fn request(raw: &str) -> RequestId {
        RequestId::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn repeated_request_returns_the_same_grant() {
        let (store, event_id) = seeded(2).await;
        let expires = epoch() + Duration::minutes(15);

        let first = store.reserve(event_id, request("a"), epoch(), expires).await.unwrap();
        let second = store.reserve(event_id, request("a"), epoch(), expires).await.unwrap();

        let (ReserveOutcome::Granted { reservation: r1, fresh: true }, ReserveOutcome::Granted { reservation: r2, fresh: false }) =
            (first, second)
        else {
            panic!("expected a fresh grant followed by a replay");
        };
        assert_eq!(r1.id, r2.id);
        assert_eq!(store.event(event_id).await.unwrap().unwrap().held, 1);
    }

    #[tokio::test]
    async fn denials_are_sticky_per_request() {
        let (store, event_id) = seeded(1).await;
        let expires = epoch() + Duration::minutes(15);
        let ReserveOutcome::Granted { reservation, .. } =
            store.reserve(event_id, request("a"), epoch(), expires).await.unwrap()
        else {
            panic!("first request should be granted");
        };
        assert_eq!(
            store.reserve(event_id, request("b"), epoch(), expires).await.unwrap(),
            ReserveOutcome::Denied
        );

        store.release_reservation(reservation.id, epoch()).await.unwrap();
        assert_eq!(
            store.reserve(event_id, request("b"), epoch(), expires).await.unwrap(),
            ReserveOutcome::Denied
        );
    }

    #[tokio::test]
    async fn commit_and_release_are_idempotent() {
        let (store, event_id) = seeded(3).await;
        let expires = epoch() + Duration::minutes(15);
        let ReserveOutcome::Granted { reservation, .. } =
            store.reserve(event_id, request("a"), epoch(), expires).await.unwrap()
        else {
            panic!("expected grant");
        };

        assert!(store.commit_reservation(reservation.id, epoch()).await.unwrap().unwrap().is_applied());
        assert!(!store.commit_reservation(reservation.id, epoch()).await.unwrap().unwrap().is_applied());
        assert!(!store.release_reservation(reservation.id, epoch()).await.unwrap().unwrap().is_applied());

        let event = store.event(event_id).await.unwrap().unwrap();
        assert_eq!((event.issued, event.held), (1, 0));
    }

    #[tokio::test]
    async fn confirmation_credits_the_donor_once() {
        let store = InMemoryStore::new();
        let donor = Donor::new("Ada", LedgerAccount::parse("0.0.1").unwrap(), epoch());
        let donor_id = donor.id;
        store.insert_donor(donor).await.unwrap();

        let donation = store
            .insert_donation(Donation::pending(
                donor_id,
                Cause::Health,
                Money::from_minor(100),
                SourceRef::parse("ref1").unwrap(),
                LedgerAccount::parse("0.0.2").unwrap(),
                epoch(),
            ))
            .await
            .unwrap();

        for _ in 0..2 {
            store
                .confirm_donation(donation.id, ReceiptId::new("tx"), epoch())
                .await
                .unwrap();
        }
        let donor = store.donor(donor_id).await.unwrap().unwrap();
        assert_eq!(donor.total_donated, Money::from_minor(100));
    }
}
