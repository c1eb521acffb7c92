//! Issuance coordinator.
//!
//! Turns a granted reservation into a confirmed, uniquely numbered ticket backed
//! by a ledger mint. The protocol per reservation:
//!
//! 1. Insert a `Reserved` ticket, tied 1:1 to the reservation.
//! 2. Compare-and-set `Reserved → Minting`. Only the winner calls the ledger, so a
//!    `Reserved` ticket was provably never submitted.
//! 3. Mint with the key `mint:{event}:{request}`:
//!    - confirmed: `Minting → Active`, then commit the reservation
//!    - rejected: `Minting → Cancelled`, then release the reservation
//!    - no answer: the ticket stays `Minting` for the reconciliation sweep
//!
//! The foreground path never retries a mint whose outcome is unknown.

use crate::allocator::InventoryAllocator;
use crate::ledger::with_deadline;
use crate::metrics;
use impact_core::ImpactError;
use impact_core::environment::Clock;
use impact_core::error::StoreError;
use impact_core::ledger::{LedgerClient, LedgerError, MintMetadata, MintRequest, ReceiptId};
use impact_core::records::{Donor, Reservation, ReservationStatus, Ticket, TicketStatus};
use impact_core::store::{TicketStore, Transition};
use impact_core::types::{ReservationId, TicketId, UserId};
use std::sync::Arc;
use std::time::Duration;

/// Result of an issuance attempt that did not fail deterministically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Issuance {
    /// The mint is confirmed and the ticket is `Active` (or later).
    Confirmed(Ticket),
    /// The mint outcome is unknown; the sweep will resolve it.
    Pending(Ticket),
}

impl Issuance {
    /// The ticket, whichever way the attempt ended.
    #[must_use]
    pub fn ticket(&self) -> &Ticket {
        match self {
            Self::Confirmed(ticket) | Self::Pending(ticket) => ticket,
        }
    }
}

/// Drives reservations through the mint protocol.
#[derive(Clone)]
pub struct IssuanceCoordinator {
    tickets: Arc<dyn TicketStore>,
    allocator: InventoryAllocator,
    ledger: Arc<dyn LedgerClient>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
}

impl IssuanceCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        tickets: Arc<dyn TicketStore>,
        allocator: InventoryAllocator,
        ledger: Arc<dyn LedgerClient>,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            tickets,
            allocator,
            ledger,
            clock,
            call_timeout,
        }
    }

    /// Issue the ticket backed by `reservation_id` to `buyer`.
    ///
    /// Safe to call any number of times: every call after the first reports the
    /// state the first one reached and never mints again.
    ///
    /// # Errors
    ///
    /// - [`ImpactError::NotFound`] for an unknown reservation
    /// - [`ImpactError::Validation`] if the reservation was released before a
    ///   ticket was submitted, or belongs to another buyer
    /// - [`ImpactError::LedgerRejected`] if the mint was refused (now or earlier)
    /// - [`ImpactError::InconsistentState`] if the ledger confirmed a mint the
    ///   local records cannot accept
    #[tracing::instrument(skip_all, fields(reservation_id = %reservation_id, buyer_id = %buyer.id))]
    pub async fn issue(
        &self,
        reservation_id: ReservationId,
        buyer: &Donor,
    ) -> Result<Issuance, ImpactError> {
        let reservation = self.allocator.reservation(reservation_id).await?;

        let ticket = match self.tickets.ticket_for_reservation(reservation_id).await? {
            Some(ticket) => ticket,
            None => {
                if reservation.status == ReservationStatus::Released {
                    return Err(released_before_issue(reservation_id));
                }
                let event = self.allocator.event(reservation.event_id).await?;
                let draft = Ticket::reserved(&reservation, buyer.id, &event, self.clock.now());
                let ticket = self.tickets.insert_ticket(draft.clone()).await?;
                if ticket.id == draft.id {
                    metrics::record_ticket(TicketStatus::Reserved);
                    tracing::debug!(ticket_id = %ticket.id, "Ticket reserved");
                }
                ticket
            }
        };

        if ticket.owner_id != buyer.id {
            return Err(ImpactError::Validation(format!(
                "reservation {reservation_id} belongs to another buyer"
            )));
        }

        if ticket.status == TicketStatus::Reserved {
            self.submit(ticket, &reservation, buyer).await
        } else {
            settled(ticket)
        }
    }

    async fn submit(
        &self,
        ticket: Ticket,
        reservation: &Reservation,
        buyer: &Donor,
    ) -> Result<Issuance, ImpactError> {
        let minting = ticket.mark_minting(self.clock.now())?;
        if !self
            .tickets
            .update_ticket(minting.clone(), TicketStatus::Reserved)
            .await?
        {
            // Another attempt for the same request won the submission.
            return settled(self.load(ticket.id).await?);
        }
        metrics::record_ticket(TicketStatus::Minting);

        // The sweep may have released the slot while the ticket was still Reserved.
        let reservation = self.allocator.reservation(reservation.id).await?;
        if reservation.status == ReservationStatus::Released {
            self.cancel(&minting, "reservation expired before submission")
                .await?;
            return Err(released_before_issue(reservation.id));
        }

        let key = minting.idempotency_key.clone();
        let request = MintRequest {
            key: key.clone(),
            event_id: minting.event_id,
            recipient: buyer.ledger_account.clone(),
            metadata: MintMetadata {
                event_id: minting.event_id,
                buyer_account: buyer.ledger_account.clone(),
                kind: minting.kind,
                purchased_at: reservation.created_at,
            },
        };
        tracing::info!(ticket_id = %minting.id, idempotency_key = %key, "Submitting mint");

        match with_deadline("mint", self.call_timeout, self.ledger.mint(request)).await {
            Ok(receipt) => self
                .confirm_mint(&minting, receipt.receipt_id, receipt.serial)
                .await
                .map(|transition| Issuance::Confirmed(transition.into_inner())),
            Err(LedgerError::Rejected { reason }) => {
                self.cancel(&minting, &reason).await?;
                Err(ImpactError::LedgerRejected {
                    key: key.to_string(),
                    reason,
                })
            }
            Err(err) => {
                tracing::warn!(
                    ticket_id = %minting.id,
                    idempotency_key = %key,
                    error = %err,
                    "Mint outcome unknown; ticket left minting"
                );
                Ok(Issuance::Pending(minting))
            }
        }
    }

    /// `Minting → Active` with the ledger's receipt, then commit the reservation.
    ///
    /// Shared by the foreground path and the sweep. If the other one already
    /// activated the ticket with the same serial, that ticket is returned as
    /// `Unchanged`.
    ///
    /// # Errors
    ///
    /// [`ImpactError::InconsistentState`] if the ticket is in any other state, or
    /// the serial or receipt is already held by another ticket.
    pub(crate) async fn confirm_mint(
        &self,
        ticket: &Ticket,
        receipt_id: ReceiptId,
        serial: u64,
    ) -> Result<Transition<Ticket>, ImpactError> {
        let record = format!("ticket {}", ticket.id);
        let active = ticket.activate(receipt_id, serial, self.clock.now())?;

        let ticket = match self
            .tickets
            .update_ticket(active.clone(), TicketStatus::Minting)
            .await
        {
            Ok(true) => {
                metrics::record_ticket(TicketStatus::Active);
                tracing::info!(
                    ticket_id = %active.id,
                    event_id = %active.event_id,
                    serial,
                    "Ticket active"
                );
                Transition::Applied(active)
            }
            Ok(false) => {
                let current = self.load(ticket.id).await?;
                if !(current.status.is_issued() && current.serial_number == Some(serial)) {
                    return Err(ImpactError::inconsistent(
                        record,
                        format!("ledger minted serial {serial} but the ticket is {}", current.status),
                    ));
                }
                Transition::Unchanged(current)
            }
            Err(StoreError::Conflict(detail)) => {
                return Err(ImpactError::inconsistent(record, detail));
            }
            Err(other) => return Err(other.into()),
        };

        self.allocator.commit(ticket.value().reservation_id).await?;
        Ok(ticket)
    }

    /// Cancel a ticket that was never issued and release its reservation.
    ///
    /// Returns `Unchanged` with the current ticket when it moved on in the
    /// meantime; callers decide whether that is a problem.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub(crate) async fn cancel(
        &self,
        ticket: &Ticket,
        reason: &str,
    ) -> Result<Transition<Ticket>, ImpactError> {
        let cancelled = ticket.cancel(reason, self.clock.now())?;
        if !self
            .tickets
            .update_ticket(cancelled.clone(), ticket.status)
            .await?
        {
            return Ok(Transition::Unchanged(self.load(ticket.id).await?));
        }

        metrics::record_ticket(TicketStatus::Cancelled);
        tracing::warn!(ticket_id = %cancelled.id, reason, "Ticket cancelled");
        self.allocator.release(cancelled.reservation_id).await?;
        Ok(Transition::Applied(cancelled))
    }

    async fn load(&self, ticket_id: TicketId) -> Result<Ticket, ImpactError> {
        self.tickets
            .ticket(ticket_id)
            .await?
            .ok_or_else(|| ImpactError::not_found("ticket", ticket_id))
    }

    /// Load a ticket.
    ///
    /// # Errors
    ///
    /// [`ImpactError::NotFound`] for an unknown ticket.
    pub async fn ticket(&self, ticket_id: TicketId) -> Result<Ticket, ImpactError> {
        self.load(ticket_id).await
    }

    /// A buyer's tickets, newest first.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn tickets_for_owner(&self, owner_id: UserId) -> Result<Vec<Ticket>, ImpactError> {
        Ok(self.tickets.tickets_for_owner(owner_id).await?)
    }
}

fn released_before_issue(reservation_id: ReservationId) -> ImpactError {
    ImpactError::Validation(format!(
        "reservation {reservation_id} was released before a ticket was issued"
    ))
}

/// What an earlier attempt already decided.
fn settled(ticket: Ticket) -> Result<Issuance, ImpactError> {
    match ticket.status {
        TicketStatus::Active | TicketStatus::Used | TicketStatus::Transferred => {
            Ok(Issuance::Confirmed(ticket))
        }
        TicketStatus::Reserved | TicketStatus::Minting => Ok(Issuance::Pending(ticket)),
        TicketStatus::Cancelled => Err(ImpactError::LedgerRejected {
            key: ticket.idempotency_key.to_string(),
            reason: ticket
                .failure_reason
                .unwrap_or_else(|| "ticket cancelled".to_string()),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)] // Test code
mod tests {
    use super::*;
    use impact_core::records::{Event, NewEvent};
    use impact_core::store::InventoryStore;
    use impact_core::types::{Cause, DonationShare, LedgerAccount, Money, RequestId};
    use impact_testing::ledger::Behavior;
    use impact_testing::{InMemoryStore, ScriptedLedger, test_clock};

    struct Fixture {
        store: InMemoryStore,
        ledger: ScriptedLedger,
        allocator: InventoryAllocator,
        coordinator: IssuanceCoordinator,
        event: Event,
        buyer: Donor,
    }

    async fn fixture(capacity: u32) -> Fixture {
        let store = InMemoryStore::new();
        let ledger = ScriptedLedger::new();
        let clock = Arc::new(test_clock());
        let allocator = InventoryAllocator::new(
            Arc::new(store.clone()),
            clock.clone(),
            chrono::Duration::minutes(15),
        );
        let coordinator = IssuanceCoordinator::new(
            Arc::new(store.clone()),
            allocator.clone(),
            Arc::new(ledger.clone()),
            clock,
            Duration::from_secs(1),
        );
        let event = allocator
            .register_event(NewEvent {
                title: "Gala".to_string(),
                capacity,
                price_per_unit: Money::from_minor(5_000),
                donation_share: DonationShare::from_basis_points(1_000).unwrap(),
                cause: Cause::Education,
            })
            .await
            .unwrap();
        let buyer = Donor::new(
            "Lin",
            LedgerAccount::parse("0.0.4001").unwrap(),
            test_clock().now(),
        );
        Fixture {
            store,
            ledger,
            allocator,
            coordinator,
            event,
            buyer,
        }
    }

    async fn reserve(f: &Fixture, request: &str) -> Reservation {
        f.allocator
            .reserve(f.event.id, RequestId::parse(request).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn confirmed_mints_activate_and_commit() {
        let f = fixture(2).await;
        let reservation = reserve(&f, "a").await;

        let Issuance::Confirmed(ticket) = f.coordinator.issue(reservation.id, &f.buyer).await.unwrap()
        else {
            panic!("expected a confirmed issuance");
        };
        assert_eq!(ticket.status, TicketStatus::Active);
        assert_eq!(ticket.serial_number, Some(1));
        assert_eq!(ticket.price, Money::from_minor(5_000));

        let event = f.store.event(f.event.id).await.unwrap().unwrap();
        assert_eq!((event.issued, event.held), (1, 0));
    }

    #[tokio::test]
    async fn repeated_issue_mints_once() {
        let f = fixture(2).await;
        let reservation = reserve(&f, "a").await;

        let first = f.coordinator.issue(reservation.id, &f.buyer).await.unwrap();
        let second = f.coordinator.issue(reservation.id, &f.buyer).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.ledger.mint_calls(), 1);
        assert_eq!(f.ledger.minted(f.event.id), 1);
    }

    #[tokio::test]
    async fn rejected_mints_cancel_and_release() {
        let f = fixture(1).await;
        f.ledger.script_mint(Behavior::Reject("malformed metadata".to_string()));
        let reservation = reserve(&f, "a").await;

        let err = f.coordinator.issue(reservation.id, &f.buyer).await.unwrap_err();
        assert!(matches!(err, ImpactError::LedgerRejected { .. }));

        let ticket = f.store.tickets_for_event(f.event.id).remove(0);
        assert_eq!(ticket.status, TicketStatus::Cancelled);
        assert_eq!(ticket.failure_reason.as_deref(), Some("malformed metadata"));
        let event = f.store.event(f.event.id).await.unwrap().unwrap();
        assert_eq!((event.issued, event.held), (0, 0));

        // Replays report the same refusal without calling the ledger again.
        let again = f.coordinator.issue(reservation.id, &f.buyer).await.unwrap_err();
        assert_eq!(again, err);
        assert_eq!(f.ledger.mint_calls(), 1);
    }

    #[tokio::test]
    async fn timeouts_leave_the_ticket_minting() {
        let f = fixture(1).await;
        f.ledger.script_mint(Behavior::AcceptThenTimeout);
        let reservation = reserve(&f, "a").await;

        let outcome = f.coordinator.issue(reservation.id, &f.buyer).await.unwrap();
        let Issuance::Pending(ticket) = outcome else {
            panic!("expected a pending issuance");
        };
        assert_eq!(ticket.status, TicketStatus::Minting);
        assert!(ticket.submitted_at.is_some());

        // No foreground retry while the outcome is unknown.
        let again = f.coordinator.issue(reservation.id, &f.buyer).await.unwrap();
        assert!(matches!(again, Issuance::Pending(_)));
        assert_eq!(f.ledger.mint_calls(), 1);

        let event = f.store.event(f.event.id).await.unwrap().unwrap();
        assert_eq!((event.issued, event.held), (0, 1));
    }

    #[tokio::test]
    async fn released_reservations_are_not_submitted() {
        let f = fixture(1).await;
        let reservation = reserve(&f, "a").await;
        f.allocator.release(reservation.id).await.unwrap();

        let err = f.coordinator.issue(reservation.id, &f.buyer).await.unwrap_err();
        assert!(matches!(err, ImpactError::Validation(_)));
        assert_eq!(f.ledger.mint_calls(), 0);
    }

    #[tokio::test]
    async fn other_buyers_cannot_claim_a_reservation() {
        let f = fixture(1).await;
        let reservation = reserve(&f, "a").await;
        f.coordinator.issue(reservation.id, &f.buyer).await.unwrap();

        let stranger = Donor::new(
            "Mallory",
            LedgerAccount::parse("0.0.666").unwrap(),
            test_clock().now(),
        );
        let err = f.coordinator.issue(reservation.id, &stranger).await.unwrap_err();
        assert!(matches!(err, ImpactError::Validation(_)));
    }

    #[tokio::test]
    async fn duplicate_serials_are_inconsistent() {
        let f = fixture(2).await;
        let first = reserve(&f, "a").await;
        f.coordinator.issue(first.id, &f.buyer).await.unwrap();

        f.ledger.script_mint(Behavior::Timeout);
        let second = reserve(&f, "b").await;
        let Issuance::Pending(minting) = f.coordinator.issue(second.id, &f.buyer).await.unwrap()
        else {
            panic!("expected a pending issuance");
        };

        let err = f
            .coordinator
            .confirm_mint(&minting, ReceiptId::new("forged"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ImpactError::InconsistentState { .. }));
    }

    #[tokio::test]
    async fn only_the_first_confirmation_applies() {
        let f = fixture(1).await;
        f.ledger.script_mint(Behavior::Timeout);
        let reservation = reserve(&f, "a").await;
        let Issuance::Pending(minting) = f.coordinator.issue(reservation.id, &f.buyer).await.unwrap()
        else {
            panic!("expected a pending issuance");
        };

        let first = f
            .coordinator
            .confirm_mint(&minting, ReceiptId::new("0.0.5@7"), 7)
            .await
            .unwrap();
        let second = f
            .coordinator
            .confirm_mint(&minting, ReceiptId::new("0.0.5@7"), 7)
            .await
            .unwrap();

        assert!(first.is_applied());
        assert!(!second.is_applied());
        assert_eq!(second.into_inner().status, TicketStatus::Active);
        let event = f.store.event(f.event.id).await.unwrap().unwrap();
        assert_eq!((event.issued, event.held), (1, 0));
    }
}
