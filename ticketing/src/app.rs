//! The inbound operations exposed to the surrounding application.
//!
//! [`ImpactTicketing`] wires the allocator, coordinator, settlement ledger and
//! sweep over one store and one ledger handle. Both are handed in by the caller,
//! which owns their lifecycle.

use crate::allocator::InventoryAllocator;
use crate::config::EngineSettings;
use crate::coordinator::{Issuance, IssuanceCoordinator};
use crate::reconciliation::{ReconciliationReport, ReconciliationSweep, SweepStores};
use crate::settlement::{DonationSettlementLedger, SettlementRequest};
use impact_core::ImpactError;
use impact_core::environment::Clock;
use impact_core::ledger::LedgerClient;
use impact_core::records::{Availability, Donation, Donor, Event, ImpactRecord, NewEvent, Ticket};
use impact_core::store::{DonationStore, InventoryStore, TicketStore};
use impact_core::types::{
    Cause, DonationId, EventId, LedgerAccount, Money, RequestId, SourceRef, TicketId, UserId,
};
use serde::Serialize;
use std::sync::Arc;

/// Outcome of a purchase that did not fail deterministically.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PurchaseOutcome {
    /// The ticket is issued; `donation` is the settled share of the price, if any.
    Issued {
        /// The active ticket
        ticket: Ticket,
        /// The purchase's donation split
        donation: Option<Donation>,
    },
    /// The mint outcome is unknown; the ticket is resolved by the sweep.
    Pending {
        /// The minting ticket
        ticket: Ticket,
    },
}

/// Ticket issuance and donation settlement.
#[derive(Clone)]
pub struct ImpactTicketing {
    allocator: InventoryAllocator,
    coordinator: IssuanceCoordinator,
    settlement: DonationSettlementLedger,
    sweep: Arc<ReconciliationSweep>,
}

impl ImpactTicketing {
    /// Build every service over `store` and `ledger`.
    #[must_use]
    pub fn new<S>(
        store: Arc<S>,
        ledger: Arc<dyn LedgerClient>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self
    where
        S: InventoryStore + TicketStore + DonationStore + 'static,
    {
        let stores = SweepStores {
            inventory: store.clone(),
            tickets: store.clone(),
            donations: store,
        };

        let allocator = InventoryAllocator::new(
            Arc::clone(&stores.inventory),
            Arc::clone(&clock),
            settings.reservation_timeout,
        );
        let coordinator = IssuanceCoordinator::new(
            Arc::clone(&stores.tickets),
            allocator.clone(),
            Arc::clone(&ledger),
            Arc::clone(&clock),
            settings.ledger_call_timeout,
        );
        let settlement = DonationSettlementLedger::new(
            Arc::clone(&stores.donations),
            Arc::clone(&ledger),
            Arc::clone(&clock),
            settings.ledger_call_timeout,
            settings.cause_accounts.clone(),
            settings.treasury_account.clone(),
        );
        let sweep = Arc::new(ReconciliationSweep::new(
            stores,
            allocator.clone(),
            coordinator.clone(),
            settlement.clone(),
            ledger,
            clock,
            settings,
        ));

        Self {
            allocator,
            coordinator,
            settlement,
            sweep,
        }
    }

    /// Buy one admission to `event_id` for `buyer_id`.
    ///
    /// `request_id` makes the purchase idempotent: any number of calls with the
    /// same id reserve one slot and mint at most once.
    ///
    /// # Errors
    ///
    /// - [`ImpactError::NotFound`] for an unknown event or buyer
    /// - [`ImpactError::CapacityExceeded`] when the event is sold out
    /// - [`ImpactError::LedgerRejected`] when the mint was refused
    /// - [`ImpactError::InconsistentState`] when the ledger and local state disagree
    #[tracing::instrument(
        skip_all,
        fields(event_id = %event_id, buyer_id = %buyer_id, request_id = %request_id)
    )]
    pub async fn purchase_ticket(
        &self,
        event_id: EventId,
        buyer_id: UserId,
        request_id: RequestId,
    ) -> Result<PurchaseOutcome, ImpactError> {
        let buyer = self.settlement.donor(buyer_id).await?;
        let reservation = self.allocator.reserve(event_id, request_id).await?;

        match self.coordinator.issue(reservation.id, &buyer).await? {
            Issuance::Confirmed(ticket) => {
                let event = self.allocator.event(event_id).await?;
                let donation = self.settlement.settle_purchase_split(&ticket, &event).await?;
                Ok(PurchaseOutcome::Issued { ticket, donation })
            }
            Issuance::Pending(ticket) => Ok(PurchaseOutcome::Pending { ticket }),
        }
    }

    /// Record and settle a direct donation.
    ///
    /// # Errors
    ///
    /// See [`DonationSettlementLedger::settle`].
    pub async fn record_donation(
        &self,
        donor_id: UserId,
        cause: Cause,
        amount: Money,
        source_ref: SourceRef,
    ) -> Result<Donation, ImpactError> {
        self.settlement
            .settle(SettlementRequest {
                donor_id,
                cause,
                amount,
                source_ref,
            })
            .await
    }

    /// Attach an impact attestation to a confirmed donation.
    ///
    /// # Errors
    ///
    /// See [`DonationSettlementLedger::verify`].
    pub async fn verify_donation(
        &self,
        donation_id: DonationId,
        impact: ImpactRecord,
    ) -> Result<Donation, ImpactError> {
        self.settlement.verify(donation_id, impact).await
    }

    /// Run one reconciliation pass now.
    ///
    /// # Errors
    ///
    /// See [`ReconciliationSweep::run_once`].
    pub async fn reconcile(&self) -> Result<ReconciliationReport, ImpactError> {
        self.sweep.run_once().await
    }

    /// The sweep, for spawning on a timer.
    #[must_use]
    pub fn sweep(&self) -> Arc<ReconciliationSweep> {
        Arc::clone(&self.sweep)
    }

    /// Register an event.
    ///
    /// # Errors
    ///
    /// [`ImpactError::Validation`] for a zero capacity or a blank title.
    pub async fn register_event(&self, input: NewEvent) -> Result<Event, ImpactError> {
        self.allocator.register_event(input).await
    }

    /// Register a donor (who may also buy tickets).
    ///
    /// # Errors
    ///
    /// [`ImpactError::Validation`] for a blank name.
    pub async fn register_donor(
        &self,
        name: &str,
        ledger_account: LedgerAccount,
    ) -> Result<Donor, ImpactError> {
        self.settlement.register_donor(name, ledger_account).await
    }

    /// Load a donor with its running total.
    ///
    /// # Errors
    ///
    /// [`ImpactError::NotFound`] for an unknown donor.
    pub async fn donor(&self, donor_id: UserId) -> Result<Donor, ImpactError> {
        self.settlement.donor(donor_id).await
    }

    /// Load a ticket.
    ///
    /// # Errors
    ///
    /// [`ImpactError::NotFound`] for an unknown ticket.
    pub async fn ticket(&self, ticket_id: TicketId) -> Result<Ticket, ImpactError> {
        self.coordinator.ticket(ticket_id).await
    }

    /// A buyer's tickets, newest first.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn tickets_for_owner(&self, owner_id: UserId) -> Result<Vec<Ticket>, ImpactError> {
        self.coordinator.tickets_for_owner(owner_id).await
    }

    /// Load a donation.
    ///
    /// # Errors
    ///
    /// [`ImpactError::NotFound`] for an unknown donation.
    pub async fn donation(&self, donation_id: DonationId) -> Result<Donation, ImpactError> {
        self.settlement.donation(donation_id).await
    }

    /// A donor's donations, newest first.
    ///
    /// # Errors
    ///
    /// [`ImpactError::NotFound`] for an unknown donor.
    pub async fn donations_for_donor(&self, donor_id: UserId) -> Result<Vec<Donation>, ImpactError> {
        self.settlement.donations_for_donor(donor_id).await
    }

    /// Capacity, issued, held and available counts of an event.
    ///
    /// # Errors
    ///
    /// [`ImpactError::NotFound`] for an unknown event.
    pub async fn event_availability(&self, event_id: EventId) -> Result<Availability, ImpactError> {
        self.allocator.availability(event_id).await
    }
}
