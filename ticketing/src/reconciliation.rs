//! Reconciliation sweep.
//!
//! The only place allowed to resolve an unknown ledger outcome. Each pass works
//! over persisted state, in this order:
//!
//! 1. stale `Reserved` tickets: never submitted, so they are cancelled
//! 2. stale `Minting` tickets: the ledger is asked by idempotency key
//! 3. expired `Held` reservations: released, or committed if their ticket is issued
//! 4. stale `Pending` donations: the ledger is asked by idempotency key
//! 5. issued tickets whose purchase split was never recorded: settled now
//!
//! A record whose outcome is still unknown is left for the next pass until the
//! grace period runs out, after which it is treated as failed.

use crate::allocator::InventoryAllocator;
use crate::config::EngineSettings;
use crate::coordinator::IssuanceCoordinator;
use crate::ledger::with_deadline;
use crate::metrics;
use crate::settlement::DonationSettlementLedger;
use impact_core::ImpactError;
use impact_core::environment::Clock;
use impact_core::ledger::{IdempotencyKey, LedgerClient, ReceiptStatus};
use impact_core::records::{Donation, Reservation, Ticket, TicketStatus};
use impact_core::store::{DonationStore, InventoryStore, TicketStore, Transition};
use impact_core::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const NO_RECEIPT: &str = "no ledger receipt within the grace period";

/// A record the sweep could not reconcile automatically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ManualIntervention {
    /// Record that needs a human (e.g. `ticket 3f2a...`)
    pub record: String,
    /// What disagrees
    pub detail: String,
}

/// What one pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    /// `Minting` tickets found confirmed on the ledger
    pub tickets_activated: usize,
    /// `Reserved` or `Minting` tickets cancelled
    pub tickets_cancelled: usize,
    /// Expired reservations returned to the pool
    pub reservations_released: usize,
    /// Expired reservations whose ticket was already issued
    pub reservations_committed: usize,
    /// `Pending` donations found executed on the ledger
    pub donations_confirmed: usize,
    /// `Pending` donations failed
    pub donations_failed: usize,
    /// Purchase splits recorded for tickets that had none
    pub splits_recovered: usize,
    /// Records left for a later pass
    pub unresolved: usize,
    /// Records that need manual intervention
    pub manual_intervention: Vec<ManualIntervention>,
}

impl ReconciliationReport {
    /// Whether the pass changed anything or found anything wrong.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }

    fn escalate(&mut self, err: &ImpactError) {
        if let ImpactError::InconsistentState { record, detail } = err {
            tracing::error!(record, detail, "Manual intervention required");
            self.manual_intervention.push(ManualIntervention {
                record: record.clone(),
                detail: detail.clone(),
            });
        } else {
            tracing::warn!(error = %err, "Reconciliation step failed; retrying next pass");
            self.unresolved += 1;
        }
    }
}

/// Stores the sweep reads stale records from.
#[derive(Clone)]
pub struct SweepStores {
    /// Reservations
    pub inventory: Arc<dyn InventoryStore>,
    /// Tickets
    pub tickets: Arc<dyn TicketStore>,
    /// Donations
    pub donations: Arc<dyn DonationStore>,
}

/// Background resolver of unknown outcomes.
pub struct ReconciliationSweep {
    stores: SweepStores,
    allocator: InventoryAllocator,
    coordinator: IssuanceCoordinator,
    settlement: DonationSettlementLedger,
    ledger: Arc<dyn LedgerClient>,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl ReconciliationSweep {
    /// Create a sweep over the same stores and ledger the services use.
    #[must_use]
    pub fn new(
        stores: SweepStores,
        allocator: InventoryAllocator,
        coordinator: IssuanceCoordinator,
        settlement: DonationSettlementLedger,
        ledger: Arc<dyn LedgerClient>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            stores,
            allocator,
            coordinator,
            settlement,
            ledger,
            clock,
            settings,
        }
    }

    /// Run one pass.
    ///
    /// # Errors
    ///
    /// Only when a stale-record query itself fails; failures on individual
    /// records are counted in the report instead.
    #[tracing::instrument(skip_all)]
    pub async fn run_once(&self) -> Result<ReconciliationReport, ImpactError> {
        let now = self.clock.now();
        let stale_before = now - self.settings.stale_after;
        let batch = self.settings.batch_size;
        let mut report = ReconciliationReport::default();

        let reserved = self
            .stores
            .tickets
            .stale_tickets(TicketStatus::Reserved, stale_before, batch)
            .await?;
        for ticket in reserved {
            self.abandon(&ticket, &mut report).await;
        }

        let minting = self
            .stores
            .tickets
            .stale_tickets(TicketStatus::Minting, stale_before, batch)
            .await?;
        for ticket in minting {
            self.resolve_mint(&ticket, now, &mut report).await;
        }

        let expired = self.stores.inventory.expired_reservations(now, batch).await?;
        for reservation in expired {
            self.expire(&reservation, &mut report).await;
        }

        let pending = self.stores.donations.stale_donations(stale_before, batch).await?;
        for donation in pending {
            self.resolve_transfer(&donation, now, &mut report).await;
        }

        let unsplit = self.stores.tickets.unsplit_tickets(stale_before, batch).await?;
        for ticket in unsplit {
            if self.split(&ticket, &mut report).await {
                metrics::record_resolution("split", "recovered");
                report.splits_recovered += 1;
            }
        }

        if report.is_idle() {
            tracing::trace!("Nothing to reconcile");
        } else {
            tracing::info!(?report, "Reconciliation pass finished");
        }
        Ok(report)
    }

    /// Spawn the periodic sweep; it stops when `shutdown` fires.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = interval.as_secs(), "Reconciliation sweep started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_once().await {
                            tracing::error!(error = %err, "Reconciliation pass failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("Reconciliation sweep stopped");
                        break;
                    }
                }
            }
        })
    }

    async fn query(&self, key: &IdempotencyKey) -> Option<ReceiptStatus> {
        match with_deadline("query", self.settings.ledger_call_timeout, self.ledger.query_receipt(key))
            .await
        {
            Ok(status) => Some(status),
            Err(err) => {
                tracing::debug!(idempotency_key = %key, error = %err, "Receipt query failed");
                None
            }
        }
    }

    fn past_grace(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - since >= self.settings.grace_period
    }

    async fn abandon(&self, ticket: &Ticket, report: &mut ReconciliationReport) {
        match self.coordinator.cancel(ticket, "abandoned before submission").await {
            Ok(transition) if transition.is_applied() => {
                metrics::record_resolution("ticket", "cancelled");
                report.tickets_cancelled += 1;
            }
            // Picked up by a live request in the meantime.
            Ok(_) => {}
            Err(err) => report.escalate(&err),
        }
    }

    async fn resolve_mint(&self, ticket: &Ticket, now: DateTime<Utc>, report: &mut ReconciliationReport) {
        let Some(status) = self.query(&ticket.idempotency_key).await else {
            report.unresolved += 1;
            return;
        };

        match status {
            ReceiptStatus::Confirmed {
                receipt_id,
                serial: Some(serial),
            } => match self.coordinator.confirm_mint(ticket, receipt_id, serial).await {
                Ok(Transition::Applied(active)) => {
                    metrics::record_resolution("ticket", "activated");
                    report.tickets_activated += 1;
                    self.split(&active, report).await;
                }
                // Activated by the foreground in the meantime; it owns the split.
                Ok(Transition::Unchanged(_)) => {}
                Err(err) => report.escalate(&err),
            },
            ReceiptStatus::Confirmed { receipt_id, serial: None } => {
                report.escalate(&ImpactError::inconsistent(
                    format!("ticket {}", ticket.id),
                    format!("receipt {receipt_id} for a mint carries no serial number"),
                ));
            }
            ReceiptStatus::Rejected { reason } => self.cancel_mint(ticket, &reason, report).await,
            ReceiptStatus::Unknown => {
                let submitted = ticket.submitted_at.unwrap_or(ticket.updated_at);
                if self.past_grace(submitted, now) {
                    self.cancel_mint(ticket, NO_RECEIPT, report).await;
                } else {
                    report.unresolved += 1;
                }
            }
        }
    }

    async fn cancel_mint(&self, ticket: &Ticket, reason: &str, report: &mut ReconciliationReport) {
        match self.coordinator.cancel(ticket, reason).await {
            Ok(transition) if transition.is_applied() => {
                metrics::record_resolution("ticket", "cancelled");
                report.tickets_cancelled += 1;
            }
            Ok(transition) => {
                let current = transition.into_inner();
                if current.status != TicketStatus::Cancelled {
                    report.escalate(&ImpactError::inconsistent(
                        format!("ticket {}", current.id),
                        format!("ledger has no issued mint ({reason}) but the ticket is {}", current.status),
                    ));
                }
            }
            Err(err) => report.escalate(&err),
        }
    }

    /// Settle the purchase split of `ticket`; whether a donation now exists.
    async fn split(&self, ticket: &Ticket, report: &mut ReconciliationReport) -> bool {
        let event = match self.allocator.event(ticket.event_id).await {
            Ok(event) => event,
            Err(err) => {
                report.escalate(&err);
                return false;
            }
        };
        match self.settlement.settle_purchase_split(ticket, &event).await {
            Ok(donation) => donation.is_some(),
            Err(err) => {
                report.escalate(&err);
                false
            }
        }
    }

    async fn expire(&self, reservation: &Reservation, report: &mut ReconciliationReport) {
        let ticket = match self.stores.tickets.ticket_for_reservation(reservation.id).await {
            Ok(ticket) => ticket,
            Err(err) => return report.escalate(&ImpactError::from(err)),
        };

        match ticket.map(|ticket| ticket.status) {
            None | Some(TicketStatus::Cancelled) => match self.allocator.release(reservation.id).await {
                Ok(_) => {
                    metrics::record_resolution("reservation", "released");
                    report.reservations_released += 1;
                }
                Err(err) => report.escalate(&err),
            },
            Some(TicketStatus::Active | TicketStatus::Used | TicketStatus::Transferred) => {
                match self.allocator.commit(reservation.id).await {
                    Ok(_) => {
                        metrics::record_resolution("reservation", "committed");
                        report.reservations_committed += 1;
                    }
                    Err(err) => report.escalate(&err),
                }
            }
            // Still in flight; the ticket steps own it.
            Some(TicketStatus::Reserved | TicketStatus::Minting) => {}
        }
    }

    async fn resolve_transfer(
        &self,
        donation: &Donation,
        now: DateTime<Utc>,
        report: &mut ReconciliationReport,
    ) {
        let Some(status) = self.query(&donation.idempotency_key).await else {
            report.unresolved += 1;
            return;
        };

        let outcome = match status {
            ReceiptStatus::Confirmed { receipt_id, .. } => self
                .settlement
                .apply_confirmation(donation.id, receipt_id)
                .await
                .map(|_| {
                    metrics::record_resolution("donation", "confirmed");
                    report.donations_confirmed += 1;
                }),
            ReceiptStatus::Rejected { reason } => self.fail(donation, &reason, report).await,
            ReceiptStatus::Unknown if self.past_grace(donation.created_at, now) => {
                self.fail(donation, NO_RECEIPT, report).await
            }
            ReceiptStatus::Unknown => {
                report.unresolved += 1;
                Ok(())
            }
        };
        if let Err(err) = outcome {
            report.escalate(&err);
        }
    }

    async fn fail(
        &self,
        donation: &Donation,
        reason: &str,
        report: &mut ReconciliationReport,
    ) -> Result<(), ImpactError> {
        self.settlement.apply_failure(donation.id, reason).await?;
        metrics::record_resolution("donation", "failed");
        report.donations_failed += 1;
        Ok(())
    }
}
