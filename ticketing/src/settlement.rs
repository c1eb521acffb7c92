//! Donation settlement ledger.
//!
//! Records each donation's lifecycle (submission, ledger confirmation, human
//! verification) and keeps the donor's `total_donated` exact. The status flip to
//! `Confirmed` and the donor credit are one store operation; nothing else in the
//! crate touches `total_donated`.

use crate::ledger::with_deadline;
use crate::metrics;
use impact_core::ImpactError;
use impact_core::environment::Clock;
use impact_core::ledger::{LedgerClient, LedgerError, ReceiptId, TransferRequest};
use impact_core::records::{Donation, DonationStatus, Donor, Event, ImpactRecord, Ticket};
use impact_core::store::{DonationStore, Transition};
use impact_core::types::{Cause, DonationId, LedgerAccount, Money, SourceRef, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Largest amount the stores can hold, for a single donation and a donor total.
const MAX_STORED_AMOUNT: u64 = i64::MAX.unsigned_abs();

/// Beneficiary ledger account per cause.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CauseAccounts {
    fallback: LedgerAccount,
    accounts: BTreeMap<Cause, LedgerAccount>,
}

impl CauseAccounts {
    /// Every cause paid to `account`.
    #[must_use]
    pub fn uniform(account: &LedgerAccount) -> Self {
        Self {
            fallback: account.clone(),
            accounts: BTreeMap::new(),
        }
    }

    /// Route `cause` to its own account.
    pub fn set(&mut self, cause: Cause, account: LedgerAccount) {
        self.accounts.insert(cause, account);
    }

    /// Account receiving donations for `cause`.
    #[must_use]
    pub fn beneficiary(&self, cause: Cause) -> &LedgerAccount {
        self.accounts.get(&cause).unwrap_or(&self.fallback)
    }
}

/// A donation to settle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRequest {
    /// Donor credited on confirmation
    pub donor_id: UserId,
    /// Cause the donation goes to
    pub cause: Cause,
    /// Amount in minor units
    pub amount: Money,
    /// Caller's reference; the idempotency key of the settlement
    pub source_ref: SourceRef,
}

/// Settles donations against the ledger.
#[derive(Clone)]
pub struct DonationSettlementLedger {
    store: Arc<dyn DonationStore>,
    ledger: Arc<dyn LedgerClient>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
    accounts: CauseAccounts,
    treasury: LedgerAccount,
}

impl DonationSettlementLedger {
    /// Create a settlement ledger.
    ///
    /// `treasury` pays the donation split of ticket sales; direct donations are
    /// paid from the donor's own account.
    #[must_use]
    pub fn new(
        store: Arc<dyn DonationStore>,
        ledger: Arc<dyn LedgerClient>,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
        accounts: CauseAccounts,
        treasury: LedgerAccount,
    ) -> Self {
        Self {
            store,
            ledger,
            clock,
            call_timeout,
            accounts,
            treasury,
        }
    }

    /// Register a donor with a zero running total.
    ///
    /// # Errors
    ///
    /// [`ImpactError::Validation`] for a blank name.
    pub async fn register_donor(
        &self,
        name: &str,
        ledger_account: LedgerAccount,
    ) -> Result<Donor, ImpactError> {
        if name.trim().is_empty() {
            return Err(ImpactError::Validation(
                "donor name must not be empty".to_string(),
            ));
        }
        let donor = Donor::new(name.trim(), ledger_account, self.clock.now());
        self.store.insert_donor(donor.clone()).await?;
        tracing::info!(donor_id = %donor.id, "Donor registered");
        Ok(donor)
    }

    /// Load a donor.
    ///
    /// # Errors
    ///
    /// [`ImpactError::NotFound`] for an unknown donor.
    pub async fn donor(&self, donor_id: UserId) -> Result<Donor, ImpactError> {
        self.store
            .donor(donor_id)
            .await?
            .ok_or_else(|| ImpactError::not_found("donor", donor_id))
    }

    /// Settle a donation paid from the donor's own account.
    ///
    /// Replaying a `source_ref` never transfers twice: a confirmed donation is
    /// returned as is, a failed one fails again with its recorded reason, and a
    /// pending one is left to the sweep.
    ///
    /// # Errors
    ///
    /// - [`ImpactError::Validation`] for a zero or unstorable amount, or a
    ///   `source_ref` already used for a different donation
    /// - [`ImpactError::NotFound`] for an unknown donor
    /// - [`ImpactError::LedgerRejected`] when the transfer was refused
    /// - [`ImpactError::LedgerTimeout`] when the outcome is unknown; the donation
    ///   stays `Pending` until the sweep resolves it
    #[tracing::instrument(
        skip_all,
        fields(donor_id = %request.donor_id, source_ref = %request.source_ref)
    )]
    pub async fn settle(&self, request: SettlementRequest) -> Result<Donation, ImpactError> {
        if request.amount.is_zero() {
            return Err(ImpactError::Validation(
                "donation amount must be positive".to_string(),
            ));
        }
        if request.amount.minor() > MAX_STORED_AMOUNT {
            return Err(ImpactError::Validation(format!(
                "donation amount must not exceed {MAX_STORED_AMOUNT} minor units"
            )));
        }
        let donor = self.donor(request.donor_id).await?;
        let credited = donor.total_donated.minor().checked_add(request.amount.minor());
        if credited.is_none_or(|total| total > MAX_STORED_AMOUNT) {
            return Err(ImpactError::Validation(format!(
                "donation would overflow the running total of donor {}",
                donor.id
            )));
        }
        self.settle_from(request, donor.ledger_account).await
    }

    /// Settle the donation share of a ticket sale, paid from the treasury.
    ///
    /// Returns `None` when the event donates nothing. A refused or unanswered
    /// transfer returns the `Failed` or `Pending` donation instead of an error,
    /// since the ticket itself is already issued.
    ///
    /// # Errors
    ///
    /// Storage failures and [`ImpactError::InconsistentState`].
    #[tracing::instrument(skip_all, fields(ticket_id = %ticket.id))]
    pub async fn settle_purchase_split(
        &self,
        ticket: &Ticket,
        event: &Event,
    ) -> Result<Option<Donation>, ImpactError> {
        let amount = event.donation_per_ticket();
        if amount.is_zero() {
            return Ok(None);
        }
        let source_ref = SourceRef::for_ticket(ticket.id);
        let request = SettlementRequest {
            donor_id: ticket.owner_id,
            cause: event.cause,
            amount,
            source_ref: source_ref.clone(),
        };

        match self.settle_from(request, self.treasury.clone()).await {
            Ok(donation) => Ok(Some(donation)),
            Err(ImpactError::LedgerTimeout { .. } | ImpactError::LedgerRejected { .. }) => {
                Ok(self.store.donation_by_source(&source_ref).await?)
            }
            Err(other) => Err(other),
        }
    }

    async fn settle_from(
        &self,
        request: SettlementRequest,
        payer: LedgerAccount,
    ) -> Result<Donation, ImpactError> {
        if let Some(existing) = self.store.donation_by_source(&request.source_ref).await? {
            return replay(existing, &request);
        }

        let pending = Donation::pending(
            request.donor_id,
            request.cause,
            request.amount,
            request.source_ref.clone(),
            self.accounts.beneficiary(request.cause).clone(),
            self.clock.now(),
        );
        let stored = self.store.insert_donation(pending.clone()).await?;
        if stored.id != pending.id {
            // A concurrent request with the same reference got there first.
            return replay(stored, &request);
        }
        metrics::record_donation(DonationStatus::Pending, stored.amount);
        tracing::debug!(donation_id = %stored.id, "Donation recorded");

        let transfer = TransferRequest {
            key: stored.idempotency_key.clone(),
            from: payer,
            to: stored.beneficiary.clone(),
            amount: stored.amount,
        };
        match with_deadline("transfer", self.call_timeout, self.ledger.transfer(transfer)).await {
            Ok(receipt) => self.apply_confirmation(stored.id, receipt.receipt_id).await,
            Err(LedgerError::Rejected { reason }) => {
                self.apply_failure(stored.id, &reason).await?;
                Err(ImpactError::LedgerRejected {
                    key: stored.idempotency_key.to_string(),
                    reason,
                })
            }
            Err(err) => {
                tracing::warn!(
                    donation_id = %stored.id,
                    error = %err,
                    "Transfer outcome unknown; leaving donation pending"
                );
                Err(ImpactError::LedgerTimeout {
                    key: stored.idempotency_key.to_string(),
                })
            }
        }
    }

    /// `Pending → Confirmed` and credit the donor, in one store step.
    ///
    /// Idempotent: an already confirmed donation is returned unchanged and the
    /// donor is not credited again.
    ///
    /// # Errors
    ///
    /// - [`ImpactError::NotFound`] for an unknown donation
    /// - [`ImpactError::InconsistentState`] if the donation was already failed
    pub async fn apply_confirmation(
        &self,
        donation_id: DonationId,
        receipt_id: ReceiptId,
    ) -> Result<Donation, ImpactError> {
        let transition = self
            .store
            .confirm_donation(donation_id, receipt_id.clone(), self.clock.now())
            .await?
            .ok_or_else(|| ImpactError::not_found("donation", donation_id))?;

        match transition {
            Transition::Applied(donation) => {
                metrics::record_donation(DonationStatus::Confirmed, donation.amount);
                tracing::info!(
                    donation_id = %donation.id,
                    donor_id = %donation.donor_id,
                    amount = donation.amount.minor(),
                    receipt_id = %receipt_id,
                    "Donation confirmed"
                );
                Ok(donation)
            }
            Transition::Unchanged(donation) if donation.status == DonationStatus::Confirmed => {
                Ok(donation)
            }
            Transition::Unchanged(donation) => Err(ImpactError::inconsistent(
                format!("donation {donation_id}"),
                format!(
                    "ledger executed transfer {receipt_id} but the donation is {}",
                    donation.status
                ),
            )),
        }
    }

    /// `Pending → Failed`. The donor total is untouched.
    ///
    /// # Errors
    ///
    /// - [`ImpactError::NotFound`] for an unknown donation
    /// - [`ImpactError::InconsistentState`] if the donation was already confirmed
    pub async fn apply_failure(
        &self,
        donation_id: DonationId,
        reason: &str,
    ) -> Result<Donation, ImpactError> {
        let transition = self
            .store
            .fail_donation(donation_id, reason.to_string(), self.clock.now())
            .await?
            .ok_or_else(|| ImpactError::not_found("donation", donation_id))?;

        match transition {
            Transition::Applied(donation) => {
                metrics::record_donation(DonationStatus::Failed, donation.amount);
                tracing::warn!(donation_id = %donation.id, reason, "Donation failed");
                Ok(donation)
            }
            Transition::Unchanged(donation) if donation.status == DonationStatus::Failed => {
                Ok(donation)
            }
            Transition::Unchanged(donation) => Err(ImpactError::inconsistent(
                format!("donation {donation_id}"),
                format!("ledger refused the transfer ({reason}) but the donation is {}", donation.status),
            )),
        }
    }

    /// Attach an impact attestation to a confirmed donation.
    ///
    /// Verifying twice is a no-op: the first attestation is kept and the
    /// donation is returned unchanged.
    ///
    /// # Errors
    ///
    /// - [`ImpactError::NotFound`] for an unknown donation
    /// - [`ImpactError::Validation`] if the donation is not confirmed or the
    ///   attestation is malformed
    #[tracing::instrument(skip_all, fields(donation_id = %donation_id))]
    pub async fn verify(
        &self,
        donation_id: DonationId,
        impact: ImpactRecord,
    ) -> Result<Donation, ImpactError> {
        let current = self.donation(donation_id).await?;
        // Fails with the right error before touching the store.
        let Some(_) = current.verify(impact.clone(), self.clock.now())? else {
            return Ok(current);
        };

        let transition = self
            .store
            .verify_donation(donation_id, impact, self.clock.now())
            .await?
            .ok_or_else(|| ImpactError::not_found("donation", donation_id))?;
        match transition {
            Transition::Applied(donation) => {
                tracing::info!(donation_id = %donation.id, "Donation verified");
                Ok(donation)
            }
            Transition::Unchanged(donation) if donation.verified => Ok(donation),
            Transition::Unchanged(donation) => Err(ImpactError::Validation(format!(
                "donation {donation_id} is {}; only confirmed donations can be verified",
                donation.status
            ))),
        }
    }

    /// Load a donation.
    ///
    /// # Errors
    ///
    /// [`ImpactError::NotFound`] for an unknown donation.
    pub async fn donation(&self, donation_id: DonationId) -> Result<Donation, ImpactError> {
        self.store
            .donation(donation_id)
            .await?
            .ok_or_else(|| ImpactError::not_found("donation", donation_id))
    }

    /// A donor's donations, newest first.
    ///
    /// # Errors
    ///
    /// [`ImpactError::NotFound`] for an unknown donor.
    pub async fn donations_for_donor(&self, donor_id: UserId) -> Result<Vec<Donation>, ImpactError> {
        self.donor(donor_id).await?;
        Ok(self.store.donations_for_donor(donor_id).await?)
    }
}

fn replay(existing: Donation, request: &SettlementRequest) -> Result<Donation, ImpactError> {
    if !existing.matches(request.donor_id, request.cause, request.amount) {
        return Err(ImpactError::Validation(format!(
            "source reference {} was already used for a different donation",
            request.source_ref
        )));
    }
    match existing.status {
        DonationStatus::Confirmed => Ok(existing),
        DonationStatus::Failed => Err(ImpactError::LedgerRejected {
            key: existing.idempotency_key.to_string(),
            reason: existing
                .failure_reason
                .unwrap_or_else(|| "transfer failed".to_string()),
        }),
        DonationStatus::Pending => Err(ImpactError::LedgerTimeout {
            key: existing.idempotency_key.to_string(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use impact_testing::ledger::Behavior;
    use impact_testing::{InMemoryStore, ScriptedLedger, test_clock};

    struct Fixture {
        ledger: ScriptedLedger,
        settlement: DonationSettlementLedger,
        donor: Donor,
    }

    async fn fixture() -> Fixture {
        let ledger = ScriptedLedger::new();
        let treasury = LedgerAccount::parse("0.0.1000").unwrap();
        let mut accounts = CauseAccounts::uniform(&treasury);
        accounts.set(Cause::Health, LedgerAccount::parse("0.0.2001").unwrap());
        let settlement = DonationSettlementLedger::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(ledger.clone()),
            Arc::new(test_clock()),
            Duration::from_secs(1),
            accounts,
            treasury,
        );
        let donor = settlement
            .register_donor("Ada", LedgerAccount::parse("0.0.3001").unwrap())
            .await
            .unwrap();
        Fixture {
            ledger,
            settlement,
            donor,
        }
    }

    fn request(donor: &Donor, amount: u64, source: &str) -> SettlementRequest {
        SettlementRequest {
            donor_id: donor.id,
            cause: Cause::Health,
            amount: Money::from_minor(amount),
            source_ref: SourceRef::parse(source).unwrap(),
        }
    }

    #[tokio::test]
    async fn transfers_go_from_the_donor_to_the_cause() {
        let f = fixture().await;
        let donation = f.settlement.settle(request(&f.donor, 100, "ref1")).await.unwrap();
        assert_eq!(donation.status, DonationStatus::Confirmed);

        let transfers = f.ledger.executed_transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].from.as_str(), "0.0.3001");
        assert_eq!(transfers[0].to.as_str(), "0.0.2001");
        assert_eq!(transfers[0].key.as_str(), "donation:ref1");
    }

    #[tokio::test]
    async fn zero_amounts_are_rejected_without_a_record() {
        let f = fixture().await;
        let err = f.settlement.settle(request(&f.donor, 0, "ref1")).await.unwrap_err();
        assert!(matches!(err, ImpactError::Validation(_)));
        assert!(f.settlement.donations_for_donor(f.donor.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unstorable_amounts_are_rejected_before_the_ledger() {
        let f = fixture().await;
        let err = f
            .settlement
            .settle(request(&f.donor, u64::MAX, "ref1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ImpactError::Validation(_)));

        // Fits on its own, but not on top of what the donor already gave.
        f.settlement.settle(request(&f.donor, 100, "ref2")).await.unwrap();
        let err = f
            .settlement
            .settle(request(&f.donor, MAX_STORED_AMOUNT, "ref3"))
            .await
            .unwrap_err();
        assert!(matches!(err, ImpactError::Validation(_)));

        assert_eq!(f.ledger.transfer_calls(), 1);
        assert_eq!(f.settlement.donations_for_donor(f.donor.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reused_references_must_describe_the_same_donation() {
        let f = fixture().await;
        f.settlement.settle(request(&f.donor, 100, "ref1")).await.unwrap();
        let err = f.settlement.settle(request(&f.donor, 250, "ref1")).await.unwrap_err();
        assert!(matches!(err, ImpactError::Validation(_)));
    }

    #[tokio::test]
    async fn rejected_transfers_fail_and_stay_failed() {
        let f = fixture().await;
        f.ledger.script_transfer(Behavior::Reject("insufficient funds".to_string()));

        let err = f.settlement.settle(request(&f.donor, 100, "ref1")).await.unwrap_err();
        assert!(matches!(err, ImpactError::LedgerRejected { ref reason, .. } if reason == "insufficient funds"));

        let again = f.settlement.settle(request(&f.donor, 100, "ref1")).await.unwrap_err();
        assert!(matches!(again, ImpactError::LedgerRejected { .. }));
        assert_eq!(f.ledger.transfer_calls(), 1);
        assert_eq!(f.settlement.donor(f.donor.id).await.unwrap().total_donated, Money::ZERO);
    }

    #[tokio::test]
    async fn timeouts_leave_the_donation_pending() {
        let f = fixture().await;
        f.ledger.script_transfer(Behavior::AcceptThenTimeout);

        let err = f.settlement.settle(request(&f.donor, 100, "ref1")).await.unwrap_err();
        assert!(matches!(err, ImpactError::LedgerTimeout { .. }));

        let donations = f.settlement.donations_for_donor(f.donor.id).await.unwrap();
        assert_eq!(donations[0].status, DonationStatus::Pending);
        assert_eq!(f.settlement.donor(f.donor.id).await.unwrap().total_donated, Money::ZERO);

        // A replay does not resubmit while the outcome is unknown.
        f.settlement.settle(request(&f.donor, 100, "ref1")).await.unwrap_err();
        assert_eq!(f.ledger.transfer_calls(), 1);
    }

    #[tokio::test]
    async fn confirmation_replays_do_not_credit_twice() {
        let f = fixture().await;
        let donation = f.settlement.settle(request(&f.donor, 100, "ref1")).await.unwrap();
        let receipt = donation.transfer_receipt_id.clone().unwrap();

        f.settlement.apply_confirmation(donation.id, receipt).await.unwrap();
        assert_eq!(
            f.settlement.donor(f.donor.id).await.unwrap().total_donated,
            Money::from_minor(100)
        );
    }

    #[tokio::test]
    async fn failing_a_confirmed_donation_is_inconsistent() {
        let f = fixture().await;
        let donation = f.settlement.settle(request(&f.donor, 100, "ref1")).await.unwrap();
        let err = f.settlement.apply_failure(donation.id, "late refusal").await.unwrap_err();
        assert!(matches!(err, ImpactError::InconsistentState { .. }));
    }

    #[tokio::test]
    async fn verification_requires_confirmation() {
        let f = fixture().await;
        f.ledger.script_transfer(Behavior::Timeout);
        f.settlement.settle(request(&f.donor, 100, "ref1")).await.unwrap_err();
        let pending = f.settlement.donations_for_donor(f.donor.id).await.unwrap().remove(0);

        let impact = ImpactRecord {
            author: "auditor".to_string(),
            description: "wells dug".to_string(),
            ..ImpactRecord::default()
        };
        let err = f.settlement.verify(pending.id, impact).await.unwrap_err();
        assert!(matches!(err, ImpactError::Validation(_)));
    }

    #[test]
    fn unconfigured_causes_fall_back() {
        let treasury = LedgerAccount::parse("0.0.1").unwrap();
        let mut accounts = CauseAccounts::uniform(&treasury);
        accounts.set(Cause::Community, LedgerAccount::parse("0.0.9").unwrap());
        assert_eq!(accounts.beneficiary(Cause::Community).as_str(), "0.0.9");
        assert_eq!(accounts.beneficiary(Cause::Education), &treasury);
    }
}
