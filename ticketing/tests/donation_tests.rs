//! Direct donations and impact verification.

#![allow(clippy::unwrap_used, clippy::panic)] // Test code

mod common;

use common::{EDUCATION_ACCOUNT, Harness};
use impact_core::ImpactError;
use impact_core::records::{DonationStatus, ImpactRecord};
use impact_core::types::{Cause, Money, SourceRef};
use impact_testing::ledger::Behavior;
use std::collections::BTreeMap;

fn source(raw: &str) -> SourceRef {
    SourceRef::parse(raw).unwrap()
}

fn attestation() -> ImpactRecord {
    ImpactRecord {
        author: "Field auditor".to_string(),
        description: "School supplies delivered".to_string(),
        metrics: BTreeMap::from([("students_reached".to_string(), 120.0)]),
        evidence: vec!["https://audits.example.org/r/77".to_string()],
    }
}

#[tokio::test]
async fn donations_transfer_from_the_donor_and_credit_the_total() {
    let h = Harness::new();
    let donor = h.donor("Ada", "0.0.4242").await;

    let donation = h
        .app
        .record_donation(donor.id, Cause::Education, Money::from_minor(2_500), source("gift-1"))
        .await
        .unwrap();

    assert_eq!(donation.status, DonationStatus::Confirmed);
    assert_eq!(donation.idempotency_key.as_str(), "donation:gift-1");
    let transfers = h.ledger.executed_transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].from.as_str(), "0.0.4242");
    assert_eq!(transfers[0].to.as_str(), EDUCATION_ACCOUNT);
    assert_eq!(
        h.app.donor(donor.id).await.unwrap().total_donated,
        Money::from_minor(2_500)
    );
}

#[tokio::test]
async fn replayed_references_settle_once() {
    let h = Harness::new();
    let donor = h.donor("Ada", "0.0.4242").await;

    let first = h
        .app
        .record_donation(donor.id, Cause::Health, Money::from_minor(1_000), source("gift-1"))
        .await
        .unwrap();
    let second = h
        .app
        .record_donation(donor.id, Cause::Health, Money::from_minor(1_000), source("gift-1"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(h.ledger.transfer_calls(), 1);
    assert_eq!(
        h.app.donor(donor.id).await.unwrap().total_donated,
        Money::from_minor(1_000)
    );
}

#[tokio::test]
async fn reused_references_with_other_details_are_refused() {
    let h = Harness::new();
    let donor = h.donor("Ada", "0.0.4242").await;
    h.app
        .record_donation(donor.id, Cause::Health, Money::from_minor(1_000), source("gift-1"))
        .await
        .unwrap();

    let err = h
        .app
        .record_donation(donor.id, Cause::Health, Money::from_minor(9_000), source("gift-1"))
        .await
        .unwrap_err();

    assert!(matches!(err, ImpactError::Validation(_)));
    assert_eq!(h.ledger.transfer_calls(), 1);
}

#[tokio::test]
async fn zero_amounts_and_unknown_donors_are_refused_before_the_ledger() {
    let h = Harness::new();
    let donor = h.donor("Ada", "0.0.4242").await;

    let err = h
        .app
        .record_donation(donor.id, Cause::Health, Money::ZERO, source("gift-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ImpactError::Validation(_)));

    let err = h
        .app
        .record_donation(
            impact_core::types::UserId::new(),
            Cause::Health,
            Money::from_minor(100),
            source("gift-2"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ImpactError::NotFound { kind: "donor", .. }));
    assert_eq!(h.ledger.transfer_calls(), 0);
}

#[tokio::test]
async fn rejected_transfers_fail_the_donation_for_good() {
    let h = Harness::new();
    let donor = h.donor("Ada", "0.0.4242").await;
    h.ledger
        .script_transfer(Behavior::Reject("insufficient balance".to_string()));

    let err = h
        .app
        .record_donation(donor.id, Cause::Health, Money::from_minor(1_000), source("gift-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ImpactError::LedgerRejected { ref reason, .. } if reason == "insufficient balance"));

    let replay = h
        .app
        .record_donation(donor.id, Cause::Health, Money::from_minor(1_000), source("gift-1"))
        .await
        .unwrap_err();
    assert_eq!(replay, err);

    let donations = h.app.donations_for_donor(donor.id).await.unwrap();
    assert_eq!(donations.len(), 1);
    assert_eq!(donations[0].status, DonationStatus::Failed);
    assert_eq!(h.app.donor(donor.id).await.unwrap().total_donated, Money::ZERO);
}

#[tokio::test]
async fn unanswered_transfers_stay_pending_without_crediting() {
    let h = Harness::new();
    let donor = h.donor("Ada", "0.0.4242").await;
    h.ledger.script_transfer(Behavior::AcceptThenTimeout);

    let err = h
        .app
        .record_donation(donor.id, Cause::Health, Money::from_minor(1_000), source("gift-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ImpactError::LedgerTimeout { .. }));

    // Replays report the unknown outcome instead of transferring again.
    let replay = h
        .app
        .record_donation(donor.id, Cause::Health, Money::from_minor(1_000), source("gift-1"))
        .await
        .unwrap_err();
    assert!(matches!(replay, ImpactError::LedgerTimeout { .. }));
    assert_eq!(h.ledger.transfer_calls(), 1);

    let donation = &h.app.donations_for_donor(donor.id).await.unwrap()[0];
    assert_eq!(donation.status, DonationStatus::Pending);
    assert_eq!(h.app.donor(donor.id).await.unwrap().total_donated, Money::ZERO);
}

#[tokio::test]
async fn verification_requires_a_confirmed_donation() {
    let h = Harness::new();
    let donor = h.donor("Ada", "0.0.4242").await;
    h.ledger.script_transfer(Behavior::Timeout);
    h.app
        .record_donation(donor.id, Cause::Health, Money::from_minor(1_000), source("gift-1"))
        .await
        .unwrap_err();
    let pending = h.app.donations_for_donor(donor.id).await.unwrap()[0].clone();

    let err = h
        .app
        .verify_donation(pending.id, attestation())
        .await
        .unwrap_err();
    assert!(matches!(err, ImpactError::Validation(_)));
    assert!(!h.app.donation(pending.id).await.unwrap().verified);
}

#[tokio::test]
async fn verification_happens_once_and_keeps_the_first_attestation() {
    let h = Harness::new();
    let donor = h.donor("Ada", "0.0.4242").await;
    let donation = h
        .app
        .record_donation(donor.id, Cause::Health, Money::from_minor(1_000), source("gift-1"))
        .await
        .unwrap();

    let verified = h.app.verify_donation(donation.id, attestation()).await.unwrap();
    assert!(verified.verified);
    assert_eq!(verified.impact, Some(attestation()));

    h.advance(60);
    let again = h
        .app
        .verify_donation(
            donation.id,
            ImpactRecord {
                author: "Someone else".to_string(),
                ..attestation()
            },
        )
        .await
        .unwrap();
    assert_eq!(again, verified);
}

#[tokio::test]
async fn malformed_attestations_are_refused() {
    let h = Harness::new();
    let donor = h.donor("Ada", "0.0.4242").await;
    let donation = h
        .app
        .record_donation(donor.id, Cause::Health, Money::from_minor(1_000), source("gift-1"))
        .await
        .unwrap();

    let err = h
        .app
        .verify_donation(
            donation.id,
            ImpactRecord {
                description: "   ".to_string(),
                ..attestation()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ImpactError::Validation(_)));
    assert!(!h.app.donation(donation.id).await.unwrap().verified);
}
