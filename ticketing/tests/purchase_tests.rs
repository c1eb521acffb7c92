//! Ticket purchase flows against the scripted ledger.

#![allow(clippy::unwrap_used, clippy::panic)] // Test code

mod common;

use common::{EDUCATION_ACCOUNT, Harness, TREASURY, request};
use impact_core::ImpactError;
use impact_core::records::{DonationStatus, ReservationStatus, TicketStatus};
use impact_core::types::{Money, UserId};
use impact_testing::ledger::Behavior;
use impact_ticketing::PurchaseOutcome;

#[tokio::test]
async fn purchase_mints_one_ticket_and_settles_the_split() {
    let h = Harness::new();
    let event = h.event(100).await;
    let buyer = h.donor("Ada", "0.0.4242").await;

    let outcome = h
        .app
        .purchase_ticket(event.id, buyer.id, request("checkout-1"))
        .await
        .unwrap();

    let PurchaseOutcome::Issued { ticket, donation } = outcome else {
        panic!("expected an issued ticket, got {outcome:?}");
    };
    assert_eq!(ticket.status, TicketStatus::Active);
    assert_eq!(ticket.owner_id, buyer.id);
    assert_eq!(ticket.serial_number, Some(1));
    assert_eq!(ticket.price, Money::from_minor(5_000));
    assert!(ticket.issuance_receipt_id.is_some());

    let donation = donation.unwrap();
    assert_eq!(donation.status, DonationStatus::Confirmed);
    assert_eq!(donation.amount, Money::from_minor(500));
    assert_eq!(donation.beneficiary.as_str(), EDUCATION_ACCOUNT);

    let transfers = h.ledger.executed_transfers();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].from.as_str(), TREASURY);

    let availability = h.app.event_availability(event.id).await.unwrap();
    assert_eq!(
        (availability.issued, availability.held, availability.available),
        (1, 0, 99)
    );
    assert_eq!(h.ledger.minted(event.id), 1);
    assert_eq!(
        h.app.donor(buyer.id).await.unwrap().total_donated,
        Money::from_minor(500)
    );
}

#[tokio::test]
async fn events_without_a_share_issue_without_a_donation() {
    let h = Harness::new();
    let event = h.plain_event(5).await;
    let buyer = h.donor("Ada", "0.0.4242").await;

    let outcome = h
        .app
        .purchase_ticket(event.id, buyer.id, request("checkout-1"))
        .await
        .unwrap();

    assert!(matches!(outcome, PurchaseOutcome::Issued { donation: None, .. }));
    assert_eq!(h.ledger.transfer_calls(), 0);
}

#[tokio::test]
async fn replaying_a_request_returns_the_same_ticket_without_minting_again() {
    let h = Harness::new();
    let event = h.event(10).await;
    let buyer = h.donor("Ada", "0.0.4242").await;

    let first = h
        .app
        .purchase_ticket(event.id, buyer.id, request("checkout-1"))
        .await
        .unwrap();
    let second = h
        .app
        .purchase_ticket(event.id, buyer.id, request("checkout-1"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(h.ledger.mint_calls(), 1);
    assert_eq!(h.ledger.transfer_calls(), 1);
    assert_eq!(h.app.event_availability(event.id).await.unwrap().issued, 1);
    assert_eq!(h.app.tickets_for_owner(buyer.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_retries_of_one_request_mint_once() {
    let h = Harness::new();
    let event = h.event(10).await;
    let buyer = h.donor("Ada", "0.0.4242").await;

    let (a, b, c) = tokio::join!(
        h.app.purchase_ticket(event.id, buyer.id, request("checkout-1")),
        h.app.purchase_ticket(event.id, buyer.id, request("checkout-1")),
        h.app.purchase_ticket(event.id, buyer.id, request("checkout-1")),
    );

    let ids: Vec<_> = [a, b, c]
        .into_iter()
        .map(|outcome| match outcome.unwrap() {
            PurchaseOutcome::Issued { ticket, .. } | PurchaseOutcome::Pending { ticket } => {
                ticket.id
            }
        })
        .collect();
    assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(h.ledger.minted(event.id), 1);
    assert_eq!(h.store.tickets_for_event(event.id).len(), 1);
}

#[tokio::test]
async fn two_buyers_racing_for_the_last_seat_get_one_ticket() {
    let h = Harness::new();
    let event = h.event(1).await;
    let first = h.donor("Ada", "0.0.4242").await;
    let second = h.donor("Grace", "0.0.4343").await;

    let (a, b) = tokio::join!(
        h.app.purchase_ticket(event.id, first.id, request("checkout-1")),
        h.app.purchase_ticket(event.id, second.id, request("checkout-2")),
    );

    let issued = [&a, &b]
        .iter()
        .filter(|outcome| matches!(outcome, Ok(PurchaseOutcome::Issued { .. })))
        .count();
    let denied = [&a, &b]
        .iter()
        .filter(|outcome| matches!(outcome, Err(ImpactError::CapacityExceeded { .. })))
        .count();
    assert_eq!((issued, denied), (1, 1), "{a:?} / {b:?}");

    let availability = h.app.event_availability(event.id).await.unwrap();
    assert_eq!(
        (availability.issued, availability.held, availability.available),
        (1, 0, 0)
    );
    assert_eq!(h.ledger.minted(event.id), 1);
}

#[tokio::test]
async fn sold_out_events_deny_and_keep_denying_the_same_request() {
    let h = Harness::new();
    let event = h.event(1).await;
    let first = h.donor("Ada", "0.0.4242").await;
    let second = h.donor("Grace", "0.0.4343").await;

    h.app
        .purchase_ticket(event.id, first.id, request("checkout-1"))
        .await
        .unwrap();

    for _ in 0..2 {
        let err = h
            .app
            .purchase_ticket(event.id, second.id, request("checkout-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ImpactError::CapacityExceeded { .. }));
    }
    assert_eq!(h.ledger.mint_calls(), 1);
}

#[tokio::test]
async fn rejected_mints_cancel_the_ticket_and_return_the_slot() {
    let h = Harness::new();
    let event = h.event(1).await;
    let buyer = h.donor("Ada", "0.0.4242").await;
    h.ledger.script_mint(Behavior::Reject("recipient account frozen".to_string()));

    let err = h
        .app
        .purchase_ticket(event.id, buyer.id, request("checkout-1"))
        .await
        .unwrap_err();
    let ImpactError::LedgerRejected { key, reason } = err else {
        panic!("expected a rejection, got {err:?}");
    };
    assert_eq!(reason, "recipient account frozen");
    assert_eq!(key, format!("mint:{}:checkout-1", event.id));

    let tickets = h.store.tickets_for_event(event.id);
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].status, TicketStatus::Cancelled);
    assert_eq!(
        h.store.reservations_for_event(event.id)[0].status,
        ReservationStatus::Released
    );
    assert_eq!(h.app.event_availability(event.id).await.unwrap().available, 1);

    // The same request keeps its outcome; a new request gets the freed slot.
    let replay = h
        .app
        .purchase_ticket(event.id, buyer.id, request("checkout-1"))
        .await
        .unwrap_err();
    assert!(matches!(replay, ImpactError::LedgerRejected { .. }));
    let retry = h
        .app
        .purchase_ticket(event.id, buyer.id, request("checkout-2"))
        .await
        .unwrap();
    assert!(matches!(retry, PurchaseOutcome::Issued { .. }));
}

#[tokio::test]
async fn lost_mint_answers_leave_the_ticket_pending() {
    let h = Harness::new();
    let event = h.event(3).await;
    let buyer = h.donor("Ada", "0.0.4242").await;
    h.ledger.script_mint(Behavior::AcceptThenTimeout);

    let outcome = h
        .app
        .purchase_ticket(event.id, buyer.id, request("checkout-1"))
        .await
        .unwrap();

    let PurchaseOutcome::Pending { ticket } = outcome else {
        panic!("expected a pending ticket, got {outcome:?}");
    };
    assert_eq!(ticket.status, TicketStatus::Minting);
    let availability = h.app.event_availability(event.id).await.unwrap();
    assert_eq!((availability.issued, availability.held), (0, 1));

    // A retry does not resubmit; only the sweep resolves the outcome.
    let retry = h
        .app
        .purchase_ticket(event.id, buyer.id, request("checkout-1"))
        .await
        .unwrap();
    assert!(matches!(retry, PurchaseOutcome::Pending { .. }));
    assert_eq!(h.ledger.mint_calls(), 1);
}

#[tokio::test]
async fn unknown_buyers_and_events_are_not_found() {
    let h = Harness::new();
    let event = h.event(3).await;
    let buyer = h.donor("Ada", "0.0.4242").await;

    let err = h
        .app
        .purchase_ticket(event.id, UserId::new(), request("checkout-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ImpactError::NotFound { kind: "donor", .. }));

    let err = h
        .app
        .purchase_ticket(impact_core::types::EventId::new(), buyer.id, request("checkout-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ImpactError::NotFound { kind: "event", .. }));
    assert_eq!(h.ledger.mint_calls(), 0);
}
