//! Shared harness for the service-level tests.

#![allow(dead_code, clippy::unwrap_used)] // Test code

use chrono::Duration;
use impact_core::records::{Donor, Event, NewEvent};
use impact_core::types::{Cause, DonationShare, LedgerAccount, Money, RequestId};
use impact_testing::{InMemoryStore, ManualClock, ScriptedLedger, manual_clock};
use impact_ticketing::{CauseAccounts, EngineSettings, ImpactTicketing};
use std::sync::Arc;

pub const TREASURY: &str = "0.0.1000";
pub const EDUCATION_ACCOUNT: &str = "0.0.7001";

/// Everything a scenario needs a handle on.
pub struct Harness {
    pub app: ImpactTicketing,
    pub store: Arc<InMemoryStore>,
    pub ledger: ScriptedLedger,
    pub clock: ManualClock,
}

pub fn settings() -> EngineSettings {
    let treasury = LedgerAccount::parse(TREASURY).unwrap();
    let mut accounts = CauseAccounts::uniform(&treasury);
    accounts.set(
        Cause::Education,
        LedgerAccount::parse(EDUCATION_ACCOUNT).unwrap(),
    );
    EngineSettings {
        ledger_call_timeout: std::time::Duration::from_millis(200),
        cause_accounts: accounts,
        ..EngineSettings::with_treasury(treasury)
    }
}

impl Harness {
    pub fn new() -> Self {
        impact_testing::init_test_tracing();
        let store = Arc::new(InMemoryStore::new());
        let ledger = ScriptedLedger::new();
        let clock = manual_clock();
        let app = ImpactTicketing::new(
            Arc::clone(&store),
            Arc::new(ledger.clone()),
            Arc::new(clock.clone()),
            settings(),
        );
        Self {
            app,
            store,
            ledger,
            clock,
        }
    }

    /// An Education event at 50.00 donating 10% of each ticket.
    pub async fn event(&self, capacity: u32) -> Event {
        self.app
            .register_event(NewEvent {
                title: "Benefit concert".to_string(),
                capacity,
                price_per_unit: Money::from_minor(5_000),
                donation_share: DonationShare::from_basis_points(1_000).unwrap(),
                cause: Cause::Education,
            })
            .await
            .unwrap()
    }

    /// An event that donates nothing.
    pub async fn plain_event(&self, capacity: u32) -> Event {
        self.app
            .register_event(NewEvent {
                title: "Workshop".to_string(),
                capacity,
                price_per_unit: Money::from_minor(2_000),
                donation_share: DonationShare::NONE,
                cause: Cause::Health,
            })
            .await
            .unwrap()
    }

    pub async fn donor(&self, name: &str, account: &str) -> Donor {
        self.app
            .register_donor(name, LedgerAccount::parse(account).unwrap())
            .await
            .unwrap()
    }

    pub fn advance(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
    }
}

pub fn request(id: &str) -> RequestId {
    RequestId::parse(id).unwrap()
}
