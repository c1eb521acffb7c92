//! # Impact Ticketing
//!
//! Ticket issuance and donation settlement over an external append-only ledger.
//!
//! Every purchase reserves capacity first and is minted on the ledger second;
//! every donation is recorded locally first and transferred second. Ledger calls
//! carry an idempotency key derived from the request, so retries and the
//! background sweep can never double-mint or double-transfer.
//!
//! ## Services
//!
//! - [`InventoryAllocator`]: reserve, commit and release capacity
//! - [`IssuanceCoordinator`]: drive a reservation to an on-ledger ticket
//! - [`DonationSettlementLedger`]: record, transfer and verify donations
//! - [`ReconciliationSweep`]: resolve outcomes a request could not observe
//!
//! [`ImpactTicketing`] wires all four over one store and one ledger client.
//!
//! ## Example
//!
//! ```
//! use impact_core::records::NewEvent;
//! use impact_core::types::{Cause, DonationShare, LedgerAccount, Money, RequestId};
//! use impact_testing::{InMemoryStore, ScriptedLedger, test_clock};
//! use impact_ticketing::{EngineSettings, ImpactTicketing, PurchaseOutcome};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let treasury = LedgerAccount::parse("0.0.1000")?;
//! let app = ImpactTicketing::new(
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(ScriptedLedger::new()),
//!     Arc::new(test_clock()),
//!     EngineSettings::with_treasury(treasury),
//! );
//!
//! let event = app
//!     .register_event(NewEvent {
//!         title: "Benefit concert".to_string(),
//!         capacity: 100,
//!         price_per_unit: Money::from_minor(5_000),
//!         donation_share: DonationShare::from_basis_points(1_000)?,
//!         cause: Cause::Education,
//!     })
//!     .await?;
//! let buyer = app.register_donor("Ada", LedgerAccount::parse("0.0.4242")?).await?;
//!
//! let outcome = app
//!     .purchase_ticket(event.id, buyer.id, RequestId::parse("checkout-1")?)
//!     .await?;
//! assert!(matches!(outcome, PurchaseOutcome::Issued { .. }));
//! # Ok::<(), impact_core::ImpactError>(())
//! # }).unwrap();
//! ```

pub mod allocator;
pub mod api;
pub mod app;
pub mod config;
pub mod coordinator;
pub mod ledger;
pub mod metrics;
pub mod reconciliation;
pub mod server;
pub mod settlement;

pub use allocator::InventoryAllocator;
pub use app::{ImpactTicketing, PurchaseOutcome};
pub use config::{Config, EngineSettings, StoreBackend};
pub use coordinator::{Issuance, IssuanceCoordinator};
pub use ledger::HttpLedgerClient;
pub use reconciliation::{ManualIntervention, ReconciliationReport, ReconciliationSweep};
pub use settlement::{CauseAccounts, DonationSettlementLedger, SettlementRequest};
