//! # Impact Core
//!
//! Domain records and dependency-injection traits for impact ticketing.
//!
//! Organizers sell a fixed inventory of admissions. Every admission is minted as a
//! uniquely numbered issuance record on an external, append-only ledger, and a fixed
//! share of every sale is redirected as a tracked donation toward a named cause.
//!
//! This crate holds everything the services agree on and nothing that performs I/O:
//!
//! - **Types**: identifiers, [`Money`](types::Money), [`DonationShare`](types::DonationShare)
//! - **Records**: [`Event`](records::Event), [`Reservation`](records::Reservation),
//!   [`Ticket`](records::Ticket), [`Donation`](records::Donation), [`Donor`](records::Donor)
//!   together with their status state machines
//! - **Ledger**: the [`LedgerClient`](ledger::LedgerClient) capability the services are
//!   handed at construction time
//! - **Store**: the storage traits whose implementations own every shared counter
//! - **Environment**: the [`Clock`](environment::Clock) used for explicit timestamping
//!
//! ## Architecture Principles
//!
//! - Dependencies are injected as trait objects, never reached through globals
//! - State transitions are explicit values carrying their own timestamps
//! - Shared counters change only through single-step store operations

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod error;
pub mod ledger;
pub mod records;
pub mod store;
pub mod types;

pub use error::{ImpactError, StoreError};

/// Environment module - time as an injected dependency.
///
/// Every write path stamps its own `updated_at` from the clock it was given;
/// nothing is timestamped implicitly by the storage layer.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use impact_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let earlier = clock.now();
    /// assert!(clock.now() >= earlier);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time for production use.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
