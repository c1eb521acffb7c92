//! Error taxonomy shared by every service.
//!
//! Deterministic failures (`Validation`, `NotFound`, `CapacityExceeded`,
//! `LedgerRejected`) are definite answers: retrying the same request yields the
//! same answer. `LedgerTimeout` is not a failure of the request; the record stays
//! in an awaiting-resolution status. `InconsistentState` is fatal to one record and
//! needs a human.

use thiserror::Error;

/// Errors surfaced by the allocator, coordinator, settlement ledger and sweep.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImpactError {
    /// Bad input; nothing was changed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown event, donor, reservation, ticket or donation.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Record kind (`event`, `donor`, ...)
        kind: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// The event has no remaining capacity for this request.
    #[error("Event {event_id} has no remaining capacity")]
    CapacityExceeded {
        /// Event that is sold out
        event_id: String,
    },

    /// The ledger did not answer before the deadline; the outcome is unknown.
    #[error("Ledger call {key} timed out; awaiting reconciliation")]
    LedgerTimeout {
        /// Idempotency key of the call
        key: String,
    },

    /// The ledger deterministically refused the operation.
    #[error("Ledger rejected {key}: {reason}")]
    LedgerRejected {
        /// Idempotency key of the call
        key: String,
        /// Reason reported by the ledger
        reason: String,
    },

    /// Local and ledger state disagree and cannot be reconciled automatically.
    #[error("Inconsistent state for {record}: {detail}")]
    InconsistentState {
        /// Record that needs manual intervention (e.g. `ticket 3f2a...`)
        record: String,
        /// What disagrees
        detail: String,
    },

    /// Persistence failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

impl ImpactError {
    /// Shorthand for [`ImpactError::NotFound`].
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Shorthand for [`ImpactError::InconsistentState`].
    #[must_use]
    pub fn inconsistent(record: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InconsistentState {
            record: record.into(),
            detail: detail.into(),
        }
    }

    /// Whether retrying the same request can produce a different answer.
    #[must_use]
    pub const fn is_deterministic(&self) -> bool {
        !matches!(self, Self::LedgerTimeout { .. } | Self::Storage(_))
    }
}

/// Errors raised by storage implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Database connection or query failure.
    #[error("Database error: {0}")]
    Database(String),

    /// A uniqueness constraint was violated (serial number, receipt id, ...).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A stored row could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_not_deterministic() {
        assert!(!ImpactError::LedgerTimeout { key: "k".into() }.is_deterministic());
        assert!(ImpactError::Validation("bad".into()).is_deterministic());
        assert!(
            ImpactError::CapacityExceeded {
                event_id: "e".into()
            }
            .is_deterministic()
        );
    }

    #[test]
    fn not_found_message_names_the_record() {
        let err = ImpactError::not_found("donor", "abc");
        assert_eq!(err.to_string(), "donor abc not found");
    }
}
