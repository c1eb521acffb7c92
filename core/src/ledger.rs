//! The external ledger as an injected capability.
//!
//! The ledger is append-only and non-transactional: once it accepts a mint or a
//! transfer the effect cannot be undone. Every call therefore carries an
//! [`IdempotencyKey`], and [`LedgerClient::query_receipt`] answers "did we already
//! ask for this exact operation" after a crash or a lost response.
//!
//! # Implementations
//!
//! - `HttpLedgerClient` (in `impact-ticketing`): talks to the ledger gateway
//! - `ScriptedLedger` (in `impact-testing`): programmable fake for tests
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
//! client can be shared as `Arc<dyn LedgerClient>`.

use crate::types::{EventId, LedgerAccount, Money, RequestId, SourceRef, TicketKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by ledger calls.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LedgerError>> + Send + 'a>>;

/// Caller-chosen key that makes a ledger operation safe to repeat.
///
/// The same logical request always maps to the same key; a fresh key is never
/// generated for a retry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Key of the mint backing the purchase `request_id` on `event_id`.
    #[must_use]
    pub fn for_mint(event_id: EventId, request_id: &RequestId) -> Self {
        Self(format!("mint:{event_id}:{request_id}"))
    }

    /// Key of the transfer settling the donation from `source_ref`.
    #[must_use]
    pub fn for_donation(source_ref: &SourceRef) -> Self {
        Self(format!("donation:{source_ref}"))
    }

    /// Rebuild a key read back from storage.
    #[must_use]
    pub const fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    /// Borrow the key
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier the ledger assigns to an accepted operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptId(String);

impl ReceiptId {
    /// Wrap a receipt id returned by the ledger
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrow the receipt id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload embedded in a minted issuance record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintMetadata {
    /// Event the admission belongs to
    pub event_id: EventId,
    /// Ledger account of the buyer
    pub buyer_account: LedgerAccount,
    /// Admission tier
    pub kind: TicketKind,
    /// When the purchase was requested
    pub purchased_at: DateTime<Utc>,
}

/// Request to mint one issuance record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintRequest {
    /// Idempotency key (`mint:{event}:{request}`)
    pub key: IdempotencyKey,
    /// Event reference on the ledger
    pub event_id: EventId,
    /// Account receiving the issuance record
    pub recipient: LedgerAccount,
    /// Embedded metadata
    pub metadata: MintMetadata,
}

/// Ledger answer to an accepted mint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintReceipt {
    /// Receipt of the mint
    pub receipt_id: ReceiptId,
    /// Serial number of the issuance record, unique per event
    pub serial: u64,
}

/// Request to move funds between ledger accounts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Idempotency key (`donation:{source_ref}`)
    pub key: IdempotencyKey,
    /// Paying account
    pub from: LedgerAccount,
    /// Receiving account
    pub to: LedgerAccount,
    /// Amount in minor units
    pub amount: Money,
}

/// Ledger answer to an accepted transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    /// Receipt of the transfer
    pub receipt_id: ReceiptId,
}

/// What the ledger knows about an idempotency key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    /// The operation was executed.
    Confirmed {
        /// Receipt of the operation
        receipt_id: ReceiptId,
        /// Serial number, present for mints
        serial: Option<u64>,
    },
    /// The operation was refused.
    Rejected {
        /// Reason reported by the ledger
        reason: String,
    },
    /// The ledger has never seen this key.
    Unknown,
}

/// Ledger call failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// No answer before the deadline; the operation may or may not have executed.
    #[error("Ledger call timed out")]
    Timeout,

    /// The ledger refused the operation; it will refuse it again.
    #[error("Ledger rejected the request: {reason}")]
    Rejected {
        /// Reason reported by the ledger
        reason: String,
    },

    /// Transport failure after the request may have left; outcome unknown.
    #[error("Ledger transport error: {0}")]
    Transport(String),
}

impl LedgerError {
    /// Whether the ledger may have executed the operation anyway.
    #[must_use]
    pub const fn is_indeterminate(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport(_))
    }
}

/// External ledger capability.
///
/// Calls are slow and may time out. Implementations must treat the idempotency key
/// as authoritative: a repeated call with the same key never produces a second
/// effect, and `query_receipt` reports the outcome of the first one.
pub trait LedgerClient: Send + Sync {
    /// Mint one uniquely numbered issuance record.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Rejected`] for deterministic refusals; `Timeout`/`Transport`
    /// when the outcome is unknown.
    fn mint(&self, request: MintRequest) -> LedgerFuture<'_, MintReceipt>;

    /// Transfer funds between two accounts.
    ///
    /// # Errors
    ///
    /// Same contract as [`LedgerClient::mint`].
    fn transfer(&self, request: TransferRequest) -> LedgerFuture<'_, TransferReceipt>;

    /// Look up the outcome of a previous call by its idempotency key.
    ///
    /// # Errors
    ///
    /// `Timeout`/`Transport` when the ledger could not be asked.
    fn query_receipt(&self, key: &IdempotencyKey) -> LedgerFuture<'_, ReceiptStatus>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable_for_the_same_request() {
        let event_id = EventId::new();
        let request_id = RequestId::parse("checkout-42").unwrap();
        assert_eq!(
            IdempotencyKey::for_mint(event_id, &request_id),
            IdempotencyKey::for_mint(event_id, &request_id)
        );
        assert_eq!(
            IdempotencyKey::for_mint(event_id, &request_id).as_str(),
            format!("mint:{event_id}:checkout-42")
        );
    }

    #[test]
    fn donation_keys_are_namespaced() {
        let source = SourceRef::parse("ref1").unwrap();
        assert_eq!(IdempotencyKey::for_donation(&source).as_str(), "donation:ref1");
    }

    #[test]
    fn only_timeouts_and_transport_errors_are_indeterminate() {
        assert!(LedgerError::Timeout.is_indeterminate());
        assert!(LedgerError::Transport("reset".into()).is_indeterminate());
        assert!(
            !LedgerError::Rejected {
                reason: "bad".into()
            }
            .is_indeterminate()
        );
    }
}
