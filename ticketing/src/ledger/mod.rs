//! Ledger plumbing shared by the services.
//!
//! Every ledger call made by this crate goes through [`with_deadline`], which
//! bounds it by the configured timeout and records its outcome.

pub mod http;

pub use http::HttpLedgerClient;

use crate::metrics;
use impact_core::ledger::{LedgerError, LedgerFuture};
use std::time::{Duration, Instant};

/// Await a ledger call, turning an expired deadline into [`LedgerError::Timeout`].
///
/// The future is dropped on expiry; the ledger may still execute the request,
/// which is why callers leave the record awaiting resolution.
///
/// # Errors
///
/// Whatever the call returns, or `Timeout` when `deadline` passes first.
pub async fn with_deadline<T>(
    operation: &'static str,
    deadline: Duration,
    call: LedgerFuture<'_, T>,
) -> Result<T, LedgerError> {
    let started = Instant::now();
    let result = match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout),
    };

    let outcome = match &result {
        Ok(_) => "ok",
        Err(LedgerError::Rejected { .. }) => "rejected",
        Err(LedgerError::Timeout) => "timeout",
        Err(LedgerError::Transport(_)) => "transport",
    };
    metrics::record_ledger_call(operation, outcome, started.elapsed().as_secs_f64());
    result
}
