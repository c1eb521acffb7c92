//! POST /api/admin/reconcile
//!
//! Runs one reconciliation pass immediately. Guarded by the verifier token.

use crate::reconciliation::ReconciliationReport;
use crate::server::error::require_bearer;
use crate::server::{ApiError, AppState};
use axum::{Json, extract::State, http::HeaderMap};

/// Run one reconciliation pass and return its report.
///
/// # Errors
///
/// 401 without the verifier token, 500 when a stale-record query fails.
pub async fn reconcile(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ReconciliationReport>, ApiError> {
    require_bearer(&headers, state.verifier_token.as_deref())?;
    Ok(Json(state.app.reconcile().await?))
}
