//! Event endpoints:
//! - POST /api/events - Register an event
//! - POST /api/events/:id/purchase - Buy one admission
//! - GET /api/events/:id/availability - Capacity, issued, held and available counts

use crate::app::PurchaseOutcome;
use crate::server::{ApiError, AppState};
use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use impact_core::records::{Availability, Event, NewEvent};
use impact_core::types::{EventId, RequestId, UserId};
use serde::Deserialize;

/// Request to buy one admission.
#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    /// Registered buyer
    pub buyer_id: UserId,
    /// Client-chosen idempotency token; retries must reuse it
    pub request_id: RequestId,
}

/// Register an event.
///
/// # Errors
///
/// 400 for a malformed body, 422 for a zero capacity or blank title.
pub async fn register_event(
    State(state): State<AppState>,
    payload: Result<Json<NewEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<Event>), ApiError> {
    let Json(input) = payload?;
    let event = state.app.register_event(input).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

/// Buy one admission.
///
/// Returns 201 with the active ticket (and its donation split) or 202 with the
/// minting ticket while the ledger outcome is unknown.
///
/// # Errors
///
/// 404 for an unknown event or buyer, 409 when sold out, 502 when the ledger
/// refused the mint.
pub async fn purchase_ticket(
    State(state): State<AppState>,
    Path(event_id): Path<EventId>,
    payload: Result<Json<PurchaseRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PurchaseOutcome>), ApiError> {
    let Json(request) = payload?;
    let outcome = state
        .app
        .purchase_ticket(event_id, request.buyer_id, request.request_id)
        .await?;

    let status = match outcome {
        PurchaseOutcome::Issued { .. } => StatusCode::CREATED,
        PurchaseOutcome::Pending { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

/// Current availability of an event.
///
/// # Errors
///
/// 404 for an unknown event.
pub async fn get_availability(
    State(state): State<AppState>,
    Path(event_id): Path<EventId>,
) -> Result<Json<Availability>, ApiError> {
    Ok(Json(state.app.event_availability(event_id).await?))
}
