//! GET /api/tickets/:id

use crate::server::{ApiError, AppState};
use axum::{
    Json,
    extract::{Path, State},
};
use impact_core::records::Ticket;
use impact_core::types::TicketId;

/// Load a ticket.
///
/// # Errors
///
/// 404 for an unknown ticket.
pub async fn get_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<TicketId>,
) -> Result<Json<Ticket>, ApiError> {
    Ok(Json(state.app.ticket(ticket_id).await?))
}
