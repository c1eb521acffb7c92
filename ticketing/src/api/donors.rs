//! Donor endpoints.
//!
//! Donors double as ticket buyers; a donor's ledger account is the recipient of
//! minted tickets and the payer of direct donations.

use crate::server::{ApiError, AppState};
use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use impact_core::records::{Donation, Donor, Ticket};
use impact_core::types::{LedgerAccount, UserId};
use serde::Deserialize;

/// Request to register a donor.
#[derive(Debug, Deserialize)]
pub struct RegisterDonorRequest {
    /// Display name
    pub name: String,
    /// Ledger account paying donations and receiving tickets
    pub ledger_account: LedgerAccount,
}

/// Register a donor.
///
/// # Errors
///
/// 400 for a malformed body, 422 for a blank name.
pub async fn register_donor(
    State(state): State<AppState>,
    payload: Result<Json<RegisterDonorRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Donor>), ApiError> {
    let Json(request) = payload?;
    let donor = state
        .app
        .register_donor(&request.name, request.ledger_account)
        .await?;
    Ok((StatusCode::CREATED, Json(donor)))
}

/// Load a donor and its running total.
///
/// # Errors
///
/// 404 for an unknown donor.
pub async fn get_donor(
    State(state): State<AppState>,
    Path(donor_id): Path<UserId>,
) -> Result<Json<Donor>, ApiError> {
    Ok(Json(state.app.donor(donor_id).await?))
}

/// A donor's tickets, newest first.
///
/// # Errors
///
/// 500 on storage failures.
pub async fn list_tickets(
    State(state): State<AppState>,
    Path(donor_id): Path<UserId>,
) -> Result<Json<Vec<Ticket>>, ApiError> {
    Ok(Json(state.app.tickets_for_owner(donor_id).await?))
}

/// A donor's donations, newest first.
///
/// # Errors
///
/// 404 for an unknown donor.
pub async fn list_donations(
    State(state): State<AppState>,
    Path(donor_id): Path<UserId>,
) -> Result<Json<Vec<Donation>>, ApiError> {
    Ok(Json(state.app.donations_for_donor(donor_id).await?))
}
