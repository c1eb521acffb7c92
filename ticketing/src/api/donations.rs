//! Donation endpoints:
//! - POST /api/donations - Record and settle a direct donation
//! - GET /api/donations/:id - Load a donation
//! - PUT /api/donations/:id/verify - Attach an impact attestation (bearer token)

use crate::server::error::require_bearer;
use crate::server::{ApiError, AppState};
use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
};
use impact_core::records::{Donation, ImpactRecord};
use impact_core::types::{Cause, DonationId, Money, SourceRef, UserId};
use serde::Deserialize;

/// Request to record a donation.
#[derive(Debug, Deserialize)]
pub struct DonationRequest {
    /// Paying donor
    pub donor_id: UserId,
    /// Receiving cause
    #[serde(default)]
    pub cause: Cause,
    /// Amount in minor units
    pub amount: Money,
    /// Caller's reference; one donation per reference
    pub source_ref: SourceRef,
}

/// Record and settle a direct donation.
///
/// Replaying a `source_ref` returns the donation already recorded for it.
///
/// # Errors
///
/// 202 while the transfer outcome is unknown, 404 for an unknown donor, 422
/// for a zero amount or a reused reference with different details, 502 when
/// the ledger refused the transfer.
pub async fn record_donation(
    State(state): State<AppState>,
    payload: Result<Json<DonationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Donation>), ApiError> {
    let Json(request) = payload?;
    let donation = state
        .app
        .record_donation(
            request.donor_id,
            request.cause,
            request.amount,
            request.source_ref,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(donation)))
}

/// Load a donation.
///
/// # Errors
///
/// 404 for an unknown donation.
pub async fn get_donation(
    State(state): State<AppState>,
    Path(donation_id): Path<DonationId>,
) -> Result<Json<Donation>, ApiError> {
    Ok(Json(state.app.donation(donation_id).await?))
}

/// Attach an impact attestation to a confirmed donation.
///
/// # Errors
///
/// 401 without the verifier token, 404 for an unknown donation, 422 for an
/// unconfirmed donation or an incomplete record.
pub async fn verify_donation(
    State(state): State<AppState>,
    Path(donation_id): Path<DonationId>,
    headers: HeaderMap,
    payload: Result<Json<ImpactRecord>, JsonRejection>,
) -> Result<Json<Donation>, ApiError> {
    require_bearer(&headers, state.verifier_token.as_deref())?;
    let Json(impact) = payload?;
    Ok(Json(state.app.verify_donation(donation_id, impact).await?))
}
