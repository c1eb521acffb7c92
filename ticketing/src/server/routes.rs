//! Router configuration.

use super::health::{health_check, readiness_check};
use super::middleware::correlation_id_layer;
use super::state::AppState;
use crate::api::{admin, donations, donors, events, tickets};
use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::trace::TraceLayer;

/// Build the complete Axum router.
///
/// - `/health`, `/ready`: probes
/// - `/api/events`: registration, purchase and availability
/// - `/api/tickets`, `/api/donors`, `/api/donations`: queries and donations
/// - `/api/admin/reconcile`: on-demand reconciliation pass
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/events", post(events::register_event))
        .route("/events/:id/purchase", post(events::purchase_ticket))
        .route("/events/:id/availability", get(events::get_availability))
        .route("/tickets/:id", get(tickets::get_ticket))
        .route("/donors", post(donors::register_donor))
        .route("/donors/:id", get(donors::get_donor))
        .route("/donors/:id/tickets", get(donors::list_tickets))
        .route("/donors/:id/donations", get(donors::list_donations))
        .route("/donations", post(donations::record_donation))
        .route("/donations/:id", get(donations::get_donation))
        .route("/donations/:id/verify", put(donations::verify_donation))
        .route("/admin/reconcile", post(admin::reconcile));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(correlation_id_layer())
        .with_state(state)
}
