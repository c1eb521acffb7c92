//! HTTP server for impact ticketing.
//!
//! This module provides the Axum-based HTTP server with:
//! - Application state
//! - Health and readiness endpoints
//! - Correlation id tracking
//! - Router configuration

pub mod error;
pub mod health;
pub mod middleware;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::build_router;
pub use state::{AppState, StoreHealth};
