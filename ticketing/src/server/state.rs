//! Application state for the HTTP server.

use crate::app::ImpactTicketing;
use impact_core::StoreError;
use impact_postgres::PostgresStore;
use std::sync::Arc;

/// Backing store, as far as readiness is concerned.
#[derive(Clone, Debug)]
pub enum StoreHealth {
    /// In-process store; always ready
    Memory,
    /// Postgres pool, pinged on every readiness probe
    Postgres(PostgresStore),
}

impl StoreHealth {
    /// Check that the store answers.
    ///
    /// # Errors
    ///
    /// Returns the store error when Postgres cannot be reached.
    pub async fn check(&self) -> Result<(), StoreError> {
        match self {
            Self::Memory => Ok(()),
            Self::Postgres(store) => store.ping().await,
        }
    }

    /// Name reported by the readiness endpoint.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres(_) => "postgres",
        }
    }
}

/// Application state shared across all HTTP handlers.
///
/// Cloned per request; every field is reference counted.
#[derive(Clone)]
pub struct AppState {
    /// The ticketing services
    pub app: ImpactTicketing,
    /// Backing store for readiness probes
    pub store: StoreHealth,
    /// Bearer token required by privileged endpoints; `None` disables them
    pub verifier_token: Option<Arc<str>>,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(app: ImpactTicketing, store: StoreHealth, verifier_token: Option<String>) -> Self {
        Self {
            app,
            store,
            verifier_token: verifier_token
                .filter(|token| !token.trim().is_empty())
                .map(Arc::from),
        }
    }
}
