//! HTTP handlers, one module per resource.
//!
//! Handlers only translate between JSON and [`ImpactTicketing`](crate::app::ImpactTicketing)
//! calls; errors flow through [`ApiError`](crate::server::ApiError).

pub mod admin;
pub mod donations;
pub mod donors;
pub mod events;
pub mod tickets;
