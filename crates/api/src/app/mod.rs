//! HTTP API application wiring (axum router + service wiring).
//!
//! - `services.rs`: storage selection, the sync orchestrator and the webhook worker
//! - `routes/`: HTTP routes + handlers (one file per resource)
//! - `dto.rs`: request DTOs and query mapping
//! - `errors.rs`: service errors mapped to status codes

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(middleware::trace_requests))
                .layer(axum::middleware::from_fn(middleware::error_envelope))
                .layer(Extension(services)),
        )
}
