//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: engine wiring (lifecycle bridge, builtin job types)
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs and JSON mapping helpers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use conductor_infra::Orchestrator;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router around `orchestrator` (public entrypoint used by `main.rs`).
///
/// The orchestrator is expected to be started by the caller.
pub async fn build_app(orchestrator: Orchestrator) -> Router {
    let services = Arc::new(services::build_services(orchestrator));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
