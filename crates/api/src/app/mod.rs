//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: queue backend, sweeper and dispatcher wiring
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::middleware::{self, TokenVerifier};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router around already-built services.
///
/// Everything except `/health` requires a bearer token accepted by `verifier`.
pub fn build_app(services: services::AppServices, verifier: Arc<dyn TokenVerifier>) -> Router {
    let auth_state = middleware::AuthState { verifier };

    let protected = routes::router()
        .layer(Extension(Arc::new(services)))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}
