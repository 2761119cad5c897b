use axum::Router;

pub mod notifications;
pub mod system;

/// Router for all authenticated (operator) endpoints.
pub fn router() -> Router {
    Router::new().nest("/notifications", notifications::router())
}
