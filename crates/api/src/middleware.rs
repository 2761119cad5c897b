use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::app::errors::json_error;
use crate::context::OperatorContext;

/// Decides whether a bearer token belongs to an operator.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<OperatorContext>;
}

/// Accepts exactly one shared admin token.
pub struct StaticTokenVerifier {
    token: String,
}

impl StaticTokenVerifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenVerifier").finish_non_exhaustive()
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Option<OperatorContext> {
        constant_time_eq(token.as_bytes(), self.token.as_bytes()).then(|| OperatorContext::new("admin"))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<dyn TokenVerifier>,
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let token = extract_bearer(req.headers()).map_err(|message| {
        json_error(StatusCode::UNAUTHORIZED, "unauthorized", message)
    })?;

    let operator = state
        .verifier
        .verify(token)
        .ok_or_else(|| json_error(StatusCode::UNAUTHORIZED, "unauthorized", "invalid token"))?;

    req.extensions_mut().insert(operator);

    Ok(next.run(req).await)
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, &'static str> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or("missing authorization header")?;

    let header = header.to_str().map_err(|_| "malformed authorization header")?;

    let header = header
        .strip_prefix("Bearer ")
        .ok_or("authorization must use the Bearer scheme")?;

    let token = header.trim();
    if token.is_empty() {
        return Err("empty bearer token");
    }

    Ok(token)
}
