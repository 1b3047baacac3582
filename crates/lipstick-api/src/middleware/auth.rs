//! Shared-secret admin authentication
//!
//! Protects the administrative endpoints with a single admin key sent as
//! `Authorization: <key>` (a `Bearer ` prefix is also accepted).

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::error::ApiError;
use crate::AppState;

/// Middleware that rejects requests without the admin key
///
/// # Errors
/// Returns 401 Unauthorized if the Authorization header is missing, not
/// valid UTF-8, or does not match the configured key.
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing Authorization header".to_string()))?;

    let provided = provided.strip_prefix("Bearer ").unwrap_or(provided).trim();

    if !keys_match(provided, &state.admin_key) {
        debug!("Rejected admin request to {}", request.uri().path());
        return Err(ApiError::Unauthorized("Invalid admin key".to_string()));
    }

    Ok(next.run(request).await)
}

fn keys_match(provided: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}
