//! Operator authentication
//!
//! Admin routes take a static bearer token from `admin.token`.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, request::Parts},
};
use sha2::{Digest, Sha256};

use crate::AppState;
use crate::error::AppError;

fn extract_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Compare tokens by digest so the comparison time does not depend on
/// how long a common prefix is.
fn token_matches(presented: &str, expected: &str) -> bool {
    let presented = Sha256::digest(presented.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    presented
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Extractor proving the request carries the admin token
///
/// # Usage
/// ```ignore
/// async fn handler(_admin: AdminToken) -> impl IntoResponse { ... }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct AdminToken;

#[async_trait]
impl<S> FromRequestParts<S> for AdminToken
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);
        let token = extract_token_from_headers(&parts.headers).ok_or(AppError::Unauthorized)?;

        if token_matches(token, &state.config.admin.token) {
            Ok(AdminToken)
        } else {
            tracing::warn!("Rejected admin request with invalid token");
            Err(AppError::Unauthorized)
        }
    }
}
