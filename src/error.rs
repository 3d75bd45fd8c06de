//! Error types for Fediport
//!
//! All errors in the application are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.
//! HTTP signature failures have their own enum so callers can tell a
//! forged request apart from an unreachable remote host.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Reasons an HTTP signature check can fail.
///
/// None of these are retried: a forged or expired signature never
/// becomes valid on redelivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("malformed signature header: {0}")]
    Malformed(String),

    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("signed headers must include {0}")]
    UnsignedHeader(&'static str),

    #[error("digest header does not match request body")]
    DigestMismatch,

    #[error("date header outside the accepted window ({skew_seconds}s skew)")]
    StaleDate { skew_seconds: i64 },

    #[error("signature keyId {key_id} does not belong to actor {actor}")]
    KeyOwnerMismatch { key_id: String, actor: String },

    #[error("public key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signature does not verify")]
    BadSignature,
}

/// Application-wide error type
///
/// This enum represents all possible errors that can occur
/// in the application. It implements `IntoResponse` to
/// automatically convert errors to appropriate HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Transient federation failure: DNS, timeout, 5xx, 429 (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Remote server explicitly refused a request (502)
    #[error("Remote {url} rejected request: HTTP {status}")]
    RemoteRejected { url: String, status: u16 },

    /// HTTP signature verification failed (401)
    #[error("Invalid signature: {0}")]
    Signature(#[from] SignatureError),

    /// Correlation data needed to answer a remote peer is absent (409)
    #[error("Missing correlation data: {0}")]
    MissingCorrelation(String),

    /// Local actor cannot sign (500)
    #[error("Local actor {0} has no private key")]
    MissingPrivateKey(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(format!("Invalid JSON: {}", err))
    }
}

impl AppError {
    /// Whether retrying the same work later can succeed.
    ///
    /// Queue consumers leave work unmarked and schedule a retry for
    /// transient errors only.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Federation(_) | AppError::HttpClient(_) => true,
            AppError::Database(error) => !matches!(error, sqlx::Error::RowNotFound),
            _ => false,
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string(), "not_found"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string(), "unauthorized"),
            AppError::Signature(_) => (
                StatusCode::UNAUTHORIZED,
                "Invalid signature".to_string(),
                "invalid_signature",
            ),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string(), "forbidden"),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::MissingCorrelation(msg) => {
                (StatusCode::CONFLICT, msg.clone(), "missing_correlation")
            }
            AppError::Federation(msg) => (StatusCode::BAD_GATEWAY, msg.clone(), "federation"),
            AppError::RemoteRejected { .. } => {
                (StatusCode::BAD_GATEWAY, self.to_string(), "remote_rejected")
            }
            AppError::HttpClient(_) => (StatusCode::BAD_GATEWAY, self.to_string(), "http_client"),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                "database",
            ),
            AppError::MissingPrivateKey(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                self.to_string(),
                "missing_private_key",
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        // Record error metric
        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
