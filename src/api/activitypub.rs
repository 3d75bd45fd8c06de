//! ActivityPub endpoints
//!
//! - Actor document
//! - Personal inbox
//! - Shared inbox
//!
//! Inboxes answer 200 whatever the activity turns out to be; only a body
//! that is not JSON (400) or a failure to enqueue (500) is reported.

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};

use crate::AppState;
use crate::error::AppError;
use crate::federation::delivery::ACTIVITY_CONTENT_TYPE;
use crate::federation::{InboxReceipt, InboxRequest};
use crate::metrics::HTTP_REQUESTS_TOTAL;

/// Create ActivityPub router
///
/// Routes:
/// - GET /actors/:username - Actor document
/// - POST /actors/:username/inbox - Personal inbox
/// - POST /shared/inbox - Shared inbox
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/actors/:username", get(actor))
        .route("/actors/:username/inbox", post(inbox))
        .route("/shared/inbox", post(shared_inbox))
}

fn record_request(method: &str, endpoint: &str, status: StatusCode) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, endpoint, status.as_str()])
        .inc();
}

/// GET /actors/:username
///
/// Returns the ActivityPub actor document with its public key.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let actor = state
        .db
        .get_local_actor_by_username(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    let document = serde_json::json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": "Person",
        "id": actor.uri,
        "preferredUsername": actor.username,
        "inbox": actor.inbox_uri,
        "followers": actor.followers_uri,
        "manuallyApprovesFollowers": actor.manually_approves_followers,
        "endpoints": {
            "sharedInbox": actor.shared_inbox_uri
        },
        "publicKey": {
            "id": actor.key_id,
            "owner": actor.uri,
            "publicKeyPem": actor.public_key_pem
        }
    });

    record_request("GET", "/actors/:username", StatusCode::OK);
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)],
        document.to_string(),
    )
        .into_response())
}

/// POST /actors/:username/inbox
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, &method, &uri, &headers, &body, Some(&username), "/actors/:username/inbox")
        .await
}

/// POST /shared/inbox
///
/// Shared inbox for all actors on this instance.
async fn shared_inbox(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    receive(&state, &method, &uri, &headers, &body, None, "/shared/inbox").await
}

async fn receive(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
    target: Option<&str>,
    endpoint: &str,
) -> Result<StatusCode, AppError> {
    let path = uri
        .path_and_query()
        .map(|path_and_query| path_and_query.as_str())
        .unwrap_or_else(|| uri.path());
    let request = InboxRequest {
        method: method.as_str(),
        path,
        headers,
    };

    match state.inbox.receive(body, request, target).await {
        Ok(receipt) => {
            match &receipt {
                InboxReceipt::Accepted { job_id } => {
                    tracing::debug!(job_id, endpoint, "Inbox activity queued")
                }
                InboxReceipt::Discarded { reason } => {
                    tracing::debug!(reason = %reason, endpoint, "Inbox activity discarded")
                }
                InboxReceipt::Processed(report) => {
                    tracing::debug!(state = report.state.as_str(), endpoint, "Inbox activity processed")
                }
            }
            record_request("POST", endpoint, StatusCode::OK);
            Ok(StatusCode::OK)
        }
        Err(error) => {
            let status = match &error {
                AppError::Validation(_) => StatusCode::BAD_REQUEST,
                _ => {
                    tracing::error!(error = %error, endpoint, "Failed to accept inbox activity");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            record_request("POST", endpoint, status);
            Err(error)
        }
    }
}
