//! Prometheus scrape endpoint
//!
//! Counters are updated where the work happens. Queue depth is read from
//! the jobs table on each scrape, so it stays right across restarts.

use axum::{
    Router,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};

use crate::AppState;
use crate::data::Database;
use crate::error::AppError;
use crate::federation::{JobState, QueueName};
use crate::metrics::{QUEUE_DEPTH, REGISTRY};

async fn scrape(State(state): State<AppState>) -> Result<Response, AppError> {
    refresh_queue_depth(&state.db).await?;

    let encoder = TextEncoder::new();
    let body = encoder
        .encode_to_string(&REGISTRY.gather())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode metrics: {}", e)))?;

    Ok(([(header::CONTENT_TYPE, encoder.format_type())], body).into_response())
}

/// Set the depth gauge for every queue and state, zero included.
pub async fn refresh_queue_depth(db: &Database) -> Result<(), AppError> {
    let counts = db.job_counts().await?;

    for queue in QueueName::ALL {
        for job_state in JobState::ALL {
            let depth = counts
                .iter()
                .find(|(q, s, _)| q == queue.as_str() && s == job_state.as_str())
                .map_or(0, |(_, _, n)| *n);
            QUEUE_DEPTH
                .with_label_values(&[queue.as_str(), job_state.as_str()])
                .set(depth);
        }
    }

    Ok(())
}

/// `/metrics`, unauthenticated like `/health`
pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(scrape))
}
