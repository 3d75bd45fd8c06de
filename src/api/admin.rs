//! Admin API endpoints
//!
//! Operator endpoints for the delivery queue and domain blocks.
//! All routes require the admin bearer token.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::auth::AdminToken;
use crate::data::{DomainBlock, JobRecord};
use crate::error::AppError;
use crate::federation::queue::now_ms;
use crate::federation::{DeliveryJob, EnqueueReceipt, JobState, QueueName};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

/// Create admin router
///
/// Routes:
/// - GET /admin/deliveries - List delivery jobs (default: failed)
/// - POST /admin/deliveries/:id/retry - Requeue a failed delivery
/// - POST /admin/domain_blocks - Block domain
/// - DELETE /admin/domain_blocks/:domain - Unblock domain
/// - GET /admin/domain_blocks - List blocked domains
pub fn admin_router() -> Router<AppState> {
    Router::new()
        // Deliveries
        .route("/deliveries", get(list_deliveries))
        .route("/deliveries/:id/retry", post(retry_delivery))
        // Domain blocks
        .route("/domain_blocks", post(block_domain).get(list_domain_blocks))
        .route("/domain_blocks/:domain", delete(unblock_domain))
}

// =============================================================================
// Deliveries
// =============================================================================

#[derive(Debug, Deserialize)]
struct DeliveryListQuery {
    state: Option<String>,
    limit: Option<i64>,
}

/// Delivery job as shown to operators
#[derive(Debug, Serialize)]
pub struct DeliveryView {
    pub id: i64,
    pub state: String,
    pub attempts: i64,
    pub inbox: Option<String>,
    pub activity_id: Option<String>,
    pub activity_type: Option<String>,
    pub correlation_id: Option<String>,
    pub last_error: Option<String>,
    pub last_status: Option<i64>,
    pub next_run_at_ms: i64,
    pub updated_at_ms: i64,
}

impl From<JobRecord> for DeliveryView {
    fn from(job: JobRecord) -> Self {
        let payload = serde_json::from_str::<DeliveryJob>(&job.payload).ok();
        let field = |name: &str| {
            payload
                .as_ref()
                .and_then(|p| p.activity.get(name))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        Self {
            id: job.id,
            activity_id: field("id"),
            activity_type: field("type"),
            inbox: payload.as_ref().map(|p| p.inbox.clone()),
            correlation_id: payload.as_ref().map(|p| p.correlation_id.clone()),
            state: job.state,
            attempts: job.attempts,
            last_error: job.last_error,
            last_status: job.last_status,
            next_run_at_ms: job.next_run_at_ms,
            updated_at_ms: job.updated_at_ms,
        }
    }
}

/// GET /admin/deliveries?state=failed&limit=50
async fn list_deliveries(
    State(state): State<AppState>,
    _admin: AdminToken,
    Query(query): Query<DeliveryListQuery>,
) -> Result<Json<Vec<DeliveryView>>, AppError> {
    let job_state = match query.state.as_deref() {
        None => JobState::Failed,
        Some(value) => JobState::parse(value)
            .ok_or_else(|| AppError::Validation(format!("unknown job state: {}", value)))?,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let jobs = state
        .db
        .list_jobs(
            Some(QueueName::Deliver.as_str()),
            Some(job_state.as_str()),
            limit,
        )
        .await?;

    Ok(Json(jobs.into_iter().map(DeliveryView::from).collect()))
}

#[derive(Debug, Serialize)]
struct RetryResponse {
    id: i64,
    state: String,
}

/// POST /admin/deliveries/:id/retry
///
/// Gives a failed or dropped delivery a fresh attempt budget.
async fn retry_delivery(
    State(state): State<AppState>,
    _admin: AdminToken,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<RetryResponse>), AppError> {
    let job = state.db.get_job(id).await?.ok_or(AppError::NotFound)?;
    if job.queue != QueueName::Deliver.as_str() {
        return Err(AppError::NotFound);
    }

    let receipt = state.queue.retry(id).await?.ok_or_else(|| {
        AppError::Validation(format!("delivery {} is {} and cannot be retried", id, job.state))
    })?;

    tracing::info!(job_id = id, "Delivery retry requested by operator");

    let response = match receipt {
        EnqueueReceipt::Queued { job_id } => RetryResponse {
            id: job_id,
            state: JobState::Pending.as_str().to_string(),
        },
        EnqueueReceipt::Completed(report) => RetryResponse {
            id,
            state: report.state.as_str().to_string(),
        },
    };

    Ok((StatusCode::ACCEPTED, Json(response)))
}

// =============================================================================
// Domain blocks
// =============================================================================

/// Block domain request
#[derive(Debug, Deserialize)]
struct BlockDomainRequest {
    domain: String,
}

#[derive(Debug, Serialize)]
struct BlockDomainResponse {
    domain: String,
    created: bool,
    dropped_jobs: u64,
}

/// POST /admin/domain_blocks
///
/// Pending deliveries to the domain are dropped along with the block.
async fn block_domain(
    State(state): State<AppState>,
    _admin: AdminToken,
    Json(req): Json<BlockDomainRequest>,
) -> Result<Json<BlockDomainResponse>, AppError> {
    let domain = req.domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() || domain.contains('/') || domain.contains(char::is_whitespace) {
        return Err(AppError::Validation(format!("invalid domain: {}", req.domain)));
    }

    let created = state.db.block_domain(&domain).await?;
    let dropped_jobs = state
        .db
        .drop_pending_jobs_for_domain(&domain, now_ms())
        .await?;

    tracing::info!(domain = %domain, created, dropped_jobs, "Domain blocked");

    Ok(Json(BlockDomainResponse {
        domain,
        created,
        dropped_jobs,
    }))
}

/// DELETE /admin/domain_blocks/:domain
async fn unblock_domain(
    State(state): State<AppState>,
    _admin: AdminToken,
    Path(domain): Path<String>,
) -> Result<StatusCode, AppError> {
    if !state.db.unblock_domain(&domain).await? {
        return Err(AppError::NotFound);
    }

    tracing::info!(domain = %domain, "Domain unblocked");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /admin/domain_blocks
async fn list_domain_blocks(
    State(state): State<AppState>,
    _admin: AdminToken,
) -> Result<Json<Vec<DomainBlock>>, AppError> {
    let blocks = state.db.get_all_domain_blocks().await?;
    Ok(Json(blocks))
}
