//! Inbound dispatcher
//!
//! Turns a raw inbox POST into an [`InboundEnvelope`] and enqueues it.
//! Nothing here trusts the sender: signatures are checked when the
//! envelope is processed, with the headers captured at receipt.

use serde_json::Value;
use std::sync::Arc;

use super::activity::{InboundEnvelope, InboxVariant, validate_structure};
use super::processor::type_label;
use super::queue::{EnqueueReceipt, JobReport, NewJob, QueueName, TaskQueue};
use super::signature::{capture_headers, generate_digest};
use crate::data::Database;
use crate::error::AppError;
use crate::metrics::ACTIVITIES_RECEIVED;

/// Request line and headers of an inbox POST
#[derive(Debug, Clone, Copy)]
pub struct InboxRequest<'a> {
    pub method: &'a str,
    /// Path and query as received
    pub path: &'a str,
    pub headers: &'a http::HeaderMap,
}

/// What happened to a received payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxReceipt {
    /// Queued for a worker
    Accepted { job_id: i64 },
    /// Acknowledged and dropped without processing
    Discarded { reason: String },
    /// Processed immediately (inline queue)
    Processed(JobReport),
}

/// Accepts inbox deliveries
pub struct InboxDispatcher {
    db: Arc<Database>,
    queue: Arc<dyn TaskQueue>,
}

impl InboxDispatcher {
    pub fn new(db: Arc<Database>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { db, queue }
    }

    /// Receive a raw activity for the personal inbox of `target`, or the
    /// shared inbox when `target` is None.
    ///
    /// # Errors
    /// `Validation` when the body is not JSON; storage errors while
    /// enqueueing. Structurally invalid activities are discarded, not errors.
    pub async fn receive(
        &self,
        body: &[u8],
        request: InboxRequest<'_>,
        target: Option<&str>,
    ) -> Result<InboxReceipt, AppError> {
        // 1. Parse
        let activity: Value = serde_json::from_slice(body)?;
        let activity_type = match validate_structure(&activity) {
            Ok((kind, _)) => kind.to_string(),
            Err(error) => {
                tracing::info!(error = %error, "Discarding malformed activity");
                return Ok(InboxReceipt::Discarded {
                    reason: error.to_string(),
                });
            }
        };

        // 2. Digest of the exact bytes received
        let digest = generate_digest(body);

        // 3. Inbox variant
        let (inbox, queue) = match target {
            Some(actor_name) => {
                if self
                    .db
                    .get_local_actor_by_username(actor_name)
                    .await?
                    .is_none()
                {
                    tracing::info!(actor = %actor_name, "Discarding activity for unknown recipient");
                    return Ok(InboxReceipt::Discarded {
                        reason: format!("unknown recipient {}", actor_name),
                    });
                }
                (
                    InboxVariant::Personal {
                        actor_name: actor_name.to_string(),
                    },
                    QueueName::PersonalInbox,
                )
            }
            None => (InboxVariant::Shared, QueueName::SharedInbox),
        };

        ACTIVITIES_RECEIVED
            .with_label_values(&[type_label(&activity_type), queue.as_str()])
            .inc();

        let envelope = InboundEnvelope {
            activity,
            headers: capture_headers(request.headers),
            digest,
            method: request.method.to_string(),
            path: request.path.to_string(),
            inbox,
            received_at: chrono::Utc::now(),
        };

        tracing::debug!(
            activity_id = %envelope.activity_id(),
            activity_type = %activity_type,
            queue = queue.as_str(),
            "Activity received"
        );

        // 4. Enqueue
        let payload = serde_json::to_value(&envelope)?;
        match self.queue.enqueue(NewJob::new(queue, payload)).await? {
            EnqueueReceipt::Queued { job_id } => Ok(InboxReceipt::Accepted { job_id }),
            EnqueueReceipt::Completed(report) => Ok(InboxReceipt::Processed(report)),
        }
    }
}
