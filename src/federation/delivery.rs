//! Outbound activity delivery
//!
//! Activities leave this server as one queued job per destination inbox.
//! A delivery worker signs each attempt with the sending actor's key and
//! classifies the remote response: delivered, retry later, permanent
//! failure, or dropped (destination blocked).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use super::key_directory::ActorKeyDirectory;
use super::queue::{EnqueueReceipt, JobHandler, JobOutcome, NewJob, QueueName, QueuedJob, TaskQueue};
use super::resolver::{extract_actor_domain, url_host};
use super::signature::sign_request;
use crate::data::{Actor, Database, Status};
use crate::error::AppError;
use crate::metrics::{DELIVERIES_TOTAL, DELIVERY_DURATION_SECONDS};

/// Header carrying a per-job identifier, stable across attempts
pub const CORRELATION_HEADER: &str = "X-Correlation-Id";

/// ActivityPub media type for outbound bodies
pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";

/// One activity addressed to one inbox. Serialized as the job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub activity: Value,
    pub inbox: String,
    /// Local actor whose key signs the request
    pub signing_actor_id: String,
    pub correlation_id: String,
}

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { status: u16 },
    Retry { error: String, status: Option<u16> },
    PermanentFailure { error: String, status: Option<u16> },
    Dropped { reason: String },
}

impl DeliveryOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::Retry { .. } => "retry",
            Self::PermanentFailure { .. } => "failed",
            Self::Dropped { .. } => "dropped",
        }
    }
}

impl From<DeliveryOutcome> for JobOutcome {
    fn from(outcome: DeliveryOutcome) -> Self {
        match outcome {
            DeliveryOutcome::Delivered { status } => JobOutcome::Done {
                status: Some(status),
            },
            DeliveryOutcome::Retry { error, status } => JobOutcome::Retry { error, status },
            DeliveryOutcome::PermanentFailure { error, status } => {
                JobOutcome::Failed { error, status }
            }
            DeliveryOutcome::Dropped { reason } => JobOutcome::Dropped { reason },
        }
    }
}

/// How a remote HTTP status is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Transient,
    Permanent,
}

/// 2xx succeeds; 5xx and 429 are retried; everything else is final.
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        429 | 500..=599 => StatusClass::Transient,
        _ => StatusClass::Permanent,
    }
}

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
///
/// This preserves recipients on the same domain that use different inbox paths.
pub fn unique_inbox_targets<I>(inbox_uris: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for inbox_uri in inbox_uris {
        if seen.insert(inbox_uri.clone()) {
            targets.push(inbox_uri);
        }
    }

    targets
}

fn audience_for_visibility(actor_uri: &str, visibility: &str) -> (Vec<String>, Vec<String>) {
    let public_audience = super::activity::PUBLIC_AUDIENCE.to_string();
    let followers_audience = format!("{}/followers", actor_uri);

    match visibility {
        "public" => (vec![public_audience], vec![followers_audience]),
        "unlisted" => (vec![followers_audience], vec![public_audience]),
        "private" => (vec![followers_audience], Vec::new()),
        "direct" => (Vec::new(), Vec::new()),
        _ => (vec![public_audience], vec![followers_audience]),
    }
}

pub(crate) fn build_undo_object(
    activity_uri: &str,
    activity_type: Option<&str>,
    activity_object: Option<&str>,
) -> Value {
    let mut object = serde_json::Map::new();
    object.insert("id".to_string(), serde_json::json!(activity_uri));
    if let Some(activity_type) = activity_type {
        object.insert("type".to_string(), serde_json::json!(activity_type));
    }
    if let Some(activity_object) = activity_object {
        object.insert("object".to_string(), serde_json::json!(activity_object));
    }
    Value::Object(object)
}

/// Fresh activity id under this server's base URL
pub fn new_activity_id(base_url: &str) -> String {
    format!(
        "{}/activities/{}",
        base_url.trim_end_matches('/'),
        crate::data::EntityId::new().0
    )
}

// =============================================================================
// Enqueue side
// =============================================================================

/// Turns outgoing activities into delivery jobs
#[derive(Clone)]
pub struct DeliveryService {
    db: Arc<Database>,
    queue: Arc<dyn TaskQueue>,
    base_url: String,
}

impl DeliveryService {
    pub fn new(db: Arc<Database>, queue: Arc<dyn TaskQueue>, base_url: String) -> Self {
        Self {
            db,
            queue,
            base_url,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Enqueue one delivery job per unique destination inbox.
    ///
    /// Destinations on blocked domains are skipped. `ordering_key` keeps
    /// jobs that share it in submission order.
    pub async fn enqueue_delivery(
        &self,
        activity: &Value,
        destination_inboxes: Vec<String>,
        signing_actor_id: &str,
        ordering_key: Option<&str>,
    ) -> Result<Vec<EnqueueReceipt>, AppError> {
        let total = destination_inboxes.len();
        let targets = unique_inbox_targets(destination_inboxes);
        let mut receipts = Vec::with_capacity(targets.len());

        for inbox in targets {
            let Some(host) = url_host(&inbox) else {
                tracing::warn!(inbox = %inbox, "Skipping unparsable inbox URL");
                continue;
            };
            if self.db.is_domain_blocked(&host).await? {
                tracing::debug!(inbox = %inbox, "Skipping delivery to blocked domain");
                continue;
            }

            let job = DeliveryJob {
                activity: activity.clone(),
                inbox,
                signing_actor_id: signing_actor_id.to_string(),
                correlation_id: crate::data::EntityId::new().0,
            };
            let payload = serde_json::to_value(&job)?;
            let receipt = self
                .queue
                .enqueue(
                    NewJob::new(QueueName::Deliver, payload)
                        .with_ordering_key(ordering_key.map(str::to_string))
                        .with_target_host(Some(host)),
                )
                .await?;
            receipts.push(receipt);
        }

        let activity_type = activity.get("type").and_then(Value::as_str).unwrap_or("unknown");
        tracing::info!(
            activity_type = %activity_type,
            jobs = receipts.len(),
            destinations = total,
            "Delivery enqueued"
        );

        Ok(receipts)
    }

    /// Deliver an activity to every approved remote follower of `actor`.
    pub async fn deliver_to_followers(
        &self,
        activity: &Value,
        actor: &Actor,
    ) -> Result<Vec<EnqueueReceipt>, AppError> {
        let inboxes = self.db.get_follower_inboxes(&actor.id).await?;
        self.enqueue_delivery(activity, inboxes, &actor.id, None)
            .await
    }

    /// Announce a locally written status to followers.
    pub async fn publish_status(
        &self,
        actor: &Actor,
        status: &Status,
    ) -> Result<Vec<EnqueueReceipt>, AppError> {
        let (to_audience, cc_audience) =
            audience_for_visibility(&actor.uri, status.visibility.as_str());
        let note_to: Vec<&str> = to_audience.iter().map(String::as_str).collect();
        let note_cc: Vec<&str> = cc_audience.iter().map(String::as_str).collect();

        let note = builder::note(
            &status.uri,
            &actor.uri,
            &status.content,
            &status.created_at.to_rfc3339(),
            status.in_reply_to_uri.as_deref(),
            note_to.clone(),
            note_cc.clone(),
        );
        let activity = builder::create(
            &new_activity_id(&self.base_url),
            &actor.uri,
            note,
            note_to,
            note_cc,
        );

        self.deliver_to_followers(&activity, actor).await
    }

    /// Tell followers a local status is gone.
    pub async fn publish_delete(
        &self,
        actor: &Actor,
        status: &Status,
    ) -> Result<Vec<EnqueueReceipt>, AppError> {
        let (to_audience, cc_audience) = audience_for_visibility(&actor.uri, &status.visibility);
        let activity = builder::delete(
            &new_activity_id(&self.base_url),
            &actor.uri,
            &status.uri,
            to_audience.iter().map(String::as_str).collect(),
            cc_audience.iter().map(String::as_str).collect(),
        );

        self.deliver_to_followers(&activity, actor).await
    }

    /// Like a remote status. Returns the Like activity id.
    pub async fn send_like(
        &self,
        actor: &Actor,
        status_uri: &str,
        author: &Actor,
    ) -> Result<String, AppError> {
        let like_id = new_activity_id(&self.base_url);
        let activity = builder::like(&like_id, &actor.uri, status_uri);
        self.enqueue_delivery(&activity, vec![author.inbox_uri.clone()], &actor.id, None)
            .await?;
        Ok(like_id)
    }

    /// Boost a status to followers and its author. Returns the Announce id.
    pub async fn send_announce(
        &self,
        actor: &Actor,
        status_uri: &str,
        visibility: &str,
        author: &Actor,
    ) -> Result<String, AppError> {
        let announce_id = new_activity_id(&self.base_url);
        let (to_audience, cc_audience) = audience_for_visibility(&actor.uri, visibility);
        let activity = builder::announce(
            &announce_id,
            &actor.uri,
            status_uri,
            to_audience.iter().map(String::as_str).collect(),
            cc_audience.iter().map(String::as_str).collect(),
        );

        let mut inboxes = self.db.get_follower_inboxes(&actor.id).await?;
        if !author.is_local {
            inboxes.push(author.delivery_inbox().to_string());
        }
        self.enqueue_delivery(&activity, inboxes, &actor.id, None)
            .await?;
        Ok(announce_id)
    }

    /// Undo an earlier Like or Announce.
    pub async fn send_undo(
        &self,
        actor: &Actor,
        activity_uri: &str,
        activity_type: &str,
        activity_object: Option<&str>,
        inboxes: Vec<String>,
    ) -> Result<Vec<EnqueueReceipt>, AppError> {
        let object = build_undo_object(activity_uri, Some(activity_type), activity_object);
        let activity = builder::undo(&new_activity_id(&self.base_url), &actor.uri, object);
        self.enqueue_delivery(&activity, inboxes, &actor.id, None)
            .await
    }
}

// =============================================================================
// Transport
// =============================================================================

/// A signed request ready to send
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub inbox: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

/// Sends signed requests; Err means no HTTP response was received.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn post(&self, request: OutboundRequest) -> Result<u16, AppError>;
}

/// HTTP transport over reqwest
pub struct ReqwestTransport {
    http_client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl DeliveryTransport for ReqwestTransport {
    async fn post(&self, request: OutboundRequest) -> Result<u16, AppError> {
        let mut builder = self.http_client.post(&request.inbox);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }

        let response = builder.body(request.body).send().await.map_err(|e| {
            AppError::Federation(format!("Failed to deliver to {}: {}", request.inbox, e))
        })?;

        Ok(response.status().as_u16())
    }
}

// =============================================================================
// Consumer side
// =============================================================================

/// Performs delivery attempts
pub struct DeliveryEngine {
    db: Arc<Database>,
    keys: Arc<ActorKeyDirectory>,
    transport: Arc<dyn DeliveryTransport>,
    allow_private_hosts: bool,
}

impl DeliveryEngine {
    pub fn new(
        db: Arc<Database>,
        keys: Arc<ActorKeyDirectory>,
        transport: Arc<dyn DeliveryTransport>,
        allow_private_hosts: bool,
    ) -> Self {
        Self {
            db,
            keys,
            transport,
            allow_private_hosts,
        }
    }

    /// Make one delivery attempt.
    pub async fn deliver(&self, job: &DeliveryJob) -> DeliveryOutcome {
        let started = Instant::now();
        let outcome = self.attempt(job).await;
        let label = outcome.label();

        DELIVERIES_TOTAL.with_label_values(&[label]).inc();
        DELIVERY_DURATION_SECONDS
            .with_label_values(&[label])
            .observe(started.elapsed().as_secs_f64());

        match &outcome {
            DeliveryOutcome::Delivered { status } => tracing::info!(
                inbox = %job.inbox,
                correlation_id = %job.correlation_id,
                status,
                "Delivered activity"
            ),
            DeliveryOutcome::Retry { error, .. } => tracing::warn!(
                inbox = %job.inbox,
                correlation_id = %job.correlation_id,
                error = %error,
                "Delivery failed, will retry"
            ),
            DeliveryOutcome::PermanentFailure { error, .. } => tracing::warn!(
                inbox = %job.inbox,
                correlation_id = %job.correlation_id,
                error = %error,
                "Delivery failed permanently"
            ),
            DeliveryOutcome::Dropped { reason } => tracing::info!(
                inbox = %job.inbox,
                correlation_id = %job.correlation_id,
                reason = %reason,
                "Delivery dropped"
            ),
        }

        outcome
    }

    async fn attempt(&self, job: &DeliveryJob) -> DeliveryOutcome {
        // 1. Destination checks
        let host = match extract_actor_domain(&job.inbox, self.allow_private_hosts) {
            Ok(host) => host,
            Err(e) => {
                return DeliveryOutcome::PermanentFailure {
                    error: format!("Invalid destination {}: {}", job.inbox, e),
                    status: None,
                };
            }
        };
        match self.db.is_domain_blocked(&host).await {
            Ok(true) => {
                return DeliveryOutcome::Dropped {
                    reason: format!("domain {} is blocked", host),
                };
            }
            Ok(false) => {}
            Err(e) => {
                return DeliveryOutcome::Retry {
                    error: e.to_string(),
                    status: None,
                };
            }
        }

        // 2. Sign
        let signing_key = match self.keys.private_key(&job.signing_actor_id).await {
            Ok(key) => key,
            Err(e) if e.is_transient() => {
                return DeliveryOutcome::Retry {
                    error: e.to_string(),
                    status: None,
                };
            }
            Err(e) => {
                return DeliveryOutcome::PermanentFailure {
                    error: e.to_string(),
                    status: None,
                };
            }
        };

        let body = match serde_json::to_vec(&job.activity) {
            Ok(body) => body,
            Err(e) => {
                return DeliveryOutcome::PermanentFailure {
                    error: format!("Failed to serialize activity: {}", e),
                    status: None,
                };
            }
        };

        let signed = match sign_request(
            "POST",
            &job.inbox,
            Some(&body),
            &signing_key.private_key_pem,
            &signing_key.key_id,
        ) {
            Ok(signed) => signed,
            Err(e) => {
                return DeliveryOutcome::PermanentFailure {
                    error: e.to_string(),
                    status: None,
                };
            }
        };

        let mut headers = vec![
            ("Content-Type", ACTIVITY_CONTENT_TYPE.to_string()),
            ("Date", signed.date),
            ("Signature", signed.signature),
            (CORRELATION_HEADER, job.correlation_id.clone()),
        ];
        if let Some(digest) = signed.digest {
            headers.push(("Digest", digest));
        }

        // 3. Send and classify
        let request = OutboundRequest {
            inbox: job.inbox.clone(),
            headers,
            body,
        };
        match self.transport.post(request).await {
            Ok(status) => match classify_status(status) {
                StatusClass::Success => DeliveryOutcome::Delivered { status },
                StatusClass::Transient => DeliveryOutcome::Retry {
                    error: format!("Inbox {} answered HTTP {}", job.inbox, status),
                    status: Some(status),
                },
                StatusClass::Permanent => DeliveryOutcome::PermanentFailure {
                    error: format!("Inbox {} rejected activity: HTTP {}", job.inbox, status),
                    status: Some(status),
                },
            },
            Err(e) => DeliveryOutcome::Retry {
                error: e.to_string(),
                status: None,
            },
        }
    }
}

/// Consumer of the `deliver` queue
pub struct DeliveryJobHandler {
    engine: Arc<DeliveryEngine>,
}

impl DeliveryJobHandler {
    pub fn new(engine: Arc<DeliveryEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for DeliveryJobHandler {
    async fn handle(&self, job: &QueuedJob) -> JobOutcome {
        let delivery: DeliveryJob = match serde_json::from_value(job.payload.clone()) {
            Ok(delivery) => delivery,
            Err(e) => {
                return JobOutcome::Failed {
                    error: format!("invalid delivery payload: {}", e),
                    status: None,
                };
            }
        };

        self.engine.deliver(&delivery).await.into()
    }
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    const CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

    /// Build a Follow activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (follower)
    /// * `object` - Object URI (followee)
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept of a Follow, referencing the Follow by id.
    pub fn accept(id: &str, actor: &str, follow_id: &str, follower: &str) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": {
                "type": "Follow",
                "id": follow_id,
                "actor": follower,
                "object": actor
            }
        })
    }

    /// Build a Reject of a Follow.
    pub fn reject(id: &str, actor: &str, follow_id: &str, follower: &str) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Reject",
            "id": id,
            "actor": actor,
            "object": {
                "type": "Follow",
                "id": follow_id,
                "actor": follower,
                "object": actor
            }
        })
    }

    /// Build a Create activity wrapping `object`
    pub fn create(id: &str, actor: &str, object: Value, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build a Delete activity with a Tombstone object
    pub fn delete(id: &str, actor: &str, object: &str, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Delete",
            "id": id,
            "actor": actor,
            "object": {
                "type": "Tombstone",
                "id": object
            },
            "to": to,
            "cc": cc
        })
    }

    pub fn like(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Like",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    pub fn announce(id: &str, actor: &str, object: &str, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Announce",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build an Undo activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (undoer)
    /// * `object` - Original activity being undone
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Note object
    pub fn note(
        id: &str,
        attributed_to: &str,
        content: &str,
        published: &str,
        in_reply_to: Option<&str>,
        to: Vec<&str>,
        cc: Vec<&str>,
    ) -> Value {
        serde_json::json!({
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content,
            "published": published,
            "inReplyTo": in_reply_to,
            "to": to,
            "cc": cc,
            "sensitive": false
        })
    }
}
