//! Inbound activity processing
//!
//! Consumes queued inbox envelopes: idempotency check and claim, HTTP
//! signature verification, then side effects per activity type.
//!
//! Transient failures (storage, unreachable remote) release the claim and
//! surface as errors so the queue retries. Everything else ends in a
//! permanent processing record, keyed by body digest and activity id.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::activity::{
    Activity, ActivityKind, InboundEnvelope, InboxVariant, ObjectRef, UndoObject, audience,
    extract_visibility, sanitize_remote_html, value_id,
};
use super::handshake::FollowCoordinator;
use super::key_directory::ActorKeyDirectory;
use super::queue::{JobHandler, JobOutcome, QueuedJob, now_ms};
use super::resolver::{RemoteResolver, extract_actor_domain};
use super::signature::{
    SignedRequest, extract_signature_key_id, key_id_matches_actor, verify_signature,
};
use crate::data::{
    Actor, Database, EntityId, Follow, Interaction, InteractionKind, ProcessedOutcome, Status,
};
use crate::error::{AppError, SignatureError};
use crate::metrics::{ACTIVITIES_PROCESSED, SIGNATURE_FAILURES};

/// Object types stored as statuses
const STATUS_TYPES: [&str; 4] = ["Note", "Article", "Question", "Page"];

/// Actor types an Update may refresh
const ACTOR_TYPES: [&str; 5] = ["Person", "Service", "Application", "Group", "Organization"];

/// Outcome of processing one envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    /// Side effects applied
    Applied { activity_type: &'static str },
    /// Already processed earlier; nothing done
    Duplicate,
    /// Another worker holds the claim; nothing done
    InFlight,
    /// Signature verification failed; dropped for good
    Rejected { reason: String },
    /// Valid but nothing to do (unsupported type, unknown target, ...)
    Ignored { reason: String },
    /// Malformed or semantically invalid; recorded with the error
    Invalid { reason: String },
}

impl ProcessingResult {
    fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Duplicate => "duplicate",
            Self::InFlight => "in_flight",
            Self::Rejected { .. } => "rejected",
            Self::Ignored { .. } => "ignored",
            Self::Invalid { .. } => "invalid",
        }
    }
}

/// What a handler did with a verified activity
enum Handled {
    Applied,
    Ignored(String),
}

fn signature_failure_reason(error: &SignatureError) -> &'static str {
    match error {
        SignatureError::MissingHeader(_) => "missing_header",
        SignatureError::Malformed(_) => "malformed",
        SignatureError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
        SignatureError::UnsignedHeader(_) => "unsigned_header",
        SignatureError::DigestMismatch => "digest_mismatch",
        SignatureError::StaleDate { .. } => "stale_date",
        SignatureError::KeyOwnerMismatch { .. } => "key_owner_mismatch",
        SignatureError::KeyUnavailable(_) => "key_unavailable",
        SignatureError::InvalidKey(_) => "invalid_key",
        SignatureError::BadSignature => "bad_signature",
    }
}

/// Applies verified inbound activities
pub struct ActivityProcessor {
    db: Arc<Database>,
    keys: Arc<ActorKeyDirectory>,
    resolver: Arc<RemoteResolver>,
    coordinator: Arc<FollowCoordinator>,
    clock_skew_seconds: i64,
    claim_lease: Duration,
    allow_private_hosts: bool,
}

impl ActivityProcessor {
    pub fn new(
        db: Arc<Database>,
        keys: Arc<ActorKeyDirectory>,
        resolver: Arc<RemoteResolver>,
        coordinator: Arc<FollowCoordinator>,
    ) -> Self {
        Self {
            db,
            keys,
            resolver,
            coordinator,
            clock_skew_seconds: 12 * 3600,
            claim_lease: Duration::from_secs(600),
            allow_private_hosts: false,
        }
    }

    pub fn with_clock_skew(mut self, clock_skew_seconds: i64) -> Self {
        self.clock_skew_seconds = clock_skew_seconds;
        self
    }

    pub fn with_claim_lease(mut self, claim_lease: Duration) -> Self {
        self.claim_lease = claim_lease;
        self
    }

    pub fn with_private_hosts(mut self, allow_private_hosts: bool) -> Self {
        self.allow_private_hosts = allow_private_hosts;
        self
    }

    /// Process one envelope.
    ///
    /// # Errors
    /// Only transient failures; the envelope stays unrecorded so a retry
    /// can process it.
    pub async fn process(&self, envelope: &InboundEnvelope) -> Result<ProcessingResult, AppError> {
        let digest = envelope.digest.as_str();
        let activity_id = envelope.activity_id();
        let activity_type = envelope.activity_type().to_string();

        // 1. Idempotency. The claim is refused once a record exists, so the
        // record is consulted again only to tell a finished duplicate from
        // one still in flight.
        let now = now_ms();
        let lease_ms = i64::try_from(self.claim_lease.as_millis()).unwrap_or(i64::MAX);
        if !self
            .db
            .try_claim_activity(digest, activity_id, now, now.saturating_sub(lease_ms))
            .await?
        {
            if let Some(record) = self.db.get_processed_activity(digest, activity_id).await? {
                tracing::debug!(
                    activity_id = %activity_id,
                    outcome = %record.outcome,
                    "Activity already processed"
                );
                return Ok(self.finish(&activity_type, ProcessingResult::Duplicate));
            }
            tracing::debug!(activity_id = %activity_id, "Activity claimed by another worker");
            return Ok(self.finish(&activity_type, ProcessingResult::InFlight));
        }

        // 2-3. Verify and apply
        let handled = self.verify_and_apply(envelope).await;

        // 4. Record
        let (result, outcome, detail) = match handled {
            Ok((kind, Handled::Applied)) => (
                ProcessingResult::Applied {
                    activity_type: kind,
                },
                ProcessedOutcome::Processed,
                None,
            ),
            Ok((_, Handled::Ignored(reason))) => (
                ProcessingResult::Ignored {
                    reason: reason.clone(),
                },
                ProcessedOutcome::Processed,
                Some(reason),
            ),
            Err(AppError::Signature(error)) => {
                SIGNATURE_FAILURES
                    .with_label_values(&[signature_failure_reason(&error)])
                    .inc();
                tracing::warn!(
                    activity_id = %activity_id,
                    actor = envelope.activity.get("actor").and_then(value_id).unwrap_or(""),
                    error = %error,
                    "Signature verification failed"
                );
                let reason = error.to_string();
                (
                    ProcessingResult::Rejected {
                        reason: reason.clone(),
                    },
                    ProcessedOutcome::Rejected,
                    Some(reason),
                )
            }
            Err(error) if error.is_transient() => {
                self.db
                    .release_activity_claim(digest, activity_id)
                    .await?;
                tracing::warn!(
                    activity_id = %activity_id,
                    error = %error,
                    "Transient failure processing activity"
                );
                return Err(error);
            }
            Err(error) => {
                tracing::info!(activity_id = %activity_id, error = %error, "Invalid activity");
                let reason = error.to_string();
                (
                    ProcessingResult::Invalid {
                        reason: reason.clone(),
                    },
                    ProcessedOutcome::Error,
                    Some(reason),
                )
            }
        };

        self.db
            .finish_activity(digest, activity_id, outcome, detail.as_deref())
            .await?;

        Ok(self.finish(&activity_type, result))
    }

    fn finish(&self, activity_type: &str, result: ProcessingResult) -> ProcessingResult {
        ACTIVITIES_PROCESSED
            .with_label_values(&[type_label(activity_type), result.label()])
            .inc();
        result
    }

    async fn verify_and_apply(
        &self,
        envelope: &InboundEnvelope,
    ) -> Result<(&'static str, Handled), AppError> {
        let activity = Activity::parse(&envelope.activity)?;

        let host = extract_actor_domain(&activity.actor, self.allow_private_hosts)?;
        if self.db.is_domain_blocked(&host).await? {
            return Ok((
                activity.kind.name(),
                Handled::Ignored(format!("domain {} is blocked", host)),
            ));
        }

        self.verify(envelope, &activity).await?;

        let sender = self.resolver.resolve_actor(&activity.actor).await?;
        let handled = self.apply(envelope, &activity, &sender).await?;

        Ok((activity.kind.name(), handled))
    }

    /// Verify the HTTP signature captured at receipt.
    ///
    /// A signature that fails against the known key is retried once with
    /// a freshly fetched key, in case the sender rotated it.
    async fn verify(&self, envelope: &InboundEnvelope, activity: &Activity) -> Result<(), AppError> {
        let key_id = extract_signature_key_id(&envelope.headers)?;
        if !key_id_matches_actor(&key_id, &activity.actor) {
            return Err(SignatureError::KeyOwnerMismatch {
                key_id,
                actor: activity.actor.clone(),
            }
            .into());
        }

        let request = SignedRequest {
            method: &envelope.method,
            path: &envelope.path,
            headers: &envelope.headers,
            body_digest: Some(&envelope.digest),
        };

        let key = self.keys.public_key(&key_id).await?;
        let check = |pem: &str| {
            verify_signature(&request, pem, envelope.received_at, self.clock_skew_seconds)
        };

        let key = match check(&key.public_key_pem) {
            Ok(()) => key,
            Err(SignatureError::BadSignature | SignatureError::InvalidKey(_)) => {
                let refreshed = self.keys.refresh(&key_id).await?;
                check(&refreshed.public_key_pem)?;
                refreshed
            }
            Err(error) => return Err(error.into()),
        };

        if !key_id_matches_actor(&key.owner, &activity.actor) {
            return Err(SignatureError::KeyOwnerMismatch {
                key_id,
                actor: activity.actor.clone(),
            }
            .into());
        }

        Ok(())
    }

    async fn apply(
        &self,
        envelope: &InboundEnvelope,
        activity: &Activity,
        sender: &Actor,
    ) -> Result<Handled, AppError> {
        match &activity.kind {
            ActivityKind::Follow { object } => self.handle_follow(activity, sender, object).await,
            ActivityKind::Accept { object } => self.handle_follow_response(sender, object, true).await,
            ActivityKind::Reject { object } => self.handle_follow_response(sender, object, false).await,
            ActivityKind::Create { object } => self.handle_create(envelope, sender, object).await,
            ActivityKind::Announce { object } => {
                self.handle_interaction(activity, sender, object, InteractionKind::Reblog)
                    .await
            }
            ActivityKind::Like { object } => {
                self.handle_interaction(activity, sender, object, InteractionKind::Like)
                    .await
            }
            ActivityKind::Undo { object } => self.handle_undo(sender, object).await,
            ActivityKind::Delete { object } => self.handle_delete(sender, object).await,
            ActivityKind::Update { object } => self.handle_update(sender, object).await,
            ActivityKind::Unsupported { kind } => {
                tracing::debug!(activity_type = %kind, "Unsupported activity type");
                Ok(Handled::Ignored(format!("unsupported activity type {}", kind)))
            }
        }
    }

    async fn handle_follow(
        &self,
        activity: &Activity,
        sender: &Actor,
        object: &str,
    ) -> Result<Handled, AppError> {
        let activity_id = activity
            .id
            .as_deref()
            .ok_or_else(|| AppError::Validation("Follow without id".to_string()))?;

        let target = match self.db.get_actor_by_uri(object).await? {
            Some(target) if target.is_local => target,
            _ => return Ok(Handled::Ignored(format!("follow target {} is not local", object))),
        };

        let outcome = self
            .coordinator
            .receive_remote_follow(sender, &target, activity_id)
            .await?;

        tracing::info!(
            follower = %sender.uri,
            target = %target.uri,
            state = outcome.state().map(|state| state.as_str()).unwrap_or("none"),
            "Follow received"
        );
        Ok(Handled::Applied)
    }

    async fn handle_follow_response(
        &self,
        sender: &Actor,
        object: &ObjectRef,
        accepted: bool,
    ) -> Result<Handled, AppError> {
        let follow_id = object
            .id()
            .ok_or_else(|| AppError::Validation("Follow response without object id".to_string()))?;

        let Some(follow) = self.find_local_follow(follow_id, object, sender).await? else {
            return Ok(Handled::Ignored(format!("no pending follow {}", follow_id)));
        };
        if follow.target_actor_id != sender.id {
            return Err(AppError::Validation(format!(
                "{} is not the target of follow {}",
                sender.uri, follow_id
            )));
        }

        let outcome = self
            .coordinator
            .apply_remote_response(follow, accepted)
            .await?;
        tracing::info!(
            target = %sender.uri,
            state = outcome.state().map(|state| state.as_str()).unwrap_or("none"),
            "Follow response received"
        );
        Ok(Handled::Applied)
    }

    /// Relationship answered by an Accept/Reject: by stored activity id,
    /// falling back to the embedded Follow's actor pair.
    async fn find_local_follow(
        &self,
        follow_id: &str,
        object: &ObjectRef,
        sender: &Actor,
    ) -> Result<Option<Follow>, AppError> {
        if let Some(follow) = self.db.get_follow_by_activity_id(follow_id).await? {
            return Ok(Some(follow));
        }

        let ObjectRef::Embedded(embedded) = object else {
            return Ok(None);
        };
        let Some(follower_uri) = embedded.get("actor").and_then(value_id) else {
            return Ok(None);
        };
        match self.db.get_actor_by_uri(follower_uri).await? {
            Some(follower) if follower.is_local => {
                self.db.get_follow(&follower.id, &sender.id).await
            }
            _ => Ok(None),
        }
    }

    async fn handle_create(
        &self,
        envelope: &InboundEnvelope,
        sender: &Actor,
        object: &Value,
    ) -> Result<Handled, AppError> {
        let object_type = object.get("type").and_then(Value::as_str).unwrap_or("");
        if !STATUS_TYPES.contains(&object_type) {
            return Ok(Handled::Ignored(format!("unsupported object type {}", object_type)));
        }

        let author = object.get("attributedTo").and_then(value_id);
        if author != Some(sender.uri.as_str()) {
            return Err(AppError::Validation(
                "Create object is not attributed to the sending actor".to_string(),
            ));
        }

        if envelope.inbox == InboxVariant::Shared && !self.addressed_locally(sender, object).await? {
            return Ok(Handled::Ignored("not addressed to local actors".to_string()));
        }

        if self.store_status(sender, object).await? {
            Ok(Handled::Applied)
        } else {
            Ok(Handled::Ignored("status already stored".to_string()))
        }
    }

    /// Whether a shared-inbox object concerns anyone here: addressed to a
    /// local actor, or to a followers collection a local actor follows.
    async fn addressed_locally(&self, sender: &Actor, object: &Value) -> Result<bool, AppError> {
        for addressee in audience(object) {
            if self.resolver.is_local_uri(addressee) {
                if let Some(actor) = self.db.get_actor_by_uri(addressee).await? {
                    if actor.is_local {
                        return Ok(true);
                    }
                }
                continue;
            }
            if self
                .db
                .is_followers_collection_followed_locally(addressee)
                .await?
            {
                return Ok(true);
            }
        }

        match &sender.followers_uri {
            Some(followers_uri) => {
                self.db
                    .is_followers_collection_followed_locally(followers_uri)
                    .await
            }
            None => Ok(false),
        }
    }

    /// Store a remote status object. Returns false when already stored.
    async fn store_status(&self, author: &Actor, object: &Value) -> Result<bool, AppError> {
        let uri = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Status object without id".to_string()))?;
        if self.resolver.is_local_uri(uri) {
            return Err(AppError::Validation(format!(
                "Remote status claims local URI {}",
                uri
            )));
        }

        let content = object.get("content").and_then(Value::as_str).unwrap_or("");
        let created_at = object
            .get("published")
            .and_then(Value::as_str)
            .and_then(|published| chrono::DateTime::parse_from_rfc3339(published).ok())
            .map(|published| published.with_timezone(&chrono::Utc))
            .unwrap_or_else(chrono::Utc::now);

        let status = Status {
            id: EntityId::new().0,
            uri: uri.to_string(),
            actor_id: author.id.clone(),
            content: sanitize_remote_html(content),
            in_reply_to_uri: object
                .get("inReplyTo")
                .and_then(value_id)
                .map(str::to_string),
            visibility: extract_visibility(object).to_string(),
            is_local: false,
            created_at,
        };

        let inserted = self.db.insert_status(&status).await?;
        if inserted {
            tracing::info!(status = %status.uri, author = %author.uri, "Remote status stored");
        }
        Ok(inserted)
    }

    /// Make sure a status referenced by URI is known, fetching it lazily.
    async fn ensure_status(&self, status_uri: &str) -> Result<(), AppError> {
        if self.resolver.is_local_uri(status_uri)
            || self.db.get_status_by_uri(status_uri).await?.is_some()
        {
            return Ok(());
        }

        let object = self.resolver.resolve_object(status_uri).await?;
        let author_uri = object
            .get("attributedTo")
            .and_then(value_id)
            .ok_or_else(|| AppError::Validation(format!("{} has no author", status_uri)))?;
        let author = self.resolver.resolve_actor(author_uri).await?;
        self.store_status(&author, &object).await?;

        Ok(())
    }

    async fn handle_interaction(
        &self,
        activity: &Activity,
        sender: &Actor,
        status_uri: &str,
        kind: InteractionKind,
    ) -> Result<Handled, AppError> {
        let activity_id = activity
            .id
            .as_deref()
            .ok_or_else(|| AppError::Validation(format!("{} without id", activity.kind.name())))?;

        self.ensure_status(status_uri).await?;

        let interaction = Interaction::new(activity_id, &sender.id, status_uri);
        if self.db.insert_interaction(kind, &interaction).await? {
            tracing::info!(
                actor = %sender.uri,
                status = %status_uri,
                kind = activity.kind.name(),
                "Interaction stored"
            );
            Ok(Handled::Applied)
        } else {
            Ok(Handled::Ignored("interaction already stored".to_string()))
        }
    }

    async fn handle_undo(&self, sender: &Actor, object: &UndoObject) -> Result<Handled, AppError> {
        let removed = match object {
            UndoObject::Follow {
                activity_id,
                target,
            } => {
                self.undo_follow(sender, activity_id.as_deref(), target.as_deref())
                    .await?
            }
            UndoObject::Like {
                activity_id,
                status_uri,
            } => {
                self.undo_interaction(
                    sender,
                    InteractionKind::Like,
                    activity_id.as_deref(),
                    status_uri.as_deref(),
                )
                .await?
            }
            UndoObject::Announce {
                activity_id,
                status_uri,
            } => {
                self.undo_interaction(
                    sender,
                    InteractionKind::Reblog,
                    activity_id.as_deref(),
                    status_uri.as_deref(),
                )
                .await?
            }
            UndoObject::Reference(activity_id) => {
                self.undo_follow(sender, Some(activity_id), None).await?
                    || self
                        .undo_interaction(sender, InteractionKind::Like, Some(activity_id), None)
                        .await?
                    || self
                        .undo_interaction(sender, InteractionKind::Reblog, Some(activity_id), None)
                        .await?
            }
            UndoObject::Other(kind) => {
                return Ok(Handled::Ignored(format!("cannot undo {}", kind)));
            }
        };

        if removed {
            Ok(Handled::Applied)
        } else {
            Ok(Handled::Ignored("nothing to undo".to_string()))
        }
    }

    async fn undo_follow(
        &self,
        sender: &Actor,
        activity_id: Option<&str>,
        target_uri: Option<&str>,
    ) -> Result<bool, AppError> {
        let mut follow = match activity_id {
            Some(activity_id) => self.db.get_follow_by_activity_id(activity_id).await?,
            None => None,
        };
        if follow.is_none() {
            if let Some(target_uri) = target_uri {
                if let Some(target) = self.db.get_actor_by_uri(target_uri).await? {
                    follow = self.db.get_follow(&sender.id, &target.id).await?;
                }
            }
        }

        match follow {
            Some(follow) if follow.source_actor_id == sender.id => {
                self.db.delete_follow(&follow.id).await?;
                tracing::info!(follower = %sender.uri, "Follow undone");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn undo_interaction(
        &self,
        sender: &Actor,
        kind: InteractionKind,
        activity_id: Option<&str>,
        status_uri: Option<&str>,
    ) -> Result<bool, AppError> {
        if let Some(activity_id) = activity_id {
            if self
                .db
                .delete_interaction_by_activity(kind, activity_id, &sender.id)
                .await?
            {
                return Ok(true);
            }
        }
        match status_uri {
            Some(status_uri) => {
                self.db
                    .delete_interaction_by_status(kind, &sender.id, status_uri)
                    .await
            }
            None => Ok(false),
        }
    }

    async fn handle_delete(&self, sender: &Actor, object: &str) -> Result<Handled, AppError> {
        if object == sender.uri {
            self.db.delete_remote_actor(&sender.uri).await?;
            self.keys.invalidate_actor(&sender.uri).await;
            tracing::info!(actor = %sender.uri, "Remote actor deleted");
            return Ok(Handled::Applied);
        }

        if self.db.delete_status_owned_by(object, &sender.id).await? {
            tracing::info!(status = %object, "Remote status deleted");
            Ok(Handled::Applied)
        } else {
            Ok(Handled::Ignored(format!("no status {} owned by sender", object)))
        }
    }

    async fn handle_update(&self, sender: &Actor, object: &Value) -> Result<Handled, AppError> {
        let object_type = object.get("type").and_then(Value::as_str).unwrap_or("");
        if !ACTOR_TYPES.contains(&object_type) {
            return Ok(Handled::Ignored(format!("updates of {} are not stored", object_type)));
        }
        if object.get("id").and_then(Value::as_str) != Some(sender.uri.as_str()) {
            return Err(AppError::Validation(
                "Actor update for a different actor".to_string(),
            ));
        }

        self.keys.invalidate_actor(&sender.uri).await;
        self.resolver.refresh_actor(&sender.uri).await?;
        tracing::info!(actor = %sender.uri, "Remote actor refreshed");
        Ok(Handled::Applied)
    }
}

/// Bounded metric label for a remote-supplied activity type
pub(crate) fn type_label(activity_type: &str) -> &'static str {
    match activity_type {
        "Follow" => "Follow",
        "Accept" => "Accept",
        "Reject" => "Reject",
        "Create" => "Create",
        "Announce" => "Announce",
        "Like" => "Like",
        "Undo" => "Undo",
        "Delete" => "Delete",
        "Update" => "Update",
        _ => "Unsupported",
    }
}

/// Consumer of the inbox queues
pub struct InboxJobHandler {
    processor: Arc<ActivityProcessor>,
}

impl InboxJobHandler {
    pub fn new(processor: Arc<ActivityProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl JobHandler for InboxJobHandler {
    async fn handle(&self, job: &QueuedJob) -> JobOutcome {
        let envelope: InboundEnvelope = match serde_json::from_value(job.payload.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                return JobOutcome::Failed {
                    error: format!("invalid inbox payload: {}", e),
                    status: None,
                };
            }
        };

        match self.processor.process(&envelope).await {
            Ok(_) => JobOutcome::Done { status: None },
            Err(error) => JobOutcome::Retry {
                error: error.to_string(),
                status: None,
            },
        }
    }
}
