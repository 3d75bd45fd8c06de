//! Data models
//!
//! Rust structs representing the federation tables.
//! Entity ids are ULIDs; queue timestamps are epoch milliseconds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Actor
// =============================================================================

/// A federation identity, local or remote.
///
/// Local actors always carry a private key and no domain; remote
/// actors never carry a private key. The table enforces the same rule.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: String,
    /// ActivityPub id (globally unique)
    pub uri: String,
    pub username: String,
    /// Host of a remote actor, None for local actors
    pub domain: Option<String>,
    pub inbox_uri: String,
    pub shared_inbox_uri: Option<String>,
    pub followers_uri: Option<String>,
    pub key_id: String,
    /// RSA public key (SPKI PEM)
    pub public_key_pem: String,
    /// RSA private key (PKCS#8 PEM), local actors only
    #[serde(skip_serializing)]
    pub private_key_pem: Option<String>,
    pub is_local: bool,
    pub manually_approves_followers: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Actor {
    /// Build a local actor rooted at `base_url`.
    pub fn new_local(
        base_url: &str,
        username: &str,
        manually_approves_followers: bool,
        private_key_pem: String,
        public_key_pem: String,
    ) -> Self {
        let now = Utc::now();
        let uri = local_actor_uri(base_url, username);
        Self {
            id: EntityId::new().0,
            key_id: format!("{}#main-key", uri),
            inbox_uri: format!("{}/inbox", uri),
            shared_inbox_uri: Some(format!("{}/shared/inbox", base_url)),
            followers_uri: Some(format!("{}/followers", uri)),
            uri,
            username: username.to_string(),
            domain: None,
            public_key_pem,
            private_key_pem: Some(private_key_pem),
            is_local: true,
            manually_approves_followers,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build a remote actor from a fetched actor document.
    pub fn new_remote(profile: RemoteActorProfile) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new().0,
            uri: profile.uri,
            username: profile.username,
            domain: Some(profile.domain),
            inbox_uri: profile.inbox_uri,
            shared_inbox_uri: profile.shared_inbox_uri,
            followers_uri: profile.followers_uri,
            key_id: profile.key_id,
            public_key_pem: profile.public_key_pem,
            private_key_pem: None,
            is_local: false,
            manually_approves_followers: profile.manually_approves_followers,
            created_at: now,
            updated_at: now,
        }
    }

    /// Inbox to deliver to: the shared inbox when advertised.
    pub fn delivery_inbox(&self) -> &str {
        self.shared_inbox_uri.as_deref().unwrap_or(&self.inbox_uri)
    }
}

/// Actor URI for a local username.
pub fn local_actor_uri(base_url: &str, username: &str) -> String {
    format!("{}/actors/{}", base_url.trim_end_matches('/'), username)
}

/// Fields parsed from a remote actor document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteActorProfile {
    pub uri: String,
    pub username: String,
    pub domain: String,
    pub inbox_uri: String,
    pub shared_inbox_uri: Option<String>,
    pub followers_uri: Option<String>,
    pub key_id: String,
    pub public_key_pem: String,
    pub manually_approves_followers: bool,
}

// =============================================================================
// Follow relationship
// =============================================================================

/// Follow relationship state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowState {
    Requested,
    Approved,
    Rejected,
}

impl FollowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "requested" => Some(Self::Requested),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// `source` follows (or asked to follow) `target`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follow {
    pub id: String,
    pub source_actor_id: String,
    pub target_actor_id: String,
    /// Values: requested, approved, rejected
    pub state: String,
    /// Follow activity id; required whenever either party is remote
    pub activity_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Follow {
    pub fn new(
        source_actor_id: &str,
        target_actor_id: &str,
        state: FollowState,
        activity_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new().0,
            source_actor_id: source_actor_id.to_string(),
            target_actor_id: target_actor_id.to_string(),
            state: state.as_str().to_string(),
            activity_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Parsed state; unknown values read as rejected.
    pub fn follow_state(&self) -> FollowState {
        FollowState::parse(&self.state).unwrap_or(FollowState::Rejected)
    }

    pub fn is_approved(&self) -> bool {
        self.follow_state() == FollowState::Approved
    }
}

// =============================================================================
// Status / Like / Reblog
// =============================================================================

/// A post stored because a Create reached this server
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Status {
    pub id: String,
    /// ActivityPub URI (globally unique)
    pub uri: String,
    pub actor_id: String,
    /// Sanitized HTML content
    pub content: String,
    pub in_reply_to_uri: Option<String>,
    /// Visibility: public, unlisted, private, direct
    pub visibility: String,
    pub is_local: bool,
    pub created_at: DateTime<Utc>,
}

/// A Like or Announce applied to a status URI.
///
/// The status itself may not be stored locally.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Interaction {
    pub id: String,
    pub activity_id: String,
    pub actor_id: String,
    pub status_uri: String,
    pub created_at: DateTime<Utc>,
}

impl Interaction {
    pub fn new(activity_id: &str, actor_id: &str, status_uri: &str) -> Self {
        Self {
            id: EntityId::new().0,
            activity_id: activity_id.to_string(),
            actor_id: actor_id.to_string(),
            status_uri: status_uri.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Which interaction table an [`Interaction`] lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Like,
    Reblog,
}

impl InteractionKind {
    pub(crate) fn table(&self) -> &'static str {
        match self {
            Self::Like => "likes",
            Self::Reblog => "reblogs",
        }
    }
}

// =============================================================================
// Idempotency
// =============================================================================

/// Final outcome of processing an inbound activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessedOutcome {
    Processed,
    Rejected,
    Error,
}

impl ProcessedOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Rejected => "rejected",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessedActivity {
    pub digest: String,
    pub activity_id: String,
    /// Values: processed, rejected, error
    pub outcome: String,
    pub detail: Option<String>,
    pub processed_at: DateTime<Utc>,
}

// =============================================================================
// Jobs
// =============================================================================

/// Row of the durable job queue
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub queue: String,
    /// JSON payload
    pub payload: String,
    pub ordering_key: Option<String>,
    pub target_host: Option<String>,
    /// Values: pending, running, done, failed, dropped
    pub state: String,
    pub attempts: i64,
    pub next_run_at_ms: i64,
    pub locked_at_ms: Option<i64>,
    pub last_error: Option<String>,
    pub last_status: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

// =============================================================================
// Domain blocks
// =============================================================================

/// Domain block
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DomainBlock {
    pub id: String,
    pub domain: String,
    pub created_at: DateTime<Utc>,
}
