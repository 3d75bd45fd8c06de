//! Inbound activity vocabulary
//!
//! The closed set of activity types this server acts on, parsed from
//! raw JSON, plus the envelope that carries a received activity through
//! the inbox queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::signature::CapturedHeaders;
use crate::error::AppError;

/// Public addressing collection
pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Reference to an object: a bare URI or an embedded document.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectRef {
    Uri(String),
    Embedded(Value),
}

impl ObjectRef {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(uri) => Some(Self::Uri(uri.clone())),
            Value::Object(_) => Some(Self::Embedded(value.clone())),
            _ => None,
        }
    }

    /// The referenced object's id
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Uri(uri) => Some(uri),
            Self::Embedded(object) => object.get("id").and_then(Value::as_str),
        }
    }

    /// `type` of an embedded object
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Uri(_) => None,
            Self::Embedded(object) => object.get("type").and_then(Value::as_str),
        }
    }

    /// `object` of an embedded activity, as an id
    pub fn inner_object_id(&self) -> Option<&str> {
        match self {
            Self::Uri(_) => None,
            Self::Embedded(object) => object.get("object").and_then(value_id),
        }
    }
}

/// What an Undo reverses
#[derive(Debug, Clone, PartialEq)]
pub enum UndoObject {
    Follow {
        activity_id: Option<String>,
        target: Option<String>,
    },
    Like {
        activity_id: Option<String>,
        status_uri: Option<String>,
    },
    Announce {
        activity_id: Option<String>,
        status_uri: Option<String>,
    },
    /// Bare activity URI; the stored record decides what it was
    Reference(String),
    /// Embedded activity of a type this server does not undo
    Other(String),
}

/// Closed set of inbound activity types
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityKind {
    Follow { object: String },
    Accept { object: ObjectRef },
    Reject { object: ObjectRef },
    Create { object: Value },
    Announce { object: String },
    Like { object: String },
    Undo { object: UndoObject },
    Delete { object: String },
    Update { object: Value },
    Unsupported { kind: String },
}

impl ActivityKind {
    /// Type name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Self::Follow { .. } => "Follow",
            Self::Accept { .. } => "Accept",
            Self::Reject { .. } => "Reject",
            Self::Create { .. } => "Create",
            Self::Announce { .. } => "Announce",
            Self::Like { .. } => "Like",
            Self::Undo { .. } => "Undo",
            Self::Delete { .. } => "Delete",
            Self::Update { .. } => "Update",
            Self::Unsupported { .. } => "Unsupported",
        }
    }
}

/// A parsed inbound activity
#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    pub id: Option<String>,
    /// Sending actor URI
    pub actor: String,
    pub kind: ActivityKind,
}

/// `id` of a value that is either a URI string or an object with `id`.
pub fn value_id(value: &Value) -> Option<&str> {
    value
        .as_str()
        .or_else(|| value.get("id").and_then(Value::as_str))
}

/// Minimal structural check done at receipt: an object with `type` and `actor`.
///
/// # Returns
/// `(type, actor)`
pub fn validate_structure(activity: &Value) -> Result<(&str, &str), AppError> {
    if !activity.is_object() {
        return Err(AppError::Validation(
            "Activity must be a JSON object".to_string(),
        ));
    }
    let kind = activity
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?;
    let actor = activity
        .get("actor")
        .and_then(value_id)
        .ok_or_else(|| AppError::Validation("Missing activity actor".to_string()))?;
    Ok((kind, actor))
}

impl Activity {
    /// Parse an activity into the closed enum.
    ///
    /// Unknown types parse as `Unsupported`; a known type with a
    /// missing or ill-typed `object` is a validation error.
    pub fn parse(activity: &Value) -> Result<Self, AppError> {
        let (kind, actor) = validate_structure(activity)?;
        let id = activity.get("id").and_then(Value::as_str).map(str::to_string);
        let object = activity.get("object");

        let object_uri = || {
            object
                .and_then(value_id)
                .map(str::to_string)
                .ok_or_else(|| AppError::Validation(format!("Invalid object in {}", kind)))
        };
        let object_ref = || {
            object
                .and_then(ObjectRef::from_value)
                .ok_or_else(|| AppError::Validation(format!("Invalid object in {}", kind)))
        };
        let embedded = || {
            object
                .filter(|value| value.is_object())
                .cloned()
                .ok_or_else(|| AppError::Validation(format!("{} object must be embedded", kind)))
        };

        let kind = match kind {
            "Follow" => ActivityKind::Follow {
                object: object_uri()?,
            },
            "Accept" => ActivityKind::Accept {
                object: object_ref()?,
            },
            "Reject" => ActivityKind::Reject {
                object: object_ref()?,
            },
            "Create" => ActivityKind::Create {
                object: embedded()?,
            },
            "Announce" => ActivityKind::Announce {
                object: object_uri()?,
            },
            "Like" => ActivityKind::Like {
                object: object_uri()?,
            },
            "Undo" => ActivityKind::Undo {
                object: parse_undo_object(&object_ref()?),
            },
            "Delete" => ActivityKind::Delete {
                object: extract_delete_target_uri(object)
                    .ok_or_else(|| AppError::Validation("Invalid object in Delete".to_string()))?,
            },
            "Update" => ActivityKind::Update {
                object: embedded()?,
            },
            other => ActivityKind::Unsupported {
                kind: other.to_string(),
            },
        };

        Ok(Self {
            id,
            actor: actor.to_string(),
            kind,
        })
    }
}

fn parse_undo_object(object: &ObjectRef) -> UndoObject {
    let activity_id = object.id().map(str::to_string);
    let inner = object.inner_object_id().map(str::to_string);
    match (object, object.kind()) {
        (ObjectRef::Uri(uri), _) => UndoObject::Reference(uri.clone()),
        (_, Some("Follow")) => UndoObject::Follow {
            activity_id,
            target: inner,
        },
        (_, Some("Like")) => UndoObject::Like {
            activity_id,
            status_uri: inner,
        },
        (_, Some("Announce")) => UndoObject::Announce {
            activity_id,
            status_uri: inner,
        },
        (_, other) => UndoObject::Other(other.unwrap_or("unknown").to_string()),
    }
}

/// Target of a Delete: a bare URI, or the `id` of an embedded object
/// (Tombstone or otherwise).
fn extract_delete_target_uri(object: Option<&Value>) -> Option<String> {
    let object = object?;

    if let Some(uri) = object.as_str() {
        return Some(uri.to_string());
    }

    object
        .get("id")
        .and_then(Value::as_str)
        .or_else(|| object.get("object").and_then(Value::as_str))
        .map(str::to_string)
}

/// Strip anything but safe formatting from remote HTML.
pub fn sanitize_remote_html(content: &str) -> String {
    ammonia::clean(content)
}

/// Every addressee of an object (`to`, `cc`, `bto`, `bcc`, `audience`).
pub fn audience(object: &Value) -> Vec<&str> {
    let mut addressees = Vec::new();
    for field in ["to", "cc", "bto", "bcc", "audience"] {
        match object.get(field) {
            Some(Value::String(value)) => addressees.push(value.as_str()),
            Some(Value::Array(values)) => {
                addressees.extend(values.iter().filter_map(Value::as_str))
            }
            _ => {}
        }
    }
    addressees
}

/// Visibility derived from addressing: public, unlisted, private.
pub fn extract_visibility(object: &Value) -> &'static str {
    let contains_public = |audience: &Value| -> bool {
        if let Some(value) = audience.as_str() {
            return value == PUBLIC_AUDIENCE;
        }
        audience
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|value| value == PUBLIC_AUDIENCE)
            })
            .unwrap_or(false)
    };

    if object.get("to").is_some_and(contains_public) {
        "public"
    } else if object.get("cc").is_some_and(contains_public) {
        "unlisted"
    } else {
        "private"
    }
}

/// Which inbox endpoint received an activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboxVariant {
    Personal { actor_name: String },
    Shared,
}

/// A received activity with everything needed to verify it later.
///
/// Immutable once enqueued; serialized as the job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub activity: Value,
    /// Request headers, lower-cased names
    pub headers: CapturedHeaders,
    /// `SHA-256=<base64>` of the raw body
    pub digest: String,
    pub method: String,
    /// Path and query as received
    pub path: String,
    pub inbox: InboxVariant,
    pub received_at: DateTime<Utc>,
}

impl InboundEnvelope {
    /// Activity id, or empty when the sender omitted one
    pub fn activity_id(&self) -> &str {
        self.activity
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn activity_type(&self) -> &str {
        self.activity
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }
}
