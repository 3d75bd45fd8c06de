//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (actor documents, inboxes)
//! - Admin API
//! - Metrics (Prometheus)

mod activitypub;
mod admin;
pub mod metrics;

pub use activitypub::activitypub_router;
pub use admin::{DeliveryView, admin_router};
pub use metrics::metrics_router;

/// Largest inbox body accepted
pub const MAX_ACTIVITY_BODY_BYTES: usize = 1024 * 1024;
