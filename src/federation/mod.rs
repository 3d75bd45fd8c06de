//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures (sign, verify, digest)
//! - Public/private key lookup
//! - Inbox receipt and queued activity processing
//! - Outbound delivery with retry
//! - Follow handshake
//! - Task queues (durable and inline)

pub mod activity;
pub mod delivery;
pub mod handshake;
pub mod inbox;
pub mod key_directory;
pub mod processor;
pub mod queue;
pub mod resolver;
pub mod signature;

pub use activity::{Activity, ActivityKind, InboundEnvelope, InboxVariant};
pub use delivery::{
    DeliveryEngine, DeliveryJob, DeliveryJobHandler, DeliveryOutcome, DeliveryService,
    DeliveryTransport, ReqwestTransport, classify_status,
};
pub use handshake::{FollowCoordinator, FollowEffect, HandshakeOutcome};
pub use inbox::{InboxDispatcher, InboxReceipt, InboxRequest};
pub use key_directory::{ActorKey, ActorKeyDirectory, CacheStats, SigningKey};
pub use processor::{ActivityProcessor, InboxJobHandler, ProcessingResult};
pub use queue::{
    DurableQueue, EnqueueReceipt, InlineQueue, JobHandler, JobOutcome, JobReport, JobState,
    NewJob, QueueName, QueueWorker, QueuedJob, RetryPolicy, TaskQueue,
};
pub use resolver::{ActorFetcher, HttpFetcher, RemoteResolver};
pub use signature::{
    SignatureHeaders, SignedRequest, generate_digest, generate_key_pair, sign_request,
    verify_signature,
};
