//! Fediport - federation core for an ActivityPub social server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Personal and shared inboxes                              │
//! │  - Local actor documents                                    │
//! │  - Admin (deliveries, domain blocks), metrics, health       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Inbound dispatcher -> queue -> activity processor        │
//! │  - Follow handshake, outbound delivery with retry           │
//! │  - HTTP signatures, actor key directory                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx): actors, follows, statuses, jobs,          │
//! │    idempotency records, domain blocks                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `auth`: Admin bearer token
//! - `federation`: ActivityPub federation handling
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus registry

pub mod api;
pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use federation::{
    ActivityProcessor, ActorFetcher, ActorKeyDirectory, DeliveryEngine, DeliveryJobHandler,
    DeliveryService, DeliveryTransport, DurableQueue, FollowCoordinator, InboxDispatcher,
    InboxJobHandler, InlineQueue, JobHandler, QueueName, QueueWorker, RemoteResolver,
    RetryPolicy, TaskQueue,
};

/// RSA modulus size for generated local actor keys
const LOCAL_KEY_BITS: usize = 2048;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains the wired
/// federation services.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Queue used for inbox and delivery work
    pub queue: Arc<dyn TaskQueue>,

    /// Set when the durable driver is configured; workers consume it
    pub durable_queue: Option<Arc<DurableQueue>>,

    pub inbox: Arc<InboxDispatcher>,
    pub processor: Arc<ActivityProcessor>,
    pub delivery: DeliveryService,
    pub delivery_engine: Arc<DeliveryEngine>,
    pub coordinator: Arc<FollowCoordinator>,
    pub keys: Arc<ActorKeyDirectory>,
    pub resolver: Arc<RemoteResolver>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the outbound HTTP client
    /// 3. Wire federation services
    /// 4. Create configured local actors
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        use std::path::Path;

        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(Path::new(&config.database.path)).await?);
        tracing::info!("Database connected");

        // 2. Initialize HTTP client
        let http_client = federation::resolver::build_http_client(
            &config.federation.user_agent,
            config.federation.request_timeout(),
        )?;
        let fetcher = Arc::new(federation::HttpFetcher::new(
            http_client.clone(),
            config.federation.allow_private_hosts,
        ));
        let transport = Arc::new(federation::ReqwestTransport::new(http_client));

        // 3. Wire services
        let state = Self::with_collaborators(config, db, fetcher, transport);
        tracing::info!(
            queue_driver = ?state.config.federation.queue_driver,
            "Federation services initialized"
        );

        // 4. Local actors
        state.bootstrap_local_actors().await?;

        Ok(state)
    }

    /// Wire services around an open database and injected network seams.
    pub fn with_collaborators(
        config: config::AppConfig,
        db: Arc<data::Database>,
        fetcher: Arc<dyn ActorFetcher>,
        transport: Arc<dyn DeliveryTransport>,
    ) -> Self {
        let federation_config = &config.federation;
        let base_url = config.server.base_url();

        let (queue, durable_queue, inline_queue): (
            Arc<dyn TaskQueue>,
            Option<Arc<DurableQueue>>,
            Option<Arc<InlineQueue>>,
        ) = match federation_config.queue_driver {
            config::QueueDriver::Durable => {
                let durable = Arc::new(DurableQueue::new(db.clone()));
                (durable.clone(), Some(durable), None)
            }
            config::QueueDriver::Inline => {
                let inline = Arc::new(InlineQueue::new(db.clone()));
                (inline.clone(), None, Some(inline))
            }
        };

        let resolver = Arc::new(RemoteResolver::new(db.clone(), fetcher, base_url.clone()));
        let keys = Arc::new(ActorKeyDirectory::new(
            db.clone(),
            resolver.clone(),
            federation_config.key_cache_ttl(),
        ));
        let delivery = DeliveryService::new(db.clone(), queue.clone(), base_url);
        let coordinator = Arc::new(FollowCoordinator::new(db.clone(), delivery.clone()));
        let processor = Arc::new(
            ActivityProcessor::new(db.clone(), keys.clone(), resolver.clone(), coordinator.clone())
                .with_clock_skew(federation_config.clock_skew_seconds)
                .with_claim_lease(claim_lease(federation_config))
                .with_private_hosts(federation_config.allow_private_hosts),
        );
        let delivery_engine = Arc::new(DeliveryEngine::new(
            db.clone(),
            keys.clone(),
            transport,
            federation_config.allow_private_hosts,
        ));
        let inbox = Arc::new(InboxDispatcher::new(db.clone(), queue.clone()));

        if let Some(inline) = &inline_queue {
            let policy = RetryPolicy::from_config(federation_config);
            let inbox_handler: Arc<dyn JobHandler> =
                Arc::new(InboxJobHandler::new(processor.clone()));
            inline.register(QueueName::PersonalInbox, inbox_handler.clone(), policy.clone());
            inline.register(QueueName::SharedInbox, inbox_handler, policy.clone());
            inline.register(
                QueueName::Deliver,
                Arc::new(DeliveryJobHandler::new(delivery_engine.clone())),
                policy,
            );
        }

        Self {
            config: Arc::new(config),
            db,
            queue,
            durable_queue,
            inbox,
            processor,
            delivery,
            delivery_engine,
            coordinator,
            keys,
            resolver,
        }
    }

    /// Create configured local actors that do not exist yet.
    pub async fn bootstrap_local_actors(&self) -> Result<(), error::AppError> {
        let base_url = self.config.server.base_url();

        for local in &self.config.instance.actors {
            if let Some(existing) = self.db.get_local_actor_by_username(&local.username).await? {
                tracing::info!(username = %existing.username, "Local actor exists");
                continue;
            }

            let (private_key_pem, public_key_pem) =
                federation::generate_key_pair(LOCAL_KEY_BITS)?;
            let actor = data::Actor::new_local(
                &base_url,
                &local.username,
                local.manually_approves_followers,
                private_key_pem,
                public_key_pem,
            );
            self.db.insert_actor(&actor).await?;

            tracing::info!(
                username = %actor.username,
                uri = %actor.uri,
                "Local actor created"
            );
        }

        Ok(())
    }

    /// Start the key cache pruner and, with the durable driver, worker
    /// pools for each queue.
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![tokio::spawn(self.keys.clone().run_pruner(
            self.config.federation.key_cache_ttl(),
            shutdown.clone(),
        ))];

        let Some(durable) = &self.durable_queue else {
            return handles;
        };

        let federation_config = &self.config.federation;
        let policy = RetryPolicy::from_config(federation_config);
        let inbox_handler: Arc<dyn JobHandler> =
            Arc::new(InboxJobHandler::new(self.processor.clone()));
        let delivery_handler: Arc<dyn JobHandler> =
            Arc::new(DeliveryJobHandler::new(self.delivery_engine.clone()));

        let pools = [
            (
                QueueName::PersonalInbox,
                inbox_handler.clone(),
                federation_config.inbox_workers,
            ),
            (
                QueueName::SharedInbox,
                inbox_handler,
                federation_config.inbox_workers,
            ),
            (
                QueueName::Deliver,
                delivery_handler,
                federation_config.delivery_workers,
            ),
        ];

        handles.extend(pools.into_iter().map(|(queue, handler, concurrency)| {
            let worker = QueueWorker::new(
                self.db.clone(),
                queue,
                handler,
                policy.clone(),
                durable.notifier(),
            )
            .with_concurrency(concurrency)
            .with_poll_interval(federation_config.poll_interval())
            .with_lease(claim_lease(federation_config));
            tokio::spawn(Arc::new(worker).run(shutdown.clone()))
        }));

        handles
    }
}

fn claim_lease(config: &config::FederationConfig) -> Duration {
    Duration::from_secs(u64::try_from(config.claim_lease_seconds).unwrap_or(600))
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower::ServiceBuilder;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::activitypub_router())
        .nest("/admin", api::admin_router())
        .merge(api::metrics_router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(RequestBodyLimitLayer::new(api::MAX_ACTIVITY_BODY_BYTES)),
        )
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
