//! Common test utilities for E2E tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fediport::data::{Actor, Database};
use fediport::error::AppError;
use fediport::federation::delivery::OutboundRequest;
use fediport::federation::signature::sign_request_at;
use fediport::federation::{
    ActorFetcher, DeliveryJobHandler, DeliveryTransport, InboxJobHandler, JobHandler, JobReport,
    QueueName, QueueWorker, RetryPolicy,
};
use fediport::{AppState, config};
use http::HeaderMap;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const LOCAL_BASE: &str = "https://local.example";
pub const ADMIN_TOKEN: &str = "test-admin-token-0123456789abcdef";

pub const LOCAL_PRIVATE_KEY: &str = include_str!("../fixtures/local_actor_key.pem");
pub const LOCAL_PUBLIC_KEY: &str = include_str!("../fixtures/local_actor_key.pub.pem");
pub const REMOTE_PRIVATE_KEY: &str = include_str!("../fixtures/remote_actor_key.pem");
pub const REMOTE_PUBLIC_KEY: &str = include_str!("../fixtures/remote_actor_key.pub.pem");
pub const ROTATED_PRIVATE_KEY: &str = include_str!("../fixtures/rotated_actor_key.pem");
pub const ROTATED_PUBLIC_KEY: &str = include_str!("../fixtures/rotated_actor_key.pub.pem");

/// A remote actor served by [`FakeFetcher`]
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub uri: String,
    pub key_id: String,
    pub inbox: String,
    pub shared_inbox: String,
    pub private_key_pem: &'static str,
}

impl RemotePeer {
    pub fn new(host: &str, username: &str) -> Self {
        let uri = format!("https://{}/users/{}", host, username);
        Self {
            key_id: format!("{}#main-key", uri),
            inbox: format!("{}/inbox", uri),
            shared_inbox: format!("https://{}/inbox", host),
            uri,
            private_key_pem: REMOTE_PRIVATE_KEY,
        }
    }

    pub fn document(&self, public_key_pem: &str) -> Value {
        json!({
            "@context": [
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security/v1"
            ],
            "id": self.uri,
            "type": "Person",
            "preferredUsername": self.uri.rsplit('/').next().unwrap_or("peer"),
            "inbox": self.inbox,
            "followers": format!("{}/followers", self.uri),
            "endpoints": { "sharedInbox": self.shared_inbox },
            "publicKey": {
                "id": self.key_id,
                "owner": self.uri,
                "publicKeyPem": public_key_pem
            }
        })
    }
}

/// Serves canned ActivityPub documents instead of the network
#[derive(Default)]
pub struct FakeFetcher {
    documents: Mutex<HashMap<String, Value>>,
    fetches: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn serve(&self, uri: &str, document: Value) {
        self.documents
            .lock()
            .unwrap()
            .insert(uri.to_string(), document);
    }

    pub fn serve_peer(&self, peer: &RemotePeer, public_key_pem: &str) {
        self.serve(&peer.uri, peer.document(public_key_pem));
    }

    pub fn fetch_count(&self, uri: &str) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|fetched| fetched.as_str() == uri)
            .count()
    }
}

#[async_trait]
impl ActorFetcher for FakeFetcher {
    async fn fetch(&self, uri: &str) -> Result<Value, AppError> {
        self.fetches.lock().unwrap().push(uri.to_string());
        self.documents
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| AppError::Federation(format!("{} unreachable", uri)))
    }
}

/// Records outbound deliveries and answers with scripted statuses
pub struct RecordingTransport {
    script: Mutex<VecDeque<u16>>,
    default_status: Mutex<u16>,
    requests: Mutex<Vec<OutboundRequest>>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_status: Mutex::new(202),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingTransport {
    /// Answer every further request with `status`.
    pub fn answer(&self, status: u16) {
        *self.default_status.lock().unwrap() = status;
    }

    /// Answer the next requests with `statuses`, then fall back to the default.
    pub fn script(&self, statuses: &[u16]) {
        self.script.lock().unwrap().extend(statuses.iter().copied());
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Bodies of every request sent, parsed as JSON
    pub fn activities(&self) -> Vec<Value> {
        self.requests()
            .iter()
            .map(|request| serde_json::from_slice(&request.body).unwrap())
            .collect()
    }

    pub fn activities_of_type(&self, kind: &str) -> Vec<Value> {
        self.activities()
            .into_iter()
            .filter(|activity| activity["type"] == kind)
            .collect()
    }
}

#[async_trait]
impl DeliveryTransport for RecordingTransport {
    async fn post(&self, request: OutboundRequest) -> Result<u16, AppError> {
        self.requests.lock().unwrap().push(request);
        let scripted = self.script.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or(*self.default_status.lock().unwrap()))
    }
}

pub fn test_config(temp_dir: &TempDir, queue_driver: config::QueueDriver) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: "local.example".to_string(),
            protocol: "https".to_string(),
        },
        database: config::DatabaseConfig {
            path: temp_dir.path().join("test.db"),
        },
        federation: config::FederationConfig {
            queue_driver,
            max_delivery_attempts: 3,
            ..config::FederationConfig::default()
        },
        admin: config::AdminConfig {
            token: ADMIN_TOKEN.to_string(),
        },
        instance: config::InstanceConfig::default(),
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Federation services wired around fakes
pub struct TestContext {
    pub state: AppState,
    pub fetcher: Arc<FakeFetcher>,
    pub transport: Arc<RecordingTransport>,
    pub alice: Actor,
    pub carol: Actor,
    pub _temp_dir: TempDir,
}

impl TestContext {
    /// Durable queue; jobs run only when the test drives a worker.
    pub async fn new() -> Self {
        Self::with_driver(config::QueueDriver::Durable).await
    }

    pub async fn with_driver(queue_driver: config::QueueDriver) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir, queue_driver);
        let db = Arc::new(Database::connect(&config.database.path).await.unwrap());

        let fetcher = Arc::new(FakeFetcher::default());
        let transport = Arc::new(RecordingTransport::default());
        let state =
            AppState::with_collaborators(config, db.clone(), fetcher.clone(), transport.clone());

        // alice approves followers automatically, carol approves manually
        let alice = local_actor("alice", false);
        let carol = local_actor("carol", true);
        db.insert_actor(&alice).await.unwrap();
        db.insert_actor(&carol).await.unwrap();

        Self {
            state,
            fetcher,
            transport,
            alice,
            carol,
            _temp_dir: temp_dir,
        }
    }

    pub fn db(&self) -> &Database {
        &self.state.db
    }

    /// A remote peer whose actor document is served with its current key.
    pub fn peer(&self, host: &str, username: &str) -> RemotePeer {
        let peer = RemotePeer::new(host, username);
        self.fetcher.serve_peer(&peer, REMOTE_PUBLIC_KEY);
        peer
    }

    /// POST a signed activity to an inbox path ("/shared/inbox" or
    /// "/actors/{name}/inbox") through the dispatcher.
    pub async fn deliver_signed(
        &self,
        peer: &RemotePeer,
        path: &str,
        activity: &Value,
    ) -> fediport::federation::InboxReceipt {
        let body = serde_json::to_vec(activity).unwrap();
        self.deliver_raw(peer, path, &body, Utc::now()).await
    }

    pub async fn deliver_raw(
        &self,
        peer: &RemotePeer,
        path: &str,
        body: &[u8],
        date: DateTime<Utc>,
    ) -> fediport::federation::InboxReceipt {
        let headers = signed_headers(
            &format!("{}{}", LOCAL_BASE, path),
            body,
            peer.private_key_pem,
            &peer.key_id,
            date,
        );
        self.receive(path, body, &headers).await
    }

    pub async fn receive(
        &self,
        path: &str,
        body: &[u8],
        headers: &HeaderMap,
    ) -> fediport::federation::InboxReceipt {
        let target = path
            .strip_prefix("/actors/")
            .and_then(|rest| rest.strip_suffix("/inbox"));
        self.state
            .inbox
            .receive(
                body,
                fediport::federation::InboxRequest {
                    method: "POST",
                    path,
                    headers,
                },
                target,
            )
            .await
            .unwrap()
    }

    pub fn inbox_worker(&self, queue: QueueName) -> QueueWorker {
        let handler: Arc<dyn JobHandler> =
            Arc::new(InboxJobHandler::new(self.state.processor.clone()));
        self.worker(queue, handler)
    }

    pub fn delivery_worker(&self) -> QueueWorker {
        let handler: Arc<dyn JobHandler> =
            Arc::new(DeliveryJobHandler::new(self.state.delivery_engine.clone()));
        self.worker(QueueName::Deliver, handler)
    }

    fn worker(&self, queue: QueueName, handler: Arc<dyn JobHandler>) -> QueueWorker {
        let durable = self
            .state
            .durable_queue
            .as_ref()
            .expect("worker needs the durable driver");
        QueueWorker::new(
            self.state.db.clone(),
            queue,
            handler,
            RetryPolicy::from_config(&self.state.config.federation),
            durable.notifier(),
        )
    }

    /// Run every job of `worker`'s queue that is due at `now_ms`.
    pub async fn drain(&self, worker: &QueueWorker, now_ms: i64) -> Vec<JobReport> {
        let mut reports = Vec::new();
        while let Some(report) = worker.process_next_at(now_ms).await.unwrap() {
            reports.push(report);
        }
        reports
    }

    /// Process both inbox queues, then deliver everything due.
    ///
    /// Each queue is drained at the current time, so jobs enqueued while
    /// an earlier queue drained are already due.
    pub async fn settle(&self) {
        self.drain(
            &self.inbox_worker(QueueName::PersonalInbox),
            Utc::now().timestamp_millis(),
        )
        .await;
        self.drain(
            &self.inbox_worker(QueueName::SharedInbox),
            Utc::now().timestamp_millis(),
        )
        .await;
        self.drain(&self.delivery_worker(), Utc::now().timestamp_millis())
            .await;
    }
}

pub fn local_actor(username: &str, manually_approves_followers: bool) -> Actor {
    Actor::new_local(
        LOCAL_BASE,
        username,
        manually_approves_followers,
        LOCAL_PRIVATE_KEY.to_string(),
        LOCAL_PUBLIC_KEY.to_string(),
    )
}

/// Headers of a request to `url` signed the way remote servers sign.
pub fn signed_headers(
    url: &str,
    body: &[u8],
    private_key_pem: &str,
    key_id: &str,
    date: DateTime<Utc>,
) -> HeaderMap {
    let signed = sign_request_at("POST", url, Some(body), private_key_pem, key_id, date).unwrap();
    let host = url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed.host_str().map(|host| match parsed.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            })
        })
        .unwrap();

    let mut headers = HeaderMap::new();
    headers.insert("host", host.parse().unwrap());
    headers.insert("date", signed.date.parse().unwrap());
    headers.insert("signature", signed.signature.parse().unwrap());
    if let Some(digest) = signed.digest {
        headers.insert("digest", digest.parse().unwrap());
    }
    headers.insert("content-type", "application/activity+json".parse().unwrap());
    headers
}

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub context: TestContext,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        let context = TestContext::new().await;

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        // Build router
        let app = fediport::build_router(context.state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait a bit for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            addr: addr_str,
            context,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }
}
