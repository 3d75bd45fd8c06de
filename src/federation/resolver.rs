//! Remote actor and object resolution
//!
//! Fetches ActivityPub documents over HTTP and turns actor documents
//! into local `actors` rows. All outbound fetches pass the SSRF guard
//! unless private hosts are explicitly allowed.

use async_trait::async_trait;
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::data::{Actor, Database, RemoteActorProfile};
use crate::error::AppError;

const ACTIVITY_JSON_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Redirect hops an actor or object fetch may follow
const MAX_REDIRECTS: usize = 3;

const ACTOR_TYPES: &[&str] = &["Person", "Service", "Application", "Group", "Organization"];

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve host {}: {}", host, e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(format!("No DNS records for {}", host)));
    }

    Ok(())
}

/// Extract the lower-cased host of an http(s) URL, ignoring any fragment.
///
/// This rejects non-HTTP(S) URLs and, unless `allow_private_hosts`,
/// obvious local/private hosts.
pub fn extract_actor_domain(
    actor_or_key_id: &str,
    allow_private_hosts: bool,
) -> Result<String, AppError> {
    let actor_url = actor_or_key_id.split('#').next().unwrap_or(actor_or_key_id);
    let parsed = url::Url::parse(actor_url)
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?
        .to_ascii_lowercase();

    if !allow_private_hosts && is_disallowed_host(&host) {
        return Err(AppError::Forbidden);
    }

    Ok(host)
}

/// Host of a URL, lower-cased, or None when unparsable.
pub fn url_host(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(|host| host.to_ascii_lowercase()))
}

/// Source of remote ActivityPub documents
#[async_trait]
pub trait ActorFetcher: Send + Sync {
    /// Fetch the JSON document at `uri`.
    ///
    /// Transient failures (network, 5xx, 429) are `AppError::Federation`;
    /// explicit refusals are `AppError::RemoteRejected`.
    async fn fetch(&self, uri: &str) -> Result<Value, AppError>;
}

/// [`ActorFetcher`] over reqwest
pub struct HttpFetcher {
    http_client: reqwest::Client,
    allow_private_hosts: bool,
}

impl HttpFetcher {
    pub fn new(http_client: reqwest::Client, allow_private_hosts: bool) -> Self {
        Self {
            http_client,
            allow_private_hosts,
        }
    }
}

/// Shared outbound HTTP client with a bounded timeout.
///
/// Redirects are never followed by the client: every hop has to pass the
/// host guard, which needs async DNS. Deliveries treat a 3xx as final;
/// [`HttpFetcher`] follows redirects itself.
pub fn build_http_client(user_agent: &str, timeout: Duration) -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(AppError::HttpClient)
}

/// Resolve a `Location` header against the URL that answered with it.
///
/// The target must be http(s) and, unless `allow_private_hosts`, not an
/// obviously local host.
pub fn redirect_target(
    current: &str,
    location: &str,
    allow_private_hosts: bool,
) -> Result<String, AppError> {
    let base = url::Url::parse(current)
        .map_err(|e| AppError::Validation(format!("Invalid URL {}: {}", current, e)))?;
    let target = base
        .join(location)
        .map_err(|e| AppError::Validation(format!("Invalid redirect to {}: {}", location, e)))?;
    extract_actor_domain(target.as_str(), allow_private_hosts)?;
    Ok(target.into())
}

impl HttpFetcher {
    /// Reject destinations the guard forbids, resolving DNS first.
    async fn check_destination(&self, url: &str) -> Result<(), AppError> {
        let host = extract_actor_domain(url, self.allow_private_hosts)?;
        if self.allow_private_hosts {
            return Ok(());
        }

        let port = url::Url::parse(url)
            .ok()
            .and_then(|url| url.port_or_known_default())
            .ok_or_else(|| AppError::Validation("Missing port in URL".to_string()))?;
        validate_resolved_host_ips(&host, port).await
    }
}

#[async_trait]
impl ActorFetcher for HttpFetcher {
    async fn fetch(&self, uri: &str) -> Result<Value, AppError> {
        let mut document_url = uri.split('#').next().unwrap_or(uri).to_string();

        for _ in 0..=MAX_REDIRECTS {
            self.check_destination(&document_url).await?;

            tracing::debug!(url = %document_url, "Fetching remote document");
            let response = self
                .http_client
                .get(&document_url)
                .header("Accept", ACTIVITY_JSON_ACCEPT)
                .send()
                .await
                .map_err(|e| {
                    AppError::Federation(format!("Failed to fetch {}: {}", document_url, e))
                })?;

            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| AppError::RemoteRejected {
                        url: document_url.clone(),
                        status: status.as_u16(),
                    })?;
                let next = redirect_target(&document_url, location, self.allow_private_hosts)?;
                tracing::debug!(from = %document_url, to = %next, "Following redirect");
                document_url = next;
                continue;
            }
            if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(AppError::Federation(format!(
                    "Failed to fetch {}: HTTP {}",
                    document_url, status
                )));
            }
            if !status.is_success() {
                return Err(AppError::RemoteRejected {
                    url: document_url,
                    status: status.as_u16(),
                });
            }

            return response.json::<Value>().await.map_err(|e| {
                AppError::Validation(format!("Invalid JSON from {}: {}", document_url, e))
            });
        }

        Err(AppError::Validation(format!(
            "Too many redirects fetching {}",
            uri
        )))
    }
}

/// Parse an actor document into a profile.
///
/// The document `id` must equal `expected_uri` so a host cannot answer
/// for an actor it does not serve.
pub fn parse_actor_document(
    document: &Value,
    expected_uri: &str,
) -> Result<RemoteActorProfile, AppError> {
    let id = document
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("Actor document missing id".to_string()))?;
    if id != expected_uri {
        return Err(AppError::Validation(format!(
            "Actor document id {} does not match {}",
            id, expected_uri
        )));
    }

    let kind = document.get("type").and_then(Value::as_str).unwrap_or("");
    if !ACTOR_TYPES.contains(&kind) {
        return Err(AppError::Validation(format!(
            "Unsupported actor type: {}",
            kind
        )));
    }

    let inbox_uri = document
        .get("inbox")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("Actor document missing inbox".to_string()))?;

    let public_key = select_public_key(document.get("publicKey"), id)
        .ok_or_else(|| AppError::Validation("Actor document missing publicKey".to_string()))?;
    let key_id = public_key
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("Actor document missing publicKey.id".to_string()))?;
    let public_key_pem = public_key
        .get("publicKeyPem")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            AppError::Validation("Actor document missing publicKey.publicKeyPem".to_string())
        })?;

    let domain = url_host(id)
        .ok_or_else(|| AppError::Validation("Actor id has no host".to_string()))?;
    let username = document
        .get("preferredUsername")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            url::Url::parse(id).ok().and_then(|url| {
                url.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
        })
        .unwrap_or_else(|| domain.clone());

    Ok(RemoteActorProfile {
        uri: id.to_string(),
        username,
        domain,
        inbox_uri: inbox_uri.to_string(),
        shared_inbox_uri: document
            .get("endpoints")
            .and_then(|endpoints| endpoints.get("sharedInbox"))
            .and_then(Value::as_str)
            .map(str::to_string),
        followers_uri: document
            .get("followers")
            .and_then(Value::as_str)
            .map(str::to_string),
        key_id: key_id.to_string(),
        public_key_pem: public_key_pem.to_string(),
        manually_approves_followers: document
            .get("manuallyApprovesFollowers")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

/// `publicKey` may be a single object or an array; prefer the key owned by the actor.
fn select_public_key<'a>(public_key: Option<&'a Value>, actor_id: &str) -> Option<&'a Value> {
    match public_key? {
        Value::Array(keys) => keys
            .iter()
            .find(|key| key.get("owner").and_then(Value::as_str) == Some(actor_id))
            .or_else(|| keys.first()),
        key @ Value::Object(_) => Some(key),
        _ => None,
    }
}

/// Resolves remote actors and objects, creating actor rows on demand.
pub struct RemoteResolver {
    db: Arc<Database>,
    fetcher: Arc<dyn ActorFetcher>,
    local_base_url: String,
}

impl RemoteResolver {
    pub fn new(db: Arc<Database>, fetcher: Arc<dyn ActorFetcher>, local_base_url: String) -> Self {
        Self {
            db,
            fetcher,
            local_base_url,
        }
    }

    /// Whether a URI belongs to this server
    pub fn is_local_uri(&self, uri: &str) -> bool {
        uri == self.local_base_url || uri.starts_with(&format!("{}/", self.local_base_url))
    }

    /// Stored actor for `uri`, fetching and storing a remote actor on first sight.
    pub async fn resolve_actor(&self, uri: &str) -> Result<Actor, AppError> {
        if let Some(actor) = self.db.get_actor_by_uri(uri).await? {
            return Ok(actor);
        }
        if self.is_local_uri(uri) {
            return Err(AppError::NotFound);
        }

        self.refresh_actor(uri).await
    }

    /// Re-fetch a remote actor document and update the stored row.
    pub async fn refresh_actor(&self, uri: &str) -> Result<Actor, AppError> {
        if self.is_local_uri(uri) {
            return self.db.get_actor_by_uri(uri).await?.ok_or(AppError::NotFound);
        }

        let document = self.fetcher.fetch(uri).await?;
        let profile = parse_actor_document(&document, uri)?;
        let actor = self.db.upsert_remote_actor(&Actor::new_remote(profile)).await?;

        tracing::info!(actor = %actor.uri, key_id = %actor.key_id, "Remote actor stored");
        Ok(actor)
    }

    /// Fetch a remote object (e.g. a Note) by URI.
    pub async fn resolve_object(&self, uri: &str) -> Result<Value, AppError> {
        let object = self.fetcher.fetch(uri).await?;
        match object.get("id").and_then(Value::as_str) {
            Some(id) if id == uri => Ok(object),
            _ => Err(AppError::Validation(format!(
                "Fetched object id does not match {}",
                uri
            ))),
        }
    }
}
