//! Actor key directory
//!
//! Resolves public keys for signature verification (cache, then the
//! actors table, then the network) and private keys for signing (local
//! actors only, never network I/O).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, watch};

use super::resolver::RemoteResolver;
use crate::data::Database;
use crate::error::{AppError, SignatureError};
use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

const CACHE_NAME: &str = "public_key";

/// Public key of an actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorKey {
    pub key_id: String,
    /// Actor URI owning the key
    pub owner: String,
    pub public_key_pem: String,
}

/// Material needed to sign as a local actor
#[derive(Debug, Clone)]
pub struct SigningKey {
    pub actor_id: String,
    pub key_id: String,
    pub private_key_pem: String,
}

/// Cached public key entry
#[derive(Debug, Clone)]
struct CachedKey {
    key: ActorKey,
    /// When this entry was cached
    cached_at: Instant,
}

/// Public and private key lookup for federation.
///
/// Public keys are cached with a TTL behind a `RwLock`; lookups are
/// concurrent and refreshes rare.
pub struct ActorKeyDirectory {
    db: Arc<Database>,
    resolver: Arc<RemoteResolver>,
    /// Cache storage: key_id -> cached key
    cache: RwLock<HashMap<String, CachedKey>>,
    ttl: Duration,
}

impl ActorKeyDirectory {
    /// Create new key directory
    ///
    /// # Arguments
    /// * `db` - Actor storage
    /// * `resolver` - Fetches actor documents for unknown keys
    /// * `ttl` - How long a cached public key stays valid
    pub fn new(db: Arc<Database>, resolver: Arc<RemoteResolver>, ttl: Duration) -> Self {
        Self {
            db,
            resolver,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Get public key for a key ID
    ///
    /// Checks cache first, then stored actors, then fetches the actor
    /// document. Fetch failures become `SignatureError::KeyUnavailable`;
    /// storage failures stay transient.
    pub async fn public_key(&self, key_id: &str) -> Result<ActorKey, AppError> {
        // 1. Check cache (read lock)
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(key_id) {
                if cached.cached_at.elapsed() < self.ttl {
                    CACHE_HITS_TOTAL.with_label_values(&[CACHE_NAME]).inc();
                    tracing::debug!(key_id = %key_id, "Public key cache hit");
                    return Ok(cached.key.clone());
                }
                tracing::debug!(key_id = %key_id, "Public key cache expired");
            }
        }
        CACHE_MISSES_TOTAL.with_label_values(&[CACHE_NAME]).inc();

        // 2. Stored actor
        if let Some(actor) = self.db.get_actor_by_key_id(key_id).await? {
            let key = ActorKey {
                key_id: actor.key_id,
                owner: actor.uri,
                public_key_pem: actor.public_key_pem,
            };
            self.store(key.clone()).await;
            return Ok(key);
        }

        // 3. Network
        let key = self.fetch(key_id).await?;
        self.store(key.clone()).await;
        Ok(key)
    }

    /// Drop the cached key and fetch the actor document again.
    ///
    /// Used once after a signature fails to verify, in case the remote
    /// actor rotated its key.
    pub async fn refresh(&self, key_id: &str) -> Result<ActorKey, AppError> {
        self.invalidate(key_id).await;
        let key = self.fetch(key_id).await?;
        self.store(key.clone()).await;
        tracing::info!(key_id = %key_id, "Public key refreshed");
        Ok(key)
    }

    async fn fetch(&self, key_id: &str) -> Result<ActorKey, AppError> {
        let actor_uri = key_id.split('#').next().unwrap_or(key_id);
        let actor = match self.resolver.refresh_actor(actor_uri).await {
            Ok(actor) => actor,
            Err(AppError::Database(error)) => return Err(AppError::Database(error)),
            Err(error) => {
                tracing::warn!(key_id = %key_id, error = %error, "Public key fetch failed");
                return Err(SignatureError::KeyUnavailable(error.to_string()).into());
            }
        };

        // The actor must advertise exactly the key that signed the request.
        if actor.key_id != key_id {
            return Err(SignatureError::KeyUnavailable(format!(
                "actor {} advertises key {}, not {}",
                actor.uri, actor.key_id, key_id
            ))
            .into());
        }

        Ok(ActorKey {
            key_id: actor.key_id,
            owner: actor.uri,
            public_key_pem: actor.public_key_pem,
        })
    }

    async fn store(&self, key: ActorKey) {
        let mut cache = self.cache.write().await;
        cache.insert(
            key.key_id.clone(),
            CachedKey {
                key,
                cached_at: Instant::now(),
            },
        );
    }

    /// Private key of a local actor.
    ///
    /// # Errors
    /// `MissingPrivateKey` when the actor is unknown, remote, or has no key.
    pub async fn private_key(&self, local_actor_id: &str) -> Result<SigningKey, AppError> {
        let actor = self
            .db
            .get_actor(local_actor_id)
            .await?
            .ok_or_else(|| AppError::MissingPrivateKey(local_actor_id.to_string()))?;

        match (actor.is_local, actor.private_key_pem) {
            (true, Some(private_key_pem)) => Ok(SigningKey {
                actor_id: actor.id,
                key_id: actor.key_id,
                private_key_pem,
            }),
            _ => Err(AppError::MissingPrivateKey(actor.uri)),
        }
    }

    /// Invalidate a cached key
    pub async fn invalidate(&self, key_id: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(key_id);
        tracing::debug!(key_id = %key_id, "Invalidated public key cache entry");
    }

    /// Invalidate every cached key owned by an actor
    pub async fn invalidate_actor(&self, actor_uri: &str) {
        let mut cache = self.cache.write().await;
        cache.retain(|_, cached| cached.key.owner != actor_uri);
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.read().await;
        let total = cache.len();
        let valid = cache
            .values()
            .filter(|v| v.cached_at.elapsed() < self.ttl)
            .count();

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }

    /// Prune expired entries
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        let ttl = self.ttl;
        cache.retain(|_, v| v.cached_at.elapsed() < ttl);
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!(removed, "Pruned expired public key cache entries");
        }
    }

    /// Prune on a fixed interval until shutdown is signalled.
    pub async fn run_pruner(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // `interval` panics on a zero period.
        let mut tick = tokio::time::interval(interval.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tick.tick() => self.prune_expired().await,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Public key cache pruner stopped");
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Total number of entries
    pub total_entries: usize,
    /// Number of valid (non-expired) entries
    pub valid_entries: usize,
    /// Number of expired entries
    pub expired_entries: usize,
}
