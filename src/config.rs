//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub admin: AdminConfig,
    #[serde(default)]
    pub instance: InstanceConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Which task queue backs inbound processing and outbound delivery.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueDriver {
    /// Jobs persisted in SQLite and consumed by background workers
    #[default]
    Durable,
    /// Jobs executed immediately on the caller's task
    Inline,
}

/// Federation tuning
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Queue backend
    #[serde(default)]
    pub queue_driver: QueueDriver,
    /// Concurrent inbox jobs per inbox queue
    pub inbox_workers: usize,
    /// Concurrent delivery jobs
    pub delivery_workers: usize,
    /// Attempts before a delivery job is marked failed
    pub max_delivery_attempts: u32,
    /// First retry delay in seconds, doubled per attempt
    pub retry_base_seconds: u64,
    /// Retry delay ceiling in seconds
    pub retry_max_seconds: u64,
    /// Timeout for every outbound HTTP request
    pub request_timeout_seconds: u64,
    /// Accepted |now - Date| for signed requests
    pub clock_skew_seconds: i64,
    /// Remote public key cache TTL
    pub key_cache_ttl_seconds: u64,
    /// Age after which an abandoned processing claim or running job is reclaimed
    pub claim_lease_seconds: i64,
    /// Idle poll interval of queue workers
    pub poll_interval_ms: u64,
    /// Permit fetching actors on loopback/private addresses (development only)
    #[serde(default)]
    pub allow_private_hosts: bool,
    /// User-Agent for outbound requests
    pub user_agent: String,
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            queue_driver: QueueDriver::Durable,
            inbox_workers: 4,
            delivery_workers: 8,
            max_delivery_attempts: 8,
            retry_base_seconds: 30,
            retry_max_seconds: 6 * 3600,
            request_timeout_seconds: 10,
            clock_skew_seconds: 12 * 3600,
            key_cache_ttl_seconds: 3600,
            claim_lease_seconds: 600,
            poll_interval_ms: 1000,
            allow_private_hosts: false,
            user_agent: "Fediport/0.1.0".to_string(),
        }
    }
}

/// Operator access
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Bearer token for /admin routes
    pub token: String,
}

/// Local actors created at startup when missing
#[derive(Debug, Clone, Deserialize, Default)]
pub struct InstanceConfig {
    #[serde(default)]
    pub actors: Vec<LocalActorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalActorConfig {
    pub username: String,
    #[serde(default)]
    pub manually_approves_followers: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDIPORT__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let defaults = FederationConfig::default();
        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/fediport.db")?
            .set_default("federation.queue_driver", "durable")?
            .set_default("federation.inbox_workers", defaults.inbox_workers as u64)?
            .set_default("federation.delivery_workers", defaults.delivery_workers as u64)?
            .set_default(
                "federation.max_delivery_attempts",
                u64::from(defaults.max_delivery_attempts),
            )?
            .set_default("federation.retry_base_seconds", defaults.retry_base_seconds)?
            .set_default("federation.retry_max_seconds", defaults.retry_max_seconds)?
            .set_default(
                "federation.request_timeout_seconds",
                defaults.request_timeout_seconds,
            )?
            .set_default("federation.clock_skew_seconds", defaults.clock_skew_seconds)?
            .set_default(
                "federation.key_cache_ttl_seconds",
                defaults.key_cache_ttl_seconds,
            )?
            .set_default("federation.claim_lease_seconds", defaults.claim_lease_seconds)?
            .set_default("federation.poll_interval_ms", defaults.poll_interval_ms)?
            .set_default("federation.allow_private_hosts", false)?
            .set_default("federation.user_agent", defaults.user_agent.as_str())?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (FEDIPORT__*)
            .add_source(
                Environment::with_prefix("FEDIPORT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        const MIN_ADMIN_TOKEN_BYTES: usize = 24;

        if self.admin.token.as_bytes().len() < MIN_ADMIN_TOKEN_BYTES {
            return Err(crate::error::AppError::Config(format!(
                "admin.token must be at least {} bytes",
                MIN_ADMIN_TOKEN_BYTES
            )));
        }

        if self.federation.inbox_workers == 0 || self.federation.delivery_workers == 0 {
            return Err(crate::error::AppError::Config(
                "federation worker counts must be greater than 0".to_string(),
            ));
        }

        if self.federation.max_delivery_attempts == 0 {
            return Err(crate::error::AppError::Config(
                "federation.max_delivery_attempts must be greater than 0".to_string(),
            ));
        }

        if self.federation.clock_skew_seconds <= 0 {
            return Err(crate::error::AppError::Config(
                "federation.clock_skew_seconds must be greater than 0".to_string(),
            ));
        }

        if self.federation.request_timeout_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "federation.request_timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if is_local_server_domain(&self.server.domain) {
            if self.federation.queue_driver == QueueDriver::Inline {
                tracing::warn!("Inline queue driver configured; federation work runs on request tasks");
            }
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        for actor in &self.instance.actors {
            if !is_valid_username(&actor.username) {
                return Err(crate::error::AppError::Config(format!(
                    "instance.actors username {:?} must be 1-30 characters of [a-z0-9_]",
                    actor.username
                )));
            }
        }

        Ok(())
    }
}

pub(crate) fn is_valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= 30
        && username
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
