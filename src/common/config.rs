//! Configuration for the segmentation gateway
//!
//! Loaded from a TOML file and layered with `SEGMENTD__*` environment
//! overrides (e.g. `SEGMENTD__HTTP__BIND_ADDR=0.0.0.0:9000`).

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variable consulted when no `--config` path is given.
pub const CONFIG_PATH_ENV: &str = "SEGMENTD_CONFIG";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Node ID (unique identifier, used in logs)
    pub node_id: String,

    /// Logging level
    pub log_level: String,

    pub http: HttpConfig,

    pub shards: ShardsConfig,

    pub cache: CacheConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            node_id: "segmentd-1".to_string(),
            log_level: default_log_level(),
            http: HttpConfig::default(),
            shards: ShardsConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Public HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind address for HTTP API
    pub bind_addr: SocketAddr,

    /// Maximum request body size
    pub body_limit_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            body_limit_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardBackend {
    Memory,
    Postgres,
}

/// Shard set configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardsConfig {
    pub backend: ShardBackend,

    /// Number of shards; fixed for the lifetime of the data set
    pub count: usize,

    /// One endpoint per shard, in shard order (postgres backend only)
    pub endpoints: Vec<ShardEndpoint>,

    /// Connection pool size per shard
    pub max_connections: u32,

    /// Deadline for a single shard operation
    pub statement_timeout_ms: u64,
}

impl Default for ShardsConfig {
    fn default() -> Self {
        Self {
            backend: ShardBackend::Memory,
            count: 2,
            endpoints: Vec::new(),
            max_connections: 10,
            statement_timeout_ms: 5_000,
        }
    }
}

impl ShardsConfig {
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }
}

/// A single shard connection. The DSN is either inline or read from an
/// environment variable so credentials stay out of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardEndpoint {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn_env: Option<String>,
}

impl ShardEndpoint {
    pub fn resolve_dsn(&self) -> Result<String> {
        if let Some(dsn) = &self.dsn {
            return Ok(dsn.clone());
        }
        match &self.dsn_env {
            Some(var) => std::env::var(var).map_err(|_| {
                Error::InvalidConfig(format!(
                    "env variable {} for shard {} is not set",
                    var, self.name
                ))
            }),
            None => Err(Error::InvalidConfig(format!(
                "shard {} has neither dsn nor dsn_env",
                self.name
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis,
    Disabled,
}

/// Segment cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,

    /// Redis URL (redis backend only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Environment variable holding the Redis URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_env: Option<String>,

    /// Time-to-live of a cached user segment list
    pub ttl_secs: u64,

    /// Upper bound on cached users (memory backend only)
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            url: None,
            url_env: None,
            ttl_secs: 300,
            max_entries: 100_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn resolve_url(&self) -> Result<String> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        match &self.url_env {
            Some(var) => std::env::var(var)
                .map_err(|_| Error::InvalidConfig(format!("env variable {} is not set", var))),
            None => Err(Error::InvalidConfig(
                "redis cache needs url or url_env".into(),
            )),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SEGMENTD")
                .prefix_separator("__")
                .separator("__"),
        );

        let config: GatewayConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to `SEGMENTD_CONFIG`.
    pub fn load_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(Some(path)),
            None => match std::env::var(CONFIG_PATH_ENV) {
                Ok(env_path) => Self::load(Some(Path::new(&env_path))),
                Err(_) => Self::load(None),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        let shards = &self.shards;
        if shards.count == 0 {
            return Err(Error::InvalidConfig("shard count must be at least 1".into()));
        }
        if shards.backend == ShardBackend::Postgres && shards.endpoints.len() != shards.count {
            return Err(Error::InvalidConfig(format!(
                "shard count is {} but {} endpoints are configured",
                shards.count,
                shards.endpoints.len()
            )));
        }
        if shards.statement_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "statement_timeout_ms must be positive".into(),
            ));
        }
        if self.cache.backend != CacheBackend::Disabled && self.cache.ttl_secs == 0 {
            return Err(Error::InvalidConfig("cache ttl must be positive".into()));
        }
        Ok(())
    }
}
