//! Static configuration for the OpenHexa query gateway
//!
//! Loaded once at startup, either deserialized by the host application or
//! read from environment variables with [`OpenHexaConfig::from_env`].

use openhexa_client::{ClientConfig, DEFAULT_GRAPHQL_URL};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenHexaConfig {
    /// Upstream metadata service
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub functions: FunctionConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Who may share a cached dataset listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingScope {
    /// One listing cache entry serves every identity
    #[default]
    Shared,
    /// Listings are cached separately per identity
    Identity,
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable response caching
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// Maximum number of entries per cache
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,

    /// Time-to-live of resolved URLs in seconds, kept below the signed URL validity
    #[serde(default = "default_url_ttl")]
    pub url_ttl_seconds: u64,

    /// Time-to-live of dataset listings in seconds
    #[serde(default = "default_listing_ttl")]
    pub listing_ttl_seconds: u64,

    #[serde(default)]
    pub listing_scope: ListingScope,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            max_capacity: default_max_capacity(),
            url_ttl_seconds: default_url_ttl(),
            listing_ttl_seconds: default_listing_ttl(),
            listing_scope: ListingScope::default(),
        }
    }
}

impl CacheConfig {
    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.url_ttl_seconds)
    }

    pub fn listing_ttl(&self) -> Duration {
        Duration::from_secs(self.listing_ttl_seconds)
    }
}

/// Per-identity engine session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions unused for longer than this are evicted
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Sessions older than this are recycled, regardless of use
    #[serde(default)]
    pub max_lifetime_secs: Option<u64>,

    /// Interval of the background eviction sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Queries one session runs at once; further queries wait in arrival order
    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,

    /// DataFusion target partitions (defaults to the number of CPUs)
    #[serde(default)]
    pub target_partitions: Option<usize>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Memory pool limit of each session in bytes (unbounded when unset)
    #[serde(default)]
    pub memory_limit_bytes: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            max_lifetime_secs: None,
            sweep_interval_secs: default_sweep_interval(),
            max_concurrent_queries: default_max_concurrent_queries(),
            target_partitions: None,
            batch_size: default_batch_size(),
            memory_limit_bytes: None,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Behavior of the SQL functions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionConfig {
    /// Turn upstream failures of `resolve_url` into NULL instead of failing the query
    #[serde(default)]
    pub null_on_transport_error: bool,
}

/// Connection gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Deadline of one request, including session creation (no deadline when unset)
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

impl OpenHexaConfig {
    /// Build the configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Build the configuration from a set of variables
    ///
    /// Recognized keys:
    /// - `OPENHEXA_GRAPHQL_URL`, `OPENHEXA_API_TOKEN`
    /// - `GCS_SIGNED_BUCKET_CACHE_TTL_MINUTES` (resolved URL TTL)
    /// - `OPENHEXA_LISTING_CACHE_TTL_MINUTES`
    /// - `OPENHEXA_SESSION_IDLE_MINUTES`, `OPENHEXA_SESSION_MAX_LIFETIME_MINUTES`
    /// - `OPENHEXA_REQUEST_TIMEOUT_SECONDS`
    /// - `DATAFUSION_THREADS`, `DATAFUSION_MEMORY_LIMIT` (bytes)
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        config.client.url = vars
            .get("OPENHEXA_GRAPHQL_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_GRAPHQL_URL.to_string());
        config.client.api_token = vars.get("OPENHEXA_API_TOKEN").cloned();
        if config.client.api_token.is_none() {
            warn!("OPENHEXA_API_TOKEN not set - queries may fail");
        }

        if let Some(secs) = parse_scaled(&vars, "GCS_SIGNED_BUCKET_CACHE_TTL_MINUTES", 60)? {
            config.cache.url_ttl_seconds = secs;
        }
        if let Some(secs) = parse_scaled(&vars, "OPENHEXA_LISTING_CACHE_TTL_MINUTES", 60)? {
            config.cache.listing_ttl_seconds = secs;
        }
        if let Some(secs) = parse_scaled(&vars, "OPENHEXA_SESSION_IDLE_MINUTES", 60)? {
            config.session.idle_timeout_secs = secs;
        }
        config.session.max_lifetime_secs =
            parse_scaled(&vars, "OPENHEXA_SESSION_MAX_LIFETIME_MINUTES", 60)?;
        config.gateway.request_timeout_ms =
            parse_scaled(&vars, "OPENHEXA_REQUEST_TIMEOUT_SECONDS", 1000)?;
        config.session.target_partitions = parse_var(&vars, "DATAFUSION_THREADS")?;
        config.session.memory_limit_bytes = parse_var(&vars, "DATAFUSION_MEMORY_LIMIT")?;

        info!(
            url_ttl_secs = config.cache.url_ttl_seconds,
            idle_timeout_secs = config.session.idle_timeout_secs,
            "Loaded OpenHexa configuration"
        );
        Ok(config)
    }
}

fn parse_var<T: FromStr>(vars: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match vars.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}

/// Parse a `u64` variable and convert it to a finer unit
fn parse_scaled(vars: &HashMap<String, String>, key: &str, factor: u64) -> Result<Option<u64>> {
    match parse_var::<u64>(vars, key)? {
        None => Ok(None),
        Some(value) => value
            .checked_mul(factor)
            .map(Some)
            .ok_or_else(|| Error::Config(format!("{}={} is out of range", key, value))),
    }
}

fn default_cache_enabled() -> bool {
    true
}

fn default_max_capacity() -> u64 {
    10_000
}

fn default_url_ttl() -> u64 {
    540 // 9 minutes
}

fn default_listing_ttl() -> u64 {
    300 // 5 minutes
}

fn default_idle_timeout() -> u64 {
    3_600 // 60 minutes
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_max_concurrent_queries() -> usize {
    4
}

fn default_batch_size() -> usize {
    8192
}
