//! Configuration for the OpenHexa GraphQL client

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default public OpenHexa GraphQL endpoint
pub const DEFAULT_GRAPHQL_URL: &str = "https://app.openhexa.org/graphql/";

/// Connection, timeout and retry settings for the upstream metadata service
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// GraphQL endpoint URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Bearer token sent as `Authorization: Bearer <token>`
    #[serde(default)]
    pub api_token: Option<String>,

    /// Per-attempt request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum number of retries for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff between attempts in milliseconds, doubled after each retry
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Page size used when listing datasets
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            api_token: None,
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            page_size: default_page_size(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for the given endpoint with default policies
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the bearer token
    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    /// Get the request timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Get the base backoff as Duration
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

// Keep the token out of logs
impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("timeout_ms", &self.timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("backoff_ms", &self.backoff_ms)
            .field("page_size", &self.page_size)
            .finish()
    }
}

fn default_url() -> String {
    DEFAULT_GRAPHQL_URL.to_string()
}

fn default_timeout_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    200
}

fn default_page_size() -> u32 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.url, DEFAULT_GRAPHQL_URL);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff(), Duration::from_millis(200));
        assert_eq!(config.page_size, 1000);
        assert!(config.api_token.is_none());
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = ClientConfig::new("http://localhost:8000/graphql/").with_api_token("s3cret");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_deserialize_partial() {
        let json = r#"{"url": "http://hexa/graphql/", "max_retries": 0}"#;
        let config: ClientConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.url, "http://hexa/graphql/");
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.timeout_ms, 30_000);
    }
}
