//! OpenHexa GraphQL API client
//!
//! Issues the two metadata requests the query engine needs: listing dataset
//! files and resolving a signed download URL for one file. Every request is
//! bounded by the configured timeout and transient failures are retried with
//! exponential backoff.

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::records::{
    flatten_datasets, DatasetFileRecord, DatasetsData, FileUrlData, GraphQlError, GraphQlResponse,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

const DATASETS_QUERY: &str = r#"
query GetDatasets($query: String!, $page: Int!, $perPage: Int!) {
    datasets(query: $query, page: $page, perPage: $perPage) {
        totalPages
        items {
            slug
            workspace {
                slug
            }
            versions {
                items {
                    name
                    files {
                        items {
                            id
                            filename
                        }
                    }
                }
            }
        }
    }
}
"#;

const FILE_URL_QUERY: &str = r#"
query GetFileDownloadUrl($fileId: ID!) {
    datasetVersionFile(id: $fileId) {
        downloadUrl
    }
}
"#;

/// Extension codes meaning "this object does not exist for this credential"
/// Upper bound of the delay between retries
const MAX_BACKOFF: Duration = Duration::from_secs(30);

const ACCESS_ERROR_CODES: &[&str] = &["NOT_FOUND", "PERMISSION_DENIED", "FORBIDDEN", "UNAUTHORIZED"];

/// HTTP client for the OpenHexa GraphQL API
///
/// # Example
/// ```no_run
/// use openhexa_client::{ClientConfig, OpenHexaClient};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::new("https://app.openhexa.org/graphql/").with_api_token("token");
/// let client = OpenHexaClient::new(config)?;
/// let files = client.list_files(Some("my-workspace")).await?;
/// println!("Found {} files", files.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct OpenHexaClient {
    config: ClientConfig,
    client: reqwest::Client,
}

impl OpenHexaClient {
    /// Create a new client. The HTTP connection pool is shared by all clones.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        match &config.api_token {
            Some(token) => {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| ClientError::InvalidConfig(format!("API token: {}", e)))?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
            None => warn!("No OpenHexa API token configured, upstream requests may fail"),
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()?;

        info!(url = %config.url, "Created OpenHexa client");
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// List dataset files, optionally restricted to one workspace slug.
    ///
    /// Follows pagination until every page has been read.
    pub async fn list_files(&self, workspace: Option<&str>) -> Result<Vec<DatasetFileRecord>> {
        let mut records = Vec::new();
        let mut page = 1u32;

        loop {
            let variables = json!({
                "query": "",
                "page": page,
                "perPage": self.config.page_size,
            });
            let data: DatasetsData = self.execute(DATASETS_QUERY, variables).await?;
            records.extend(flatten_datasets(&data.datasets, workspace));

            if page >= data.datasets.total_pages {
                break;
            }
            page += 1;
        }

        info!(
            workspace = workspace.unwrap_or("*"),
            pages = page,
            "Retrieved {} dataset files",
            records.len()
        );
        Ok(records)
    }

    /// Resolve the signed download URL of one file.
    ///
    /// Returns `Ok(None)` when the file does not exist or the credential may
    /// not see it; transport failures are errors.
    pub async fn resolve_file_url(&self, file_id: &str) -> Result<Option<String>> {
        let result: Result<FileUrlData> = self
            .execute(FILE_URL_QUERY, json!({ "fileId": file_id }))
            .await;

        match result {
            Ok(data) => match data.dataset_version_file.and_then(|f| f.download_url) {
                Some(url) => {
                    debug!(file_id, "Retrieved download URL");
                    Ok(Some(url))
                }
                None => {
                    warn!(file_id, "File not found");
                    Ok(None)
                }
            },
            Err(ClientError::NotAccessible(messages)) => {
                warn!(file_id, "File not accessible: {}", messages.join("; "));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn execute<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T> {
        let body = json!({ "query": query, "variables": variables });
        self.with_retry(|| self.post_once(&body)).await
    }

    /// One POST of a GraphQL document, decoding the envelope
    async fn post_once<T: DeserializeOwned>(&self, body: &Value) -> Result<T> {
        let response = self.client.post(&self.config.url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status,
                body: response.text().await.unwrap_or_default(),
            });
        }

        let bytes = response.bytes().await?;
        let envelope: GraphQlResponse<T> =
            serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))?;

        if let Some(errors) = envelope.errors.filter(|errors| !errors.is_empty()) {
            return Err(classify_errors(errors));
        }

        envelope
            .data
            .ok_or_else(|| ClientError::Decode("response carried no data".to_string()))
    }

    /// Execute an operation with retry logic
    async fn with_retry<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_retries + 1;
        let mut backoff = self.config.backoff().min(MAX_BACKOFF);
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        "OpenHexa request failed (attempt {}/{}): {}. Retrying after {:?}",
                        attempt, max_attempts, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Double the backoff, capped at [`MAX_BACKOFF`]
fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(MAX_BACKOFF)
}

fn classify_errors(errors: Vec<GraphQlError>) -> ClientError {
    let all_access = errors.iter().all(|e| {
        e.code()
            .map(|code| ACCESS_ERROR_CODES.contains(&code))
            .unwrap_or(false)
    });
    let messages = errors.into_iter().map(|e| e.message).collect();

    if all_access {
        ClientError::NotAccessible(messages)
    } else {
        ClientError::GraphQl(messages)
    }
}

// Manual Debug so the bearer token never reaches logs
impl std::fmt::Debug for OpenHexaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenHexaClient")
            .field("url", &self.config.url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = OpenHexaClient::new(ClientConfig::new("http://localhost:8000/graphql/"))
            .expect("client should build");
        assert_eq!(client.config().url, "http://localhost:8000/graphql/");
    }

    #[test]
    fn test_invalid_token_rejected() {
        let config = ClientConfig::new("http://localhost:8000/graphql/").with_api_token("bad\ntoken");
        let result = OpenHexaClient::new(config);
        assert!(matches!(result, Err(ClientError::InvalidConfig(_))));
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(next_backoff(Duration::from_millis(200)), Duration::from_millis(400));
        assert_eq!(next_backoff(Duration::from_secs(20)), MAX_BACKOFF);

        let mut backoff = Duration::from_millis(200);
        for _ in 0..200 {
            backoff = next_backoff(backoff);
        }
        assert_eq!(backoff, MAX_BACKOFF);
        assert_eq!(next_backoff(Duration::MAX), MAX_BACKOFF);
    }

    #[test]
    fn test_classify_access_errors() {
        let errors: Vec<GraphQlError> = serde_json::from_str(
            r#"[{"message": "no such file", "extensions": {"code": "NOT_FOUND"}}]"#,
        )
        .unwrap();
        assert!(matches!(classify_errors(errors), ClientError::NotAccessible(_)));

        let errors: Vec<GraphQlError> = serde_json::from_str(
            r#"[
                {"message": "denied", "extensions": {"code": "PERMISSION_DENIED"}},
                {"message": "syntax error"}
            ]"#,
        )
        .unwrap();
        assert!(matches!(classify_errors(errors), ClientError::GraphQl(_)));
    }
}
