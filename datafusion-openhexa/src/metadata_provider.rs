//! Metadata provider abstraction for dataset file discovery
//!
//! This module defines the `MetadataProvider` trait that abstracts the source
//! of dataset metadata (file listings, signed URLs) from the cache and the SQL
//! functions built on top of it. [`OpenHexaClient`] is the production
//! implementation; tests substitute in-memory providers.

use async_trait::async_trait;
use openhexa_client::{ClientError, DatasetFileRecord, OpenHexaClient};

/// Trait for listing dataset files and resolving their download URLs
///
/// # Example
/// ```ignore
/// use datafusion_openhexa::metadata_provider::MetadataProvider;
///
/// async fn show_urls(provider: &dyn MetadataProvider) {
///     let files = provider.list_files(Some("my-workspace")).await.unwrap();
///     for file in files {
///         let url = provider.resolve_file_url(&file.file_id).await.unwrap();
///         println!("{}: {:?}", file.filename, url);
///     }
/// }
/// ```
#[async_trait]
pub trait MetadataProvider: Send + Sync + std::fmt::Debug {
    /// List dataset files, optionally restricted to one workspace
    ///
    /// # Errors
    /// Returns error if the upstream is unreachable or answers malformed data
    async fn list_files(
        &self,
        workspace: Option<&str>,
    ) -> Result<Vec<DatasetFileRecord>, ClientError>;

    /// Resolve a signed download URL
    ///
    /// # Returns
    /// `None` if the file does not exist or is not accessible
    async fn resolve_file_url(&self, file_id: &str) -> Result<Option<String>, ClientError>;
}

#[async_trait]
impl MetadataProvider for OpenHexaClient {
    async fn list_files(
        &self,
        workspace: Option<&str>,
    ) -> Result<Vec<DatasetFileRecord>, ClientError> {
        OpenHexaClient::list_files(self, workspace).await
    }

    async fn resolve_file_url(&self, file_id: &str) -> Result<Option<String>, ClientError> {
        OpenHexaClient::resolve_file_url(self, file_id).await
    }
}
