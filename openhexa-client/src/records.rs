//! Dataset file records and the GraphQL response shapes they are read from
//!
//! The upstream returns datasets nested as
//! `datasets.items[].versions.items[].files.items[]`; [`flatten_datasets`]
//! turns one page of that tree into flat [`DatasetFileRecord`]s.

use serde::{Deserialize, Serialize};

/// One file of one dataset version, as listed by the upstream.
///
/// Never carries a download URL; URLs are resolved on demand by file id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetFileRecord {
    pub workspace: String,
    pub dataset: String,
    pub version: String,
    pub filename: String,
    /// Upstream file identifier, the input of URL resolution
    pub file_id: String,
}

/// GraphQL response envelope
#[derive(Debug, Deserialize)]
pub struct GraphQlResponse<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlError {
    pub message: String,
    #[serde(default)]
    pub extensions: Option<GraphQlErrorExtensions>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlErrorExtensions {
    #[serde(default)]
    pub code: Option<String>,
}

impl GraphQlError {
    /// Machine-readable error code, when the server supplied one
    pub fn code(&self) -> Option<&str> {
        self.extensions.as_ref().and_then(|e| e.code.as_deref())
    }
}

/// `items` wrapper used by every paginated connection in the schema
#[derive(Debug, Deserialize)]
pub struct ItemList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct DatasetsData {
    pub datasets: DatasetPage,
}

#[derive(Debug, Deserialize)]
pub struct DatasetPage {
    #[serde(rename = "totalPages", default)]
    pub total_pages: u32,
    #[serde(default = "Vec::new")]
    pub items: Vec<DatasetItem>,
}

#[derive(Debug, Deserialize)]
pub struct DatasetItem {
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub workspace: Option<WorkspaceRef>,
    #[serde(default)]
    pub versions: Option<ItemList<VersionItem>>,
}

#[derive(Debug, Deserialize)]
pub struct WorkspaceRef {
    #[serde(default)]
    pub slug: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VersionItem {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub files: Option<ItemList<FileItem>>,
}

#[derive(Debug, Deserialize)]
pub struct FileItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FileUrlData {
    #[serde(rename = "datasetVersionFile")]
    pub dataset_version_file: Option<FileUrl>,
}

#[derive(Debug, Deserialize)]
pub struct FileUrl {
    #[serde(rename = "downloadUrl", default)]
    pub download_url: Option<String>,
}

/// Flatten one page of datasets into file records.
///
/// When `workspace_filter` is set, datasets of other workspaces are skipped.
/// Missing names default to empty strings.
pub fn flatten_datasets(
    page: &DatasetPage,
    workspace_filter: Option<&str>,
) -> Vec<DatasetFileRecord> {
    let mut records = Vec::new();

    for dataset in &page.items {
        let dataset_slug = dataset.slug.clone().unwrap_or_default();
        let workspace_slug = dataset
            .workspace
            .as_ref()
            .and_then(|w| w.slug.clone())
            .unwrap_or_default();

        if let Some(filter) = workspace_filter {
            if workspace_slug != filter {
                continue;
            }
        }

        let versions = dataset.versions.iter().flat_map(|v| v.items.iter());
        for version in versions {
            let version_name = version.name.clone().unwrap_or_default();
            let files = version.files.iter().flat_map(|f| f.items.iter());
            for file in files {
                records.push(DatasetFileRecord {
                    workspace: workspace_slug.clone(),
                    dataset: dataset_slug.clone(),
                    version: version_name.clone(),
                    filename: file.filename.clone().unwrap_or_default(),
                    file_id: file.id.clone().unwrap_or_default(),
                });
            }
        }
    }

    records
}
