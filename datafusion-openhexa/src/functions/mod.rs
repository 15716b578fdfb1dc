//! SQL functions exposing OpenHexa dataset metadata
//!
//! - `list_files([workspace])`: table of dataset files (no URLs)
//! - `resolve_url(file_path)`: signed download URL of one file, or NULL
//!
//! Both read through the shared [`MetadataCache`]. The names used by earlier
//! deployments, `openhexa_dataset_files` and `get_dataset_file_url`, are
//! registered as aliases.

mod list_files;
mod resolve_url;

pub use list_files::{DatasetFilesTable, ListFilesFunction};
pub use resolve_url::ResolveUrlUdf;

use datafusion::logical_expr::ScalarUDF;
use datafusion::prelude::SessionContext;
use std::sync::Arc;
use tracing::debug;

use crate::cache::MetadataCache;
use crate::config::FunctionConfig;
use crate::identity::CallerIdentity;

/// Names the listing table function is registered under
pub const LIST_FILES_NAMES: [&str; 2] = ["list_files", "openhexa_dataset_files"];

/// Install the dataset access functions on a session context
pub fn register_functions(
    ctx: &SessionContext,
    cache: Arc<MetadataCache>,
    identity: &CallerIdentity,
    config: &FunctionConfig,
) {
    let list_files = Arc::new(ListFilesFunction::new(Arc::clone(&cache), identity.clone()));
    for name in LIST_FILES_NAMES {
        ctx.register_udtf(name, list_files.clone());
    }

    ctx.register_udf(ScalarUDF::new_from_impl(ResolveUrlUdf::new(
        cache,
        config.null_on_transport_error,
    )));

    debug!(%identity, "Registered dataset access functions");
}
