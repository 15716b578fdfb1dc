use datafusion::arrow::array::{Array, ArrayRef, StringBuilder};
use datafusion::arrow::datatypes::DataType;
use datafusion::common::cast::as_string_array;
use datafusion::common::{exec_err, DataFusionError, ScalarValue};
use datafusion::error::Result as DataFusionResult;
use datafusion::logical_expr::{ColumnarValue, ScalarUDFImpl, Signature, Volatility};
use futures::stream::{self, StreamExt};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

use crate::cache::MetadataCache;
use crate::error::Error;
use crate::session::QueryDeadline;

/// Upstream lookups in flight at once for one batch
const MAX_CONCURRENT_LOOKUPS: usize = 16;

/// `resolve_url(file_path)` scalar function
///
/// Returns the signed download URL, or NULL when the file is missing or not
/// accessible. Distinct ids of a batch are resolved concurrently through the
/// cache, so repeated ids cost one lookup. With a deadline, waiting for
/// lookups stops when it passes; the lookups themselves keep filling the cache.
#[derive(Debug, Clone)]
pub struct ResolveUrlUdf {
    signature: Signature,
    aliases: Vec<String>,
    cache: Arc<MetadataCache>,
    null_on_transport_error: bool,
    deadline: Option<QueryDeadline>,
}

impl ResolveUrlUdf {
    pub const NAME: &'static str = "resolve_url";

    pub fn new(cache: Arc<MetadataCache>, null_on_transport_error: bool) -> Self {
        Self {
            // Volatile: signed URLs change over time and must not be folded at plan time
            signature: Signature::exact(vec![DataType::Utf8], Volatility::Volatile),
            aliases: vec!["get_dataset_file_url".to_string()],
            cache,
            null_on_transport_error,
            deadline: None,
        }
    }

    /// Copy of this function that gives up waiting at `deadline`
    pub fn with_deadline(&self, deadline: QueryDeadline) -> Self {
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    fn resolve_all(&self, ids: Vec<String>) -> DataFusionResult<HashMap<String, Option<String>>> {
        let cache = Arc::clone(&self.cache);
        let lookups = async move {
            stream::iter(ids)
                .map(|id| {
                    let cache = Arc::clone(&cache);
                    async move {
                        let result = cache.resolve_file_url(&id).await;
                        (id, result)
                    }
                })
                .buffer_unordered(MAX_CONCURRENT_LOOKUPS)
                .collect::<Vec<_>>()
                .await
        };

        let results = match self.deadline {
            None => block_on_upstream(lookups)?,
            Some(deadline) => {
                let expires_at = tokio::time::Instant::from_std(deadline.expires_at());
                let bounded = async move { tokio::time::timeout_at(expires_at, lookups).await };
                block_on_upstream(bounded)?.map_err(|_| {
                    warn!(
                        timeout_ms = deadline.timeout().as_millis() as u64,
                        "resolve_url gave up at request deadline"
                    );
                    DataFusionError::External(Box::new(Error::Timeout(deadline.timeout())))
                })?
            }
        };

        let mut urls = HashMap::with_capacity(results.len());
        for (id, result) in results {
            match result {
                Ok(url) => {
                    urls.insert(id, url);
                }
                Err(e) if self.null_on_transport_error => {
                    warn!(file_id = %id, "resolve_url returning NULL after upstream failure: {}", e);
                    urls.insert(id, None);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(urls)
    }
}

impl ScalarUDFImpl for ResolveUrlUdf {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn name(&self) -> &str {
        Self::NAME
    }

    fn aliases(&self) -> &[String] {
        &self.aliases
    }

    fn signature(&self) -> &Signature {
        &self.signature
    }

    fn return_type(&self, _arg_types: &[DataType]) -> DataFusionResult<DataType> {
        Ok(DataType::Utf8)
    }

    fn invoke_batch(
        &self,
        args: &[ColumnarValue],
        _number_rows: usize,
    ) -> DataFusionResult<ColumnarValue> {
        let [arg] = args else {
            return exec_err!("resolve_url takes exactly one argument, got {}", args.len());
        };

        match arg {
            ColumnarValue::Scalar(ScalarValue::Utf8(None)) | ColumnarValue::Scalar(ScalarValue::Null) => {
                Ok(ColumnarValue::Scalar(ScalarValue::Utf8(None)))
            }
            ColumnarValue::Scalar(ScalarValue::Utf8(Some(id))) => {
                let mut urls = self.resolve_all(vec![id.clone()])?;
                let url = urls.remove(id).flatten();
                Ok(ColumnarValue::Scalar(ScalarValue::Utf8(url)))
            }
            ColumnarValue::Scalar(other) => {
                exec_err!("resolve_url expects a string, got {}", other.data_type())
            }
            ColumnarValue::Array(array) => {
                let ids = as_string_array(array)?;

                let distinct: HashSet<&str> = ids.iter().flatten().collect();
                debug!(
                    rows = ids.len(),
                    distinct = distinct.len(),
                    "Resolving dataset file URLs"
                );
                let urls = self.resolve_all(distinct.into_iter().map(str::to_string).collect())?;

                let mut builder = StringBuilder::with_capacity(ids.len(), ids.len() * 128);
                for id in ids.iter() {
                    match id.and_then(|id| urls.get(id)).and_then(|url| url.as_deref()) {
                        Some(url) => builder.append_value(url),
                        None => builder.append_null(),
                    }
                }
                Ok(ColumnarValue::Array(Arc::new(builder.finish()) as ArrayRef))
            }
        }
    }
}

/// Drive an upstream future to completion from synchronous engine code.
///
/// Blocks the current worker thread in place, so it needs a multi-threaded
/// Tokio runtime.
fn block_on_upstream<F: Future>(future: F) -> DataFusionResult<F::Output> {
    let handle = Handle::try_current().map_err(|_| {
        DataFusionError::Execution("resolve_url must run inside a Tokio runtime".to_string())
    })?;

    match handle.runtime_flavor() {
        RuntimeFlavor::CurrentThread => {
            exec_err!("resolve_url requires a multi-threaded Tokio runtime")
        }
        _ => Ok(tokio::task::block_in_place(|| handle.block_on(future))),
    }
}
