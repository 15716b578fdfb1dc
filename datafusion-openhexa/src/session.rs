//! Per-identity engine sessions
//!
//! A [`Session`] owns one DataFusion [`SessionContext`] for one caller. The
//! context outlives individual queries, so its runtime caches (file
//! statistics, object listings) stay warm across the caller's queries.
//!
//! Sessions move through [`SessionState`]: a context is created
//! `Uninitialized`, becomes `Ready` once the dataset access functions are
//! installed, and is dropped when the session is `Closed`. Queries are only
//! accepted in the `Ready` state.

use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::error::{DataFusionError, Result as DataFusionResult};
use datafusion::execution::cache::cache_manager::{
    CacheManagerConfig, FileStatisticsCache, ListFilesCache,
};
use datafusion::execution::cache::cache_unit::{DefaultFileStatisticsCache, DefaultListFilesCache};
use datafusion::execution::runtime_env::RuntimeEnvBuilder;
use datafusion::execution::{FunctionRegistry, RecordBatchStream, SendableRecordBatchStream};
use datafusion::logical_expr::ScalarUDF;
use datafusion::prelude::{SessionConfig as EngineConfig, SessionContext};
use futures::stream::Stream;
use parking_lot::RwLock;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::cache::MetadataCache;
use crate::config::{FunctionConfig, SessionConfig};
use crate::error::{Error, Result};
use crate::functions::{register_functions, ResolveUrlUdf};
use crate::identity::CallerIdentity;

/// Lifecycle of a session's engine context
pub enum SessionState {
    /// Context created, functions not installed yet
    Uninitialized(SessionContext),
    /// Functions installed, accepting queries
    Ready(SessionContext),
    Closed,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::Uninitialized(_) => "uninitialized",
            SessionState::Ready(_) => "ready",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Point in time at which a request stops waiting for its result
#[derive(Debug, Clone, Copy)]
pub struct QueryDeadline {
    expires_at: Instant,
    timeout: Duration,
}

impl QueryDeadline {
    /// Deadline `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        Self {
            expires_at: Instant::now() + timeout,
            timeout,
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Full request timeout the deadline was derived from
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Opens engine contexts for new sessions
pub trait EngineFactory: Send + Sync + fmt::Debug {
    fn create(&self, identity: &CallerIdentity) -> Result<SessionContext>;
}

/// Builds DataFusion contexts with runtime caches and the configured limits
#[derive(Debug, Clone)]
pub struct DataFusionEngineFactory {
    config: SessionConfig,
}

impl DataFusionEngineFactory {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for DataFusionEngineFactory {
    fn create(&self, identity: &CallerIdentity) -> Result<SessionContext> {
        let mut engine_config = EngineConfig::new()
            .with_batch_size(self.config.batch_size)
            .with_information_schema(true);
        if let Some(partitions) = self.config.target_partitions {
            engine_config = engine_config.with_target_partitions(partitions);
        }

        let statistics_cache: FileStatisticsCache = Arc::new(DefaultFileStatisticsCache::default());
        let list_files_cache: ListFilesCache = Arc::new(DefaultListFilesCache::default());
        let cache_config = CacheManagerConfig::default()
            .with_files_statistics_cache(Some(statistics_cache))
            .with_list_files_cache(Some(list_files_cache));

        let mut runtime = RuntimeEnvBuilder::new().with_cache_manager(cache_config);
        if let Some(limit) = self.config.memory_limit_bytes {
            runtime = runtime.with_memory_limit(limit, 1.0);
        }

        let ctx = SessionContext::new_with_config_rt(engine_config, runtime.build_arc()?);
        debug!(%identity, session_id = %ctx.session_id(), "Created engine context");
        Ok(ctx)
    }
}

/// One caller's engine session
pub struct Session {
    id: String,
    identity: CallerIdentity,
    state: RwLock<SessionState>,
    created_at: Instant,
    /// Nanoseconds after `created_at` of the last use
    last_used: AtomicU64,
    /// FIFO admission of concurrent queries
    queries: Arc<Semaphore>,
    max_concurrent_queries: usize,
}

impl Session {
    /// Open a session over `ctx` and install the dataset access functions
    pub fn open(
        identity: CallerIdentity,
        ctx: SessionContext,
        cache: Arc<MetadataCache>,
        functions: &FunctionConfig,
        max_concurrent_queries: usize,
    ) -> Result<Self> {
        let max_concurrent_queries = max_concurrent_queries.max(1);
        let session = Self {
            id: ctx.session_id(),
            identity,
            state: RwLock::new(SessionState::Uninitialized(ctx)),
            created_at: Instant::now(),
            last_used: AtomicU64::new(0),
            queries: Arc::new(Semaphore::new(max_concurrent_queries)),
            max_concurrent_queries,
        };
        session.install_functions(cache, functions)?;
        Ok(session)
    }

    fn install_functions(&self, cache: Arc<MetadataCache>, functions: &FunctionConfig) -> Result<()> {
        let mut state = self.state.write();
        let ctx = match std::mem::replace(&mut *state, SessionState::Closed) {
            SessionState::Uninitialized(ctx) => ctx,
            other => {
                let name = other.name();
                *state = other;
                return Err(Error::Internal(format!(
                    "cannot install functions on a {} session",
                    name
                )));
            }
        };

        register_functions(&ctx, cache, &self.identity, functions);
        *state = SessionState::Ready(ctx);
        Ok(())
    }

    /// Engine session id
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &CallerIdentity {
        &self.identity
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.created_at + Duration::from_nanos(self.last_used.load(Ordering::Relaxed))
    }

    /// Record a use at the current time
    pub fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.last_used.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.read(), SessionState::Ready(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.read(), SessionState::Closed)
    }

    /// Queries currently admitted
    pub fn active_queries(&self) -> usize {
        self.max_concurrent_queries - self.queries.available_permits()
    }

    pub fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        self.active_queries() == 0 && now.saturating_duration_since(self.last_used()) > idle_timeout
    }

    pub fn is_expired(&self, now: Instant, max_lifetime: Option<Duration>) -> bool {
        max_lifetime.is_some_and(|lifetime| now.saturating_duration_since(self.created_at) > lifetime)
    }

    /// Engine context of a ready session
    pub fn context(&self) -> Result<SessionContext> {
        match &*self.state.read() {
            SessionState::Ready(ctx) => Ok(ctx.clone()),
            _ => Err(Error::SessionClosed(self.identity.to_string())),
        }
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        let permit = Arc::clone(&self.queries)
            .acquire_owned()
            .await
            .map_err(|_| Error::SessionClosed(self.identity.to_string()))?;
        self.touch();
        Ok(permit)
    }

    /// Context for one query
    ///
    /// With a deadline, the query runs on a copy of the session state whose
    /// `resolve_url` stops waiting at the deadline. The copy shares the
    /// session's runtime, so the engine caches stay warm.
    fn query_context(&self, deadline: Option<QueryDeadline>) -> Result<SessionContext> {
        let ctx = self.context()?;
        let Some(deadline) = deadline else {
            return Ok(ctx);
        };

        let udf = ctx.udf(ResolveUrlUdf::NAME)?;
        let Some(resolve_url) = udf.inner().as_any().downcast_ref::<ResolveUrlUdf>() else {
            return Ok(ctx);
        };

        let scoped = SessionContext::new_with_state(ctx.state());
        scoped.register_udf(ScalarUDF::new_from_impl(resolve_url.with_deadline(deadline)));
        Ok(scoped)
    }

    /// Run a query and collect its results
    pub async fn execute(&self, sql: &str) -> Result<Vec<RecordBatch>> {
        self.execute_with_deadline(sql, None).await
    }

    /// Run a query and collect its results, giving up on metadata lookups at `deadline`
    pub async fn execute_with_deadline(
        &self,
        sql: &str,
        deadline: Option<QueryDeadline>,
    ) -> Result<Vec<RecordBatch>> {
        let _permit = self.admit().await?;
        let ctx = self.query_context(deadline)?;

        debug!(identity = %self.identity, session_id = %self.id, "Executing query: {}", sql);
        let batches = ctx
            .sql(sql)
            .await
            .map_err(query_error)?
            .collect()
            .await
            .map_err(query_error)?;
        self.touch();
        Ok(batches)
    }

    /// Run a query and stream its results
    ///
    /// The query keeps its admission slot until the stream is dropped.
    pub async fn execute_stream(&self, sql: &str) -> Result<SendableRecordBatchStream> {
        self.execute_stream_with_deadline(sql, None).await
    }

    /// Streaming variant of [`execute_with_deadline`](Self::execute_with_deadline)
    pub async fn execute_stream_with_deadline(
        &self,
        sql: &str,
        deadline: Option<QueryDeadline>,
    ) -> Result<SendableRecordBatchStream> {
        let permit = self.admit().await?;
        let ctx = self.query_context(deadline)?;

        debug!(identity = %self.identity, session_id = %self.id, "Streaming query: {}", sql);
        let inner = ctx
            .sql(sql)
            .await
            .map_err(query_error)?
            .execute_stream()
            .await
            .map_err(query_error)?;
        Ok(Box::pin(AdmittedStream {
            inner,
            _permit: permit,
        }))
    }

    /// Release the engine context; queries already running keep their own handle
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.write(), SessionState::Closed);
        self.queries.close();
        if !matches!(previous, SessionState::Closed) {
            info!(identity = %self.identity, session_id = %self.id, "Closed session");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &*self.state.read())
            .field("active_queries", &self.active_queries())
            .finish()
    }
}

/// Surface a deadline hit inside a function as [`Error::Timeout`]
fn query_error(err: DataFusionError) -> Error {
    if let DataFusionError::External(inner) = err.find_root() {
        if let Some(Error::Timeout(timeout)) = inner.downcast_ref::<Error>() {
            return Error::Timeout(*timeout);
        }
    }
    Error::DataFusion(err)
}

/// Result stream holding its session admission slot
struct AdmittedStream {
    inner: SendableRecordBatchStream,
    _permit: OwnedSemaphorePermit,
}

impl Stream for AdmittedStream {
    type Item = DataFusionResult<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl RecordBatchStream for AdmittedStream {
    fn schema(&self) -> SchemaRef {
        self.inner.schema()
    }
}
