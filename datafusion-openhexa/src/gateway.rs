//! Connection gateway: entry point of the host application's SQL driver
//!
//! Resolves the caller's session through the [`SessionRegistry`] and forwards
//! the query text to it. An optional request deadline covers session creation
//! and execution. It also reaches `resolve_url`, which would otherwise block
//! the query past it. A deadline that fires while a metadata load is in flight
//! only abandons the wait; the load itself completes and fills the cache.

use datafusion::arrow::array::RecordBatch;
use datafusion::execution::SendableRecordBatchStream;
use openhexa_client::OpenHexaClient;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::MetadataCache;
use crate::config::OpenHexaConfig;
use crate::error::{Error, Result};
use crate::identity::CallerIdentity;
use crate::metadata_provider::MetadataProvider;
use crate::registry::SessionRegistry;
use crate::session::{DataFusionEngineFactory, EngineFactory, QueryDeadline};

#[derive(Debug, Clone)]
pub struct ConnectionGateway {
    registry: Arc<SessionRegistry>,
    request_timeout: Option<Duration>,
}

impl ConnectionGateway {
    /// Gateway talking to the configured OpenHexa GraphQL endpoint
    ///
    /// Must be called from within a Tokio runtime; the idle-session sweeper is
    /// spawned on it.
    pub fn from_config(config: OpenHexaConfig) -> Result<Self> {
        let client = OpenHexaClient::new(config.client.clone())?;
        info!(url = %config.client.url, "Connecting gateway to OpenHexa");
        Ok(Self::new(config, Arc::new(client)))
    }

    /// Gateway over any metadata provider
    pub fn new(config: OpenHexaConfig, provider: Arc<dyn MetadataProvider>) -> Self {
        let factory = Arc::new(DataFusionEngineFactory::new(config.session.clone()));
        Self::with_factory(config, provider, factory)
    }

    pub fn with_factory(
        config: OpenHexaConfig,
        provider: Arc<dyn MetadataProvider>,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        let cache = Arc::new(MetadataCache::new(provider, &config.cache));
        let registry = Arc::new(SessionRegistry::new(
            factory,
            cache,
            config.session.clone(),
            config.functions.clone(),
        ));
        registry.spawn_sweeper();

        Self {
            registry,
            request_timeout: config.gateway.request_timeout(),
        }
    }

    /// Run `sql` for `identity` and collect the result
    pub async fn handle(&self, identity: &CallerIdentity, sql: &str) -> Result<Vec<RecordBatch>> {
        debug!(%identity, "Handling query");
        let deadline = self.request_timeout.map(QueryDeadline::after);
        self.with_deadline(identity, async {
            let session = self.registry.get_or_create(identity).await?;
            session.execute_with_deadline(sql, deadline).await
        })
        .await
    }

    /// Run `sql` for `identity` and stream the result
    ///
    /// The deadline bounds planning and the `resolve_url` lookups made while
    /// the stream is consumed; otherwise consuming it is up to the caller.
    pub async fn handle_stream(
        &self,
        identity: &CallerIdentity,
        sql: &str,
    ) -> Result<SendableRecordBatchStream> {
        debug!(%identity, "Handling streaming query");
        let deadline = self.request_timeout.map(QueryDeadline::after);
        self.with_deadline(identity, async {
            let session = self.registry.get_or_create(identity).await?;
            session.execute_stream_with_deadline(sql, deadline).await
        })
        .await
    }

    async fn with_deadline<T>(
        &self,
        identity: &CallerIdentity,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(%identity, timeout_ms = limit.as_millis() as u64, "Request timed out");
                    Err(Error::Timeout(limit))
                }
            },
            None => work.await,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        self.registry.cache()
    }

    /// Close every session; later requests fail with [`Error::ShuttingDown`]
    pub async fn shutdown(&self) -> usize {
        self.registry.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use datafusion::arrow::array::StringArray;
    use openhexa_client::{ClientError, DatasetFileRecord};
    use std::time::Instant;

    #[derive(Debug)]
    struct SlowProvider {
        delay: Duration,
    }

    #[async_trait]
    impl MetadataProvider for SlowProvider {
        async fn list_files(
            &self,
            workspace: Option<&str>,
        ) -> std::result::Result<Vec<DatasetFileRecord>, ClientError> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![DatasetFileRecord {
                workspace: workspace.unwrap_or("ws1").to_string(),
                dataset: "ds".to_string(),
                version: "v1".to_string(),
                filename: "a.csv".to_string(),
                file_id: "file-1".to_string(),
            }])
        }

        async fn resolve_file_url(
            &self,
            file_id: &str,
        ) -> std::result::Result<Option<String>, ClientError> {
            tokio::time::sleep(self.delay).await;
            Ok(Some(format!("https://signed/{}", file_id)))
        }
    }

    fn gateway(delay: Duration, request_timeout_ms: Option<u64>) -> ConnectionGateway {
        let mut config = OpenHexaConfig::default();
        config.gateway.request_timeout_ms = request_timeout_ms;
        ConnectionGateway::new(config, Arc::new(SlowProvider { delay }))
    }

    #[tokio::test]
    async fn test_handle_runs_query_in_identity_session() {
        let gateway = gateway(Duration::ZERO, None);
        let alice = CallerIdentity::new("alice");

        let batches = gateway
            .handle(&alice, "SELECT workspace FROM list_files('ws9')")
            .await
            .unwrap();

        let workspaces = batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(workspaces.value(0), "ws9");
        assert_eq!(gateway.registry().identities(), vec![alice]);
    }

    #[tokio::test]
    async fn test_engine_error_propagates() {
        let gateway = gateway(Duration::ZERO, None);

        let err = gateway
            .handle(&CallerIdentity::anonymous(), "SELECT * FROM no_such_table")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DataFusion(_)));
    }

    #[tokio::test]
    async fn test_timeout_leaves_load_running() {
        let gateway = gateway(Duration::from_millis(300), Some(50));
        let alice = CallerIdentity::new("alice");

        let err = gateway
            .handle(&alice, "SELECT * FROM list_files()")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        tokio::time::sleep(Duration::from_millis(500)).await;
        let fingerprint = gateway.cache().listing_fingerprint(&alice, None);
        assert!(gateway.cache().listings().contains(&fingerprint));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_during_url_resolution() {
        let gateway = gateway(Duration::from_millis(1_000), Some(100));
        let alice = CallerIdentity::new("alice");

        let start = Instant::now();
        let err = gateway
            .handle(&alice, "SELECT resolve_url('file-1')")
            .await
            .unwrap_err();
        let took = start.elapsed();

        assert!(matches!(err, Error::Timeout(_)), "unexpected error: {}", err);
        assert!(took < Duration::from_millis(600), "deadline missed: {:?}", took);

        let session = gateway.registry().get_or_create(&alice).await.unwrap();
        assert_eq!(session.active_queries(), 0);

        // the abandoned lookup still fills the cache
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        let fingerprint = MetadataCache::url_fingerprint("file-1");
        assert!(gateway.cache().urls().contains(&fingerprint));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_url_resolution_within_deadline() {
        let gateway = gateway(Duration::from_millis(10), Some(5_000));

        let batches = gateway
            .handle(&CallerIdentity::new("alice"), "SELECT resolve_url('file-1')")
            .await
            .unwrap();

        let urls = batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(urls.value(0), "https://signed/file-1");
    }

    #[tokio::test]
    async fn test_shutdown_rejects_requests() {
        let gateway = gateway(Duration::ZERO, None);
        gateway.handle(&CallerIdentity::new("alice"), "SELECT 1").await.unwrap();

        assert_eq!(gateway.shutdown().await, 1);
        assert!(matches!(
            gateway.handle(&CallerIdentity::new("alice"), "SELECT 1").await,
            Err(Error::ShuttingDown)
        ));
    }
}
