//! Pull-through caching of upstream metadata responses
//!
//! [`ResponseCache`] memoizes one kind of upstream response by
//! [`Fingerprint`]. Entries expire after a TTL and the cache is bounded in
//! size. Concurrent misses for one fingerprint share a single load, and a
//! failed load is never stored. [`MetadataCache`] pairs a listing cache and a
//! URL cache in front of a [`MetadataProvider`].

use futures::future::{BoxFuture, FutureExt, Shared};
use moka::sync::Cache;
use openhexa_client::DatasetFileRecord;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::{CacheConfig, ListingScope};
use crate::error::{Error, Result};
use crate::identity::CallerIdentity;
use crate::metadata_provider::MetadataProvider;

/// Cache key naming the exact upstream call a response came from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fingerprint {
    /// Dataset file listing. `scope` is the identity when listings are not shared.
    ListFiles {
        workspace: Option<String>,
        scope: Option<String>,
    },
    /// Signed URL of one file
    FileUrl { file_id: String },
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fingerprint::ListFiles { workspace, scope } => write!(
                f,
                "list_files(workspace={}, scope={})",
                workspace.as_deref().unwrap_or("*"),
                scope.as_deref().unwrap_or("shared")
            ),
            Fingerprint::FileUrl { file_id } => write!(f, "file_url({})", file_id),
        }
    }
}

type LoadResult<V> = std::result::Result<V, Arc<Error>>;
type SharedLoad<V> = Shared<BoxFuture<'static, LoadResult<V>>>;

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
    loads: AtomicU64,
    failures: AtomicU64,
}

/// TTL-bounded, size-bounded, single-flight response cache
pub struct ResponseCache<V> {
    name: &'static str,
    enabled: bool,
    entries: Cache<Fingerprint, V>,
    /// In-flight loads; an entry lives from the first miss until the load settles
    pending: Arc<Mutex<HashMap<Fingerprint, SharedLoad<V>>>>,
    counters: Arc<Counters>,
}

impl<V> ResponseCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, enabled: bool, max_capacity: u64, ttl: Duration) -> Self {
        let entries = Cache::builder()
            .name(name)
            .max_capacity(if enabled { max_capacity } else { 0 })
            .time_to_live(ttl)
            .build();

        Self {
            name,
            enabled,
            entries,
            pending: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Return the cached value for `fingerprint`, loading it on a miss.
    ///
    /// `loader` runs at most once per miss no matter how many callers ask
    /// concurrently; all of them receive its result. The load runs on its own
    /// task, so it completes and populates the cache even if every waiting
    /// caller gives up. Errors are shared with the waiters but not cached.
    pub async fn get_with<F, Fut>(&self, fingerprint: Fingerprint, loader: F) -> LoadResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if !self.enabled {
            return loader().await.map_err(Arc::new);
        }

        if let Some(value) = self.entries.get(&fingerprint) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            trace!(cache = self.name, %fingerprint, "Cache hit");
            return Ok(value);
        }

        let load = {
            let mut pending = self.pending.lock();

            // A load may have settled between the lookup above and taking the lock
            if let Some(value) = self.entries.get(&fingerprint) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }

            match pending.get(&fingerprint) {
                Some(load) => {
                    self.counters.joined.fetch_add(1, Ordering::Relaxed);
                    trace!(cache = self.name, %fingerprint, "Joining in-flight load");
                    load.clone()
                }
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    debug!(cache = self.name, %fingerprint, "Cache miss, loading");
                    let load = self.spawn_load(fingerprint.clone(), loader());
                    pending.insert(fingerprint, load.clone());
                    load
                }
            }
        };

        load.await
    }

    fn spawn_load<Fut>(&self, fingerprint: Fingerprint, load: Fut) -> SharedLoad<V>
    where
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let name = self.name;
        let entries = self.entries.clone();
        let pending = Arc::clone(&self.pending);
        let counters = Arc::clone(&self.counters);

        let task = tokio::spawn(async move {
            let result = load.await.map_err(Arc::new);

            // Store before un-registering so a new caller sees either the
            // pending load or the entry, never neither.
            let mut pending = pending.lock();
            match &result {
                Ok(value) => {
                    counters.loads.fetch_add(1, Ordering::Relaxed);
                    entries.insert(fingerprint.clone(), value.clone());
                }
                Err(e) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(cache = name, %fingerprint, "Load failed, not cached: {}", e);
                }
            }
            pending.remove(&fingerprint);
            result
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(Arc::new(Error::Internal(format!(
                    "cache load task failed: {}",
                    e
                )))),
            }
        }
        .boxed()
        .shared()
    }

    /// Whether an unexpired entry exists for `fingerprint`
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.contains_key(fingerprint)
    }

    /// Drop the entry for `fingerprint`, forcing the next read upstream
    pub fn invalidate(&self, fingerprint: &Fingerprint) {
        debug!(cache = self.name, %fingerprint, "Invalidating cache entry");
        self.entries.invalidate(fingerprint);
    }

    /// Clear all cache entries
    pub fn clear(&self) {
        debug!(cache = self.name, "Clearing all cache entries");
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }

    /// Number of in-flight loads
    pub fn pending_loads(&self) -> usize {
        self.pending.lock().len()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        self.entries.run_pending_tasks();
        CacheStats {
            entries: self.entries.entry_count(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            joined: self.counters.joined.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

impl<V> fmt::Debug for ResponseCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    /// Misses that started an upstream load
    pub misses: u64,
    /// Misses that waited on another caller's load
    pub joined: u64,
    /// Loads that completed successfully
    pub loads: u64,
    /// Loads that failed
    pub failures: u64,
}

impl CacheStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.joined;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entries ({:.1}% hit rate, {} loads, {} failures)",
            self.entries,
            self.hit_rate() * 100.0,
            self.loads,
            self.failures
        )
    }
}

/// Metadata responses cached in front of a [`MetadataProvider`]
///
/// One instance is shared by every session: resolved URLs are keyed by file
/// id only, listings by workspace and, with [`ListingScope::Identity`], by
/// caller identity.
#[derive(Debug)]
pub struct MetadataCache {
    provider: Arc<dyn MetadataProvider>,
    listings: ResponseCache<Arc<Vec<DatasetFileRecord>>>,
    urls: ResponseCache<Option<String>>,
    listing_scope: ListingScope,
}

impl MetadataCache {
    pub fn new(provider: Arc<dyn MetadataProvider>, config: &CacheConfig) -> Self {
        Self {
            provider,
            listings: ResponseCache::new(
                "openhexa-listings",
                config.enabled,
                config.max_capacity,
                config.listing_ttl(),
            ),
            urls: ResponseCache::new(
                "openhexa-urls",
                config.enabled,
                config.max_capacity,
                config.url_ttl(),
            ),
            listing_scope: config.listing_scope,
        }
    }

    pub fn listing_fingerprint(
        &self,
        identity: &CallerIdentity,
        workspace: Option<&str>,
    ) -> Fingerprint {
        let scope = match self.listing_scope {
            ListingScope::Shared => None,
            ListingScope::Identity => Some(identity.to_string()),
        };
        Fingerprint::ListFiles {
            workspace: workspace.map(str::to_string),
            scope,
        }
    }

    pub fn url_fingerprint(file_id: &str) -> Fingerprint {
        Fingerprint::FileUrl {
            file_id: file_id.to_string(),
        }
    }

    /// List dataset files through the listing cache
    pub async fn list_files(
        &self,
        identity: &CallerIdentity,
        workspace: Option<&str>,
    ) -> Result<Arc<Vec<DatasetFileRecord>>> {
        let fingerprint = self.listing_fingerprint(identity, workspace);
        let provider = Arc::clone(&self.provider);
        let workspace = workspace.map(str::to_string);

        self.listings
            .get_with(fingerprint, move || async move {
                let records = provider.list_files(workspace.as_deref()).await?;
                Ok(Arc::new(records))
            })
            .await
            .map_err(Error::Shared)
    }

    /// Resolve a file URL through the URL cache; `None` if missing or hidden
    pub async fn resolve_file_url(&self, file_id: &str) -> Result<Option<String>> {
        let fingerprint = Self::url_fingerprint(file_id);
        let provider = Arc::clone(&self.provider);
        let file_id = file_id.to_string();

        self.urls
            .get_with(fingerprint, move || async move {
                Ok(provider.resolve_file_url(&file_id).await?)
            })
            .await
            .map_err(Error::Shared)
    }

    pub fn listings(&self) -> &ResponseCache<Arc<Vec<DatasetFileRecord>>> {
        &self.listings
    }

    pub fn urls(&self) -> &ResponseCache<Option<String>> {
        &self.urls
    }

    pub fn clear(&self) {
        self.listings.clear();
        self.urls.clear();
    }
}
