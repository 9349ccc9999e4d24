use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::lifecycle::{BootstrapLoader, DisposeListener, ShutdownPersister};
use super::refresh::{RefreshAheadScheduler, RefreshClock};
use super::{
    CacheEntry, CacheError, CacheKey, FileSnapshotStore, KeyValueStore, MokaStore, Populate,
    SelfPopulatingCache, Snapshot, SnapshotStore,
};
use crate::config::{CacheConfig, RefreshConfig};
use crate::response::CachedResponse;

/// Collects the parts of a [`ProxyCache`] before it is activated.
///
/// ```
/// # use proxycache_service::caching::{CacheError, CacheKey, ProxyCacheSetup};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache = ProxyCacheSetup::new("pages", |key: CacheKey| async move {
///     Ok::<_, CacheError>(format!("content of {}", key.uri()))
/// })
/// .activate();
///
/// let page = cache.get(&CacheKey::get("/index.html")).await.unwrap();
/// assert_eq!(page, "content of /index.html");
/// cache.dispose().await;
/// # }
/// ```
pub struct ProxyCacheSetup<V> {
    name: String,
    populate: Arc<dyn Populate<V>>,
    store: Option<Arc<dyn KeyValueStore<V>>>,
    bootstrap: Option<BootstrapLoader<V>>,
    listeners: Vec<Box<dyn DisposeListener<V>>>,
    refresh: Option<RefreshConfig>,
}

impl<V> ProxyCacheSetup<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Starts the setup of a cache populated by `populate`.
    ///
    /// Without further configuration the cache is backed by a [`MokaStore`], neither bootstraps
    /// nor persists, and does not refresh.
    pub fn new(name: impl Into<String>, populate: impl Populate<V>) -> Self {
        Self {
            name: name.into(),
            populate: Arc::new(populate),
            store: None,
            bootstrap: None,
            listeners: Vec::new(),
            refresh: None,
        }
    }

    /// Starts the setup from the `cache` section of the configuration file.
    ///
    /// A configured `snapshot_path` adds a [`FileSnapshotStore`] for bootstrap and persistence.
    pub fn from_config(
        name: impl Into<String>,
        config: &CacheConfig,
        populate: impl Populate<V>,
    ) -> Self
    where
        V: Serialize + DeserializeOwned,
    {
        let name = name.into();
        if !config.eternal {
            tracing::warn!(
                cache = %name,
                "Expiring cache entries are not supported, entries stay until removed"
            );
        }

        let mut setup = Self::new(name, populate);
        if let Some(path) = &config.snapshot_path {
            setup = setup.snapshot_store(Arc::new(FileSnapshotStore::<V>::new(path)));
        }
        if let Some(refresh) = &config.refresh {
            setup = setup.refresh(refresh.clone());
        }
        setup
    }

    /// Uses `store` instead of the default in-memory store.
    pub fn store(mut self, store: impl KeyValueStore<V>) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Bootstraps the cache from `store` on activation and persists it there on disposal.
    pub fn snapshot_store(self, store: Arc<dyn SnapshotStore<V>>) -> Self {
        self.bootstrap_from(Arc::clone(&store))
            .on_dispose(ShutdownPersister::new(store))
    }

    /// Bootstraps the cache from `store` on activation, without persisting it on disposal.
    pub fn bootstrap_from(mut self, store: Arc<dyn SnapshotStore<V>>) -> Self {
        self.bootstrap = Some(BootstrapLoader::new(store));
        self
    }

    /// Registers a listener that receives all entries when the cache is disposed.
    pub fn on_dispose(mut self, listener: impl DisposeListener<V> + 'static) -> Self {
        self.listeners.push(Box::new(listener));
        self
    }

    /// Refreshes stale entries in the background.
    pub fn refresh(mut self, config: RefreshConfig) -> Self {
        self.refresh = Some(config);
        self
    }

    /// Creates the cache, bootstraps it and starts the refresh workers.
    ///
    /// The returned cache is fully bootstrapped, no caller can observe it half-loaded.
    ///
    /// # Panics
    ///
    /// Panics when refreshing is configured and this is called outside of a tokio runtime.
    pub fn activate(self) -> ProxyCache<V> {
        let store: Arc<dyn KeyValueStore<V>> = match self.store {
            Some(store) => store,
            None => Arc::new(MokaStore::new(&self.name)),
        };
        let clock = Arc::new(RefreshClock::default());
        let cache =
            SelfPopulatingCache::with_clock(self.name, store, self.populate, Arc::clone(&clock));

        if let Some(bootstrap) = self.bootstrap {
            bootstrap.load_into(&cache);
        }

        let scheduler = self
            .refresh
            .map(|config| RefreshAheadScheduler::start(&config, &cache, clock));

        tracing::debug!(
            cache = cache.name(),
            entries = cache.len(),
            refresh = scheduler.is_some(),
            "Activated cache"
        );

        ProxyCache {
            cache,
            scheduler,
            listeners: self.listeners,
        }
    }
}

/// An activated cache, see [`ProxyCacheSetup`].
///
/// Reads go through the [`SelfPopulatingCache`] and, if refreshing is configured, give the
/// refresh-ahead scheduler a chance to queue a refresh of the key.
///
/// A cache is shut down with [`dispose`](Self::dispose). Dropping it without disposing stops
/// the refresh workers but skips the dispose listeners.
pub struct ProxyCache<V> {
    cache: SelfPopulatingCache<V>,
    scheduler: Option<RefreshAheadScheduler>,
    listeners: Vec<Box<dyn DisposeListener<V>>>,
}

impl<V: 'static> fmt::Debug for ProxyCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCache")
            .field("cache", &self.cache)
            .field("scheduler", &self.scheduler)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl<V> ProxyCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn name(&self) -> &str {
        self.cache.name()
    }

    /// Returns the value for `key`, populating it on a miss.
    pub async fn get(&self, key: &CacheKey) -> Result<V, CacheError> {
        let entry = self.get_entry(key).await?;
        Ok(entry.value().clone())
    }

    /// Returns the entry for `key` including its metadata, populating it on a miss.
    pub async fn get_entry(&self, key: &CacheKey) -> Result<Arc<CacheEntry<V>>, CacheError> {
        let entry = self.cache.get_entry(key).await?;
        self.schedule_refresh(key);
        Ok(entry)
    }

    /// Returns the value for `key` if present, without ever populating.
    pub fn peek(&self, key: &CacheKey) -> Option<V> {
        let entry = self.cache.peek(key)?;
        self.schedule_refresh(key);
        Some(entry.value().clone())
    }

    /// Populates a missing `key` in the background.
    ///
    /// Returns `false` if the key is present or already being populated.
    pub fn load(&self, key: &CacheKey) -> bool {
        self.cache.load(key)
    }

    pub fn put(&self, key: CacheKey, value: V) {
        self.cache.put(key, value)
    }

    /// Removes `key`. A population in progress for it is not stored.
    pub fn remove(&self, key: &CacheKey) -> Option<V> {
        self.cache.remove(key).map(|entry| entry.value().clone())
    }

    pub fn clear(&self) {
        self.cache.clear()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Copies all current entries.
    pub fn entries(&self) -> Snapshot<V> {
        self.cache.entries()
    }

    /// The number of reads served for `key`, if it is present.
    pub fn hit_count(&self, key: &CacheKey) -> Option<u64> {
        self.cache.hit_count(key)
    }

    /// The number of successful populations, including refreshes.
    pub fn populations(&self) -> u64 {
        self.cache.populations()
    }

    /// The number of refreshes waiting for a worker.
    pub fn refresh_backlog(&self) -> usize {
        self.scheduler.as_ref().map_or(0, |s| s.backlog())
    }

    /// The number of refreshes dropped because the backlog was full.
    pub fn dropped_refreshes(&self) -> u64 {
        self.scheduler.as_ref().map_or(0, |s| s.dropped())
    }

    /// Shuts the cache down.
    ///
    /// Stops the refresh workers, hands all entries to the dispose listeners in registration
    /// order, and finally releases the entries.
    pub async fn dispose(mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown().await;
        }

        let entries = self.cache.entries();
        let name = self.cache.name();
        for listener in &self.listeners {
            listener.on_dispose(name, &entries);
        }

        self.cache.clear();
        tracing::debug!(cache = name, entries = entries.len(), "Disposed cache");
    }

    fn schedule_refresh(&self, key: &CacheKey) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.maybe_schedule(key);
        }
    }
}

impl ProxyCache<CachedResponse> {
    /// Returns the response for `key` the way it is served to clients.
    ///
    /// The response carries the cache key and the current hit count in extra headers.
    pub async fn serve(&self, key: &CacheKey) -> Result<CachedResponse, CacheError> {
        let entry = self.get_entry(key).await?;
        Ok(entry.value().served(key, entry.hits()))
    }
}
