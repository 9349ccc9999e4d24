use std::sync::Arc;

use super::{SelfPopulatingCache, Snapshot, SnapshotStore};

/// Fills a freshly created cache from a [`SnapshotStore`].
pub struct BootstrapLoader<V> {
    store: Arc<dyn SnapshotStore<V>>,
}

impl<V: Send + Sync + 'static> BootstrapLoader<V> {
    pub fn new(store: Arc<dyn SnapshotStore<V>>) -> Self {
        Self { store }
    }

    /// Inserts every entry of the stored snapshot into `cache`, keeping their metadata.
    ///
    /// Failing to load the snapshot is logged and results in an empty (cold) cache, it never
    /// prevents the cache from starting. Returns the number of loaded entries.
    pub(crate) fn load_into(&self, cache: &SelfPopulatingCache<V>) -> usize {
        let name = cache.name();
        let snapshot = match self.store.load() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                metric!(counter("caches.snapshot.load") += 1, "cache" => name, "status" => "failed");
                tracing::error!(
                    cache = name,
                    error = &err as &dyn std::error::Error,
                    "Failed to load cache snapshot, starting cold"
                );
                return 0;
            }
        };

        let count = snapshot.len();
        for (key, entry) in snapshot {
            cache.insert_entry(key, Arc::new(entry));
        }

        metric!(counter("caches.snapshot.load") += 1, "cache" => name, "status" => "ok");
        metric!(gauge("caches.snapshot.entries") = count as u64, "cache" => name);
        tracing::info!(cache = name, entries = count, "Bootstrapped cache from snapshot");
        count
    }
}

/// Receives all entries of a cache right before the cache is disposed.
///
/// Listeners run in registration order. They cannot fail the disposal, errors have to be handled
/// (or logged) by the listener itself.
pub trait DisposeListener<V>: Send + Sync {
    fn on_dispose(&self, cache_name: &str, entries: &Snapshot<V>);
}

impl<V, F> DisposeListener<V> for F
where
    F: Fn(&str, &Snapshot<V>) + Send + Sync,
{
    fn on_dispose(&self, cache_name: &str, entries: &Snapshot<V>) {
        self(cache_name, entries)
    }
}

/// A [`DisposeListener`] saving all entries to a [`SnapshotStore`].
pub struct ShutdownPersister<V> {
    store: Arc<dyn SnapshotStore<V>>,
}

impl<V> ShutdownPersister<V> {
    pub fn new(store: Arc<dyn SnapshotStore<V>>) -> Self {
        Self { store }
    }
}

impl<V> DisposeListener<V> for ShutdownPersister<V> {
    fn on_dispose(&self, cache_name: &str, entries: &Snapshot<V>) {
        match self.store.save(entries) {
            Ok(()) => {
                metric!(counter("caches.snapshot.save") += 1, "cache" => cache_name, "status" => "ok");
                metric!(
                    gauge("caches.snapshot.entries") = entries.len() as u64,
                    "cache" => cache_name
                );
                tracing::info!(
                    cache = cache_name,
                    entries = entries.len(),
                    "Persisted cache snapshot"
                );
            }
            Err(err) => {
                metric!(counter("caches.snapshot.save") += 1, "cache" => cache_name, "status" => "failed");
                tracing::error!(
                    cache = cache_name,
                    error = &err as &dyn std::error::Error,
                    "Failed to persist cache snapshot"
                );
            }
        }
    }
}

