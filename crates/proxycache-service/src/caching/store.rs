use std::fmt;
use std::sync::Arc;

use super::{CacheEntry, CacheKey};

/// The key-value storage capability the caches are built on.
///
/// Every operation has to be atomic per key. Implementations must not evict entries on their
/// own, the engine treats entries as eternal.
pub trait KeyValueStore<V>: Send + Sync + 'static {
    fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry<V>>>;

    fn put(&self, key: CacheKey, entry: Arc<CacheEntry<V>>);

    fn remove(&self, key: &CacheKey) -> Option<Arc<CacheEntry<V>>>;

    /// Lists all keys currently held, in no particular order.
    fn keys(&self) -> Vec<CacheKey>;

    fn clear(&self) {
        for key in self.keys() {
            self.remove(&key);
        }
    }

    fn len(&self) -> usize {
        self.keys().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A [`KeyValueStore`] backed by an unbounded in-memory [`moka`] cache.
pub struct MokaStore<V> {
    name: String,
    entries: moka::sync::Cache<CacheKey, Arc<CacheEntry<V>>>,
}

impl<V: Send + Sync + 'static> MokaStore<V> {
    pub fn new(name: &str) -> Self {
        // NOTE: neither a capacity nor any expiration is configured, entries stay until removed.
        let entries = moka::sync::Cache::builder().name(name).build();
        Self {
            name: name.to_owned(),
            entries,
        }
    }
}

impl<V> fmt::Debug for MokaStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MokaStore")
            .field("name", &self.name)
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl<V: Send + Sync + 'static> KeyValueStore<V> for MokaStore<V> {
    fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry<V>>> {
        self.entries.get(key)
    }

    fn put(&self, key: CacheKey, entry: Arc<CacheEntry<V>>) {
        self.entries.insert(key, entry);
    }

    fn remove(&self, key: &CacheKey) -> Option<Arc<CacheEntry<V>>> {
        self.entries.remove(key)
    }

    fn keys(&self) -> Vec<CacheKey> {
        self.entries
            .iter()
            .map(|(key, _)| CacheKey::clone(&key))
            .collect()
    }

    fn len(&self) -> usize {
        // `entry_count` lags behind pending writes, counting is exact.
        self.entries.iter().count()
    }
}
