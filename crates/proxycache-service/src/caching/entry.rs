use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Access statistics of a key, shared by all entries that were stored for it by refreshes.
#[derive(Debug, Default)]
struct AccessStats {
    hits: AtomicU64,
    /// Milliseconds since the unix epoch.
    last_accessed: AtomicU64,
}

/// A value stored in the cache together with its metadata.
///
/// Entries are eternal, the underlying store never expires them. A refresh stores a new entry via
/// [`with_value`](Self::with_value) which keeps the creation time and shares the access statistics
/// with the entry it replaces, so hits recorded concurrently with a refresh are not lost.
///
/// [`Clone`] produces a detached copy: the clone starts with the current statistics but does not
/// observe hits recorded on the original afterwards. This is what snapshots are made of.
pub struct CacheEntry<V> {
    value: V,
    created: SystemTime,
    stats: Arc<AccessStats>,
}

impl<V> CacheEntry<V> {
    /// Creates a fresh entry that has never been read.
    pub fn new(value: V) -> Self {
        let created = SystemTime::now();
        let stats = AccessStats {
            hits: AtomicU64::new(0),
            last_accessed: AtomicU64::new(unix_millis(created)),
        };
        Self {
            value,
            created,
            stats: Arc::new(stats),
        }
    }

    /// Creates an entry that shares the creation time and statistics of `self`, but holds `value`.
    pub(crate) fn with_value(&self, value: V) -> Self {
        Self {
            value,
            created: self.created,
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    /// The number of successful reads of this key.
    pub fn hits(&self) -> u64 {
        self.stats.hits.load(Ordering::Relaxed)
    }

    /// The last time this key was read, or the creation time if it never was.
    pub fn last_accessed(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH
            + Duration::from_millis(self.stats.last_accessed.load(Ordering::Relaxed))
    }

    /// Records a successful read and returns the new hit count.
    pub(crate) fn record_hit(&self) -> u64 {
        self.stats
            .last_accessed
            .fetch_max(unix_millis(SystemTime::now()), Ordering::Relaxed);
        self.stats.hits.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl<V: Clone> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        let stats = AccessStats {
            hits: AtomicU64::new(self.hits()),
            last_accessed: AtomicU64::new(self.stats.last_accessed.load(Ordering::Relaxed)),
        };
        Self {
            value: self.value.clone(),
            created: self.created,
            stats: Arc::new(stats),
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("value", &self.value)
            .field("created", &self.created)
            .field("hits", &self.hits())
            .field("last_accessed", &self.last_accessed())
            .finish()
    }
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[derive(Serialize)]
struct SerializeEntry<'a, V> {
    value: &'a V,
    created: SystemTime,
    hits: u64,
    last_accessed: SystemTime,
}

#[derive(Deserialize)]
struct DeserializeEntry<V> {
    value: V,
    created: SystemTime,
    #[serde(default)]
    hits: u64,
    last_accessed: Option<SystemTime>,
}

impl<V: Serialize> Serialize for CacheEntry<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SerializeEntry {
            value: &self.value,
            created: self.created,
            hits: self.hits(),
            last_accessed: self.last_accessed(),
        }
        .serialize(serializer)
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for CacheEntry<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = DeserializeEntry::<V>::deserialize(deserializer)?;
        let last_accessed = raw.last_accessed.unwrap_or(raw.created);
        let stats = AccessStats {
            hits: AtomicU64::new(raw.hits),
            last_accessed: AtomicU64::new(unix_millis(last_accessed)),
        };
        Ok(Self {
            value: raw.value,
            created: raw.created,
            stats: Arc::new(stats),
        })
    }
}
