//! Point-in-time extractions of all cache entries, used to survive restarts.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{CacheEntry, CacheKey, SnapshotError};

mod fs;
mod memory;

pub use fs::FileSnapshotStore;
pub use memory::MemorySnapshotStore;

/// An ordered sequence of cache entries without duplicate keys.
///
/// The order is the insertion order, it has no meaning for the cache but keeps snapshots
/// deterministic.
#[derive(Debug, Clone)]
pub struct Snapshot<V> {
    entries: Vec<(CacheKey, CacheEntry<V>)>,
    positions: HashMap<CacheKey, usize>,
}

impl<V> Default for Snapshot<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }
}

impl<V> Snapshot<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, replacing the entry of an equal key in place.
    ///
    /// Returns the replaced entry, if any.
    pub fn insert(&mut self, key: CacheKey, entry: CacheEntry<V>) -> Option<CacheEntry<V>> {
        match self.positions.get(&key) {
            Some(&index) => Some(std::mem::replace(&mut self.entries[index].1, entry)),
            None => {
                self.positions.insert(key.clone(), self.entries.len());
                self.entries.push((key, entry));
                None
            }
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry<V>> {
        let index = *self.positions.get(key)?;
        Some(&self.entries[index].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, &CacheEntry<V>)> {
        self.entries.iter().map(|(key, entry)| (key, entry))
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.iter().map(|(key, _)| key)
    }
}

impl<V> FromIterator<(CacheKey, CacheEntry<V>)> for Snapshot<V> {
    /// Collects entries into a snapshot, later duplicates replace earlier ones.
    fn from_iter<I: IntoIterator<Item = (CacheKey, CacheEntry<V>)>>(iter: I) -> Self {
        let mut snapshot = Self::new();
        for (key, entry) in iter {
            snapshot.insert(key, entry);
        }
        snapshot
    }
}

impl<V> IntoIterator for Snapshot<V> {
    type Item = (CacheKey, CacheEntry<V>);
    type IntoIter = std::vec::IntoIter<(CacheKey, CacheEntry<V>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// The on-disk representation of a single snapshot entry.
#[derive(Serialize)]
struct SerializeRecord<'a, V> {
    key: &'a CacheKey,
    entry: &'a CacheEntry<V>,
}

#[derive(Deserialize)]
struct DeserializeRecord<V> {
    key: CacheKey,
    entry: CacheEntry<V>,
}

impl<V: Serialize> Serialize for Snapshot<V> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(
            self.entries
                .iter()
                .map(|(key, entry)| SerializeRecord { key, entry }),
        )
    }
}

impl<'de, V: DeserializeOwned> Deserialize<'de> for Snapshot<V> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let records = Vec::<DeserializeRecord<V>>::deserialize(deserializer)?;
        Ok(records
            .into_iter()
            .map(|record| (record.key, record.entry))
            .collect())
    }
}

/// A holder of a [`Snapshot`] that outlives a single cache instance.
///
/// Loading and saving are mutually exclusive.
pub trait SnapshotStore<V>: Send + Sync {
    /// Returns all entries currently held.
    ///
    /// A store that never saved anything returns an empty snapshot.
    fn load(&self) -> Result<Snapshot<V>, SnapshotError>;

    /// Replaces the held entries with `snapshot`.
    fn save(&self, snapshot: &Snapshot<V>) -> Result<(), SnapshotError>;

    /// Drops all held entries.
    fn clear(&self) -> Result<(), SnapshotError>;
}
