use std::sync::Mutex;

use super::{Snapshot, SnapshotStore};
use crate::caching::SnapshotError;

/// A process-local [`SnapshotStore`].
///
/// It carries entries from one cache instance to the next within the same process, which is
/// what restarts of a cache (and tests) need. It never fails.
#[derive(Debug)]
pub struct MemorySnapshotStore<V> {
    snapshot: Mutex<Snapshot<V>>,
}

impl<V> Default for MemorySnapshotStore<V> {
    fn default() -> Self {
        Self {
            snapshot: Mutex::new(Snapshot::new()),
        }
    }
}

impl<V> MemorySnapshotStore<V> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<V> From<Snapshot<V>> for MemorySnapshotStore<V> {
    fn from(snapshot: Snapshot<V>) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }
}

impl<V: Clone + Send> SnapshotStore<V> for MemorySnapshotStore<V> {
    fn load(&self) -> Result<Snapshot<V>, SnapshotError> {
        let snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        tracing::debug!(entries = snapshot.len(), "Loading in-memory snapshot");
        Ok(snapshot.clone())
    }

    fn save(&self, snapshot: &Snapshot<V>) -> Result<(), SnapshotError> {
        tracing::debug!(entries = snapshot.len(), "Saving in-memory snapshot");
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();
        Ok(())
    }

    fn clear(&self) -> Result<(), SnapshotError> {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Snapshot::new();
        Ok(())
    }
}
