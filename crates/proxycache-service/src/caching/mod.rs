//! # Proxycache caching infrastructure
//!
//! The cache sits in front of the forwarding path and answers repeated requests without going
//! upstream. This module contains the whole engine: how requests are keyed, how entries are
//! populated and refreshed, and how they survive restarts.
//!
//! ## Cache Layers
//!
//! - A [`KeyValueStore`] holds the entries. The default [`MokaStore`] never evicts anything,
//!   entries are eternal and live until they are removed.
//! - The [`SelfPopulatingCache`] wraps the store. On a miss it runs the [`Populate`] function for
//!   the key, and it makes sure that at most one population per key runs at any time: every
//!   concurrent caller for the same key waits for that population and observes its result.
//!   Failures are handed to all waiters and never stored.
//! - The [`RefreshAheadScheduler`] re-populates entries that are older than a configured age on
//!   their next read, using a fixed pool of background workers. Readers keep getting the old value
//!   until the refresh finished.
//! - A [`SnapshotStore`] holds a [`Snapshot`] of all entries between two runs of the process. The
//!   [`BootstrapLoader`] fills a new cache from it before the cache is handed out, and the
//!   [`ShutdownPersister`] writes all entries back to it when the cache is disposed.
//!
//! The [`ProxyCacheSetup`] wires all of these together and activates a [`ProxyCache`].
//!
//! ### Metrics
//!
//! Each metric is tagged with a `cache` field naming the cache:
//!
//! - `caches.access`: All accesses through `get`.
//! - `caches.memory.hit`: Reads served from the store.
//! - `caches.memory.coalesced`: Misses that joined a population already running.
//! - `caches.computation`: Successful populations, tagged with `is_refresh`.
//! - `caches.computation.failed`: Failed populations, tagged with `is_refresh` and `reason`.
//! - `caches.computation.duration`: How long successful populations took.
//! - `caches.refresh.scheduled` / `caches.refresh.dropped`: Refreshes queued or dropped because
//!   the backlog was full, and `caches.refresh.backlog` with the resulting backlog depth.
//! - `caches.snapshot.load` / `caches.snapshot.save`: Snapshot I/O, tagged with `status`, and
//!   `caches.snapshot.entries` with the number of entries loaded or saved.
//!
//! ## [`CacheKey`] / [`CacheEntry`]
//!
//! A [`CacheKey`] is the method and the normalized URI of a request. Its display form
//! `METHOD|uri` is also what clients see as the cache key of a response.
//!
//! A [`CacheEntry`] wraps the cached value with its creation time, its last access and the number
//! of reads it served. A refresh swaps the value but keeps these statistics.
//!
//! ## Removing entries during population
//!
//! [`ProxyCache::remove`], [`ProxyCache::put`] and [`ProxyCache::clear`] win over a population
//! that is in progress for the affected keys. The callers already waiting on such a population
//! still receive its result, but the result is never written to the store.

mod cache_error;
mod cache_key;
mod entry;
mod lifecycle;
mod populating;
mod proxy;
mod refresh;
pub mod snapshot;
mod store;
#[cfg(test)]
mod tests;

pub use cache_error::{CacheError, SnapshotError};
pub use cache_key::CacheKey;
pub use entry::CacheEntry;
pub use lifecycle::{BootstrapLoader, DisposeListener, ShutdownPersister};
pub use populating::{Populate, SelfPopulatingCache};
pub use proxy::{ProxyCache, ProxyCacheSetup};
pub use refresh::RefreshAheadScheduler;
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, Snapshot, SnapshotStore};
pub use store::{KeyValueStore, MokaStore};
