use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;

use super::refresh::RefreshClock;
use super::{CacheEntry, CacheError, CacheKey, KeyValueStore, Snapshot};
use crate::utils::defer::defer;

/// The function filling the cache on a miss or a refresh.
///
/// This is the only place upstream I/O happens. The engine never looks at the produced values,
/// and imposes no timeout: a population that hangs keeps its waiters waiting.
pub trait Populate<V>: Send + Sync + 'static {
    fn populate(&self, key: CacheKey) -> BoxFuture<'static, Result<V, CacheError>>;
}

impl<V, F, Fut> Populate<V> for F
where
    F: Fn(CacheKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, CacheError>> + Send + 'static,
{
    fn populate(&self, key: CacheKey) -> BoxFuture<'static, Result<V, CacheError>> {
        self(key).boxed()
    }
}

/// What triggered a population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    /// A caller asked for a missing key and waits for it.
    Miss,
    /// A caller asked for a missing key to be loaded in the background.
    Load,
    /// The refresh-ahead scheduler re-populates a present key.
    Refresh,
}

impl Origin {
    fn refresh_tag(self) -> &'static str {
        match self {
            Self::Refresh => "true",
            Self::Miss | Self::Load => "false",
        }
    }
}

type PopulationResult<V> = Result<Arc<CacheEntry<V>>, CacheError>;

/// A population in progress, awaitable by any number of callers.
pub(crate) type Flight<V> = Shared<BoxFuture<'static, PopulationResult<V>>>;

struct InFlight<V> {
    /// Distinguishes this population from later ones for the same key.
    id: u64,
    future: Flight<V>,
    /// Set by `remove`, `put` and `clear`. The result is handed to the waiters but not stored.
    cancelled: bool,
}

impl<V> InFlight<V> {
    /// Returns the population new callers may join, or the cancelled one a new population
    /// has to wait for.
    fn split(&self) -> Result<Flight<V>, Flight<V>> {
        if self.cancelled {
            Err(self.future.clone())
        } else {
            Ok(self.future.clone())
        }
    }
}

struct Inner<V> {
    name: String,
    store: Arc<dyn KeyValueStore<V>>,
    populate: Arc<dyn Populate<V>>,
    /// The populations currently running, at most one per key.
    ///
    /// A cancelled population stays registered until its task finishes, so that a new one for
    /// the same key can wait for it instead of overlapping. The lock is only held to register,
    /// complete or cancel a population, never across one.
    inflight: Mutex<HashMap<CacheKey, InFlight<V>>>,
    next_flight: AtomicU64,
    clock: Arc<RefreshClock>,
    populations: AtomicU64,
    failures: AtomicU64,
}

/// A cache that fills itself on misses.
///
/// Hits are served straight from the underlying [`KeyValueStore`]. On a miss, the first caller
/// starts the [`Populate`] function for the key and every concurrent caller for the same key
/// waits for that single population and observes its result. A successful result is stored,
/// a failure is handed to all waiters but never stored, so the next access retries.
///
/// [`remove`](Self::remove), [`put`](Self::put) and [`clear`](Self::clear) cancel a population
/// in progress for the affected keys: its waiters still receive the result, but it will not be
/// written to the store. A miss on such a key starts a new population only once the cancelled
/// one has finished, the populate function never runs twice at once for one key.
///
/// The handle is cheap to clone, all clones share the same state.
pub struct SelfPopulatingCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for SelfPopulatingCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: 'static> fmt::Debug for SelfPopulatingCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inflight = self
            .inner
            .inflight
            .try_lock()
            .map(|i| i.len())
            .unwrap_or_default();
        f.debug_struct("SelfPopulatingCache")
            .field("name", &self.inner.name)
            .field("entries", &self.inner.store.len())
            .field("running populations", &inflight)
            .field("populations", &self.inner.populations.load(Ordering::Relaxed))
            .finish()
    }
}

impl<V: Send + Sync + 'static> SelfPopulatingCache<V> {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn KeyValueStore<V>>,
        populate: Arc<dyn Populate<V>>,
    ) -> Self {
        Self::with_clock(name.into(), store, populate, Default::default())
    }

    pub(crate) fn with_clock(
        name: String,
        store: Arc<dyn KeyValueStore<V>>,
        populate: Arc<dyn Populate<V>>,
        clock: Arc<RefreshClock>,
    ) -> Self {
        let inner = Inner {
            name,
            store,
            populate,
            inflight: Default::default(),
            next_flight: AtomicU64::new(0),
            clock,
            populations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the entry for `key`, populating it on a miss.
    ///
    /// A hit never suspends. A miss suspends until the single population for `key` finishes,
    /// whether this call started it or joined one already running.
    pub async fn get_entry(&self, key: &CacheKey) -> PopulationResult<V> {
        let name = self.name();
        metric!(counter("caches.access") += 1, "cache" => name);

        if let Some(entry) = self.peek(key) {
            return Ok(entry);
        }

        let flight = {
            let mut inflight = self.inner.lock_inflight();
            // The population may have finished between the lookup above and taking the lock.
            if let Some(entry) = self.inner.store.get(key) {
                drop(inflight);
                metric!(counter("caches.memory.hit") += 1, "cache" => name);
                entry.record_hit();
                return Ok(entry);
            }
            match inflight.get(key).map(InFlight::split) {
                Some(Ok(running)) => {
                    metric!(counter("caches.memory.coalesced") += 1, "cache" => name);
                    running
                }
                Some(Err(cancelled)) => {
                    self.start_population(&mut inflight, key, Origin::Miss, Some(cancelled))
                }
                None => self.start_population(&mut inflight, key, Origin::Miss, None),
            }
        };

        flight.await
    }

    /// Returns a clone of the value for `key`, populating it on a miss.
    ///
    /// See [`get_entry`](Self::get_entry).
    pub async fn get(&self, key: &CacheKey) -> Result<V, CacheError>
    where
        V: Clone,
    {
        let entry = self.get_entry(key).await?;
        Ok(entry.value().clone())
    }

    /// Returns the entry for `key` if it is present, recording a hit. Never populates.
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<CacheEntry<V>>> {
        let entry = self.inner.store.get(key)?;
        metric!(counter("caches.memory.hit") += 1, "cache" => self.name());
        entry.record_hit();
        Some(entry)
    }

    /// Starts populating a missing `key` in the background without waiting for it.
    ///
    /// Returns `false` if the key is present or already being populated.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn load(&self, key: &CacheKey) -> bool {
        let mut inflight = self.inner.lock_inflight();
        if self.inner.store.get(key).is_some() {
            return false;
        }
        let after = match inflight.get(key).map(InFlight::split) {
            Some(Ok(_)) => return false,
            Some(Err(cancelled)) => Some(cancelled),
            None => None,
        };
        // The flight runs as its own task, it does not need to be polled to make progress.
        let _flight = self.start_population(&mut inflight, key, Origin::Load, after);
        true
    }

    /// Re-populates a present `key`.
    ///
    /// Returns `None` if the key is absent, so a removed key is never resurrected, or if a
    /// population for it is already running, cancelled or not.
    pub(crate) fn refresh(&self, key: &CacheKey) -> Option<Flight<V>> {
        let mut inflight = self.inner.lock_inflight();
        if inflight.contains_key(key) || self.inner.store.get(key).is_none() {
            return None;
        }
        Some(self.start_population(&mut inflight, key, Origin::Refresh, None))
    }

    /// Stores `value` for `key`, replacing any previous entry.
    pub fn put(&self, key: CacheKey, value: V) {
        self.insert_entry(key, Arc::new(CacheEntry::new(value)));
    }

    /// Stores an already complete entry, bypassing population.
    pub(crate) fn insert_entry(&self, key: CacheKey, entry: Arc<CacheEntry<V>>) {
        let mut inflight = self.inner.lock_inflight();
        if let Some(running) = inflight.get_mut(&key) {
            running.cancelled = true;
        }
        self.inner.clock.record(&key, Instant::now());
        self.inner.store.put(key, entry);
    }

    pub fn remove(&self, key: &CacheKey) -> Option<Arc<CacheEntry<V>>> {
        let mut inflight = self.inner.lock_inflight();
        if let Some(running) = inflight.get_mut(key) {
            running.cancelled = true;
            tracing::debug!(cache = self.name(), %key, "Removed key with a population in progress");
        }
        self.inner.clock.forget(key);
        self.inner.store.remove(key)
    }

    pub fn clear(&self) {
        let mut inflight = self.inner.lock_inflight();
        for running in inflight.values_mut() {
            running.cancelled = true;
        }
        self.inner.clock.clear();
        self.inner.store.clear();
    }

    /// Copies all current entries into a [`Snapshot`], ordered by key.
    pub fn entries(&self) -> Snapshot<V>
    where
        V: Clone,
    {
        let mut keys = self.inner.store.keys();
        keys.sort();
        keys.into_iter()
            .filter_map(|key| {
                let entry = self.inner.store.get(&key)?;
                Some((key, CacheEntry::clone(&entry)))
            })
            .collect()
    }

    /// The number of reads served for `key`, if it is present.
    pub fn hit_count(&self, key: &CacheKey) -> Option<u64> {
        self.inner.store.get(key).map(|entry| entry.hits())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.store.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// The number of successful populations so far, both from misses and from refreshes.
    pub fn populations(&self) -> u64 {
        self.inner.populations.load(Ordering::Relaxed)
    }

    /// The number of failed populations so far.
    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::Relaxed)
    }

    /// Spawns the population for `key` and registers it as the running one.
    ///
    /// When `after` is given, the populate function is only invoked once that cancelled
    /// population has finished. Must be called with the in-flight lock held, which `inflight`
    /// proves.
    fn start_population(
        &self,
        inflight: &mut MutexGuard<'_, HashMap<CacheKey, InFlight<V>>>,
        key: &CacheKey,
        origin: Origin,
        after: Option<Flight<V>>,
    ) -> Flight<V> {
        let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(cache = self.name(), %key, ?origin, "Spawning population");

        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let task = async move {
            // Unregisters the population if the task unwinds before completing.
            let unregister = defer({
                let inner = Arc::clone(&inner);
                let key = task_key.clone();
                move || inner.unregister(&key, id)
            });

            if let Some(cancelled) = after {
                // Its outcome belongs to its own waiters.
                let _ = cancelled.await;
            }

            let started = Instant::now();
            let result = inner.populate.populate(task_key.clone()).await;
            unregister.cancel();

            inner.complete(&task_key, id, origin, started, result)
        };
        let handle = tokio::spawn(task);

        let future = async move { handle.await.unwrap_or_else(|e| Err(CacheError::from(e))) }
            .boxed()
            .shared();

        inflight.insert(
            key.clone(),
            InFlight {
                id,
                future: future.clone(),
                cancelled: false,
            },
        );
        future
    }
}

impl<V: Send + Sync + 'static> Inner<V> {
    fn lock_inflight(&self) -> MutexGuard<'_, HashMap<CacheKey, InFlight<V>>> {
        // The map stays consistent even if a holder panicked, all updates are single inserts
        // and removals.
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Removes the registration of population `id` for `key`, if it is still the registered one.
    fn unregister(&self, key: &CacheKey, id: u64) {
        let mut inflight = self.lock_inflight();
        if inflight.get(key).is_some_and(|running| running.id == id) {
            inflight.remove(key);
        }
    }

    /// Finishes population `id`: stores a successful result unless the population was
    /// cancelled in the meantime, and releases the key.
    fn complete(
        &self,
        key: &CacheKey,
        id: u64,
        origin: Origin,
        started: Instant,
        result: Result<V, CacheError>,
    ) -> PopulationResult<V> {
        let name = self.name.as_str();
        let is_refresh = origin.refresh_tag();

        let mut inflight = self.lock_inflight();
        // A cancelled population may also have been replaced by a newer one in the meantime.
        let registered = match inflight.get(key) {
            Some(running) if running.id == id => {
                let cancelled = running.cancelled;
                inflight.remove(key);
                !cancelled
            }
            _ => false,
        };

        match result {
            Ok(value) => {
                self.populations.fetch_add(1, Ordering::Relaxed);
                metric!(
                    counter("caches.computation") += 1,
                    "cache" => name,
                    "is_refresh" => is_refresh,
                );
                metric!(
                    timer("caches.computation.duration") = started.elapsed(),
                    "cache" => name,
                    "is_refresh" => is_refresh,
                );

                let entry = match self.store.get(key) {
                    Some(previous) => Arc::new(previous.with_value(value)),
                    None => Arc::new(CacheEntry::new(value)),
                };

                if registered {
                    self.clock.record(key, started);
                    self.store.put(key.clone(), Arc::clone(&entry));
                } else {
                    tracing::debug!(
                        cache = name,
                        %key,
                        "Discarding result of a cancelled population"
                    );
                }
                drop(inflight);

                tracing::trace!(cache = name, %key, ?origin, "Population finished");
                Ok(entry)
            }
            Err(err) => {
                drop(inflight);
                self.failures.fetch_add(1, Ordering::Relaxed);
                metric!(
                    counter("caches.computation.failed") += 1,
                    "cache" => name,
                    "is_refresh" => is_refresh,
                    "reason" => err.metrics_tag(),
                );
                tracing::debug!(
                    cache = name,
                    %key,
                    ?origin,
                    error = &err as &dyn std::error::Error,
                    "Population failed"
                );
                Err(err)
            }
        }
    }
}
