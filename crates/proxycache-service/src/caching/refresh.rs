use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{CacheKey, SelfPopulatingCache};
use crate::config::RefreshConfig;
use crate::utils::defer::defer;

/// Remembers when the value of each key was last populated.
///
/// The recorded instant is the start of the population that produced the stored value. Entries
/// that were put or bootstrapped count as populated at the time they were stored.
#[derive(Debug, Default)]
pub(crate) struct RefreshClock {
    populated: Mutex<HashMap<CacheKey, Instant>>,
}

impl RefreshClock {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Instant>> {
        self.populated.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, key: &CacheKey, at: Instant) {
        self.lock().insert(key.clone(), at);
    }

    pub fn forget(&self, key: &CacheKey) {
        self.lock().remove(key);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// The time since `key` was last populated, if it is known.
    pub fn elapsed(&self, key: &CacheKey) -> Option<Duration> {
        self.lock().get(key).map(|at| at.elapsed())
    }
}

/// State shared by the scheduler and its workers.
#[derive(Debug, Default)]
struct Backlog {
    /// Keys that are queued or currently being refreshed.
    pending: Mutex<HashSet<CacheKey>>,
    /// Keys waiting in the channel, not yet picked up by a worker.
    queued: AtomicUsize,
    scheduled: AtomicU64,
    dropped: AtomicU64,
}

impl Backlog {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashSet<CacheKey>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Re-populates stale entries in the background while the old value keeps being served.
///
/// Reads of a key call [`maybe_schedule`](Self::maybe_schedule). When the value of the key is
/// older than the configured `time_to_refresh`, a refresh is queued for a fixed pool of worker
/// tasks. A key is queued at most once at a time. When the bounded backlog is full, the request
/// is dropped, the next read of the key will try again.
///
/// Refreshes go through the same population path as misses, so they never run concurrently with
/// another population of the same key, and a key removed in the meantime is not refreshed.
#[derive(Debug)]
pub struct RefreshAheadScheduler {
    name: String,
    time_to_refresh: Duration,
    clock: Arc<RefreshClock>,
    /// `None` when the backlog holds no refreshes at all.
    sender: Option<mpsc::Sender<CacheKey>>,
    backlog: Arc<Backlog>,
    workers: Vec<JoinHandle<()>>,
}

impl RefreshAheadScheduler {
    /// Starts the worker pool refreshing entries of `cache`.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub(crate) fn start<V>(
        config: &RefreshConfig,
        cache: &SelfPopulatingCache<V>,
        clock: Arc<RefreshClock>,
    ) -> Self
    where
        V: Send + Sync + 'static,
    {
        let backlog = Arc::new(Backlog::default());

        // With a zero backlog every refresh request is dropped, workers would never get any.
        let worker_count = match config.max_backlog {
            0 => 0,
            _ => config.worker_threads.max(1),
        };
        let mut sender = None;
        let mut workers = Vec::with_capacity(worker_count);
        if worker_count > 0 {
            let (tx, receiver) = mpsc::channel(config.max_backlog);
            let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
            workers.extend((0..worker_count).map(|_| {
                tokio::spawn(refresh_worker(
                    cache.clone(),
                    Arc::clone(&receiver),
                    Arc::clone(&backlog),
                ))
            }));
            sender = Some(tx);
        }

        tracing::debug!(
            cache = cache.name(),
            workers = worker_count,
            max_backlog = config.max_backlog,
            time_to_refresh = ?config.time_to_refresh,
            "Started refresh-ahead workers"
        );

        Self {
            name: cache.name().to_owned(),
            time_to_refresh: config.time_to_refresh,
            clock,
            sender,
            backlog,
            workers,
        }
    }

    /// Queues a refresh of `key` if its value is stale and no refresh for it is pending.
    ///
    /// Returns `true` if a refresh was queued. Never blocks.
    pub fn maybe_schedule(&self, key: &CacheKey) -> bool {
        match self.clock.elapsed(key) {
            Some(age) if age > self.time_to_refresh => {}
            _ => return false,
        }

        let name = self.name.as_str();
        let mut pending = self.backlog.lock_pending();
        if pending.contains(key) {
            return false;
        }
        let Some(sender) = &self.sender else {
            self.drop_refresh(key);
            return false;
        };

        // Counted before sending, a worker may pick the key up right away.
        self.backlog.queued.fetch_add(1, Ordering::Relaxed);
        match sender.try_send(key.clone()) {
            Ok(()) => {
                pending.insert(key.clone());
                self.backlog.scheduled.fetch_add(1, Ordering::Relaxed);
                metric!(counter("caches.refresh.scheduled") += 1, "cache" => name);
                metric!(
                    gauge("caches.refresh.backlog") = self.backlog() as u64,
                    "cache" => name
                );
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.backlog.queued.fetch_sub(1, Ordering::Relaxed);
                self.drop_refresh(key);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.backlog.queued.fetch_sub(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn drop_refresh(&self, key: &CacheKey) {
        let name = self.name.as_str();
        self.backlog.dropped.fetch_add(1, Ordering::Relaxed);
        metric!(counter("caches.refresh.dropped") += 1, "cache" => name);
        tracing::debug!(cache = name, %key, "Refresh backlog full, dropping refresh");
    }

    /// The number of refreshes queued but not yet picked up by a worker.
    pub fn backlog(&self) -> usize {
        self.backlog.queued.load(Ordering::Relaxed)
    }

    /// The number of refreshes queued so far.
    pub fn scheduled(&self) -> u64 {
        self.backlog.scheduled.load(Ordering::Relaxed)
    }

    /// The number of refreshes dropped because the backlog was full.
    pub fn dropped(&self) -> u64 {
        self.backlog.dropped.load(Ordering::Relaxed)
    }

    /// Stops all workers.
    ///
    /// Queued refreshes are discarded. Populations already started keep running to completion on
    /// their own.
    pub async fn shutdown(mut self) {
        for worker in &self.workers {
            worker.abort();
        }
        for worker in self.workers.drain(..) {
            // Cancellation is the expected outcome here.
            let _ = worker.await;
        }
        tracing::debug!(cache = self.name.as_str(), "Stopped refresh-ahead workers");
    }
}

impl Drop for RefreshAheadScheduler {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn refresh_worker<V>(
    cache: SelfPopulatingCache<V>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<CacheKey>>>,
    backlog: Arc<Backlog>,
) where
    V: Send + Sync + 'static,
{
    loop {
        let key = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(key) = key else {
            break;
        };
        backlog.queued.fetch_sub(1, Ordering::Relaxed);

        let _done = defer(|| {
            backlog.lock_pending().remove(&key);
        });

        let Some(flight) = cache.refresh(&key) else {
            tracing::trace!(cache = cache.name(), %key, "Skipping refresh");
            continue;
        };
        // Failures are already reported by the population, the previous value stays in place.
        let _ = flight.await;
    }
}
