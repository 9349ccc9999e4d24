use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, join_all};

use crate::config::{CacheConfig, RefreshConfig};
use crate::response::CachedResponse;
use proxycache_test as test;

use super::*;

/// A population function answering with the request URI and a running number.
#[derive(Clone, Default)]
struct TestPopulate {
    calls: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    delay: Duration,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl TestPopulate {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// The highest number of invocations that were running at the same time.
    fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

impl Populate<String> for TestPopulate {
    fn populate(&self, key: CacheKey) -> BoxFuture<'static, Result<String, CacheError>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let fail = self.fail.load(Ordering::SeqCst);
        let delay = self.delay;
        let running = Arc::clone(&self.running);
        let max_running = Arc::clone(&self.max_running);

        Box::pin(async move {
            let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
            max_running.fetch_max(now_running, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            running.fetch_sub(1, Ordering::SeqCst);
            if fail {
                return Err(CacheError::population("upstream unavailable"));
            }
            Ok(format!("{} #{call}", key.uri()))
        })
    }
}

fn snapshot_of(entries: &[(&str, &str)]) -> Snapshot<String> {
    entries
        .iter()
        .map(|(uri, value)| (CacheKey::get(*uri), CacheEntry::new(value.to_string())))
        .collect()
}

/// Concurrent misses of one key are served by a single population.
#[tokio::test(start_paused = true)]
async fn test_single_flight() {
    test::setup();

    let populate = TestPopulate::with_delay(Duration::from_millis(100));
    let cache = ProxyCacheSetup::new("test", populate.clone()).activate();
    let key = CacheKey::get("/a");

    let results = join_all((0..10).map(|_| cache.get(&key))).await;
    for result in results {
        assert_eq!(result.unwrap(), "/a #1");
    }
    assert_eq!(populate.calls(), 1);
    assert_eq!(cache.populations(), 1);

    // waiting on a population does not count as a hit
    assert_eq!(cache.hit_count(&key), Some(0));
    assert_eq!(cache.get(&key).await.unwrap(), "/a #1");
    assert_eq!(cache.hit_count(&key), Some(1));
    assert_eq!(populate.calls(), 1);

    cache.dispose().await;
}

/// Different keys are populated independently.
#[tokio::test(start_paused = true)]
async fn test_keys_are_independent() {
    test::setup();

    let populate = TestPopulate::with_delay(Duration::from_millis(100));
    let cache = ProxyCacheSetup::new("test", populate.clone()).activate();

    let get_a = CacheKey::get("/a");
    let post_a = CacheKey::new("post", "/a");
    let (first, second) = tokio::join!(cache.get(&get_a), cache.get(&post_a));

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_ne!(first, second);
    assert_eq!(populate.calls(), 2);
    assert_eq!(cache.len(), 2);
}

/// A failed population stores nothing and is retried on the next access.
#[tokio::test(start_paused = true)]
async fn test_failure_isolation() {
    test::setup();

    let populate = TestPopulate::with_delay(Duration::from_millis(100));
    let cache = ProxyCacheSetup::new("test", populate.clone()).activate();
    let key = CacheKey::get("/a");

    populate.set_failing(true);
    let results = join_all((0..3).map(|_| cache.get(&key))).await;
    for result in results {
        assert_eq!(
            result,
            Err(CacheError::PopulationFailed("upstream unavailable".into()))
        );
    }
    assert_eq!(populate.calls(), 1);
    assert_eq!(cache.peek(&key), None);
    assert_eq!(cache.populations(), 0);

    populate.set_failing(false);
    assert_eq!(cache.get(&key).await.unwrap(), "/a #2");
    assert_eq!(cache.populations(), 1);
    assert_eq!(cache.peek(&key).as_deref(), Some("/a #2"));
}

/// A panicking population function surfaces as an internal error.
#[tokio::test]
async fn test_panicking_population() {
    test::setup();

    let cache = ProxyCacheSetup::new("test", |key: CacheKey| async move {
        if key.uri() == "/panic" {
            panic!("population exploded");
        }
        Ok::<_, CacheError>(key.uri().to_owned())
    })
    .activate();

    let key = CacheKey::get("/panic");
    assert_eq!(cache.get(&key).await, Err(CacheError::InternalError));
    assert!(cache.is_empty());

    // the key is not stuck, and other keys are unaffected
    assert_eq!(cache.get(&key).await, Err(CacheError::InternalError));
    assert_eq!(cache.get(&CacheKey::get("/ok")).await.unwrap(), "/ok");
}

/// Removing a key while it is being populated hands the result to the waiters without storing it.
#[tokio::test(start_paused = true)]
async fn test_remove_during_population() {
    test::setup();

    let populate = TestPopulate::with_delay(Duration::from_secs(1));
    let cache = ProxyCacheSetup::new("test", populate.clone()).activate();
    let key = CacheKey::get("/a");

    let (result, removed) = tokio::join!(cache.get(&key), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.remove(&key)
    });

    assert_eq!(removed, None);
    assert_eq!(result.unwrap(), "/a #1");
    assert_eq!(cache.peek(&key), None);

    // the next access populates again
    assert_eq!(cache.get(&key).await.unwrap(), "/a #2");
    assert_eq!(populate.calls(), 2);
}

/// A miss right after a removal waits for the cancelled population instead of overlapping it.
#[tokio::test(start_paused = true)]
async fn test_no_overlap_after_remove() {
    test::setup();

    let populate = TestPopulate::with_delay(Duration::from_secs(1));
    let cache = ProxyCacheSetup::new("test", populate.clone()).activate();
    let key = CacheKey::get("/a");

    let (first, second) = tokio::join!(cache.get(&key), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.remove(&key);
        let started = tokio::time::Instant::now();
        let result = cache.get(&key).await;
        (result, started.elapsed())
    });

    assert_eq!(first.unwrap(), "/a #1");
    let (second, waited) = second;
    assert_eq!(second.unwrap(), "/a #2");
    // 900ms for the cancelled population, then a full one of its own
    assert!(waited >= Duration::from_millis(1900), "waited {waited:?}");
    assert_eq!(populate.max_running(), 1);
    assert_eq!(cache.peek(&key).as_deref(), Some("/a #2"));

    // joining the new population while the cancelled one still runs works the same way
    cache.remove(&key);
    assert!(cache.load(&key));
    cache.remove(&key);
    let results = join_all((0..3).map(|_| cache.get(&key))).await;
    for result in results {
        assert_eq!(result.unwrap(), "/a #4");
    }
    assert_eq!(populate.calls(), 4);
    assert_eq!(populate.max_running(), 1);
}

/// Clearing the cache discards the results of all populations in progress.
#[tokio::test(start_paused = true)]
async fn test_clear_during_population() {
    test::setup();

    let populate = TestPopulate::with_delay(Duration::from_secs(1));
    let cache = ProxyCacheSetup::new("test", populate.clone()).activate();
    let a = CacheKey::get("/a");
    let b = CacheKey::get("/b");
    cache.put(CacheKey::get("/c"), "c".into());

    let (first, second, ()) = tokio::join!(cache.get(&a), cache.get(&b), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.clear();
    });

    assert!(first.unwrap().starts_with("/a #"));
    assert!(second.unwrap().starts_with("/b #"));
    assert!(cache.is_empty());
    assert_eq!(cache.populations(), 2);
}

/// An explicit `put` wins over a population in progress.
#[tokio::test(start_paused = true)]
async fn test_put_during_population() {
    test::setup();

    let populate = TestPopulate::with_delay(Duration::from_secs(1));
    let cache = ProxyCacheSetup::new("test", populate.clone()).activate();
    let key = CacheKey::get("/a");

    let (result, ()) = tokio::join!(cache.get(&key), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.put(key.clone(), "manual".into());
    });

    assert_eq!(result.unwrap(), "/a #1");
    assert_eq!(cache.peek(&key).as_deref(), Some("manual"));
}

/// `load` populates in the background, `peek` never populates.
#[tokio::test(start_paused = true)]
async fn test_peek_and_load() {
    test::setup();

    let populate = TestPopulate::with_delay(Duration::from_millis(500));
    let cache = ProxyCacheSetup::new("test", populate.clone()).activate();
    let key = CacheKey::get("/a");

    assert_eq!(cache.peek(&key), None);
    assert_eq!(populate.calls(), 0);

    assert!(cache.load(&key));
    // already being populated
    assert!(!cache.load(&key));
    assert_eq!(cache.peek(&key), None);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(cache.peek(&key).as_deref(), Some("/a #1"));
    assert_eq!(cache.hit_count(&key), Some(1));
    // already present
    assert!(!cache.load(&key));
    assert_eq!(populate.calls(), 1);
}

/// Entries saved by one cache are served by the next one without populating.
#[tokio::test]
async fn test_persistence_round_trip() {
    test::setup();

    let store: Arc<dyn SnapshotStore<String>> = Arc::new(MemorySnapshotStore::from(snapshot_of(
        &[("/k1", "a"), ("/k2", "b")],
    )));
    let populate = TestPopulate::default();
    let cache = ProxyCacheSetup::new("test", populate.clone())
        .bootstrap_from(store)
        .activate();

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get(&CacheKey::get("/k1")).await.unwrap(), "a");
    assert_eq!(cache.get(&CacheKey::get("/k2")).await.unwrap(), "b");
    assert_eq!(populate.calls(), 0);
    assert_eq!(cache.populations(), 0);
}

/// Disposing a cache hands its entries to the persister.
#[tokio::test]
async fn test_shutdown_persists() {
    test::setup();

    let store: Arc<dyn SnapshotStore<String>> = Arc::new(MemorySnapshotStore::new());
    let cache = ProxyCacheSetup::new("test", TestPopulate::default())
        .on_dispose(ShutdownPersister::new(store.clone()))
        .activate();

    cache.put(CacheKey::get("/a"), "a".into());
    assert!(store.load().unwrap().is_empty());

    cache.dispose().await;

    let snapshot = store.load().unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(
        snapshot.get(&CacheKey::get("/a")).map(|e| e.value().as_str()),
        Some("a")
    );
}

/// Hit counts survive a restart through the snapshot store.
#[tokio::test]
async fn test_restart_keeps_hits() {
    test::setup();

    let store: Arc<dyn SnapshotStore<String>> = Arc::new(MemorySnapshotStore::new());
    let key = CacheKey::get("/a");

    let cache = ProxyCacheSetup::new("test", TestPopulate::default())
        .snapshot_store(store.clone())
        .activate();
    assert_eq!(cache.get(&key).await.unwrap(), "/a #1");
    assert_eq!(cache.get(&key).await.unwrap(), "/a #1");
    cache.dispose().await;

    let populate = TestPopulate::default();
    let cache = ProxyCacheSetup::new("test", populate.clone())
        .snapshot_store(store)
        .activate();
    assert_eq!(cache.hit_count(&key), Some(1));
    assert_eq!(cache.get(&key).await.unwrap(), "/a #1");
    assert_eq!(cache.hit_count(&key), Some(2));
    assert_eq!(populate.calls(), 0);
}

/// A snapshot store that cannot be written to.
struct ReadOnlySnapshotStore;

impl SnapshotStore<String> for ReadOnlySnapshotStore {
    fn load(&self) -> Result<Snapshot<String>, SnapshotError> {
        Ok(Snapshot::new())
    }

    fn save(&self, _snapshot: &Snapshot<String>) -> Result<(), SnapshotError> {
        Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied).into())
    }

    fn clear(&self) -> Result<(), SnapshotError> {
        Ok(())
    }
}

/// A failed save is logged and the remaining listeners still run.
#[tokio::test]
async fn test_failed_persist_continues_dispose() {
    test::setup();

    let store: Arc<dyn SnapshotStore<String>> = Arc::new(ReadOnlySnapshotStore);
    let after = Arc::new(AtomicUsize::new(0));
    let cache = ProxyCacheSetup::new("test", TestPopulate::default())
        .snapshot_store(store)
        .on_dispose({
            let after = Arc::clone(&after);
            move |_: &str, entries: &Snapshot<String>| {
                after.store(entries.len(), Ordering::SeqCst);
            }
        })
        .activate();

    cache.put(CacheKey::get("/a"), "a".into());
    cache.put(CacheKey::get("/b"), "b".into());
    cache.dispose().await;

    assert_eq!(after.load(Ordering::SeqCst), 2);
}

/// Dispose listeners run in registration order and see all entries.
#[tokio::test]
async fn test_dispose_listeners() {
    test::setup();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let listener = |tag: &'static str| {
        let seen = Arc::clone(&seen);
        move |name: &str, entries: &Snapshot<String>| {
            seen.lock()
                .unwrap()
                .push(format!("{tag}: {name} ({} entries)", entries.len()));
        }
    };

    let cache = ProxyCacheSetup::new("pages", TestPopulate::default())
        .on_dispose(listener("first"))
        .on_dispose(listener("second"))
        .activate();
    cache.put(CacheKey::get("/a"), "a".into());
    cache.put(CacheKey::get("/b"), "b".into());
    cache.dispose().await;

    let seen = seen.lock().unwrap();
    insta::assert_debug_snapshot!(*seen, @r###"
    [
        "first: pages (2 entries)",
        "second: pages (2 entries)",
    ]
    "###);
}

/// A corrupt snapshot file means a cold start, and is replaced on shutdown.
#[tokio::test]
async fn test_bootstrap_from_corrupt_file() {
    test::setup();
    let dir = test::tempdir();
    let path = dir.path().join("snapshot.json");
    std::fs::write(&path, "definitely not json").unwrap();

    let config = CacheConfig {
        snapshot_path: Some(path.clone()),
        refresh: None,
        ..Default::default()
    };
    let populate = TestPopulate::default();
    let cache = ProxyCacheSetup::from_config("test", &config, populate.clone()).activate();
    assert!(cache.is_empty());

    assert_eq!(cache.get(&CacheKey::get("/a")).await.unwrap(), "/a #1");
    cache.dispose().await;

    let snapshot = FileSnapshotStore::<String>::new(&path).load().unwrap();
    assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec![&CacheKey::get("/a")]);
}

/// Reads keep being served while entries are refreshed in the background.
///
/// A population takes one second and entries are refreshed after two seconds. Reading every
/// 100ms for ten seconds and loading the key in the background whenever it is absent, only the
/// reads during the initial population come back empty.
#[tokio::test(start_paused = true)]
async fn test_refresh_cadence() {
    test::setup();

    let populate = TestPopulate::with_delay(Duration::from_secs(1));
    let cache = ProxyCacheSetup::new("test", populate.clone())
        .refresh(RefreshConfig {
            worker_threads: 1,
            max_backlog: 10,
            time_to_refresh: Duration::from_secs(2),
        })
        .activate();
    let key = CacheKey::get("/a");

    let mut non_empty = 0;
    for _ in 0..100 {
        if cache.peek(&key).is_some() {
            non_empty += 1;
        } else {
            cache.load(&key);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert!(cache.populations() > 3, "{} populations", cache.populations());
    assert!(non_empty > 85, "{non_empty} non-empty reads");
    assert_eq!(cache.dropped_refreshes(), 0);

    cache.dispose().await;
}

/// A refresh that fails keeps serving the previous value.
#[tokio::test(start_paused = true)]
async fn test_failed_refresh_keeps_value() {
    test::setup();

    let populate = TestPopulate::with_delay(Duration::from_millis(100));
    let cache = ProxyCacheSetup::new("test", populate.clone())
        .refresh(RefreshConfig {
            worker_threads: 1,
            max_backlog: 10,
            time_to_refresh: Duration::from_secs(1),
        })
        .activate();
    let key = CacheKey::get("/a");

    assert_eq!(cache.get(&key).await.unwrap(), "/a #1");

    populate.set_failing(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(cache.peek(&key).as_deref(), Some("/a #1"));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(populate.calls(), 2);
    assert_eq!(cache.populations(), 1);
    assert_eq!(cache.peek(&key).as_deref(), Some("/a #1"));

    // the entry is still stale, so the next read schedules another attempt
    populate.set_failing(false);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(cache.populations(), 2);
    assert_eq!(cache.peek(&key).as_deref(), Some("/a #3"));
}

/// Refreshes beyond the backlog capacity are dropped, and a key is never queued twice.
#[tokio::test(start_paused = true)]
async fn test_refresh_backlog_drops() {
    test::setup();

    let populate = TestPopulate::with_delay(Duration::from_secs(1));
    let cache = ProxyCacheSetup::new("test", populate.clone())
        .refresh(RefreshConfig {
            worker_threads: 1,
            max_backlog: 1,
            time_to_refresh: Duration::from_secs(1),
        })
        .activate();

    let keys: Vec<_> = ["/a", "/b", "/c"].into_iter().map(CacheKey::get).collect();
    for key in &keys {
        cache.put(key.clone(), "initial".into());
    }
    tokio::time::advance(Duration::from_secs(2)).await;

    // the workers have not picked anything up yet, so only the first refresh fits
    for key in &keys {
        assert!(cache.peek(key).is_some());
    }
    assert!(cache.peek(&keys[0]).is_some());
    assert_eq!(cache.refresh_backlog(), 1);
    assert_eq!(cache.dropped_refreshes(), 2);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(cache.refresh_backlog(), 0);
    assert_eq!(cache.populations(), 1);
    assert_eq!(cache.peek(&keys[0]).as_deref(), Some("/a #1"));
    assert_eq!(cache.peek(&keys[1]).as_deref(), Some("initial"));
}

/// A zero backlog drops every refresh request.
#[tokio::test(start_paused = true)]
async fn test_refresh_zero_backlog() {
    test::setup();

    let populate = TestPopulate::with_delay(Duration::from_millis(100));
    let cache = ProxyCacheSetup::new("test", populate.clone())
        .refresh(RefreshConfig {
            worker_threads: 2,
            max_backlog: 0,
            time_to_refresh: Duration::from_secs(1),
        })
        .activate();
    let key = CacheKey::get("/a");

    cache.put(key.clone(), "initial".into());
    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(cache.peek(&key).is_some());
    assert!(cache.peek(&key).is_some());
    assert_eq!(cache.refresh_backlog(), 0);
    assert_eq!(cache.dropped_refreshes(), 2);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(populate.calls(), 0);
    assert_eq!(cache.peek(&key).as_deref(), Some("initial"));

    cache.dispose().await;
}

/// A removed key is not resurrected by a refresh that was queued before the removal.
#[tokio::test(start_paused = true)]
async fn test_refresh_skips_removed_key() {
    test::setup();

    let populate = TestPopulate::with_delay(Duration::from_millis(100));
    let cache = ProxyCacheSetup::new("test", populate.clone())
        .refresh(RefreshConfig {
            worker_threads: 1,
            max_backlog: 10,
            time_to_refresh: Duration::from_secs(1),
        })
        .activate();
    let key = CacheKey::get("/a");

    cache.put(key.clone(), "initial".into());
    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(cache.peek(&key).is_some());
    assert_eq!(cache.refresh_backlog(), 1);
    cache.remove(&key);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(cache.refresh_backlog(), 0);
    assert_eq!(populate.calls(), 0);
    assert!(cache.is_empty());
}

/// Cached responses are served with their key and hit count.
#[tokio::test]
async fn test_serve_response() {
    test::setup();

    let cache = ProxyCacheSetup::new("responses", |key: CacheKey| async move {
        Ok::<_, CacheError>(CachedResponse::ok(format!("body of {}", key.uri())))
    })
    .activate();
    let key = CacheKey::get("/index.html");

    let first = cache.serve(&key).await.unwrap();
    let second = cache.serve(&key).await.unwrap();

    assert_eq!(first.header("X-Hits"), Some("0"));
    assert_eq!(second.header("X-Hits"), Some("1"));
    assert_eq!(second.header("X-Cache-Key"), Some("GET|/index.html"));
    assert_eq!(&second.body[..], b"body of /index.html");
}
