//! The `snapshot` commands.
use std::io::{self, Write};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use proxycache_service::caching::{FileSnapshotStore, Snapshot, SnapshotStore};
use proxycache_service::config::Config;
use proxycache_service::response::CachedResponse;

fn snapshot_store(config: &Config) -> Result<FileSnapshotStore<CachedResponse>> {
    let path = config
        .cache
        .snapshot_path
        .as_deref()
        .context("no `cache.snapshot_path` configured")?;
    Ok(FileSnapshotStore::new(path))
}

/// Prints all entries of the configured snapshot file.
pub fn show(config: &Config, out: &mut impl Write) -> Result<()> {
    let store = snapshot_store(config)?;
    let snapshot = store.load().with_context(|| {
        format!("failed to read snapshot file {}", store.path().display())
    })?;

    render(&snapshot, SystemTime::now(), out).context("failed to print snapshot")
}

/// Removes the configured snapshot file.
pub fn clear(config: &Config) -> Result<()> {
    let store = snapshot_store(config)?;
    store.clear().with_context(|| {
        format!("failed to clear snapshot file {}", store.path().display())
    })?;

    tracing::info!(path = %store.path().display(), "Cleared snapshot file");
    Ok(())
}

fn render(
    snapshot: &Snapshot<CachedResponse>,
    now: SystemTime,
    out: &mut impl Write,
) -> io::Result<()> {
    writeln!(out, "{} entries", snapshot.len())?;

    for (key, entry) in snapshot.iter() {
        let response = entry.value();
        // whole seconds are precise enough for an overview
        let age = now.duration_since(entry.created()).unwrap_or_default();
        let age = Duration::from_secs(age.as_secs());

        writeln!(
            out,
            "{key}  status={} hits={} size={} age={}",
            response.status,
            entry.hits(),
            response.body.len(),
            humantime::format_duration(age),
        )?;
    }

    Ok(())
}
