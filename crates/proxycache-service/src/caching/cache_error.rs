use std::io;
use std::time::Duration;

use thiserror::Error;

/// An error that happens while populating a cache entry.
///
/// The same error is handed to every caller that waited on the failed population, so it has to
/// be cheap to clone. Errors are never stored: the next access to the key retries population.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The population function failed.
    ///
    /// The attached string describes the upstream failure.
    #[error("population failed: {0}")]
    PopulationFailed(String),
    /// The population function gave up after the contained duration.
    ///
    /// The engine itself does not impose a timeout, population functions bounding their own
    /// latency report it with this variant.
    #[error("population timed out after {0:?}")]
    Timeout(Duration),
    /// An unexpected error in the engine itself, for example a population task that panicked.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    /// Creates a [`PopulationFailed`](Self::PopulationFailed) error from any displayable error.
    pub fn population(err: impl std::fmt::Display) -> Self {
        Self::PopulationFailed(err.to_string())
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short tag for metrics.
    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::PopulationFailed(_) => "failed",
            Self::Timeout(_) => "timeout",
            Self::InternalError => "internal",
        }
    }
}

impl From<tokio::task::JoinError> for CacheError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> Self {
        Self::from_std_error(err)
    }
}

/// An error reading or writing a [`Snapshot`](super::Snapshot).
///
/// These never reach callers of the cache: a failed read means a cold start, a failed write
/// means the entries of this run are lost.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to access snapshot file")]
    Io(#[from] io::Error),
    #[error("failed to (de)serialize snapshot")]
    Format(#[from] serde_json::Error),
    #[error("failed to persist snapshot file")]
    Persist(#[from] tempfile::PersistError),
}
