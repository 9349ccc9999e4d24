use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use super::{Snapshot, SnapshotStore};
use crate::caching::SnapshotError;

/// A [`SnapshotStore`] persisting the snapshot as a JSON file.
///
/// Saving writes a temporary file next to the target and moves it into place, so the previous
/// snapshot stays intact if the process dies while saving. A missing file loads as an empty
/// snapshot.
#[derive(Debug)]
pub struct FileSnapshotStore<V> {
    path: PathBuf,
    /// Serializes loads and saves of this store.
    lock: Mutex<()>,
    _value: PhantomData<fn() -> V>,
}

impl<V> FileSnapshotStore<V> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            _value: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<V> SnapshotStore<V> for FileSnapshotStore<V>
where
    V: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Snapshot<V>, SnapshotError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No snapshot file found");
                return Ok(Snapshot::new());
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot<V> = serde_json::from_reader(BufReader::new(file))?;
        tracing::debug!(
            path = %self.path.display(),
            entries = snapshot.len(),
            "Loaded snapshot file"
        );
        Ok(snapshot)
    }

    fn save(&self, snapshot: &Snapshot<V>) -> Result<(), SnapshotError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;

        let mut temp_file = NamedTempFile::new_in(parent)?;
        {
            let mut writer = BufWriter::new(temp_file.as_file_mut());
            serde_json::to_writer(&mut writer, snapshot)?;
            writer.flush()?;
        }
        temp_file.as_file().sync_all()?;
        temp_file.persist(&self.path)?;

        tracing::debug!(
            path = %self.path.display(),
            entries = snapshot.len(),
            "Saved snapshot file"
        );
        Ok(())
    }

    fn clear(&self) -> Result<(), SnapshotError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            // `NotFound` means there is nothing to clear.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
