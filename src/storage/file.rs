//! JSON file snapshot storage.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::storage::{Snapshot, Storage};

/// Stores the snapshot as a JSON document at `path`.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// reader never sees a half-written document.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Storage for JsonFileStorage {
    fn load(&self) -> Result<Option<Snapshot>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        debug!(path = %self.path.display(), entries = snapshot.db.len(), "Snapshot loaded");
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        let tmp = self.temp_path();
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
