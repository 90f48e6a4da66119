//! In-process snapshot storage.

use std::sync::{Mutex, PoisonError};

use crate::error::Result;
use crate::storage::{Snapshot, Storage};

/// Keeps the latest snapshot in memory. Useful for tests and for handing state
/// between cache instances in one process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    snapshot: Mutex<Option<Snapshot>>,
    saves: Mutex<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with a previously captured snapshot.
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            saves: Mutex::new(0),
        }
    }

    /// Latest saved snapshot.
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> u64 {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for MemoryStorage {
    fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}
