//! Detached snapshot writer.
//!
//! Mutations only flag the cache as dirty. A dedicated thread wakes on that
//! flag, builds one snapshot from the live cache and saves it, so a slow or
//! failing adapter never adds latency to cache writes, and any number of
//! mutations between two saves collapse into a single save.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, warn};

use crate::storage::{Snapshot, Storage};

#[derive(Debug, Default)]
struct Pending {
    dirty: bool,
    closed: bool,
}

#[derive(Debug, Default)]
struct Signal {
    pending: Mutex<Pending>,
    wake: Condvar,
}

impl Signal {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct SnapshotWriter {
    signal: Arc<Signal>,
}

impl SnapshotWriter {
    /// Spawns the writer thread. `source` builds the snapshot to save; it is
    /// called on the writer thread, once per save.
    ///
    /// The thread saves any outstanding change and exits once the writer is dropped.
    pub(crate) fn spawn<F>(
        storage: Arc<dyn Storage>,
        cache_name: &str,
        source: F,
    ) -> std::io::Result<Self>
    where
        F: Fn() -> Snapshot + Send + 'static,
    {
        let signal = Arc::new(Signal::default());
        let thread_signal = signal.clone();
        let name = cache_name.to_string();

        thread::Builder::new()
            .name(format!("{}-persist", cache_name))
            .spawn(move || writer_loop(storage, thread_signal, source, name))?;

        Ok(Self { signal })
    }

    /// Flags the cache as changed. Constant time, never blocks on storage.
    pub(crate) fn mark_dirty(&self) {
        let mut pending = self.signal.lock();
        if !pending.dirty {
            pending.dirty = true;
            self.signal.wake.notify_one();
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        self.signal.lock().closed = true;
        self.signal.wake.notify_one();
    }
}

fn writer_loop<F>(storage: Arc<dyn Storage>, signal: Arc<Signal>, source: F, cache_name: String)
where
    F: Fn() -> Snapshot,
{
    loop {
        let (dirty, closed) = {
            let mut pending = signal.lock();
            while !pending.dirty && !pending.closed {
                pending = signal
                    .wake
                    .wait(pending)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            let state = (pending.dirty, pending.closed);
            pending.dirty = false;
            state
        };

        if dirty {
            let snapshot = source();
            match storage.save(&snapshot) {
                Ok(()) => debug!(cache = %cache_name, entries = snapshot.db.len(), "Snapshot saved"),
                Err(err) => warn!(cache = %cache_name, error = %err, "Snapshot save failed"),
            }
        }

        if closed {
            debug!(cache = %cache_name, "Snapshot writer stopped");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CacheError, Result};
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_writer_saves_latest_state() {
        let storage = Arc::new(MemoryStorage::new());
        let version = Arc::new(AtomicU64::new(0));
        let source_version = version.clone();
        let writer = SnapshotWriter::spawn(storage.clone(), "test", move || {
            let mut snapshot = Snapshot::default();
            snapshot
                .db
                .insert("k".to_string(), json!(source_version.load(Ordering::SeqCst)));
            snapshot
        })
        .unwrap();

        for i in 1..=10 {
            version.store(i, Ordering::SeqCst);
            writer.mark_dirty();
        }

        assert!(wait_for(|| {
            storage
                .snapshot()
                .map(|s| s.db.get("k") == Some(&json!(10)))
                .unwrap_or(false)
        }));
    }

    struct SlowStorage {
        saves: AtomicUsize,
    }

    impl Storage for SlowStorage {
        fn load(&self) -> Result<Option<Snapshot>> {
            Ok(None)
        }

        fn save(&self, _snapshot: &Snapshot) -> Result<()> {
            thread::sleep(Duration::from_millis(50));
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_marks_during_slow_save_are_coalesced() {
        let storage = Arc::new(SlowStorage { saves: AtomicUsize::new(0) });
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let writer = SnapshotWriter::spawn(storage.clone(), "slow", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Snapshot::default()
        })
        .unwrap();

        let started = Instant::now();
        for _ in 0..1_000 {
            writer.mark_dirty();
        }
        assert!(started.elapsed() < Duration::from_millis(50));

        drop(writer);
        assert!(wait_for(|| built.load(Ordering::SeqCst) >= 1));
        thread::sleep(Duration::from_millis(200));
        assert!(built.load(Ordering::SeqCst) <= 2);
        assert_eq!(built.load(Ordering::SeqCst), storage.saves.load(Ordering::SeqCst));
    }

    struct FailingStorage;

    impl Storage for FailingStorage {
        fn load(&self) -> Result<Option<Snapshot>> {
            Ok(None)
        }

        fn save(&self, _snapshot: &Snapshot) -> Result<()> {
            Err(CacheError::Storage("disk full".to_string()))
        }
    }

    #[test]
    fn test_writer_survives_save_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let writer = SnapshotWriter::spawn(Arc::new(FailingStorage), "failing", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Snapshot::default()
        })
        .unwrap();

        writer.mark_dirty();
        assert!(wait_for(|| attempts.load(Ordering::SeqCst) == 1));

        writer.mark_dirty();
        assert!(wait_for(|| attempts.load(Ordering::SeqCst) == 2));
    }
}
