//! Cache Store Module
//!
//! Main cache engine: entry table with lazy TTL expiration, refresh
//! registrations, batch operations and optional snapshot persistence.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheEntry, CacheStats, Clock, RefreshFn, RefreshRegistration, SystemClock};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::storage::{RegistrationRecord, Snapshot, SnapshotWriter, Storage};
use crate::tasks::RefreshScheduler;

// == Mset Entry ==
/// A value passed to [`CacheStore::mset`], optionally with its own TTL.
#[derive(Debug, Clone, PartialEq)]
pub enum MsetEntry {
    Value(Value),
    WithTtl { value: Value, ttl_seconds: u64 },
}

impl From<Value> for MsetEntry {
    fn from(value: Value) -> Self {
        MsetEntry::Value(value)
    }
}

// == Table ==
/// All mutable cache state, guarded by a single lock.
#[derive(Debug, Default)]
struct Table {
    entries: HashMap<String, CacheEntry>,
    /// Outlives lazily expired entries; removed only by delete or flush
    registrations: HashMap<String, RefreshRegistration>,
    stats: CacheStats,
    next_generation: u64,
}

impl Table {
    fn read(&mut self, key: &str, now_ms: u64) -> Option<Value> {
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now_ms) => {
                let value = entry.value.clone();
                self.stats.record_hit();
                Some(value)
            }
            Some(_) => {
                self.expire(key);
                self.stats.record_miss();
                None
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Drops the entry but keeps any refresh registration.
    fn expire(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.stats.record_expiration();
            self.stats.set_total_entries(self.entries.len());
        }
    }

    /// Writes an entry and, when given a refresh function, replaces the key's
    /// registration. Shared by caller writes and refresh write-backs.
    fn write(
        &mut self,
        key: String,
        value: Value,
        now_ms: u64,
        ttl_ms: u64,
        refresh: Option<RefreshFn>,
    ) {
        let entry = CacheEntry::new(value, now_ms, ttl_ms);
        let expires_at = entry.expires_at;

        if let Some(refresh) = refresh {
            self.next_generation += 1;
            self.registrations.insert(
                key.clone(),
                RefreshRegistration {
                    expires_at,
                    ttl_ms,
                    generation: self.next_generation,
                    refresh,
                },
            );
        }

        self.entries.insert(key, entry);
        self.stats.set_total_entries(self.entries.len());
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.registrations.remove(key);
        self.stats.set_total_entries(self.entries.len());
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.registrations.clear();
        self.stats.set_total_entries(0);
    }

    fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for (key, entry) in &self.entries {
            snapshot.db.insert(key.clone(), entry.value.clone());
            snapshot.expirations.insert(key.clone(), entry.expires_at);
        }
        for (key, reg) in &self.registrations {
            snapshot.refresh_keys.insert(
                key.clone(),
                RegistrationRecord {
                    expires_at: reg.expires_at,
                    ttl_ms: reg.ttl_ms,
                },
            );
        }
        snapshot
    }

    /// Seeds entries that carry both a value and a live expiration.
    fn seed(&mut self, snapshot: Snapshot, now_ms: u64) -> usize {
        for (key, value) in snapshot.db {
            if value.is_null() {
                continue;
            }
            match snapshot.expirations.get(&key) {
                Some(&expires_at) if expires_at > now_ms => {
                    self.entries.insert(key, CacheEntry { value, expires_at });
                }
                _ => {}
            }
        }
        self.stats.set_total_entries(self.entries.len());
        self.entries.len()
    }
}

// == Refresh Target ==
/// A registration selected for refresh on a scheduler tick.
pub(crate) struct RefreshTarget {
    pub key: String,
    pub generation: u64,
    pub refresh: RefreshFn,
}

pub(crate) struct StoreInner {
    /// Shared with the snapshot writer thread
    table: Arc<Mutex<Table>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    writer: Option<SnapshotWriter>,
    pub(crate) scheduler: RefreshScheduler,
}

// == Cache Store ==
/// Thread-safe time-expiring key-value cache.
///
/// Cloning gives another handle to the same cache. Expiration is checked
/// lazily on read; keys written with a refresh function are kept warm by the
/// background refresh scheduler when it is enabled.
#[derive(Clone)]
pub struct CacheStore {
    pub(crate) inner: Arc<StoreInner>,
}

impl CacheStore {
    // == Constructor ==
    /// Creates a cache on the system clock with no persistence.
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: CacheConfig) -> CacheStoreBuilder {
        CacheStoreBuilder {
            config,
            clock: Arc::new(SystemClock),
            storage: None,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    // == Get ==
    /// Returns the value for `key` if it has not expired.
    ///
    /// An expired entry is removed on the way out; its refresh registration,
    /// if any, is kept so the next refresh can revive it.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        if key.is_empty() {
            return Err(CacheError::Argument("key cannot be empty".to_string()));
        }
        self.trace("get", key);

        let mut table = self.data_table().map_err(CacheError::Get)?;
        Ok(table.read(key, self.inner.clock.now_ms()))
    }

    // == Mget ==
    /// Reads several keys. Missing, expired and empty keys are left out of the result.
    ///
    /// Where `get` would fail with [`CacheError::Get`], the result is empty.
    pub fn mget<I, K>(&self, keys: I) -> HashMap<String, Value>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut values = HashMap::new();
        let mut table = match self.data_table() {
            Ok(table) => table,
            Err(err) => {
                warn!(cache = %self.inner.config.name, error = %err, "mget failed");
                return values;
            }
        };
        let now = self.inner.clock.now_ms();

        for key in keys {
            let key = key.as_ref();
            if key.is_empty() {
                continue;
            }
            if let Some(value) = table.read(key, now) {
                values.insert(key.to_string(), value);
            }
        }

        if self.inner.config.verbose {
            debug!(cache = %self.inner.config.name, found = values.len(), "mget");
        }
        values
    }

    // == Set ==
    /// Stores `value` under `key`.
    ///
    /// `ttl_seconds` of `None` or `Some(0)` uses the configured default
    /// expiration. On a read-only cache this is a silent no-op.
    pub fn set(&self, key: impl Into<String>, value: Value, ttl_seconds: Option<u64>) -> Result<()> {
        self.set_entry(key.into(), value, ttl_seconds, None)
    }

    /// Stores `value` and registers `refresh` to recompute it before it expires.
    ///
    /// Replaces any earlier registration for the key.
    pub fn set_with_refresh(
        &self,
        key: impl Into<String>,
        value: Value,
        ttl_seconds: Option<u64>,
        refresh: RefreshFn,
    ) -> Result<()> {
        self.set_entry(key.into(), value, ttl_seconds, Some(refresh))
    }

    fn set_entry(
        &self,
        key: String,
        value: Value,
        ttl_seconds: Option<u64>,
        refresh: Option<RefreshFn>,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(CacheError::Argument("key cannot be empty".to_string()));
        }
        if value.is_null() {
            return Err(CacheError::Argument(format!(
                "value for key '{}' cannot be null",
                key
            )));
        }
        self.trace("set", &key);

        if self.inner.config.read_only {
            return Ok(());
        }

        let ttl_ms = self.effective_ttl_ms(ttl_seconds);
        let registered = refresh.is_some();

        // Write failures are logged, not returned
        if let Err(err) = self.write(key, value, ttl_ms, refresh) {
            error!(cache = %self.inner.config.name, error = %err, "set failed");
            return Ok(());
        }

        if registered {
            self.inner.scheduler.ensure_started(self);
        }
        Ok(())
    }

    fn write(
        &self,
        key: String,
        value: Value,
        ttl_ms: u64,
        refresh: Option<RefreshFn>,
    ) -> Result<()> {
        let mut table = self.data_table().map_err(CacheError::Set)?;
        table.write(key, value, self.inner.clock.now_ms(), ttl_ms, refresh);
        self.persist();
        Ok(())
    }

    /// TTL in milliseconds: seconds from the caller, or the default when absent or zero.
    pub fn effective_ttl_ms(&self, ttl_seconds: Option<u64>) -> u64 {
        match ttl_seconds {
            Some(secs) if secs > 0 => secs.saturating_mul(1000),
            _ => self.inner.config.default_expiration_ms(),
        }
    }

    // == Mset ==
    /// Stores several entries independently.
    ///
    /// Each entry uses its own TTL when it carries one, else `ttl_seconds`,
    /// else the default. Invalid entries are logged and skipped. Returns the
    /// number of entries accepted.
    pub fn mset<I, K, E>(&self, entries: I, ttl_seconds: Option<u64>) -> usize
    where
        I: IntoIterator<Item = (K, E)>,
        K: Into<String>,
        E: Into<MsetEntry>,
    {
        let mut accepted = 0;
        for (key, entry) in entries {
            let (value, ttl) = match entry.into() {
                MsetEntry::Value(value) => (value, ttl_seconds),
                MsetEntry::WithTtl { value, ttl_seconds: own } if own > 0 => (value, Some(own)),
                MsetEntry::WithTtl { value, .. } => (value, ttl_seconds),
            };

            match self.set(key, value, ttl) {
                Ok(()) => accepted += 1,
                Err(err) => {
                    warn!(cache = %self.inner.config.name, error = %err, "mset entry skipped")
                }
            }
        }
        accepted
    }

    // == Delete ==
    /// Removes keys together with their refresh registrations and any
    /// in-flight refresh. Returns the number of keys processed, present or not.
    pub fn delete<I, K>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut removed = Vec::new();
        {
            let mut table = self.lock_table();
            for key in keys {
                let key = key.as_ref();
                self.trace("delete", key);
                table.remove(key);
                removed.push(key.to_string());
            }
            self.persist();
        }

        self.inner.scheduler.cancel(&removed);
        removed.len()
    }

    // == Flush ==
    /// Clears every entry and registration in one step.
    ///
    /// Also returns a poisoned cache to service.
    pub fn flush(&self) {
        {
            let mut table = self.lock_table();
            table.clear();
            self.persist();
        }
        self.inner.table.clear_poison();
        self.inner.scheduler.cancel_all();

        if self.inner.config.verbose {
            debug!(cache = %self.inner.config.name, "flush");
        }
    }

    // == Stats ==
    pub fn stats(&self) -> CacheStats {
        self.lock_table().stats.clone()
    }

    /// Number of stored entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        self.lock_table().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `key` has a refresh registration.
    pub fn is_registered(&self, key: &str) -> bool {
        self.lock_table().registrations.contains_key(key)
    }

    // == Refresh ==
    /// Runs one refresh pass immediately instead of waiting for the next tick.
    ///
    /// Returns the number of refreshes started. Does nothing outside a Tokio runtime.
    pub fn refresh_now(&self) -> usize {
        self.inner.scheduler.tick(self)
    }

    /// Stops the background refresh scheduler and aborts in-flight refreshes.
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
    }

    /// Registrations within `min_ttl_ms` of expiring. Entries that already
    /// expired are dropped along the way; their registrations stay.
    pub(crate) fn due_refreshes(&self, min_ttl_ms: u64) -> Vec<RefreshTarget> {
        let mut table = match self.data_table() {
            Ok(table) => table,
            Err(err) => {
                warn!(cache = %self.inner.config.name, error = %err, "refresh scan skipped");
                return Vec::new();
            }
        };
        let now = self.inner.clock.now_ms();

        let due: Vec<RefreshTarget> = table
            .registrations
            .iter()
            .filter(|(_, reg)| reg.is_due(now, min_ttl_ms))
            .map(|(key, reg)| RefreshTarget {
                key: key.clone(),
                generation: reg.generation,
                refresh: reg.refresh.clone(),
            })
            .collect();

        for target in &due {
            let expired = table
                .entries
                .get(&target.key)
                .map(|entry| entry.is_expired(now))
                .unwrap_or(false);
            if expired {
                table.expire(&target.key);
            }
        }
        due
    }

    /// Stores a refreshed value if the registration that produced it is still current.
    ///
    /// Returns false when the key was deleted, flushed or re-registered meanwhile.
    pub(crate) fn write_back(&self, key: &str, generation: u64, value: Value) -> bool {
        if value.is_null() || self.inner.config.read_only {
            return false;
        }

        let mut table = match self.data_table() {
            Ok(table) => table,
            Err(err) => {
                error!(cache = %self.inner.config.name, key, error = %err, "refresh write-back failed");
                return false;
            }
        };

        let (ttl_ms, refresh) = match table.registrations.get(key) {
            Some(reg) if reg.generation == generation => (reg.ttl_ms, reg.refresh.clone()),
            _ => return false,
        };

        let now = self.inner.clock.now_ms();
        table.write(key.to_string(), value, now, ttl_ms, Some(refresh));
        table.stats.record_refresh();
        self.persist();
        true
    }

    pub(crate) fn record_refresh_failure(&self) {
        self.lock_table().stats.record_refresh_failure();
    }

    /// Tells the writer thread the cache changed, if persistence is configured.
    /// The snapshot itself is built on that thread.
    fn persist(&self) {
        if let Some(writer) = &self.inner.writer {
            writer.mark_dirty();
        }
    }

    /// Lock for reading or writing cached values. A poisoned table is refused:
    /// `get` reports [`CacheError::Get`], `set` logs [`CacheError::Set`],
    /// `mget` and refresh passes come back empty.
    fn data_table(&self) -> std::result::Result<MutexGuard<'_, Table>, String> {
        self.inner.table.lock().map_err(|err| err.to_string())
    }

    /// Lock for removals and counters, which go through a poisoned table.
    fn lock_table(&self) -> MutexGuard<'_, Table> {
        self.inner.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trace(&self, op: &str, key: &str) {
        if self.inner.config.verbose {
            debug!(cache = %self.inner.config.name, op, key, "cache operation");
        }
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("name", &self.inner.config.name)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

// == Builder ==
/// Assembles a [`CacheStore`] with a custom clock or storage adapter.
pub struct CacheStoreBuilder {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    storage: Option<Arc<dyn Storage>>,
}

impl CacheStoreBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validates the configuration, seeds from storage and builds the cache.
    ///
    /// Fails only on an invalid configuration; storage problems are logged.
    pub fn build(self) -> Result<CacheStore> {
        self.config.validate()?;

        let mut table = Table::default();
        let storage = self.storage;

        if let Some(adapter) = &storage {
            match adapter.load() {
                Ok(Some(snapshot)) => {
                    let dropped = snapshot.refresh_keys.len();
                    let seeded = table.seed(snapshot, self.clock.now_ms());
                    info!(cache = %self.config.name, seeded, "Seeded cache from storage");
                    if dropped > 0 {
                        debug!(
                            cache = %self.config.name,
                            dropped,
                            "Persisted refresh registrations have no function and were dropped"
                        );
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(cache = %self.config.name, error = %err, "Storage load failed; starting empty")
                }
            }
        }

        let table = Arc::new(Mutex::new(table));
        let writer = storage.and_then(|adapter| {
            let source = table.clone();
            let spawned = SnapshotWriter::spawn(adapter, &self.config.name, move || {
                source
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .snapshot()
            });
            match spawned {
                Ok(writer) => Some(writer),
                Err(err) => {
                    warn!(cache = %self.config.name, error = %err, "Snapshot writer unavailable; persistence disabled");
                    None
                }
            }
        });

        let scheduler = RefreshScheduler::new(&self.config);

        info!(
            cache = %self.config.name,
            default_expiration_ms = self.config.default_expiration_ms(),
            read_only = self.config.read_only,
            background_refresh = self.config.background_refresh_enabled,
            "Cache created"
        );

        Ok(CacheStore {
            inner: Arc::new(StoreInner {
                table,
                config: self.config,
                clock: self.clock,
                writer,
                scheduler,
            }),
        })
    }
}
