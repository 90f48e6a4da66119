//! Storage Module
//!
//! Optional persistence capability. The cache seeds itself from [`Storage::load`]
//! at construction and hands snapshots to [`Storage::save`] after mutations.
//! Storage failures are logged and never surface from cache operations.

mod file;
mod memory;
mod writer;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

pub use file::JsonFileStorage;
pub use memory::MemoryStorage;
pub(crate) use writer::SnapshotWriter;

// == Snapshot ==
/// Serialized cache state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// key -> value
    #[serde(default)]
    pub db: HashMap<String, Value>,
    /// key -> expiration (Unix milliseconds)
    #[serde(default)]
    pub expirations: HashMap<String, u64>,
    /// key -> refresh bookkeeping (the function itself is not persisted)
    #[serde(default)]
    pub refresh_keys: HashMap<String, RegistrationRecord>,
}

/// Persisted part of a refresh registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRecord {
    pub expires_at: u64,
    pub ttl_ms: u64,
}

// == Storage Trait ==
/// Durable home for cache snapshots.
pub trait Storage: Send + Sync {
    /// Returns the last saved snapshot, or `None` if nothing was saved yet.
    fn load(&self) -> Result<Option<Snapshot>>;

    fn save(&self, snapshot: &Snapshot) -> Result<()>;
}
