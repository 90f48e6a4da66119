//! Cache Module
//!
//! Provides the in-memory cache engine with lazy TTL expiration and
//! background refresh registrations.

mod clock;
mod entry;
mod stats;
pub(crate) mod store;


// Re-export public types
pub use clock::{current_timestamp_ms, Clock, ManualClock, SystemClock};
pub use entry::{refresh_fn, CacheEntry, RefreshFn, RefreshFuture, RefreshRegistration};
pub use stats::CacheStats;
pub use store::{CacheStore, CacheStoreBuilder, MsetEntry};
