//! Warm Cache - An embedded time-expiring key-value cache
//!
//! Values are served from memory until their TTL elapses. Keys written with a
//! refresh function can be kept warm by a background scheduler that recomputes
//! them shortly before they expire.

pub mod cache;
pub mod config;
pub mod error;
pub mod storage;
pub mod tasks;

pub use cache::{refresh_fn, CacheStore, MsetEntry, RefreshFn};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
