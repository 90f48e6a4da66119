//! Cache Entry Module
//!
//! Defines stored entries and refresh registrations.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

// == Refresh Function ==
/// Future returned by a refresh function.
pub type RefreshFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + 'static>>;

/// Recomputes the value for a key. Invoked by the background refresh scheduler.
pub type RefreshFn = Arc<dyn Fn(String) -> RefreshFuture + Send + Sync + 'static>;

/// Wraps an async closure into a [`RefreshFn`].
///
/// ```ignore
/// let refresh = refresh_fn(|key| async move { Ok(json!(load_from_db(&key).await?)) });
/// cache.set_with_refresh("user:1", value, Some(60), refresh)?;
/// ```
pub fn refresh_fn<F, Fut>(f: F) -> RefreshFn
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |key| Box::pin(f(key)) as RefreshFuture)
}

// == Cache Entry ==
/// A stored value and its expiration timestamp.
///
/// Value and expiration live in one struct so neither can exist without the other.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// The stored value
    pub value: Value,
    /// Expiration timestamp (Unix milliseconds)
    pub expires_at: u64,
}

impl CacheEntry {
    pub fn new(value: Value, now_ms: u64, ttl_ms: u64) -> Self {
        Self {
            value,
            expires_at: now_ms.saturating_add(ttl_ms),
        }
    }

    // == Is Expired ==
    /// An entry is live while `expires_at > now`; at exactly `expires_at` it has expired.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

// == Refresh Registration ==
/// Bookkeeping for a key written with a refresh function.
///
/// Survives lazy expiration of its entry; removed only by delete or flush.
#[derive(Clone)]
pub struct RefreshRegistration {
    /// Expiration of the value written alongside this registration
    pub expires_at: u64,
    /// Effective TTL in milliseconds, reused on write-back
    pub ttl_ms: u64,
    /// Distinguishes this registration from earlier or later ones for the same key
    pub generation: u64,
    pub refresh: RefreshFn,
}

impl RefreshRegistration {
    /// True when the entry is within `min_ttl_ms` of expiring (or already expired).
    pub fn is_due(&self, now_ms: u64, min_ttl_ms: u64) -> bool {
        (self.expires_at as i128 - now_ms as i128) < min_ttl_ms as i128
    }
}

impl fmt::Debug for RefreshRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshRegistration")
            .field("expires_at", &self.expires_at)
            .field("ttl_ms", &self.ttl_ms)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
