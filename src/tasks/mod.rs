//! Background Tasks Module
//!
//! Contains background tasks that run periodically while a cache is alive.
//!
//! # Tasks
//! - Refresh: Recomputes values nearing expiry through their refresh functions

mod refresh;

pub use refresh::RefreshScheduler;
