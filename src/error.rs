//! Error types for the cache
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Missing or invalid argument (empty key, absent value)
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// Invalid configuration, detected at construction
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Unexpected failure while reading
    #[error("Get failed: {0}")]
    Get(String),

    /// Unexpected failure while writing
    #[error("Set failed: {0}")]
    Set(String),

    /// Storage adapter failure (load, save, serialization)
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Storage(err.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Storage(err.to_string())
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;
