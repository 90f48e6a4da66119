//! Configuration Module
//!
//! Handles loading, building and validating cache configuration.

use std::env;
use std::time::Duration;

use crate::error::{CacheError, Result};

pub const DEFAULT_EXPIRATION_SECS: u64 = 900;
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_REFRESH_MIN_TTL_MS: u64 = 70_000;

/// Cache configuration parameters.
///
/// Fixed at construction. All values can be configured via environment
/// variables or builder methods, with sensible defaults. A zero duration
/// means "use the default".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Identity used in log lines
    pub name: String,
    /// Emit per-operation debug logs
    pub verbose: bool,
    /// Default TTL in seconds for writes without an explicit TTL
    pub default_expiration_secs: u64,
    /// When set, writes are silently ignored
    pub read_only: bool,
    /// Allow the background refresh scheduler to run
    pub background_refresh_enabled: bool,
    /// Milliseconds between refresh ticks
    pub background_refresh_interval_ms: u64,
    /// Entries closer than this (ms) to expiry are refreshed on a tick
    pub background_refresh_min_ttl_ms: u64,
    /// Reject configurations where the interval exceeds the minimum TTL
    pub background_refresh_interval_check: bool,
}

impl CacheConfig {
    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_NAME` - Log identity (default: cache-module)
    /// - `CACHE_VERBOSE` - Per-operation logging (default: false)
    /// - `CACHE_DEFAULT_EXPIRATION` - Default TTL in seconds (default: 900)
    /// - `CACHE_READ_ONLY` - Ignore writes (default: false)
    /// - `CACHE_BACKGROUND_REFRESH` - Enable background refresh (default: false)
    /// - `CACHE_REFRESH_INTERVAL_MS` - Refresh tick interval (default: 60000)
    /// - `CACHE_REFRESH_MIN_TTL_MS` - Refresh threshold (default: 70000)
    /// - `CACHE_REFRESH_INTERVAL_CHECK` - Interval vs TTL check (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            name: env::var("CACHE_NAME").unwrap_or(defaults.name),
            verbose: env_parse("CACHE_VERBOSE").unwrap_or(defaults.verbose),
            default_expiration_secs: env_parse("CACHE_DEFAULT_EXPIRATION")
                .unwrap_or(defaults.default_expiration_secs),
            read_only: env_parse("CACHE_READ_ONLY").unwrap_or(defaults.read_only),
            background_refresh_enabled: env_parse("CACHE_BACKGROUND_REFRESH")
                .unwrap_or(defaults.background_refresh_enabled),
            background_refresh_interval_ms: env_parse("CACHE_REFRESH_INTERVAL_MS")
                .unwrap_or(defaults.background_refresh_interval_ms),
            background_refresh_min_ttl_ms: env_parse("CACHE_REFRESH_MIN_TTL_MS")
                .unwrap_or(defaults.background_refresh_min_ttl_ms),
            background_refresh_interval_check: env_parse("CACHE_REFRESH_INTERVAL_CHECK")
                .unwrap_or(defaults.background_refresh_interval_check),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_default_expiration_secs(mut self, secs: u64) -> Self {
        self.default_expiration_secs = secs;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Enables background refresh with the given tick interval and refresh threshold.
    pub fn with_background_refresh(mut self, interval: Duration, min_ttl: Duration) -> Self {
        self.background_refresh_enabled = true;
        self.background_refresh_interval_ms = interval.as_millis() as u64;
        self.background_refresh_min_ttl_ms = min_ttl.as_millis() as u64;
        self
    }

    pub fn with_interval_check(mut self, check: bool) -> Self {
        self.background_refresh_interval_check = check;
        self
    }

    /// Default TTL converted to milliseconds.
    pub fn default_expiration_ms(&self) -> u64 {
        or_default(self.default_expiration_secs, DEFAULT_EXPIRATION_SECS).saturating_mul(1000)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms())
    }

    pub fn refresh_interval_ms(&self) -> u64 {
        or_default(self.background_refresh_interval_ms, DEFAULT_REFRESH_INTERVAL_MS)
    }

    pub fn refresh_min_ttl_ms(&self) -> u64 {
        or_default(self.background_refresh_min_ttl_ms, DEFAULT_REFRESH_MIN_TTL_MS)
    }

    // == Validate ==
    /// Checks the configuration for inconsistencies.
    ///
    /// The refresh interval may not exceed the refresh minimum TTL, otherwise a
    /// tick could never catch an entry before it expires.
    pub fn validate(&self) -> Result<()> {
        if !self.background_refresh_enabled || !self.background_refresh_interval_check {
            return Ok(());
        }

        let interval_ms = self.refresh_interval_ms();
        let min_ttl_ms = self.refresh_min_ttl_ms();
        if interval_ms > min_ttl_ms {
            return Err(CacheError::Configuration(format!(
                "background refresh interval ({}ms) cannot be greater than background refresh min TTL ({}ms)",
                interval_ms, min_ttl_ms
            )));
        }

        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "cache-module".to_string(),
            verbose: false,
            default_expiration_secs: DEFAULT_EXPIRATION_SECS,
            read_only: false,
            background_refresh_enabled: false,
            background_refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            background_refresh_min_ttl_ms: DEFAULT_REFRESH_MIN_TTL_MS,
            background_refresh_interval_check: true,
        }
    }
}

fn or_default(value: u64, default: u64) -> u64 {
    if value == 0 {
        default
    } else {
        value
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
