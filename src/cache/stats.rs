//! Cache Statistics Module
//!
//! Tracks cache metrics: hits, misses, lazy expirations and background refreshes.

use serde::Serialize;

// == Cache Stats ==
/// Tracks cache performance metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of reads that found a live entry
    pub hits: u64,
    /// Number of reads that found nothing or an expired entry
    pub misses: u64,
    /// Number of entries removed by lazy expiration
    pub expirations: u64,
    /// Number of successful background refresh write-backs
    pub refreshes: u64,
    /// Number of refresh functions that returned an error
    pub refresh_failures: u64,
    /// Current number of stored entries
    pub total_entries: usize,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no reads have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_expiration(&mut self) {
        self.expirations += 1;
    }

    pub fn record_refresh(&mut self) {
        self.refreshes += 1;
    }

    pub fn record_refresh_failure(&mut self) {
        self.refresh_failures += 1;
    }

    pub fn set_total_entries(&mut self, count: usize) {
        self.total_entries = count;
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = CacheStats::new();
        assert_eq!(stats, CacheStats::default());
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let mut stats = CacheStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        assert_eq!(stats.hit_rate(), 0.75);
    }

    #[test]
    fn test_refresh_counters() {
        let mut stats = CacheStats::new();
        stats.record_refresh();
        stats.record_refresh_failure();
        stats.record_refresh_failure();
        stats.record_expiration();
        assert_eq!(stats.refreshes, 1);
        assert_eq!(stats.refresh_failures, 2);
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn test_stats_serialize() {
        let mut stats = CacheStats::new();
        stats.set_total_entries(42);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["total_entries"], 42);
        assert_eq!(json["hits"], 0);
    }
}
