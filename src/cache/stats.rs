//! Cache statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic cache counters.
///
/// Reads observe a non-decreasing view; updates are relaxed fetch-adds.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expired_keys: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub expired_keys: u64,
    /// `hits / (hits + misses)` rounded to two decimals, `0` when empty.
    pub hit_ratio: f32,
}

impl CacheStats {
    /// Record a hit.
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a miss.
    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an expired key removal.
    pub fn key_expired(&self) {
        self.expired_keys.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn expired_keys(&self) -> u64 {
        self.expired_keys.load(Ordering::Relaxed)
    }

    /// Take a snapshot with the derived hit ratio.
    pub fn snapshot(&self) -> StatsSnapshot {
        let hits = self.hits();
        let misses = self.misses();
        StatsSnapshot {
            hits,
            misses,
            expired_keys: self.expired_keys(),
            hit_ratio: hit_ratio(hits, misses),
        }
    }
}

/// Hit ratio rounded to two decimals, `0` when no lookups happened.
pub fn hit_ratio(hits: u64, misses: u64) -> f32 {
    let total = hits + misses;
    if total == 0 {
        return 0.0;
    }
    ((hits as f64 / total as f64) * 100.0).round() as f32 / 100.0
}
