//! Spawn cache counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals for one [`crate::spawn::SpawnCache`]
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    orphaned: AtomicU64,
    lookup_errors: AtomicU64,
    stores: AtomicU64,
    store_failures: AtomicU64,
    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    /// Lookups that produced a usable result
    pub hits: u64,
    /// Every miss, including orphaned results and failed lookups
    pub misses: u64,
    /// Results whose blobs had been evicted
    pub orphaned: u64,
    /// Lookups that failed with a warning
    pub lookup_errors: u64,
    /// Results recorded in the action cache
    pub stores: u64,
    /// Stores that failed with a warning
    pub store_failures: u64,
    /// Bytes written to the CAS
    pub bytes_uploaded: u64,
    /// Bytes read from the CAS
    pub bytes_downloaded: u64,
}

impl CacheStatsSnapshot {
    /// Fraction of lookups that hit, or `None` before the first lookup
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> Option<f64> {
        let lookups = self.hits + self.misses;
        (lookups > 0).then(|| self.hits as f64 / lookups as f64)
    }
}

impl CacheStats {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_orphaned(&self) {
        self.orphaned.fetch_add(1, Ordering::Relaxed);
        self.record_miss();
    }

    pub(crate) fn record_lookup_error(&self) {
        self.lookup_errors.fetch_add(1, Ordering::Relaxed);
        self.record_miss();
    }

    pub(crate) fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_transferred(&self, uploaded: u64, downloaded: u64) {
        self.bytes_uploaded.store(uploaded, Ordering::Relaxed);
        self.bytes_downloaded.store(downloaded, Ordering::Relaxed);
    }

    /// Copy the current values
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            lookup_errors: self.lookup_errors.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orphaned_and_errors_count_as_misses() {
        let stats = CacheStats::default();
        stats.record_hit();
        stats.record_miss();
        stats.record_orphaned();
        stats.record_lookup_error();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 3);
        assert_eq!(snapshot.orphaned, 1);
        assert_eq!(snapshot.lookup_errors, 1);
        assert_eq!(snapshot.hit_rate(), Some(0.25));
    }

    #[test]
    fn test_hit_rate_without_lookups() {
        assert_eq!(CacheStats::default().snapshot().hit_rate(), None);
    }
}
