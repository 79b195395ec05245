//! Process-local IO counters for the statistics stream.

use std::sync::atomic::{AtomicU64, Ordering};

/// Count / bytes / microseconds of one read category.
#[derive(Debug, Default)]
pub struct OpStat {
    count: AtomicU64,
    bytes: AtomicU64,
    micros: AtomicU64,
}

impl OpStat {
    pub fn record(&self, bytes: u64, micros: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn micros(&self) -> u64 {
        self.micros.load(Ordering::Relaxed)
    }
}

/// Counters for the three read paths of the engine.
#[derive(Debug, Default)]
pub struct IoStats {
    /// Reads served straight from the backend.
    pub remote: OpStat,
    /// Reads served from the materialized cache file.
    pub cached: OpStat,
    /// Whole-file downloads into the cache.
    pub download: OpStat,
}

impl IoStats {
    /// One-line summary for the statistics stream.
    pub fn summary(&self, cache_size: i64) -> String {
        format!(
            "statistics: remoteIO {}/{}/{} cachedIO {}/{}/{} dl {}/{}/{} cs {}",
            self.remote.count(),
            self.remote.bytes(),
            self.remote.micros(),
            self.cached.count(),
            self.cached.bytes(),
            self.cached.micros(),
            self.download.count(),
            self.download.bytes(),
            self.download.micros(),
            cache_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_accumulate() {
        let stats = IoStats::default();
        stats.cached.record(100, 5);
        stats.cached.record(50, 3);
        stats.remote.record(7, 1);
        assert_eq!(stats.cached.count(), 2);
        assert_eq!(stats.cached.bytes(), 150);
        assert_eq!(stats.cached.micros(), 8);
        assert!(stats.summary(150).starts_with("statistics: remoteIO 1/7/1 cachedIO 2/150/8"));
    }
}
