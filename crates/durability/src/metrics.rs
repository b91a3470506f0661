//! WAL error counters.
//!
//! The metrics layer proper is an external collaborator; this module only
//! keeps the counters it scrapes.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide WAL counters.
pub struct WalMetrics {
    wal_errors: AtomicU64,
    quarantined_volumes: AtomicU64,
}

/// Global instance incremented by the WAL on errors and quarantines.
pub static WAL_METRICS: WalMetrics = WalMetrics {
    wal_errors: AtomicU64::new(0),
    quarantined_volumes: AtomicU64::new(0),
};

impl WalMetrics {
    /// Record one WAL error.
    pub fn record_error(&self) {
        self.wal_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record quarantined volumes.
    pub fn record_quarantined(&self, count: u64) {
        self.quarantined_volumes.fetch_add(count, Ordering::Relaxed);
    }

    /// Total WAL errors so far.
    pub fn wal_errors(&self) -> u64 {
        self.wal_errors.load(Ordering::Relaxed)
    }

    /// Total quarantined volumes so far.
    pub fn quarantined_volumes(&self) -> u64 {
        self.quarantined_volumes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let before = WAL_METRICS.wal_errors();
        WAL_METRICS.record_error();
        WAL_METRICS.record_error();
        assert!(WAL_METRICS.wal_errors() >= before + 2);

        let before = WAL_METRICS.quarantined_volumes();
        WAL_METRICS.record_quarantined(3);
        assert!(WAL_METRICS.quarantined_volumes() >= before + 3);
    }
}
