//! Per-run counters shared by every worker of a crawl.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters for one harvest run. Cheap to update from concurrent workers.
#[derive(Debug, Default)]
pub struct HarvestStats {
    requests: AtomicU64,
    retries: AtomicU64,
    pages: AtomicU64,
    records: AtomicU64,
    duplicates: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of [`HarvestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub retries: u64,
    pub pages: u64,
    pub records: u64,
    pub duplicates: u64,
    pub failures: u64,
}

impl HarvestStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page(&self, new_records: usize, duplicates: usize) {
        self.pages.fetch_add(1, Ordering::Relaxed);
        self.records.fetch_add(new_records as u64, Ordering::Relaxed);
        self.duplicates.fetch_add(duplicates as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            pages: self.pages.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
