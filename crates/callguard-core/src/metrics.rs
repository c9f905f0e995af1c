//! Per-breaker event counters.
//!
//! Four monotonic counters, one per call outcome category. Counters are
//! cumulative for the lifetime of the breaker and are never reset.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time copy of a [`MetricsCounter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejections: u64,
}

impl MetricsSnapshot {
    /// Calls that reached the operation (successes plus failures).
    pub fn executed(&self) -> u64 {
        self.successes + self.failures
    }
}

/// Lock-free success / failure / timeout / rejection counters.
#[derive(Debug, Default)]
pub struct MetricsCounter {
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    rejections: AtomicU64,
}

impl MetricsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_successes(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rejections(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all four counters.
    ///
    /// Each counter is read atomically; counters may be from slightly
    /// different instants if other threads are recording concurrently.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}
