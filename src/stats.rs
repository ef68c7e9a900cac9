//! Statistics tracking for the proxy.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for request outcomes.
pub struct Stats {
    pub requests: AtomicU64,
    pub fetched: AtomicU64,
    pub cached: AtomicU64,
    pub blocked: AtomicU64,
    pub rejected: AtomicU64,
    pub failed: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            fetched: AtomicU64::new(0),
            cached: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    fn record(&self, counter: &AtomicU64, response_time_ms: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add((response_time_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn record_fetched(&self, response_time_ms: f64) {
        self.record(&self.fetched, response_time_ms);
    }

    pub fn record_cached(&self, response_time_ms: f64) {
        self.record(&self.cached, response_time_ms);
    }

    pub fn record_blocked(&self, response_time_ms: f64) {
        self.record(&self.blocked, response_time_ms);
    }

    pub fn record_rejected(&self, response_time_ms: f64) {
        self.record(&self.rejected, response_time_ms);
    }

    pub fn record_failed(&self, response_time_ms: f64) {
        self.record(&self.failed, response_time_ms);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let fetched = self.fetched.swap(0, Ordering::Relaxed);
        let cached = self.cached.swap(0, Ordering::Relaxed);
        let blocked = self.blocked.swap(0, Ordering::Relaxed);
        let rejected = self.rejected.swap(0, Ordering::Relaxed);
        let failed = self.failed.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let avg_response_ms = if requests > 0 {
            (total_us as f64 / requests as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            requests,
            fetched,
            cached,
            blocked,
            rejected,
            failed,
            avg_response_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub fetched: u64,
    pub cached: u64,
    pub blocked: u64,
    pub rejected: u64,
    pub failed: u64,
    pub avg_response_ms: f64,
}
