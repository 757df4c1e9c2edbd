//! Pool counters and read-only snapshots.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters updated by a pool as it works.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    requests: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
    created: AtomicU64,
    closed: AtomicU64,
    validation_failures: AtomicU64,
    acquire_count: AtomicU64,
    acquire_micros: AtomicU64,
    release_count: AtomicU64,
    release_micros: AtomicU64,
}

fn micros(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}

impl PoolMetrics {
    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_closed(&self, count: u64) {
        self.closed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acquire(&self, elapsed: Duration) {
        self.acquire_count.fetch_add(1, Ordering::Relaxed);
        self.acquire_micros
            .fetch_add(micros(elapsed), Ordering::Relaxed);
    }

    pub(crate) fn record_release(&self, elapsed: Duration) {
        self.release_count.fetch_add(1, Ordering::Relaxed);
        self.release_micros
            .fetch_add(micros(elapsed), Ordering::Relaxed);
    }

    /// Builds a snapshot combining these counters with the pool's current
    /// occupancy.
    pub fn snapshot(&self, active: usize, idle: usize, max_size: usize) -> PoolStats {
        let average = |total: &AtomicU64, count: &AtomicU64| {
            match count.load(Ordering::Relaxed) {
                0 => Duration::ZERO,
                n => Duration::from_micros(total.load(Ordering::Relaxed) / n),
            }
        };

        PoolStats {
            active,
            idle,
            max_size,
            total_requests: self.requests.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            total_created: self.created.load(Ordering::Relaxed),
            total_closed: self.closed.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            avg_acquire_time: average(&self.acquire_micros, &self.acquire_count),
            avg_release_time: average(&self.release_micros, &self.release_count),
        }
    }
}

/// Statistics for a connection pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    /// Connections currently checked out.
    pub active: usize,
    /// Connections waiting for reuse.
    pub idle: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// Acquire calls.
    pub total_requests: u64,
    /// Acquires that gave up waiting for capacity.
    pub timeouts: u64,
    /// Factory failures.
    pub errors: u64,
    /// Connections opened.
    pub total_created: u64,
    /// Connections closed.
    pub total_closed: u64,
    /// Connections discarded by a failed liveness or lifetime check.
    pub validation_failures: u64,
    /// Mean time for a successful acquire.
    #[serde(with = "herd_core::serde_ms", rename = "avg_acquire_time_ms")]
    pub avg_acquire_time: Duration,
    /// Mean time to check a connection back in.
    #[serde(with = "herd_core::serde_ms", rename = "avg_release_time_ms")]
    pub avg_release_time: Duration,
}

impl PoolStats {
    /// Returns the share of capacity currently checked out.
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            self.active as f64 / self.max_size as f64
        }
    }

    /// Returns the share of acquire calls that failed.
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.timeouts + self.errors) as f64 / self.total_requests as f64
        }
    }
}
