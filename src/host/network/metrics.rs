//! CNI operation metrics.
//!
//! Process-wide atomic counters; snapshots are computed without locks.
//! Constructed once at startup and passed explicitly (no lazily
//! initialized singletons) so tests can reset their own instance.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Counters for network setup and teardown.
#[derive(Debug, Default)]
pub struct NetworkMetrics {
    setup_attempts: AtomicI64,
    setup_successes: AtomicI64,
    setup_failures: AtomicI64,
    resource_conflicts: AtomicI64,

    teardown_attempts: AtomicI64,
    teardown_successes: AtomicI64,
    teardown_failures: AtomicI64,

    ipam_leaks_detected: AtomicI64,

    total_setup_time_ns: AtomicI64,
    total_teardown_time_ns: AtomicI64,
}

impl NetworkMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a setup attempt.
    pub fn record_setup(&self, success: bool, conflict: bool, duration: Duration) {
        self.setup_attempts.fetch_add(1, Ordering::Relaxed);
        self.total_setup_time_ns
            .fetch_add(duration.as_nanos() as i64, Ordering::Relaxed);
        if success {
            self.setup_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.setup_failures.fetch_add(1, Ordering::Relaxed);
        }
        if conflict {
            self.resource_conflicts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a teardown attempt.
    pub fn record_teardown(&self, success: bool, duration: Duration) {
        self.teardown_attempts.fetch_add(1, Ordering::Relaxed);
        self.total_teardown_time_ns
            .fetch_add(duration.as_nanos() as i64, Ordering::Relaxed);
        if success {
            self.teardown_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.teardown_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a detected IPAM leak.
    pub fn record_ipam_leak(&self) {
        self.ipam_leaks_detected.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let setup_attempts = self.setup_attempts.load(Ordering::Relaxed);
        let teardown_attempts = self.teardown_attempts.load(Ordering::Relaxed);

        let mut snap = MetricsSnapshot {
            setup_attempts,
            setup_successes: self.setup_successes.load(Ordering::Relaxed),
            setup_failures: self.setup_failures.load(Ordering::Relaxed),
            resource_conflicts: self.resource_conflicts.load(Ordering::Relaxed),
            teardown_attempts,
            teardown_successes: self.teardown_successes.load(Ordering::Relaxed),
            teardown_failures: self.teardown_failures.load(Ordering::Relaxed),
            ipam_leaks_detected: self.ipam_leaks_detected.load(Ordering::Relaxed),
            avg_setup_time_ms: 0.0,
            avg_teardown_time_ms: 0.0,
        };

        if setup_attempts > 0 {
            snap.avg_setup_time_ms = self.total_setup_time_ns.load(Ordering::Relaxed) as f64
                / setup_attempts as f64
                / 1e6;
        }
        if teardown_attempts > 0 {
            snap.avg_teardown_time_ms = self.total_teardown_time_ns.load(Ordering::Relaxed)
                as f64
                / teardown_attempts as f64
                / 1e6;
        }
        snap
    }

    /// Resets every counter to zero. For tests.
    pub fn reset(&self) {
        self.setup_attempts.store(0, Ordering::Relaxed);
        self.setup_successes.store(0, Ordering::Relaxed);
        self.setup_failures.store(0, Ordering::Relaxed);
        self.resource_conflicts.store(0, Ordering::Relaxed);
        self.teardown_attempts.store(0, Ordering::Relaxed);
        self.teardown_successes.store(0, Ordering::Relaxed);
        self.teardown_failures.store(0, Ordering::Relaxed);
        self.ipam_leaks_detected.store(0, Ordering::Relaxed);
        self.total_setup_time_ns.store(0, Ordering::Relaxed);
        self.total_teardown_time_ns.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time metric values.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub setup_attempts: i64,
    pub setup_successes: i64,
    pub setup_failures: i64,
    pub resource_conflicts: i64,
    pub teardown_attempts: i64,
    pub teardown_successes: i64,
    pub teardown_failures: i64,
    pub ipam_leaks_detected: i64,
    pub avg_setup_time_ms: f64,
    pub avg_teardown_time_ms: f64,
}
