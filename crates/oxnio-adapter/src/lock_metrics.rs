//! Lock contention and handle lifecycle metrics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics for path lock acquisition and handle bookkeeping.
///
/// Thread-safe counters using atomic operations for lock-free updates.
#[derive(Debug, Default)]
pub struct LockMetrics {
    /// Granted READ lock requests
    pub read_grants: AtomicU64,

    /// Granted WRITE lock requests (a rename counts once)
    pub write_grants: AtomicU64,

    /// Requests that had to wait before being granted
    pub contended: AtomicU64,

    /// Requests abandoned through cancellation
    pub cancelled: AtomicU64,

    /// Total time spent waiting for contended grants (nanoseconds)
    pub wait_time_ns: AtomicU64,

    /// Handles issued
    pub handle_opens: AtomicU64,

    /// Handles closed
    pub handle_closes: AtomicU64,

    /// Unlinked-while-open files whose removal was deferred to last close
    pub deferred_deletions: AtomicU64,
}

impl LockMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_read_grant(&self) {
        self.read_grants.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_write_grant(&self) {
        self.write_grants.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_contended(&self, waited: Duration) {
        self.contended.fetch_add(1, Ordering::Relaxed);
        let nanos = u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX);
        self.wait_time_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_handle_open(&self) {
        self.handle_opens.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_handle_close(&self) {
        self.handle_closes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_deferred_deletion(&self) {
        self.deferred_deletions.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of metrics
    pub fn snapshot(&self) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            read_grants: self.read_grants.load(Ordering::Relaxed),
            write_grants: self.write_grants.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            wait_time_ns: self.wait_time_ns.load(Ordering::Relaxed),
            handle_opens: self.handle_opens.load(Ordering::Relaxed),
            handle_closes: self.handle_closes.load(Ordering::Relaxed),
            deferred_deletions: self.deferred_deletions.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero
    pub fn reset(&self) {
        self.read_grants.store(0, Ordering::Relaxed);
        self.write_grants.store(0, Ordering::Relaxed);
        self.contended.store(0, Ordering::Relaxed);
        self.cancelled.store(0, Ordering::Relaxed);
        self.wait_time_ns.store(0, Ordering::Relaxed);
        self.handle_opens.store(0, Ordering::Relaxed);
        self.handle_closes.store(0, Ordering::Relaxed);
        self.deferred_deletions.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time snapshot of lock metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockMetricsSnapshot {
    /// Granted requests with only READ targets
    pub read_grants: u64,
    /// Granted requests with at least one WRITE target
    pub write_grants: u64,
    /// Grants that had to wait in the queue
    pub contended: u64,
    /// Waits given up through a cancellation token
    pub cancelled: u64,
    /// Total time spent waiting by contended grants, in nanoseconds
    pub wait_time_ns: u64,
    /// Handles opened
    pub handle_opens: u64,
    /// Handles closed
    pub handle_closes: u64,
    /// Unlinked files whose deletion waited for their last handle
    pub deferred_deletions: u64,
}

impl LockMetricsSnapshot {
    /// Total granted lock requests
    pub fn total_grants(&self) -> u64 {
        self.read_grants + self.write_grants
    }

    /// Fraction of grants that had to wait (0.0 to 1.0)
    pub fn contention_rate(&self) -> f64 {
        let total = self.total_grants();
        if total == 0 {
            0.0
        } else {
            self.contended as f64 / total as f64
        }
    }

    /// Handles currently open according to the counters
    pub fn open_handles(&self) -> u64 {
        self.handle_opens.saturating_sub(self.handle_closes)
    }
}

impl fmt::Display for LockMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let avg_wait_ms = if self.contended > 0 {
            (self.wait_time_ns as f64 / self.contended as f64) / 1_000_000.0
        } else {
            0.0
        };
        write!(
            f,
            "locks: {} read / {} write, {:.1}% contended (avg wait {:.2} ms), {} cancelled; \
             handles: {} open, {} deferred deletions",
            self.read_grants,
            self.write_grants,
            self.contention_rate() * 100.0,
            avg_wait_ms,
            self.cancelled,
            self.open_handles(),
            self.deferred_deletions,
        )
    }
}
