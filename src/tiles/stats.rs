//! Scheduler counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated by the scheduler and its tasks
#[derive(Debug, Default)]
pub struct SchedulerStats {
    requests: AtomicU64,
    coalesced: AtomicU64,
    loads: AtomicU64,
    failures: AtomicU64,
    sync_joins: AtomicU64,
    drops: AtomicU64,
    cancelled: AtomicU64,
    completed: AtomicU64,
}

impl SchedulerStats {
    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sync_join(&self) {
        self.sync_joins.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completion(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.requests.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced.load(Ordering::Relaxed),
            storage_loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.failures.load(Ordering::Relaxed),
            sync_joins: self.sync_joins.load(Ordering::Relaxed),
            dropped_callbacks: self.drops.load(Ordering::Relaxed),
            cancelled_tasks: self.cancelled.load(Ordering::Relaxed),
            completed_tasks: self.completed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SchedulerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Synchronous and asynchronous requests received
    pub total_requests: u64,
    /// Asynchronous requests that joined an existing task
    pub coalesced_requests: u64,
    /// Reads issued against storage
    pub storage_loads: u64,
    /// Reads that failed or panicked
    pub load_failures: u64,
    /// Synchronous requests that took over or waited on a queued task
    pub sync_joins: u64,
    pub dropped_callbacks: u64,
    /// Tasks withdrawn from the pool before they started
    pub cancelled_tasks: u64,
    /// Tasks whose completion step has run
    pub completed_tasks: u64,
}

impl StatsSnapshot {
    /// Share of requests served by an already running task (0.0 to 1.0)
    pub fn coalescing_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.coalesced_requests + self.sync_joins) as f64 / self.total_requests as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalescing_ratio() {
        let stats = SchedulerStats::default();
        assert_eq!(stats.snapshot().coalescing_ratio(), 0.0);

        for _ in 0..4 {
            stats.record_request();
        }
        stats.record_coalesced();
        stats.record_sync_join();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_requests, 4);
        assert!((snapshot.coalescing_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
