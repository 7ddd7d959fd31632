//! Process-wide replication and recovery counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counter block shared by every replicator in the process.
///
/// `replicator_count` tracks live state machines; the rest are monotonic.
#[derive(Debug, Default)]
pub struct ReplicatorCounters {
    replicator_count: AtomicU64,
    replication_count: AtomicU64,
    replication_error_count: AtomicU64,
    replication_canceled_count: AtomicU64,
    recovery_count: AtomicU64,
    recovery_error_count: AtomicU64,
    recovery_canceled_count: AtomicU64,
}

/// Point-in-time copy of the counter block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    /// Live replicator state machines.
    pub replicator_count: u64,
    /// Direct replications attempted.
    pub replication_count: u64,
    /// Direct replications that failed.
    pub replication_error_count: u64,
    /// Direct replications cancelled.
    pub replication_canceled_count: u64,
    /// Recoveries attempted.
    pub recovery_count: u64,
    /// Recoveries that failed.
    pub recovery_error_count: u64,
    /// Recoveries cancelled.
    pub recovery_canceled_count: u64,
}

impl ReplicatorCounters {
    /// Creates a zeroed counter block.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn replicator_created(&self) {
        self.replicator_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn replicator_destroyed(&self) {
        self.replicator_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn replication_started(&self) {
        self.replication_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn replication_failed(&self) {
        self.replication_error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn replication_canceled(&self) {
        self.replication_canceled_count
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn recovery_started(&self) {
        self.recovery_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn recovery_failed(&self) {
        self.recovery_error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn recovery_canceled(&self) {
        self.recovery_canceled_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of every counter.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            replicator_count: self.replicator_count.load(Ordering::Relaxed),
            replication_count: self.replication_count.load(Ordering::Relaxed),
            replication_error_count: self.replication_error_count.load(Ordering::Relaxed),
            replication_canceled_count: self.replication_canceled_count.load(Ordering::Relaxed),
            recovery_count: self.recovery_count.load(Ordering::Relaxed),
            recovery_error_count: self.recovery_error_count.load(Ordering::Relaxed),
            recovery_canceled_count: self.recovery_canceled_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let c = ReplicatorCounters::new();
        assert_eq!(c.snapshot(), CountersSnapshot::default());
    }

    #[test]
    fn test_replicator_lifecycle_counting() {
        let c = ReplicatorCounters::new();
        c.replicator_created();
        c.replicator_created();
        assert_eq!(c.snapshot().replicator_count, 2);
        c.replicator_destroyed();
        assert_eq!(c.snapshot().replicator_count, 1);
    }

    #[test]
    fn test_outcome_counters() {
        let c = ReplicatorCounters::new();
        c.replication_started();
        c.replication_failed();
        c.replication_canceled();
        c.recovery_started();
        c.recovery_started();
        c.recovery_failed();
        c.recovery_canceled();
        let s = c.snapshot();
        assert_eq!(s.replication_count, 1);
        assert_eq!(s.replication_error_count, 1);
        assert_eq!(s.replication_canceled_count, 1);
        assert_eq!(s.recovery_count, 2);
        assert_eq!(s.recovery_error_count, 1);
        assert_eq!(s.recovery_canceled_count, 1);
    }
}
