use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::protocol::Language;

/// Lifetime counters for one pool.
///
/// `replenish_failures` is the signal for a shrinking pool: a failed
/// replenishment is never retried, so every increment is one slot lost
/// until the process restarts.
#[derive(Debug, Default)]
pub struct PoolStats {
    provisioned: AtomicU64,
    provision_failures: AtomicU64,
    replenish_failures: AtomicU64,
    leases: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    late_replies_dropped: AtomicU64,
    cleanups: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub provisioned: u64,
    pub provision_failures: u64,
    pub replenish_failures: u64,
    pub leases: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub late_replies_dropped: u64,
    pub cleanups: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub language: Language,
    pub capacity: usize,
    pub ready: usize,
    pub live_workers: usize,
    pub closed: bool,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
}

impl PoolStats {
    pub fn record_provisioned(&self) {
        self.provisioned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_provision_failure(&self) {
        self.provision_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replenish_failure(&self) {
        self.replenish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease(&self) {
        self.leases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_reply(&self) {
        self.late_replies_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            provisioned: self.provisioned.load(Ordering::Relaxed),
            provision_failures: self.provision_failures.load(Ordering::Relaxed),
            replenish_failures: self.replenish_failures.load(Ordering::Relaxed),
            leases: self.leases.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            late_replies_dropped: self.late_replies_dropped.load(Ordering::Relaxed),
            cleanups: self.cleanups.load(Ordering::Relaxed),
        }
    }
}
