//! Pool counters.

use std::sync::atomic::{AtomicU64, Ordering};

use wasm_calc_core::CallMetrics;

/// Live counters shared by the coordinator and its workers.
#[derive(Debug, Default)]
pub struct PoolStats {
    guest_calls: AtomicU64,
    skipped: AtomicU64,
    completed: AtomicU64,
    recycled: AtomicU64,
    limits_hit: AtomicU64,
    in_flight: AtomicU64,
    allocations: AtomicU64,
    deallocations: AtomicU64,
}

/// A point-in-time copy of [`PoolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Tickets handed to a guest instance.
    pub guest_calls: u64,
    /// Tickets dropped before dispatch because their caller was done.
    pub skipped: u64,
    /// Guest calls that returned, successfully or not.
    pub completed: u64,
    /// Instances replaced after a poisoning call.
    pub recycled: u64,
    /// Guest calls stopped by fuel, timeout, or input size limits.
    pub limits_hit: u64,
    /// Guest calls currently executing.
    pub in_flight: u64,
    /// Guest regions the host took ownership of.
    pub allocations: u64,
    /// Guest regions the host released.
    pub deallocations: u64,
}

impl PoolStatsSnapshot {
    /// Regions taken but never released.
    pub fn outstanding_allocations(&self) -> u64 {
        self.allocations.saturating_sub(self.deallocations)
    }
}

impl PoolStats {
    pub(crate) fn call_started(&self) {
        self.guest_calls.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn call_finished(&self, metrics: &CallMetrics) {
        self.allocations
            .fetch_add(u64::from(metrics.allocations), Ordering::Relaxed);
        self.deallocations
            .fetch_add(u64::from(metrics.deallocations), Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn ticket_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn limit_hit(&self) {
        self.limits_hit.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn instance_recycled(&self) {
        self.recycled.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            guest_calls: self.guest_calls.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            limits_hit: self.limits_hit.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
        }
    }
}
