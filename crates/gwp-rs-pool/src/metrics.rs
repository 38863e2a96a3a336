//! Atomic counters for pool observability.
//!
//! All counters use relaxed ordering — they are advisory/diagnostic, not
//! synchronization primitives. The allocation hot path touches at most one.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-pool operation counters.
#[derive(Debug)]
pub struct PoolMetrics {
    /// `should_sample` returned true.
    pub samples: AtomicU64,
    /// Allocations serviced from the guarded pool.
    pub guarded_allocations: AtomicU64,
    /// Allocation requests refused (size, exhaustion, recursion, stop).
    pub refused_allocations: AtomicU64,
    /// Valid deallocations.
    pub deallocations: AtomicU64,
    /// Internally raised traps (double free, invalid free).
    pub internal_traps: AtomicU64,
    /// Crash reports emitted by the handler.
    pub reports_emitted: AtomicU64,
    /// Faults on already-reported slots, swallowed in recoverable mode.
    pub reports_suppressed: AtomicU64,
}

impl PoolMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            samples: AtomicU64::new(0),
            guarded_allocations: AtomicU64::new(0),
            refused_allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            internal_traps: AtomicU64::new(0),
            reports_emitted: AtomicU64::new(0),
            reports_suppressed: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    #[must_use]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters into a displayable summary.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            samples: Self::get(&self.samples),
            guarded_allocations: Self::get(&self.guarded_allocations),
            refused_allocations: Self::get(&self.refused_allocations),
            deallocations: Self::get(&self.deallocations),
            internal_traps: Self::get(&self.internal_traps),
            reports_emitted: Self::get(&self.reports_emitted),
            reports_suppressed: Self::get(&self.reports_suppressed),
        }
    }
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub samples: u64,
    pub guarded_allocations: u64,
    pub refused_allocations: u64,
    pub deallocations: u64,
    pub internal_traps: u64,
    pub reports_emitted: u64,
    pub reports_suppressed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = PoolMetrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap.guarded_allocations, 0);
        assert_eq!(snap.reports_emitted, 0);
    }

    #[test]
    fn increment_is_visible_in_snapshots() {
        let metrics = PoolMetrics::new();
        PoolMetrics::inc(&metrics.samples);
        PoolMetrics::inc(&metrics.samples);
        PoolMetrics::inc(&metrics.refused_allocations);
        let snap = metrics.snapshot();
        assert_eq!(snap.samples, 2);
        assert_eq!(snap.refused_allocations, 1);
    }
}
