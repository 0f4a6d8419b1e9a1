//! Process-local counters, threaded explicitly through component
//! constructors instead of living in a global registry. A metrics pusher (an
//! external collaborator) can snapshot these at its own cadence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    pub actions_dispatched: AtomicU64,
    pub actions_succeeded: AtomicU64,
    pub actions_failed: AtomicU64,
    pub actions_evicted: AtomicU64,
    pub sensor_runs: AtomicU64,
    pub sensor_failures: AtomicU64,
    pub operator_cycles: AtomicU64,
    pub operator_failures: AtomicU64,
    pub alerts_dispatched: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub actions_dispatched: u64,
    pub actions_succeeded: u64,
    pub actions_failed: u64,
    pub actions_evicted: u64,
    pub sensor_runs: u64,
    pub sensor_failures: u64,
    pub operator_cycles: u64,
    pub operator_failures: u64,
    pub alerts_dispatched: u64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            actions_dispatched: self.actions_dispatched.load(Ordering::Relaxed),
            actions_succeeded: self.actions_succeeded.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
            actions_evicted: self.actions_evicted.load(Ordering::Relaxed),
            sensor_runs: self.sensor_runs.load(Ordering::Relaxed),
            sensor_failures: self.sensor_failures.load(Ordering::Relaxed),
            operator_cycles: self.operator_cycles.load(Ordering::Relaxed),
            operator_failures: self.operator_failures.load(Ordering::Relaxed),
            alerts_dispatched: self.alerts_dispatched.load(Ordering::Relaxed),
        }
    }
}

/// Bump a counter by one.
pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let m = Metrics::new();
        incr(&m.actions_dispatched);
        incr(&m.actions_dispatched);
        incr(&m.sensor_runs);
        let snap = m.snapshot();
        assert_eq!(snap.actions_dispatched, 2);
        assert_eq!(snap.sensor_runs, 1);
        assert_eq!(snap.actions_failed, 0);
    }
}
