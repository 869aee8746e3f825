use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;

/// Apply-path metrics. The registry (and whatever serves it) belongs to the
/// embedding process; the manager only increments.
#[derive(Debug, Default)]
pub struct Metrics {
    applies: Counter,
    apply_failures: Counter,
    tracked_sets: Gauge,
    pending_changes: Gauge,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(prom: &mut Registry) -> Arc<Self> {
        let metrics = Self::default();

        prom.register(
            "ipset_applies",
            "Count of successful ipset apply batches",
            metrics.applies.clone(),
        );
        prom.register(
            "ipset_apply_failures",
            "Count of ipset apply batches that exhausted recovery",
            metrics.apply_failures.clone(),
        );
        prom.register(
            "ipsets_tracked",
            "Gauge of sets in the manager's cache",
            metrics.tracked_sets.clone(),
        );
        prom.register(
            "ipsets_pending_changes",
            "Gauge of sets with pending kernel changes",
            metrics.pending_changes.clone(),
        );

        Arc::new(metrics)
    }

    pub(crate) fn inc_applies(&self) {
        self.applies.inc();
    }

    pub(crate) fn inc_apply_failures(&self) {
        self.apply_failures.inc();
    }

    pub(crate) fn observe(&self, tracked_sets: usize, pending_changes: usize) {
        self.tracked_sets.set(tracked_sets as i64);
        self.pending_changes.set(pending_changes as i64);
    }
}
