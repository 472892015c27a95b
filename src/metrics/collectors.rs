//! High-level recording interface over the raw Prometheus metrics.

use super::prometheus::{
    ACTIVE_WORKERS, DISPATCH_TOTAL, FLEET_OPERATIONS_TOTAL, QUEUE_BACKLOG,
    ROUTED_MESSAGES_TOTAL, RUNS_COMPLETED_TOTAL, RUNS_CREATED_TOTAL, RUN_DURATION,
};

/// Records flowrun operational metrics.
///
/// Every method is a no-op until `init_metrics()` has been called, so
/// library code can record unconditionally.
///
/// ```ignore
/// use flowrun::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_run_created("suite");
/// collector.record_dispatch(true);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Records a run record creation (`test` or `suite`).
    pub fn record_run_created(&self, kind: &str) {
        if let Some(counter) = RUNS_CREATED_TOTAL.get() {
            counter.with_label_values(&[kind]).inc();
        }
    }

    /// Records the outcome of one queue publish for a test run.
    pub fn record_dispatch(&self, published: bool) {
        let outcome = if published { "dispatched" } else { "failed" };
        if let Some(counter) = DISPATCH_TOTAL.get() {
            counter.with_label_values(&[outcome]).inc();
        }
        tracing::trace!(outcome = outcome, "Recorded dispatch metric");
    }

    /// Records a router decision (`forwarded`, `ignored`, `dead_lettered`, `retried`).
    pub fn record_routed(&self, outcome: &str) {
        if let Some(counter) = ROUTED_MESSAGES_TOTAL.get() {
            counter.with_label_values(&[outcome]).inc();
        }
    }

    pub fn update_queue_backlog(&self, queue_name: &str, backlog: usize) {
        if let Some(gauge) = QUEUE_BACKLOG.get() {
            gauge.with_label_values(&[queue_name]).set(backlog as f64);
        }
    }

    pub fn update_active_workers(&self, count: usize) {
        if let Some(gauge) = ACTIVE_WORKERS.get() {
            gauge.set(count as f64);
        }
    }

    /// Records a launch or decommission attempt.
    pub fn record_fleet_operation(&self, operation: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        if let Some(counter) = FLEET_OPERATIONS_TOTAL.get() {
            counter.with_label_values(&[operation, outcome]).inc();
        }
        tracing::trace!(operation = operation, outcome = outcome, "Recorded fleet metric");
    }

    /// Records a test run reaching a terminal status.
    pub fn record_run_completed(&self, status: &str, model: &str, duration_secs: f64) {
        if let Some(counter) = RUNS_COMPLETED_TOTAL.get() {
            counter.with_label_values(&[status]).inc();
        }
        if let Some(histogram) = RUN_DURATION.get() {
            histogram.with_label_values(&[model]).observe(duration_secs);
        }
    }
}
