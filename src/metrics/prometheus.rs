//! Prometheus metrics registration and export.
//!
//! All flowrun metrics live in a dedicated registry held in statics, so
//! recording is a no-op until `init_metrics()` has run.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all flowrun metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Run records created, labeled by kind (`test` or `suite`).
pub static RUNS_CREATED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Queue publishes made on behalf of runs, labeled by outcome.
pub static DISPATCH_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Messages handled by the task router, labeled by outcome.
pub static ROUTED_MESSAGES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Approximate backlog per queue, as last observed.
pub static QUEUE_BACKLOG: OnceLock<GaugeVec> = OnceLock::new();

/// Workers running for the launch template, as last observed.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Fleet operations, labeled by operation and outcome.
pub static FLEET_OPERATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Test run completions, labeled by terminal status.
pub static RUNS_COMPLETED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall time spent executing a test run inside a worker.
pub static RUN_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Creates every metric and registers it with the flowrun registry.
///
/// Calling this more than once keeps the first set of metrics.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let runs_created_total = CounterVec::new(
        Opts::new("flowrun_runs_created_total", "Total run records created"),
        &["kind"],
    )?;

    let dispatch_total = CounterVec::new(
        Opts::new(
            "flowrun_dispatch_total",
            "Test run messages published to the intake queue",
        ),
        &["outcome"],
    )?;

    let routed_messages_total = CounterVec::new(
        Opts::new(
            "flowrun_routed_messages_total",
            "Messages handled by the task router",
        ),
        &["outcome"],
    )?;

    let queue_backlog = GaugeVec::new(
        Opts::new("flowrun_queue_backlog", "Approximate number of waiting messages"),
        &["queue_name"],
    )?;

    let active_workers = Gauge::new("flowrun_active_workers", "Number of running workers")?;

    let fleet_operations_total = CounterVec::new(
        Opts::new("flowrun_fleet_operations_total", "Worker launches and decommissions"),
        &["operation", "outcome"],
    )?;

    let runs_completed_total = CounterVec::new(
        Opts::new("flowrun_runs_completed_total", "Test runs that reached a terminal status"),
        &["status"],
    )?;

    let run_duration = HistogramVec::new(
        HistogramOpts::new(
            "flowrun_run_duration_seconds",
            "Test run execution duration in seconds",
        )
        .buckets(vec![10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
        &["model"],
    )?;

    registry.register(Box::new(runs_created_total.clone()))?;
    registry.register(Box::new(dispatch_total.clone()))?;
    registry.register(Box::new(routed_messages_total.clone()))?;
    registry.register(Box::new(queue_backlog.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(fleet_operations_total.clone()))?;
    registry.register(Box::new(runs_completed_total.clone()))?;
    registry.register(Box::new(run_duration.clone()))?;

    // Already-set statics mean a previous call won; keep those.
    let _ = REGISTRY.set(registry);
    let _ = RUNS_CREATED_TOTAL.set(runs_created_total);
    let _ = DISPATCH_TOTAL.set(dispatch_total);
    let _ = ROUTED_MESSAGES_TOTAL.set(routed_messages_total);
    let _ = QUEUE_BACKLOG.set(queue_backlog);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = FLEET_OPERATIONS_TOTAL.set(fleet_operations_total);
    let _ = RUNS_COMPLETED_TOTAL.set(runs_completed_total);
    let _ = RUN_DURATION.set(run_duration);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Exports all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
