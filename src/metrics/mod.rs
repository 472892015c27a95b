//! Prometheus metrics for dispatch, routing, fleet scaling and run execution.
//!
//! ```ignore
//! use flowrun::metrics::{export_metrics, init_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! MetricsCollector::new().update_active_workers(4);
//! println!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, REGISTRY};
