//! flowrun: versioned test and suite runs dispatched to an autoscaled worker fleet.
//!
//! A run pins an immutable version of a test (or of a suite and each of its
//! tests), is recorded as `pending`, and is handed to workers through a
//! message queue. The worker fleet is sized to the queue backlog.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod fleet;
pub mod metrics;
pub mod scheduler;
pub mod storage;

pub use config::{ConfigError, ServiceConfig};
pub use error::{DispatchError, ExecutorError, FleetError};
