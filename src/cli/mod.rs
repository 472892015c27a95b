//! Command-line interface for flowrun.
//!
//! Provides commands for managing tests and suites, dispatching runs,
//! reading results, and running the router, worker and scaler processes.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
