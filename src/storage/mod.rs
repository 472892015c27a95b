//! Persistent storage for versions, runs and result artifacts.
//!
//! # Overview
//!
//! - **Database**: SQLite client holding projects, tests, suites, their
//!   immutable versions, suite membership, and run records
//! - **Versions**: append-only version sequences with a single default per parent
//! - **Runs**: pending run creation, suite fan-out, status and dispatch state
//! - **Results**: worker-written JSON artifacts keyed by run slug
//! - **Migrations**: idempotent schema application
//!
//! # Usage
//!
//! ```rust,ignore
//! use flowrun::storage::{Database, ParentKind};
//!
//! let db = Database::connect("sqlite://flowrun.db").await?;
//! db.run_migrations().await?;
//!
//! let project = db.create_project("acme", "checkout", "Checkout").await?;
//! let (test, v1) = db
//!     .create_entity(ParentKind::Test, &project, "Login", "Log in as a known user", "qa@acme.io")
//!     .await?;
//! let run = db.create_test_run(&v1, "qa@acme.io", "gpt-4o-mini", "openai").await?;
//! ```

pub mod database;
pub mod migrations;
pub mod records;
pub mod results;
pub mod runs;
pub mod schema;
pub mod versions;

pub use database::{Database, DatabaseError};
pub use migrations::{MigrationError, MigrationRunner};
pub use records::{
    new_slug, ChildRun, DispatchState, ParentKind, Project, Run, RunCounts, RunKind, RunStatus,
    SuiteRunCreated, SuiteRunSummary, Version, VersionedEntity,
};
pub use results::{ModelThought, ResultArtifact, ResultError, ResultStore, ResultView, Screenshot};
