//! Run dispatch and queue-driven execution.
//!
//! - **Dispatcher**: creates pending runs and publishes one self-describing
//!   `test-run` message per test run
//! - **TaskRouter**: forwards `test-run` messages from the intake queue to the
//!   execution queue and triggers fleet scaling as traffic arrives
//! - **WorkerPool**: drains the execution queue, runs tests through a
//!   `TestExecutor`, stores artifacts and advances run status
//! - **RedisQueue**: at-least-once queue with processing and dead-letter lists
//!
//! # Architecture
//!
//! ```text
//!   Dispatcher ──▶ intake queue ──▶ TaskRouter ──▶ execution queue ──▶ Workers
//!        │                              │                                 │
//!        ▼                              ▼                                 ▼
//!   run records                   FleetScaler.tick()               status + artifacts
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use flowrun::scheduler::{Dispatcher, RedisQueue, RunRequest, RunTarget};
//! use flowrun::storage::Database;
//!
//! let db = Database::connect("flowrun.db").await?;
//! let intake = Arc::new(RedisQueue::connect("redis://localhost:6379", "flowrun:intake").await?);
//! let dispatcher = Dispatcher::new(db, intake);
//!
//! let target = RunTarget::new("acme", "checkout", "login-test", "qa@acme.io");
//! let created = dispatcher
//!     .dispatch_test_run(&target, &RunRequest::new("gpt-4o-mini"))
//!     .await?;
//! ```

pub mod dispatcher;
pub mod executor;
pub mod message;
pub mod queue;
pub mod router;
pub mod worker_pool;

pub use dispatcher::{
    ChildDispatch, DispatchOutcome, Dispatcher, RunRequest, RunTarget, SuiteRunDispatch,
    TestRunDispatch,
};
pub use executor::{CommandExecutor, TestExecutor};
pub use message::{Envelope, MessageError, TestRunMessage, DEFAULT_MAX_ATTEMPTS, TEST_RUN_TASK};
pub use queue::{MessageQueue, QueueError, QueueStats, RedisQueue};
pub use router::{RouteOutcome, RouterError, TaskRouter};
pub use worker_pool::{PoolError, PoolStats, RunWorker, WorkOutcome, WorkerPool, WorkerPoolConfig};
