//! Record types persisted by the store.
//!
//! Rows are decoded by hand from `SqliteRow` so status strings are checked
//! against the closed set of values before they reach callers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::database::DatabaseError;

/// Generates a new globally unique slug for versions, parents and runs.
pub fn new_slug() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The two kinds of versioned parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentKind {
    Test,
    Suite,
}

impl ParentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentKind::Test => "test",
            ParentKind::Suite => "suite",
        }
    }

    pub(crate) fn parent_table(&self) -> &'static str {
        match self {
            ParentKind::Test => "tests",
            ParentKind::Suite => "test_suites",
        }
    }

    pub(crate) fn version_table(&self) -> &'static str {
        match self {
            ParentKind::Test => "test_versions",
            ParentKind::Suite => "test_suite_versions",
        }
    }
}

impl fmt::Display for ParentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A project row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(skip)]
    pub id: i64,
    pub slug: String,
    pub organization_slug: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, DatabaseError> {
        Ok(Self {
            id: row.try_get("id")?,
            slug: row.try_get("slug")?,
            organization_slug: row.try_get("organization_slug")?,
            name: row.try_get("name")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// A test or a test suite: the parent that owns a sequence of versions.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedEntity {
    pub kind: ParentKind,
    #[serde(skip)]
    pub id: i64,
    pub slug: String,
    #[serde(skip)]
    pub project_id: i64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl VersionedEntity {
    pub(crate) fn from_row(row: &SqliteRow, kind: ParentKind) -> Result<Self, DatabaseError> {
        Ok(Self {
            kind,
            id: row.try_get("id")?,
            slug: row.try_get("slug")?,
            project_id: row.try_get("project_id")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// An immutable snapshot of a test's or suite's title and description.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    #[serde(skip)]
    pub id: i64,
    #[serde(skip)]
    pub kind: ParentKind,
    #[serde(skip)]
    pub parent_id: i64,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub number: i64,
    pub is_default: bool,
    #[serde(skip)]
    pub created_by: String,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

impl Version {
    pub(crate) fn from_row(row: &SqliteRow, kind: ParentKind) -> Result<Self, DatabaseError> {
        Ok(Self {
            id: row.try_get("id")?,
            kind,
            parent_id: row.try_get("parent_id")?,
            slug: row.try_get("slug")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            number: row.try_get("number")?,
            is_default: row.try_get("is_default")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Execution status of a run.
///
/// Only the worker side moves a run past `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub const ALL: [RunStatus; 4] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Succeeded,
        RunStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            other => Err(DatabaseError::CorruptValue {
                column: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Whether the dispatch message for a run ever reached the queue.
///
/// Tracked separately from [`RunStatus`] so a run stuck in `pending` can be
/// told apart from one whose publish never succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    NotDispatched,
    Dispatched,
    DispatchFailed,
}

impl DispatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchState::NotDispatched => "not_dispatched",
            DispatchState::Dispatched => "dispatched",
            DispatchState::DispatchFailed => "dispatch_failed",
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchState {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_dispatched" => Ok(DispatchState::NotDispatched),
            "dispatched" => Ok(DispatchState::Dispatched),
            "dispatch_failed" => Ok(DispatchState::DispatchFailed),
            other => Err(DatabaseError::CorruptValue {
                column: "dispatch_state",
                value: other.to_string(),
            }),
        }
    }
}

/// Test runs and suite runs share one record shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Test,
    Suite,
}

impl RunKind {
    pub(crate) fn table(&self) -> &'static str {
        match self {
            RunKind::Test => "test_runs",
            RunKind::Suite => "test_suite_runs",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Test => "test",
            RunKind::Suite => "suite",
        }
    }
}

/// A test run or a suite run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    #[serde(skip)]
    pub id: i64,
    pub kind: RunKind,
    pub slug: String,
    pub status: RunStatus,
    pub dispatch_state: DispatchState,
    pub model_slug: String,
    pub model_provider: String,
    #[serde(skip)]
    pub version_id: i64,
    #[serde(skip)]
    pub suite_run_id: Option<i64>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub(crate) fn from_row(row: &SqliteRow, kind: RunKind) -> Result<Self, DatabaseError> {
        let status: String = row.try_get("status")?;
        let dispatch_state: String = row.try_get("dispatch_state")?;
        let suite_run_id = match kind {
            RunKind::Test => row.try_get("test_suite_run_id")?,
            RunKind::Suite => None,
        };

        Ok(Self {
            id: row.try_get("id")?,
            kind,
            slug: row.try_get("slug")?,
            status: status.parse()?,
            dispatch_state: dispatch_state.parse()?,
            model_slug: row.try_get("model_slug")?,
            model_provider: row.try_get("model_provider")?,
            version_id: row.try_get("version_id")?,
            suite_run_id,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Per-status child counts of a suite run, computed at read time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounts {
    pub total_runs: usize,
    pub pending_runs: usize,
    pub running_runs: usize,
    pub successful_runs: usize,
    pub failed_runs: usize,
}

impl RunCounts {
    /// Folds child statuses into counts.
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = RunStatus>,
    {
        statuses.into_iter().fold(Self::default(), |mut acc, status| {
            acc.total_runs += 1;
            match status {
                RunStatus::Pending => acc.pending_runs += 1,
                RunStatus::Running => acc.running_runs += 1,
                RunStatus::Succeeded => acc.successful_runs += 1,
                RunStatus::Failed => acc.failed_runs += 1,
            }
            acc
        })
    }

    /// Aggregate status of the owning suite run.
    ///
    /// All succeeded: succeeded. All terminal with at least one failure:
    /// failed. Nothing started yet: pending. Anything else: running.
    pub fn aggregate_status(&self) -> RunStatus {
        let terminal = self.successful_runs + self.failed_runs;
        if self.total_runs > 0 && self.successful_runs == self.total_runs {
            RunStatus::Succeeded
        } else if self.total_runs > 0 && terminal == self.total_runs {
            RunStatus::Failed
        } else if self.pending_runs == self.total_runs {
            RunStatus::Pending
        } else {
            RunStatus::Running
        }
    }
}

/// A suite run with its children and derived counts.
///
/// The stored suite-run status is never advanced, so `suite_run.status` is
/// replaced with the status derived from the children.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteRunSummary {
    pub suite_run: Run,
    pub status: RunStatus,
    pub counts: RunCounts,
    pub test_runs: Vec<Run>,
}

impl SuiteRunSummary {
    pub fn new(mut suite_run: Run, test_runs: Vec<Run>) -> Self {
        let counts = RunCounts::from_statuses(test_runs.iter().map(|r| r.status));
        let status = counts.aggregate_status();
        suite_run.status = status;
        Self {
            status,
            suite_run,
            counts,
            test_runs,
        }
    }
}

/// A child test run created by suite fan-out, with the context a
/// dispatcher needs to describe it.
#[derive(Debug, Clone)]
pub struct ChildRun {
    pub run: Run,
    pub test_slug: String,
    pub version: Version,
}

/// Result of creating a suite run.
#[derive(Debug, Clone)]
pub struct SuiteRunCreated {
    pub suite_run: Run,
    pub children: Vec<ChildRun>,
}
