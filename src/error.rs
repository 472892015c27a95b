//! Error types shared across subsystems.
//!
//! - Run dispatch (validation, lookup, record creation)
//! - Worker fleet management
//! - Test execution inside a worker

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::storage::DatabaseError;

/// Errors returned to callers of the run dispatch operations.
///
/// Queue publish failures are not errors here: they are reported per run
/// in the dispatch response and leave the run pending.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No tests found in suite version {0}")]
    NoTestsInVersion(String),

    #[error("Storage error: {0}")]
    Store(DatabaseError),
}

impl From<DatabaseError> for DispatchError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(what) => DispatchError::NotFound(what),
            DatabaseError::Validation(message) => DispatchError::Validation(message),
            DatabaseError::NoTestsInVersion(slug) => DispatchError::NoTestsInVersion(slug),
            other => DispatchError::Store(other),
        }
    }
}

impl From<CatalogError> for DispatchError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::UnknownModel(slug) => DispatchError::UnknownModel(slug),
        }
    }
}

/// Errors from the compute provider hosting workers.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to list workers: {0}")]
    ListFailed(String),

    #[error("Failed to launch worker: {0}")]
    LaunchFailed(String),

    #[error("Failed to decommission worker '{id}': {reason}")]
    DecommissionFailed { id: String, reason: String },
}

/// Errors raised while executing a test run inside a worker.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to start agent: {0}")]
    SpawnFailed(String),

    #[error("Agent exited with non-zero code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error("Agent produced an unreadable result: {0}")]
    MalformedOutput(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_errors_map_to_dispatch_errors() {
        let err: DispatchError = DatabaseError::NotFound("test 'abc'".to_string()).into();
        assert!(matches!(err, DispatchError::NotFound(ref what) if what == "test 'abc'"));

        let err: DispatchError = DatabaseError::NoTestsInVersion("v1".to_string()).into();
        assert!(matches!(err, DispatchError::NoTestsInVersion(_)));

        let err: DispatchError = DatabaseError::ConnectionFailed("refused".to_string()).into();
        assert!(matches!(err, DispatchError::Store(_)));
    }

    #[test]
    fn test_unknown_model_maps() {
        let err: DispatchError = CatalogError::UnknownModel("gpt-0".to_string()).into();
        assert_eq!(err.to_string(), "Unknown model: gpt-0");
    }

    #[test]
    fn test_executor_error_display() {
        let err = ExecutorError::NonZeroExit {
            code: 2,
            stderr: "browser crashed".to_string(),
        };
        assert!(err.to_string().contains("browser crashed"));
    }
}
