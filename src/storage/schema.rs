//! Database schema constants.
//!
//! All tables live in a single SQLite database. Version and run rows are
//! never hard-deleted; parents and versions carry a `deleted_at` marker
//! instead.

/// Projects scope tests and suites and carry the organization identifier
/// copied into every dispatched message.
pub const CREATE_PROJECTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    slug                TEXT    NOT NULL,
    organization_slug   TEXT    NOT NULL,
    name                TEXT    NOT NULL,
    created_at          TEXT    NOT NULL,
    deleted_at          TEXT,
    UNIQUE (organization_slug, slug)
)
"#;

/// Tests are the parents of test versions.
pub const CREATE_TESTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tests (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    slug        TEXT    NOT NULL UNIQUE,
    project_id  INTEGER NOT NULL REFERENCES projects(id),
    created_by  TEXT    NOT NULL,
    created_at  TEXT    NOT NULL,
    deleted_at  TEXT
)
"#;

/// Immutable test versions. Only `is_default` and `deleted_at` ever change.
pub const CREATE_TEST_VERSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS test_versions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    slug        TEXT    NOT NULL UNIQUE,
    parent_id   INTEGER NOT NULL REFERENCES tests(id),
    title       TEXT    NOT NULL,
    description TEXT    NOT NULL,
    number      INTEGER NOT NULL CHECK (number >= 1),
    is_default  INTEGER NOT NULL DEFAULT 0,
    created_by  TEXT    NOT NULL,
    created_at  TEXT    NOT NULL,
    deleted_at  TEXT
)
"#;

/// Test suites are the parents of suite versions.
pub const CREATE_TEST_SUITES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS test_suites (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    slug        TEXT    NOT NULL UNIQUE,
    project_id  INTEGER NOT NULL REFERENCES projects(id),
    created_by  TEXT    NOT NULL,
    created_at  TEXT    NOT NULL,
    deleted_at  TEXT
)
"#;

/// Immutable suite versions.
pub const CREATE_TEST_SUITE_VERSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS test_suite_versions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    slug        TEXT    NOT NULL UNIQUE,
    parent_id   INTEGER NOT NULL REFERENCES test_suites(id),
    title       TEXT    NOT NULL,
    description TEXT    NOT NULL,
    number      INTEGER NOT NULL CHECK (number >= 1),
    is_default  INTEGER NOT NULL DEFAULT 0,
    created_by  TEXT    NOT NULL,
    created_at  TEXT    NOT NULL,
    deleted_at  TEXT
)
"#;

/// Membership is pinned to a suite version, not to the suite.
pub const CREATE_TEST_SUITE_TESTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS test_suite_tests (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    test_suite_version_id   INTEGER NOT NULL REFERENCES test_suite_versions(id),
    test_id                 INTEGER NOT NULL REFERENCES tests(id),
    UNIQUE (test_suite_version_id, test_id)
)
"#;

/// Suite runs. Aggregate counts are derived from the child test runs.
pub const CREATE_TEST_SUITE_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS test_suite_runs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    slug            TEXT    NOT NULL UNIQUE,
    status          TEXT    NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'running', 'succeeded', 'failed')),
    dispatch_state  TEXT    NOT NULL DEFAULT 'not_dispatched'
                    CHECK (dispatch_state IN ('not_dispatched', 'dispatched', 'dispatch_failed')),
    model_slug      TEXT    NOT NULL,
    model_provider  TEXT    NOT NULL,
    version_id      INTEGER NOT NULL REFERENCES test_suite_versions(id),
    created_by      TEXT    NOT NULL,
    created_at      TEXT    NOT NULL,
    updated_at      TEXT    NOT NULL
)
"#;

/// Test runs, optionally owned by a suite run. `claimed_by` holds the id
/// of the queue delivery executing the run.
pub const CREATE_TEST_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS test_runs (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    slug                TEXT    NOT NULL UNIQUE,
    status              TEXT    NOT NULL DEFAULT 'pending'
                        CHECK (status IN ('pending', 'running', 'succeeded', 'failed')),
    dispatch_state      TEXT    NOT NULL DEFAULT 'not_dispatched'
                        CHECK (dispatch_state IN ('not_dispatched', 'dispatched', 'dispatch_failed')),
    model_slug          TEXT    NOT NULL,
    model_provider      TEXT    NOT NULL,
    version_id          INTEGER NOT NULL REFERENCES test_versions(id),
    test_suite_run_id   INTEGER REFERENCES test_suite_runs(id),
    claimed_by          TEXT,
    created_by          TEXT    NOT NULL,
    created_at          TEXT    NOT NULL,
    updated_at          TEXT    NOT NULL
)
"#;

/// Single-row table every multi-statement write touches first, so the
/// transaction holds SQLite's write lock before it reads anything.
pub const CREATE_WRITE_LOCK_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS write_lock (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    acquired_at TEXT
);
INSERT OR IGNORE INTO write_lock (id) VALUES (1)
"#;

/// Indexes for the lookups the dispatcher and readers perform.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_test_versions_parent ON test_versions(parent_id);
CREATE INDEX IF NOT EXISTS idx_test_suite_versions_parent ON test_suite_versions(parent_id);
CREATE INDEX IF NOT EXISTS idx_test_suite_tests_version ON test_suite_tests(test_suite_version_id);
CREATE INDEX IF NOT EXISTS idx_test_runs_suite_run ON test_runs(test_suite_run_id);
CREATE INDEX IF NOT EXISTS idx_test_runs_dispatch_state ON test_runs(dispatch_state);
CREATE INDEX IF NOT EXISTS idx_test_runs_status ON test_runs(status)
"#;

/// Returns all schema creation statements in dependency order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_PROJECTS_TABLE,
        CREATE_TESTS_TABLE,
        CREATE_TEST_VERSIONS_TABLE,
        CREATE_TEST_SUITES_TABLE,
        CREATE_TEST_SUITE_VERSIONS_TABLE,
        CREATE_TEST_SUITE_TESTS_TABLE,
        CREATE_TEST_SUITE_RUNS_TABLE,
        CREATE_TEST_RUNS_TABLE,
        CREATE_INDEXES,
        CREATE_WRITE_LOCK_TABLE,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 10);

        let position = |needle: &str| {
            statements
                .iter()
                .position(|s| s.contains(needle))
                .expect("statement present")
        };
        assert!(position("TABLE IF NOT EXISTS tests ") < position("test_versions ("));
        assert!(position("test_suite_runs (") < position("test_runs ("));
    }

    #[test]
    fn test_run_tables_restrict_status_values() {
        for table in [CREATE_TEST_RUNS_TABLE, CREATE_TEST_SUITE_RUNS_TABLE] {
            assert!(table.contains("'pending', 'running', 'succeeded', 'failed'"));
            assert!(table.contains("'not_dispatched', 'dispatched', 'dispatch_failed'"));
        }
    }
}
