//! Run record store.
//!
//! Runs are created `pending` by the dispatcher. Only the worker side moves
//! a run's status further; the dispatcher records whether its message was
//! published through the separate dispatch state.

use chrono::Utc;
use sqlx::{Row, SqliteConnection};
use tracing::{info, warn};

use super::database::{Database, DatabaseError};
use super::records::{
    new_slug, ChildRun, DispatchState, ParentKind, Run, RunKind, RunStatus, SuiteRunCreated,
    SuiteRunSummary, Version,
};

async fn insert_run(
    conn: &mut SqliteConnection,
    kind: RunKind,
    version_id: i64,
    suite_run_id: Option<i64>,
    actor: &str,
    model_slug: &str,
    model_provider: &str,
) -> Result<Run, DatabaseError> {
    let slug = new_slug();
    let now = Utc::now();

    let result = match kind {
        RunKind::Test => {
            sqlx::query(
                "INSERT INTO test_runs \
                 (slug, model_slug, model_provider, version_id, test_suite_run_id, created_by, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            )
            .bind(&slug)
            .bind(model_slug)
            .bind(model_provider)
            .bind(version_id)
            .bind(suite_run_id)
            .bind(actor)
            .bind(now)
            .execute(&mut *conn)
            .await?
        }
        RunKind::Suite => {
            sqlx::query(
                "INSERT INTO test_suite_runs \
                 (slug, model_slug, model_provider, version_id, created_by, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            )
            .bind(&slug)
            .bind(model_slug)
            .bind(model_provider)
            .bind(version_id)
            .bind(actor)
            .bind(now)
            .execute(&mut *conn)
            .await?
        }
    };

    Ok(Run {
        id: result.last_insert_rowid(),
        kind,
        slug,
        status: RunStatus::Pending,
        dispatch_state: DispatchState::NotDispatched,
        model_slug: model_slug.to_string(),
        model_provider: model_provider.to_string(),
        version_id,
        suite_run_id,
        created_by: actor.to_string(),
        created_at: now,
        updated_at: now,
    })
}

impl Database {
    /// Creates a pending test run against a test version.
    pub async fn create_test_run(
        &self,
        version: &Version,
        actor: &str,
        model_slug: &str,
        model_provider: &str,
    ) -> Result<Run, DatabaseError> {
        if version.kind != ParentKind::Test {
            return Err(DatabaseError::Validation(format!(
                "version {} is not a test version",
                version.slug
            )));
        }

        let mut conn = self.pool().acquire().await?;
        let run = insert_run(
            &mut *conn,
            RunKind::Test,
            version.id,
            None,
            actor,
            model_slug,
            model_provider,
        )
        .await?;

        info!(
            run_slug = %run.slug,
            version = %version.slug,
            model = %model_slug,
            "Created test run"
        );
        Ok(run)
    }

    /// Creates a pending suite run plus one pending child test run per test
    /// bound to the suite version, all in one transaction.
    ///
    /// Each child targets its test's current default version. Tests without
    /// a live default version are skipped. When no child would be created
    /// the call fails with `NoTestsInVersion` and writes nothing.
    pub async fn create_suite_run(
        &self,
        version: &Version,
        actor: &str,
        model_slug: &str,
        model_provider: &str,
    ) -> Result<SuiteRunCreated, DatabaseError> {
        if version.kind != ParentKind::Suite {
            return Err(DatabaseError::Validation(format!(
                "version {} is not a suite version",
                version.slug
            )));
        }

        let mut tx = self.begin_write().await?;

        let rows = sqlx::query(
            "SELECT t.slug AS test_slug, v.* \
             FROM test_suite_tests m \
             JOIN tests t ON t.id = m.test_id AND t.deleted_at IS NULL \
             JOIN test_versions v ON v.parent_id = t.id AND v.is_default = 1 AND v.deleted_at IS NULL \
             WHERE m.test_suite_version_id = ?1 \
             ORDER BY m.id",
        )
        .bind(version.id)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            warn!(suite_version = %version.slug, "Refusing suite run with no tests");
            return Err(DatabaseError::NoTestsInVersion(version.slug.clone()));
        }

        let suite_run = insert_run(
            &mut *tx,
            RunKind::Suite,
            version.id,
            None,
            actor,
            model_slug,
            model_provider,
        )
        .await?;

        let mut children = Vec::with_capacity(rows.len());
        for row in &rows {
            let test_slug: String = row.try_get("test_slug")?;
            let test_version = Version::from_row(row, ParentKind::Test)?;
            let run = insert_run(
                &mut *tx,
                RunKind::Test,
                test_version.id,
                Some(suite_run.id),
                actor,
                model_slug,
                model_provider,
            )
            .await?;

            children.push(ChildRun {
                run,
                test_slug,
                version: test_version,
            });
        }

        tx.commit().await?;

        info!(
            suite_run_slug = %suite_run.slug,
            suite_version = %version.slug,
            children = children.len(),
            model = %model_slug,
            "Created suite run"
        );
        Ok(SuiteRunCreated {
            suite_run,
            children,
        })
    }

    /// Sets a run's execution status. Used by the worker side.
    pub async fn update_status(
        &self,
        kind: RunKind,
        run_slug: &str,
        status: RunStatus,
    ) -> Result<Run, DatabaseError> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = ?1, updated_at = ?2 WHERE slug = ?3",
            kind.table()
        ))
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(run_slug)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!(
                "{} run {}",
                kind.as_str(),
                run_slug
            )));
        }

        info!(run_slug = %run_slug, status = %status, "Updated run status");
        self.get_run(kind, run_slug).await
    }

    /// Moves a test run to `running` on behalf of the delivery `claim_id`.
    ///
    /// The claim succeeds when the run is `pending`, or already `running`
    /// under the same `claim_id` (a retry of the same message). Returns
    /// `None` when another delivery holds the run or it has finished.
    pub async fn claim_test_run(
        &self,
        run_slug: &str,
        claim_id: &str,
    ) -> Result<Option<Run>, DatabaseError> {
        let result = sqlx::query(
            "UPDATE test_runs SET status = 'running', claimed_by = ?1, updated_at = ?2 \
             WHERE slug = ?3 AND (status = 'pending' OR (status = 'running' AND claimed_by = ?1))",
        )
        .bind(claim_id)
        .bind(Utc::now())
        .bind(run_slug)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        info!(run_slug = %run_slug, claim_id = %claim_id, "Claimed test run");
        self.get_test_run(run_slug).await.map(Some)
    }

    /// Records whether a run's dispatch message reached the queue.
    pub async fn mark_dispatch_state(
        &self,
        kind: RunKind,
        run_slug: &str,
        state: DispatchState,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET dispatch_state = ?1, updated_at = ?2 WHERE slug = ?3",
            kind.table()
        ))
        .bind(state.as_str())
        .bind(Utc::now())
        .bind(run_slug)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!(
                "{} run {}",
                kind.as_str(),
                run_slug
            )));
        }
        Ok(())
    }

    pub async fn get_run(&self, kind: RunKind, run_slug: &str) -> Result<Run, DatabaseError> {
        let row = sqlx::query(&format!("SELECT * FROM {} WHERE slug = ?1", kind.table()))
            .bind(run_slug)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| {
                DatabaseError::NotFound(format!("{} run {}", kind.as_str(), run_slug))
            })?;

        Run::from_row(&row, kind)
    }

    pub async fn get_test_run(&self, run_slug: &str) -> Result<Run, DatabaseError> {
        self.get_run(RunKind::Test, run_slug).await
    }

    pub async fn get_suite_run(&self, run_slug: &str) -> Result<Run, DatabaseError> {
        self.get_run(RunKind::Suite, run_slug).await
    }

    /// Lists the child test runs of a suite run in creation order.
    pub async fn suite_run_children(&self, suite_run: &Run) -> Result<Vec<Run>, DatabaseError> {
        let rows = sqlx::query("SELECT * FROM test_runs WHERE test_suite_run_id = ?1 ORDER BY id")
            .bind(suite_run.id)
            .fetch_all(self.pool())
            .await?;

        rows.iter()
            .map(|row| Run::from_row(row, RunKind::Test))
            .collect()
    }

    /// Loads a suite run with its children and counts derived from them.
    pub async fn suite_run_summary(&self, run_slug: &str) -> Result<SuiteRunSummary, DatabaseError> {
        let suite_run = self.get_suite_run(run_slug).await?;
        let children = self.suite_run_children(&suite_run).await?;
        Ok(SuiteRunSummary::new(suite_run, children))
    }

    /// Lists test runs in a given dispatch state, oldest first.
    ///
    /// `dispatch_failed` runs still `pending` are the ones a reconciliation
    /// pass would re-publish.
    pub async fn list_runs_by_dispatch_state(
        &self,
        state: DispatchState,
    ) -> Result<Vec<Run>, DatabaseError> {
        let rows = sqlx::query("SELECT * FROM test_runs WHERE dispatch_state = ?1 ORDER BY id")
            .bind(state.as_str())
            .fetch_all(self.pool())
            .await?;

        rows.iter()
            .map(|row| Run::from_row(row, RunKind::Test))
            .collect()
    }
}
