//! SQLite database client.
//!
//! Owns the connection pool and the parent records (projects, tests,
//! suites and suite membership). Version and run operations are defined
//! in the sibling `versions` and `runs` modules as further `impl Database`
//! blocks.

use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::info;

use super::migrations::{MigrationError, MigrationRunner};
use super::records::{new_slug, ParentKind, Project, Version, VersionedEntity};
use super::versions::insert_version;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Input rejected before anything was written.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A suite version has no runnable tests bound to it.
    #[error("No tests found in suite version {0}")]
    NoTestsInVersion(String),

    /// A stored value is outside its closed set.
    #[error("Unexpected value '{value}' in column {column}")]
    CorruptValue { column: &'static str, value: String },

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// SQLite database client.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if missing) the database at `database_url`.
    ///
    /// Accepts `sqlite://path/to/file.db` URLs or a plain file path.
    pub async fn connect(database_url: &str) -> Result<Self, DatabaseError> {
        let url = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite://{}", database_url)
        };

        let opts = SqliteConnectOptions::from_str(&url)
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(opts)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        info!(url = %url, "Database opened");
        Ok(Self { pool })
    }

    /// Opens a private in-memory database with the schema applied.
    ///
    /// The pool holds exactly one connection that is never recycled, since
    /// the database lives only as long as that connection.
    pub async fn connect_in_memory() -> Result<Self, DatabaseError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begins a transaction holding SQLite's write lock from its first statement.
    ///
    /// Under WAL, a deferred transaction that reads and then writes fails with
    /// `SQLITE_BUSY_SNAPSHOT` when another connection commits in between.
    /// Taking the lock first makes concurrent writers wait on the busy timeout.
    pub(crate) async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, DatabaseError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE write_lock SET acquired_at = ?1 WHERE id = 1")
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<usize, DatabaseError> {
        let runner = MigrationRunner::new(self.pool.clone());
        Ok(runner.run_migrations().await?)
    }

    // =========================================================================
    // Projects
    // =========================================================================

    pub async fn create_project(
        &self,
        organization_slug: &str,
        slug: &str,
        name: &str,
    ) -> Result<Project, DatabaseError> {
        if organization_slug.trim().is_empty() || slug.trim().is_empty() {
            return Err(DatabaseError::Validation(
                "organization and project slugs cannot be empty".to_string(),
            ));
        }

        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO projects (slug, organization_slug, name, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(slug)
        .bind(organization_slug)
        .bind(name)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(Project {
            id: result.last_insert_rowid(),
            slug: slug.to_string(),
            organization_slug: organization_slug.to_string(),
            name: name.to_string(),
            created_at,
        })
    }

    pub async fn get_project(
        &self,
        organization_slug: &str,
        slug: &str,
    ) -> Result<Project, DatabaseError> {
        let row = sqlx::query(
            "SELECT * FROM projects WHERE organization_slug = ?1 AND slug = ?2 AND deleted_at IS NULL",
        )
        .bind(organization_slug)
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            DatabaseError::NotFound(format!("project {}/{}", organization_slug, slug))
        })?;

        Project::from_row(&row)
    }

    // =========================================================================
    // Tests and suites
    // =========================================================================

    /// Creates a test or suite together with its first (default) version.
    pub async fn create_entity(
        &self,
        kind: ParentKind,
        project: &Project,
        title: &str,
        description: &str,
        actor: &str,
    ) -> Result<(VersionedEntity, Version), DatabaseError> {
        let mut tx = self.begin_write().await?;

        let slug = new_slug();
        let created_at = Utc::now();
        let sql = format!(
            "INSERT INTO {} (slug, project_id, created_by, created_at) VALUES (?1, ?2, ?3, ?4)",
            kind.parent_table()
        );
        let result = sqlx::query(&sql)
            .bind(&slug)
            .bind(project.id)
            .bind(actor)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;

        let entity = VersionedEntity {
            kind,
            id: result.last_insert_rowid(),
            slug,
            project_id: project.id,
            created_by: actor.to_string(),
            created_at,
        };

        let version = insert_version(&mut *tx, &entity, title, description, actor, true).await?;
        tx.commit().await?;

        info!(
            kind = %kind,
            slug = %entity.slug,
            project = %project.slug,
            "Created versioned entity"
        );
        Ok((entity, version))
    }

    /// Looks up a live test or suite by slug.
    pub async fn get_entity(
        &self,
        kind: ParentKind,
        slug: &str,
    ) -> Result<VersionedEntity, DatabaseError> {
        let sql = format!(
            "SELECT * FROM {} WHERE slug = ?1 AND deleted_at IS NULL",
            kind.parent_table()
        );
        let row = sqlx::query(&sql)
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("{} {}", kind, slug)))?;

        VersionedEntity::from_row(&row, kind)
    }

    /// Looks up a live test or suite by slug within a project.
    pub async fn get_entity_in_project(
        &self,
        kind: ParentKind,
        project: &Project,
        slug: &str,
    ) -> Result<VersionedEntity, DatabaseError> {
        let entity = self.get_entity(kind, slug).await?;
        if entity.project_id != project.id {
            return Err(DatabaseError::NotFound(format!(
                "{} {} in project {}",
                kind, slug, project.slug
            )));
        }
        Ok(entity)
    }

    /// Edits a test or suite by creating a new default version.
    ///
    /// Editing a suite carries the current default version's test bindings
    /// over to the new version.
    pub async fn edit_entity(
        &self,
        entity: &VersionedEntity,
        title: &str,
        description: &str,
        actor: &str,
    ) -> Result<Version, DatabaseError> {
        let mut tx = self.begin_write().await?;

        let previous_default = match entity.kind {
            ParentKind::Suite => {
                let sql = "SELECT id FROM test_suite_versions \
                           WHERE parent_id = ?1 AND is_default = 1 AND deleted_at IS NULL";
                sqlx::query_as::<_, (i64,)>(sql)
                    .bind(entity.id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .map(|(id,)| id)
            }
            ParentKind::Test => None,
        };

        let version = insert_version(&mut *tx, entity, title, description, actor, true).await?;

        if let Some(previous_id) = previous_default {
            sqlx::query(
                "INSERT OR IGNORE INTO test_suite_tests (test_suite_version_id, test_id) \
                 SELECT ?1, test_id FROM test_suite_tests WHERE test_suite_version_id = ?2",
            )
            .bind(version.id)
            .bind(previous_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(
            kind = %entity.kind,
            slug = %entity.slug,
            version = version.number,
            "Edited entity as new default version"
        );
        Ok(version)
    }

    /// Soft-deletes a test or suite and all of its versions.
    pub async fn delete_entity(&self, entity: &VersionedEntity) -> Result<(), DatabaseError> {
        let now = Utc::now();
        let mut tx = self.begin_write().await?;

        let sql = format!(
            "UPDATE {} SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            entity.kind.parent_table()
        );
        let result = sqlx::query(&sql)
            .bind(now)
            .bind(entity.id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!(
                "{} {}",
                entity.kind, entity.slug
            )));
        }

        let sql = format!(
            "UPDATE {} SET deleted_at = ?1 WHERE parent_id = ?2 AND deleted_at IS NULL",
            entity.kind.version_table()
        );
        sqlx::query(&sql)
            .bind(now)
            .bind(entity.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(kind = %entity.kind, slug = %entity.slug, "Soft-deleted entity");
        Ok(())
    }

    // =========================================================================
    // Suite membership
    // =========================================================================

    /// Binds tests to a suite.
    ///
    /// Membership is pinned to a suite version. If the current default
    /// version already has runs, a new default version copying its title
    /// and description is created and the tests are bound there; otherwise
    /// the default version's bindings are replaced in place. Returns the
    /// version the tests are bound to.
    pub async fn set_suite_tests(
        &self,
        suite: &VersionedEntity,
        test_slugs: &[String],
        actor: &str,
    ) -> Result<Version, DatabaseError> {
        if suite.kind != ParentKind::Suite {
            return Err(DatabaseError::Validation(format!(
                "{} is not a suite",
                suite.slug
            )));
        }

        let mut tx = self.begin_write().await?;

        let mut test_ids = Vec::with_capacity(test_slugs.len());
        for slug in test_slugs {
            let id: Option<(i64,)> = sqlx::query_as(
                "SELECT id FROM tests WHERE slug = ?1 AND project_id = ?2 AND deleted_at IS NULL",
            )
            .bind(slug)
            .bind(suite.project_id)
            .fetch_optional(&mut *tx)
            .await?;

            match id {
                Some((id,)) => test_ids.push(id),
                None => return Err(DatabaseError::NotFound(format!("test {}", slug))),
            }
        }

        let row = sqlx::query(
            "SELECT * FROM test_suite_versions \
             WHERE parent_id = ?1 AND is_default = 1 AND deleted_at IS NULL",
        )
        .bind(suite.id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("default version of suite {}", suite.slug)))?;
        let current = Version::from_row(&row, ParentKind::Suite)?;

        let (run_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM test_suite_runs WHERE version_id = ?1")
                .bind(current.id)
                .fetch_one(&mut *tx)
                .await?;

        let target = if run_count > 0 {
            insert_version(
                &mut *tx,
                suite,
                &current.title,
                &current.description,
                actor,
                true,
            )
            .await?
        } else {
            sqlx::query("DELETE FROM test_suite_tests WHERE test_suite_version_id = ?1")
                .bind(current.id)
                .execute(&mut *tx)
                .await?;
            current
        };

        for test_id in test_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO test_suite_tests (test_suite_version_id, test_id) VALUES (?1, ?2)",
            )
            .bind(target.id)
            .bind(test_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(
            suite = %suite.slug,
            version = target.number,
            tests = test_slugs.len(),
            new_version = run_count > 0,
            "Bound tests to suite version"
        );
        Ok(target)
    }

    /// Lists the live tests bound to a suite version.
    pub async fn list_suite_tests(
        &self,
        suite_version: &Version,
    ) -> Result<Vec<VersionedEntity>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT t.* FROM test_suite_tests m \
             JOIN tests t ON t.id = m.test_id AND t.deleted_at IS NULL \
             WHERE m.test_suite_version_id = ?1 ORDER BY m.id",
        )
        .bind(suite_version.id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| VersionedEntity::from_row(row, ParentKind::Test))
            .collect()
    }
}
