//! Database migration helpers.
//!
//! Schema parts are applied in order and recorded in `_migrations`, so
//! running the migrations against an existing database is a no-op.

use sqlx::SqlitePool;
use thiserror::Error;

use super::schema;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration script failed to execute.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Migration runner for applying schema changes.
pub struct MigrationRunner {
    pool: SqlitePool,
}

impl MigrationRunner {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Runs all pending migrations.
    pub async fn run_migrations(&self) -> Result<usize, MigrationError> {
        self.ensure_migrations_table().await?;

        let mut applied = 0;
        for (idx, statement) in schema::all_schema_statements().iter().enumerate() {
            let migration_name = format!("schema_v1_part_{}", idx);

            if !self.is_migration_applied(&migration_name).await? {
                self.apply_migration(&migration_name, statement).await?;
                applied += 1;
            }
        }

        if applied > 0 {
            tracing::info!(applied = applied, "Applied schema migrations");
        }

        Ok(applied)
    }

    async fn ensure_migrations_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL UNIQUE,
                applied_at  TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_migration_applied(&self, name: &str) -> Result<bool, MigrationError> {
        let result: Option<(i64,)> = sqlx::query_as("SELECT id FROM _migrations WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(result.is_some())
    }

    async fn apply_migration(&self, name: &str, sql: &str) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::MigrationFailed(format!("{}: {}", name, e)))?;

        sqlx::query("INSERT INTO _migrations (name) VALUES (?1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    /// Returns the names of applied migrations in application order.
    pub async fn list_applied_migrations(&self) -> Result<Vec<String>, MigrationError> {
        self.ensure_migrations_table().await?;

        let names: Vec<(String,)> = sqlx::query_as("SELECT name FROM _migrations ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(names.into_iter().map(|(name,)| name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite")
    }

    #[test]
    fn test_migration_error_display() {
        let err = MigrationError::MigrationFailed("test error".to_string());
        assert!(err.to_string().contains("test error"));
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let runner = MigrationRunner::new(memory_pool().await);

        let first = runner.run_migrations().await.expect("first run");
        assert_eq!(first, schema::all_schema_statements().len());

        let second = runner.run_migrations().await.expect("second run");
        assert_eq!(second, 0);

        let applied = runner.list_applied_migrations().await.expect("list");
        assert_eq!(applied.first().map(String::as_str), Some("schema_v1_part_0"));
        assert_eq!(applied.len(), first);
    }
}
