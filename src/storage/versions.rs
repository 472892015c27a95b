//! Versioned entity store.
//!
//! Versions are append-only. Each parent owns a gap-free sequence of
//! version numbers starting at 1, and once a parent has any live version
//! exactly one of them is flagged as the default. Both properties are
//! maintained inside a single transaction per write.

use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::{debug, info};

use super::database::{Database, DatabaseError};
use super::records::{new_slug, Version, VersionedEntity};

/// Inserts a new version of `parent` on an open connection or transaction.
///
/// The number is `max(existing) + 1`, counting soft-deleted versions too.
/// The version becomes the default when `make_default` is set or when the
/// parent has no live default yet.
pub(crate) async fn insert_version(
    conn: &mut SqliteConnection,
    parent: &VersionedEntity,
    title: &str,
    description: &str,
    actor: &str,
    make_default: bool,
) -> Result<Version, DatabaseError> {
    validate_text("title", title)?;
    validate_text("description", description)?;

    let table = parent.kind.version_table();

    let (max_number,): (i64,) = sqlx::query_as(&format!(
        "SELECT COALESCE(MAX(number), 0) FROM {} WHERE parent_id = ?1",
        table
    ))
    .bind(parent.id)
    .fetch_one(&mut *conn)
    .await?;

    let (live_defaults,): (i64,) = sqlx::query_as(&format!(
        "SELECT COUNT(*) FROM {} WHERE parent_id = ?1 AND is_default = 1 AND deleted_at IS NULL",
        table
    ))
    .bind(parent.id)
    .fetch_one(&mut *conn)
    .await?;

    let is_default = make_default || live_defaults == 0;
    if is_default {
        sqlx::query(&format!(
            "UPDATE {} SET is_default = 0 WHERE parent_id = ?1",
            table
        ))
        .bind(parent.id)
        .execute(&mut *conn)
        .await?;
    }

    let slug = new_slug();
    let number = max_number + 1;
    let created_at = Utc::now();

    let result = sqlx::query(&format!(
        "INSERT INTO {} (slug, parent_id, title, description, number, is_default, created_by, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        table
    ))
    .bind(&slug)
    .bind(parent.id)
    .bind(title)
    .bind(description)
    .bind(number)
    .bind(is_default)
    .bind(actor)
    .bind(created_at)
    .execute(&mut *conn)
    .await?;

    debug!(
        kind = %parent.kind,
        parent = %parent.slug,
        number = number,
        is_default = is_default,
        "Inserted version"
    );

    Ok(Version {
        id: result.last_insert_rowid(),
        kind: parent.kind,
        parent_id: parent.id,
        slug,
        title: title.to_string(),
        description: description.to_string(),
        number,
        is_default,
        created_by: actor.to_string(),
        created_at,
    })
}

fn validate_text(field: &str, value: &str) -> Result<(), DatabaseError> {
    if value.trim().is_empty() {
        return Err(DatabaseError::Validation(format!(
            "{} cannot be empty",
            field
        )));
    }
    Ok(())
}

impl Database {
    /// Creates a new version of `parent`.
    ///
    /// The first version of a parent is always made the default.
    pub async fn create_version(
        &self,
        parent: &VersionedEntity,
        title: &str,
        description: &str,
        actor: &str,
        make_default: bool,
    ) -> Result<Version, DatabaseError> {
        let mut tx = self.begin_write().await?;
        let version =
            insert_version(&mut *tx, parent, title, description, actor, make_default).await?;
        tx.commit().await?;

        info!(
            kind = %parent.kind,
            parent = %parent.slug,
            version = %version.slug,
            number = version.number,
            is_default = version.is_default,
            "Created version"
        );
        Ok(version)
    }

    /// Makes `version_slug` the default version of `parent`.
    ///
    /// Fails with `NotFound` and changes nothing if the slug does not name
    /// a live version of this parent.
    pub async fn set_default(
        &self,
        parent: &VersionedEntity,
        version_slug: &str,
    ) -> Result<Version, DatabaseError> {
        let table = parent.kind.version_table();
        let mut tx = self.begin_write().await?;

        let row = sqlx::query(&format!(
            "SELECT * FROM {} WHERE slug = ?1 AND parent_id = ?2 AND deleted_at IS NULL",
            table
        ))
        .bind(version_slug)
        .bind(parent.id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            DatabaseError::NotFound(format!(
                "version {} of {} {}",
                version_slug, parent.kind, parent.slug
            ))
        })?;
        let mut version = Version::from_row(&row, parent.kind)?;

        sqlx::query(&format!(
            "UPDATE {} SET is_default = 0 WHERE parent_id = ?1",
            table
        ))
        .bind(parent.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!("UPDATE {} SET is_default = 1 WHERE id = ?1", table))
            .bind(version.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        version.is_default = true;

        info!(
            kind = %parent.kind,
            parent = %parent.slug,
            version = %version.slug,
            number = version.number,
            "Set default version"
        );
        Ok(version)
    }

    /// Looks up a live version of `parent` by slug.
    pub async fn get_version(
        &self,
        parent: &VersionedEntity,
        version_slug: &str,
    ) -> Result<Version, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT * FROM {} WHERE slug = ?1 AND parent_id = ?2 AND deleted_at IS NULL",
            parent.kind.version_table()
        ))
        .bind(version_slug)
        .bind(parent.id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| {
            DatabaseError::NotFound(format!(
                "version {} of {} {}",
                version_slug, parent.kind, parent.slug
            ))
        })?;

        Version::from_row(&row, parent.kind)
    }

    /// Returns the current default version of `parent`, if any.
    pub async fn default_version(
        &self,
        parent: &VersionedEntity,
    ) -> Result<Option<Version>, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT * FROM {} WHERE parent_id = ?1 AND is_default = 1 AND deleted_at IS NULL",
            parent.kind.version_table()
        ))
        .bind(parent.id)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| Version::from_row(&row, parent.kind))
            .transpose()
    }

    /// Lists the live versions of `parent`, newest first.
    pub async fn list_versions(
        &self,
        parent: &VersionedEntity,
    ) -> Result<Vec<Version>, DatabaseError> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM {} WHERE parent_id = ?1 AND deleted_at IS NULL ORDER BY number DESC",
            parent.kind.version_table()
        ))
        .bind(parent.id)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| Version::from_row(row, parent.kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::records::ParentKind;

    async fn setup() -> (Database, VersionedEntity) {
        let db = Database::connect_in_memory().await.expect("db");
        let project = db.create_project("acme", "web", "Web").await.unwrap();
        let (test, _) = db
            .create_entity(ParentKind::Test, &project, "Login", "Log in", "qa@acme.io")
            .await
            .unwrap();
        (db, test)
    }

    #[tokio::test]
    async fn test_non_default_version_keeps_current_default() {
        let (db, test) = setup().await;

        let v2 = db
            .create_version(&test, "Login", "Draft", "qa@acme.io", false)
            .await
            .unwrap();
        assert_eq!(v2.number, 2);
        assert!(!v2.is_default);

        let default = db.default_version(&test).await.unwrap().unwrap();
        assert_eq!(default.number, 1);
    }

    #[tokio::test]
    async fn test_empty_title_is_rejected() {
        let (db, test) = setup().await;

        let result = db.create_version(&test, "  ", "desc", "qa@acme.io", true).await;
        assert!(matches!(result, Err(DatabaseError::Validation(_))));

        let result = db.create_version(&test, "Title", "", "qa@acme.io", true).await;
        assert!(matches!(result, Err(DatabaseError::Validation(_))));

        assert_eq!(db.list_versions(&test).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_default_unknown_slug_changes_nothing() {
        let (db, test) = setup().await;
        let before = db.default_version(&test).await.unwrap().unwrap();

        let result = db.set_default(&test, "no-such-version").await;
        assert!(matches!(result, Err(DatabaseError::NotFound(_))));

        let after = db.default_version(&test).await.unwrap().unwrap();
        assert_eq!(before.slug, after.slug);
    }

    #[tokio::test]
    async fn test_set_default_rejects_other_parents_version() {
        let (db, test) = setup().await;
        let project = db.get_project("acme", "web").await.unwrap();
        let (other, other_v1) = db
            .create_entity(ParentKind::Test, &project, "Logout", "Log out", "qa@acme.io")
            .await
            .unwrap();

        let result = db.set_default(&test, &other_v1.slug).await;
        assert!(matches!(result, Err(DatabaseError::NotFound(_))));
        assert!(db.default_version(&other).await.unwrap().unwrap().is_default);
    }

    #[tokio::test]
    async fn test_list_versions_newest_first() {
        let (db, test) = setup().await;
        db.create_version(&test, "Login", "v2", "qa@acme.io", true)
            .await
            .unwrap();
        db.create_version(&test, "Login", "v3", "qa@acme.io", false)
            .await
            .unwrap();

        let numbers: Vec<i64> = db
            .list_versions(&test)
            .await
            .unwrap()
            .iter()
            .map(|v| v.number)
            .collect();
        assert_eq!(numbers, vec![3, 2, 1]);
    }
}
