use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};

use crate::common::{SourceId, SourceVersionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "version_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    #[default]
    Building,
    Active,
    Archived,
}

impl std::fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionStatus::Building => write!(f, "building"),
            VersionStatus::Active => write!(f, "active"),
            VersionStatus::Archived => write!(f, "archived"),
        }
    }
}

/// Blue/green snapshot of a source's capability data.
///
/// Created as `building`; only the publisher flips it to `active`, and only
/// while demoting whatever was active before.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SourceVersion {
    pub id: SourceVersionId,
    pub source_id: SourceId,
    pub version_number: i32,
    pub status: VersionStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub commit_message: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SourceVersion {
    pub fn building(
        source_id: SourceId,
        version_number: i32,
        commit_message: Option<String>,
        created_by: Option<String>,
    ) -> Self {
        Self {
            id: SourceVersionId::new(),
            source_id,
            version_number,
            status: VersionStatus::Building,
            published_at: None,
            commit_message,
            created_by,
            created_at: Utc::now(),
        }
    }

    /// Building and active versions can be (re)published; archived ones can't.
    pub fn is_publishable(&self) -> bool {
        self.status != VersionStatus::Archived
    }
}

// =============================================================================
// SQL Queries
// =============================================================================

impl SourceVersion {
    pub async fn find_by_id(id: SourceVersionId, pool: &PgPool) -> Result<Option<Self>> {
        let version =
            sqlx::query_as::<_, SourceVersion>("SELECT * FROM source_versions WHERE id = $1")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(version)
    }

    pub async fn find_active(source_id: SourceId, pool: &PgPool) -> Result<Option<Self>> {
        let version = sqlx::query_as::<_, SourceVersion>(
            "SELECT * FROM source_versions WHERE source_id = $1 AND status = 'active'",
        )
        .bind(source_id)
        .fetch_optional(pool)
        .await?;
        Ok(version)
    }

    pub async fn find_for_source(source_id: SourceId, pool: &PgPool) -> Result<Vec<Self>> {
        let versions = sqlx::query_as::<_, SourceVersion>(
            "SELECT * FROM source_versions WHERE source_id = $1 ORDER BY version_number",
        )
        .bind(source_id)
        .fetch_all(pool)
        .await?;
        Ok(versions)
    }

    /// Insert a `building` version with the next version number.
    ///
    /// The caller must hold the source row lock (see `Source::upsert_locked`)
    /// so the `MAX + 1` read can't race another insert.
    pub async fn insert_next_building(
        source_id: SourceId,
        commit_message: Option<&str>,
        created_by: Option<&str>,
        conn: &mut PgConnection,
    ) -> Result<Self> {
        let version = sqlx::query_as::<_, SourceVersion>(
            r#"
            INSERT INTO source_versions (id, source_id, version_number, status, commit_message, created_by)
            SELECT $1, $2, COALESCE(MAX(version_number), 0) + 1, 'building'::version_status, $3, $4
            FROM source_versions
            WHERE source_id = $2
            RETURNING *
            "#,
        )
        .bind(SourceVersionId::new())
        .bind(source_id)
        .bind(commit_message)
        .bind(created_by)
        .fetch_one(conn)
        .await?;
        Ok(version)
    }

    /// Demote every active version of the source except `keep`.
    pub async fn archive_active(
        source_id: SourceId,
        keep: SourceVersionId,
        conn: &mut PgConnection,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE source_versions
            SET status = 'archived'
            WHERE source_id = $1 AND status = 'active' AND id <> $2
            "#,
        )
        .bind(source_id)
        .bind(keep)
        .execute(conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// Flip a non-archived version of `source_id` to `active`.
    pub async fn activate(
        id: SourceVersionId,
        source_id: SourceId,
        conn: &mut PgConnection,
    ) -> Result<Option<Self>> {
        let version = sqlx::query_as::<_, SourceVersion>(
            r#"
            UPDATE source_versions
            SET status = 'active',
                published_at = NOW()
            WHERE id = $1
              AND source_id = $2
              AND status IN ('building', 'active')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(source_id)
        .fetch_optional(conn)
        .await?;
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_versions_start_building() {
        let version = SourceVersion::building(SourceId::new(), 1, None, Some("worker".into()));
        assert_eq!(version.status, VersionStatus::Building);
        assert!(version.published_at.is_none());
        assert!(version.is_publishable());
    }

    #[test]
    fn archived_versions_cannot_be_published() {
        let mut version = SourceVersion::building(SourceId::new(), 3, None, None);
        version.status = VersionStatus::Archived;
        assert!(!version.is_publishable());
    }
}
