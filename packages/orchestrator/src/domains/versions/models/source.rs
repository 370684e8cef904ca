use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};

use crate::common::{SourceId, SourceVersionId};

/// A website whose capability manual is being built.
///
/// `current_version_id` points at the version readers should see; it only
/// changes inside the publish transaction.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    pub base_url: String,
    pub current_version_id: Option<SourceVersionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SourceId::new(),
            name: name.into(),
            base_url: base_url.into(),
            current_version_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// SQL Queries
// =============================================================================

impl Source {
    pub async fn find_by_id(id: SourceId, pool: &PgPool) -> Result<Option<Self>> {
        let source = sqlx::query_as::<_, Source>("SELECT * FROM sources WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(source)
    }

    /// Find or create the source for `base_url` and lock its row.
    ///
    /// `ON CONFLICT DO UPDATE` takes the row lock in both branches, so the
    /// caller's transaction holds the source until commit. Version-number
    /// allocation and publishing both rely on that lock.
    pub async fn upsert_locked(
        name: &str,
        base_url: &str,
        conn: &mut PgConnection,
    ) -> Result<Self> {
        let source = sqlx::query_as::<_, Source>(
            r#"
            INSERT INTO sources (id, name, base_url)
            VALUES ($1, $2, $3)
            ON CONFLICT (base_url) DO UPDATE SET updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(SourceId::new())
        .bind(name)
        .bind(base_url)
        .fetch_one(conn)
        .await?;
        Ok(source)
    }

    pub async fn lock(id: SourceId, conn: &mut PgConnection) -> Result<Option<Self>> {
        let source = sqlx::query_as::<_, Source>("SELECT * FROM sources WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(conn)
            .await?;
        Ok(source)
    }

    pub async fn set_current_version(
        id: SourceId,
        version_id: SourceVersionId,
        conn: &mut PgConnection,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sources SET current_version_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(version_id)
        .execute(conn)
        .await?;
        Ok(())
    }
}
