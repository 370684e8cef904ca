//! Recording task model and its queue statements.
//!
//! Every state change here is a single conditional `UPDATE`. Claims skip
//! locked rows, and follow-up updates (heartbeat, completion, failure) match on
//! `status = 'running' AND worker_id = $owner`, so a worker that lost its
//! claim to stale recovery can't overwrite whoever holds the task now.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};

use crate::common::{BuildTaskId, RecordingTaskId, SourceId, SourceVersionId};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "recording_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl RecordingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RecordingStatus::Completed | RecordingStatus::Failed)
    }
}

impl std::fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordingStatus::Pending => write!(f, "pending"),
            RecordingStatus::Running => write!(f, "running"),
            RecordingStatus::Completed => write!(f, "completed"),
            RecordingStatus::Failed => write!(f, "failed"),
        }
    }
}

// ============================================================================
// Config
// ============================================================================

/// Typed view of `recording_tasks.config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingTaskConfig {
    /// Version this task records into.
    pub source_version_id: SourceVersionId,

    /// Page the executor should open first, when the chunk doesn't imply one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_url: Option<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RecordingTaskConfig {
    pub fn for_version(source_version_id: SourceVersionId) -> Self {
        Self {
            source_version_id,
            start_url: None,
            extra: serde_json::Map::new(),
        }
    }
}

// ============================================================================
// Model
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecordingTask {
    pub id: RecordingTaskId,
    pub build_task_id: BuildTaskId,
    pub source_id: SourceId,
    pub chunk_ids: Json<Vec<i64>>,
    pub status: RecordingStatus,
    pub attempt_count: i32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub config: Json<RecordingTaskConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RecordingTask {
    pub fn new_pending(
        build_task_id: BuildTaskId,
        source_id: SourceId,
        chunk_ids: Vec<i64>,
        config: RecordingTaskConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RecordingTaskId::new(),
            build_task_id,
            source_id,
            chunk_ids: Json(chunk_ids),
            status: RecordingStatus::Pending,
            attempt_count: 0,
            last_heartbeat: None,
            worker_id: None,
            error_message: None,
            config: Json(config),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn source_version_id(&self) -> SourceVersionId {
        self.config.source_version_id
    }

    /// Status after one more failed attempt.
    pub fn status_after_failure(attempt_count: i32, max_attempts: i32) -> RecordingStatus {
        if attempt_count + 1 < max_attempts {
            RecordingStatus::Pending
        } else {
            RecordingStatus::Failed
        }
    }

    /// Status (and attempt count) a stale sweep assigns to a running task.
    ///
    /// The lost run counts as an attempt when the task is re-queued; a task
    /// already at the limit fails without its count changing.
    pub fn recovered_from_stale(attempt_count: i32, max_attempts: i32) -> (RecordingStatus, i32) {
        if attempt_count < max_attempts {
            (RecordingStatus::Pending, attempt_count + 1)
        } else {
            (RecordingStatus::Failed, attempt_count)
        }
    }
}

/// Per-status totals for one build task's batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow)]
pub struct RecordingTaskCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

impl RecordingTaskCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.running + self.completed + self.failed
    }

    /// Tasks not yet in a terminal state.
    pub fn outstanding(&self) -> i64 {
        self.pending + self.running
    }

    pub fn all_terminal(&self) -> bool {
        self.outstanding() == 0
    }
}

/// What one stale sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow)]
pub struct StaleRecoveryReport {
    pub requeued: i64,
    pub failed: i64,
}

impl StaleRecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.failed == 0
    }
}

// =============================================================================
// SQL Queries
// =============================================================================

impl RecordingTask {
    pub async fn insert(&self, conn: &mut PgConnection) -> Result<Self> {
        let task = sqlx::query_as::<_, RecordingTask>(
            r#"
            INSERT INTO recording_tasks (
                id, build_task_id, source_id, chunk_ids, status, attempt_count,
                last_heartbeat, worker_id, error_message, config, created_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(self.build_task_id)
        .bind(self.source_id)
        .bind(&self.chunk_ids)
        .bind(self.status)
        .bind(self.attempt_count)
        .bind(self.last_heartbeat)
        .bind(&self.worker_id)
        .bind(&self.error_message)
        .bind(&self.config)
        .bind(self.created_at)
        .bind(self.updated_at)
        .bind(self.completed_at)
        .fetch_one(conn)
        .await?;
        Ok(task)
    }

    pub async fn find_by_id(id: RecordingTaskId, pool: &PgPool) -> Result<Option<Self>> {
        let task =
            sqlx::query_as::<_, RecordingTask>("SELECT * FROM recording_tasks WHERE id = $1")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(task)
    }

    pub async fn find_for_build_task(build_task_id: BuildTaskId, pool: &PgPool) -> Result<Vec<Self>> {
        let tasks = sqlx::query_as::<_, RecordingTask>(
            "SELECT * FROM recording_tasks WHERE build_task_id = $1 ORDER BY created_at, id",
        )
        .bind(build_task_id)
        .fetch_all(pool)
        .await?;
        Ok(tasks)
    }

    /// Claim the oldest pending task for `worker_id`.
    ///
    /// Returns `None` when nothing is pending or every candidate was taken by
    /// a concurrent claimant; losing the race is not an error.
    pub async fn claim_next(worker_id: &str, pool: &PgPool) -> Result<Option<Self>> {
        let task = sqlx::query_as::<_, RecordingTask>(
            r#"
            UPDATE recording_tasks
            SET status = 'running',
                worker_id = $1,
                last_heartbeat = NOW(),
                updated_at = NOW()
            WHERE id = (
                SELECT id
                FROM recording_tasks
                WHERE status = 'pending'
                ORDER BY created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(pool)
        .await?;
        Ok(task)
    }

    /// Renew the heartbeat of every listed task this worker still owns.
    pub async fn heartbeat_many(
        ids: &[RecordingTaskId],
        worker_id: &str,
        pool: &PgPool,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE recording_tasks
            SET last_heartbeat = NOW(),
                updated_at = NOW()
            WHERE id = ANY($1)
              AND status = 'running'
              AND worker_id = $2
            "#,
        )
        .bind(ids)
        .bind(worker_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn mark_completed(id: RecordingTaskId, worker_id: &str, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE recording_tasks
            SET status = 'completed',
                worker_id = NULL,
                error_message = NULL,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status = 'running'
              AND worker_id = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Count a failed attempt; re-queue while attempts remain, else fail.
    ///
    /// Returns the new status, or `None` if this worker no longer owns the task.
    pub async fn record_failed_attempt(
        id: RecordingTaskId,
        worker_id: &str,
        error: &str,
        max_attempts: i32,
        pool: &PgPool,
    ) -> Result<Option<RecordingStatus>> {
        let status = sqlx::query_scalar::<_, RecordingStatus>(
            r#"
            UPDATE recording_tasks
            SET attempt_count = attempt_count + 1,
                status = CASE
                    WHEN attempt_count + 1 < $3 THEN 'pending'::recording_status
                    ELSE 'failed'::recording_status
                END,
                completed_at = CASE WHEN attempt_count + 1 < $3 THEN NULL ELSE NOW() END,
                worker_id = NULL,
                error_message = $4,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'running'
              AND worker_id = $2
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(max_attempts)
        .bind(error)
        .fetch_optional(pool)
        .await?;
        Ok(status)
    }

    /// Re-queue or fail every running task whose heartbeat is older than
    /// `stale_after`.
    ///
    /// Rows that are no longer running (or were renewed meanwhile) don't
    /// match, so concurrent sweeps and repeated sweeps are harmless.
    ///
    /// A re-queued task gets `attempt_count + 1` on purpose: the lost run
    /// was an attempt, and without the increment a task that crashes its
    /// worker every time would be re-queued forever.
    pub async fn recover_stale(
        stale_after: Duration,
        max_attempts: i32,
        pool: &PgPool,
    ) -> Result<StaleRecoveryReport> {
        let report = sqlx::query_as::<_, StaleRecoveryReport>(
            r#"
            WITH recovered AS (
                UPDATE recording_tasks
                SET status = CASE
                        WHEN attempt_count < $2 THEN 'pending'::recording_status
                        ELSE 'failed'::recording_status
                    END,
                    attempt_count = CASE
                        WHEN attempt_count < $2 THEN attempt_count + 1
                        ELSE attempt_count
                    END,
                    completed_at = CASE WHEN attempt_count < $2 THEN NULL ELSE NOW() END,
                    error_message = CASE
                        WHEN attempt_count < $2 THEN error_message
                        ELSE 'heartbeat lost after final attempt'
                    END,
                    worker_id = NULL,
                    updated_at = NOW()
                WHERE status = 'running'
                  AND last_heartbeat < NOW() - ($1 || ' milliseconds')::INTERVAL
                RETURNING status
            )
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS requeued,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM recovered
            "#,
        )
        .bind(stale_after.as_millis().to_string())
        .bind(max_attempts)
        .fetch_one(pool)
        .await?;
        Ok(report)
    }

    pub async fn counts_for_build_task(
        build_task_id: BuildTaskId,
        pool: &PgPool,
    ) -> Result<RecordingTaskCounts> {
        let counts = sqlx::query_as::<_, RecordingTaskCounts>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM recording_tasks
            WHERE build_task_id = $1
            "#,
        )
        .bind(build_task_id)
        .fetch_one(pool)
        .await?;
        Ok(counts)
    }

    pub async fn count_outstanding_for_version(
        version_id: SourceVersionId,
        pool: &PgPool,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM recording_tasks
            WHERE config->>'sourceVersionId' = $1
              AND status IN ('pending', 'running')
            "#,
        )
        .bind(version_id.to_string())
        .fetch_one(pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_requeue_until_the_last_attempt() {
        assert_eq!(RecordingTask::status_after_failure(0, 3), RecordingStatus::Pending);
        assert_eq!(RecordingTask::status_after_failure(1, 3), RecordingStatus::Pending);
        assert_eq!(RecordingTask::status_after_failure(2, 3), RecordingStatus::Failed);
    }

    #[test]
    fn stale_recovery_requeues_below_the_limit() {
        assert_eq!(
            RecordingTask::recovered_from_stale(1, 3),
            (RecordingStatus::Pending, 2)
        );
    }

    #[test]
    fn stale_recovery_fails_at_the_limit_without_counting() {
        assert_eq!(
            RecordingTask::recovered_from_stale(3, 3),
            (RecordingStatus::Failed, 3)
        );
    }

    #[test]
    fn counts_track_outstanding_work() {
        let counts = RecordingTaskCounts {
            pending: 1,
            running: 2,
            completed: 4,
            failed: 1,
        };
        assert_eq!(counts.total(), 8);
        assert_eq!(counts.outstanding(), 3);
        assert!(!counts.all_terminal());
        assert!(RecordingTaskCounts::default().all_terminal());
    }

    #[test]
    fn config_serializes_with_camel_case_version_key() {
        let version = SourceVersionId::new();
        let config = RecordingTaskConfig::for_version(version);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["sourceVersionId"], version.to_string());
        assert!(json.get("startUrl").is_none());
    }
}
