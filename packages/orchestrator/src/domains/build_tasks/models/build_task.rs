use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};

use crate::common::{BuildTaskId, SourceId, SourceVersionId};

// ============================================================================
// Enums
// ============================================================================

/// Pipeline stage of a build task.
///
/// Stages only move forward (`Init` → `KnowledgeBuild` → `ActionBuild` →
/// `Completed`); `Error` can be entered from any stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "build_stage", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BuildStage {
    #[default]
    Init,
    KnowledgeBuild,
    ActionBuild,
    Completed,
    Error,
}

impl BuildStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildStage::Completed | BuildStage::Error)
    }

    /// Whether moving from `self` to `to` respects forward-only ordering.
    pub fn can_transition_to(self, to: BuildStage) -> bool {
        if self == to {
            return true;
        }
        match to {
            BuildStage::Error => !self.is_terminal(),
            _ => self.rank() < to.rank() && !self.is_terminal(),
        }
    }

    fn rank(self) -> u8 {
        match self {
            BuildStage::Init => 0,
            BuildStage::KnowledgeBuild => 1,
            BuildStage::ActionBuild => 2,
            BuildStage::Completed => 3,
            BuildStage::Error => 4,
        }
    }
}

impl std::fmt::Display for BuildStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildStage::Init => write!(f, "init"),
            BuildStage::KnowledgeBuild => write!(f, "knowledge_build"),
            BuildStage::ActionBuild => write!(f, "action_build"),
            BuildStage::Completed => write!(f, "completed"),
            BuildStage::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for BuildStage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "init" => Ok(BuildStage::Init),
            "knowledge_build" => Ok(BuildStage::KnowledgeBuild),
            "action_build" => Ok(BuildStage::ActionBuild),
            "completed" => Ok(BuildStage::Completed),
            "error" => Ok(BuildStage::Error),
            _ => Err(anyhow::anyhow!("Invalid build stage: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "stage_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Running => write!(f, "running"),
            StageStatus::Completed => write!(f, "completed"),
            StageStatus::Error => write!(f, "error"),
        }
    }
}

// ============================================================================
// Config
// ============================================================================

/// Typed view of the `build_tasks.config` jsonb column.
///
/// Keys this crate doesn't know about are kept in `extra` and written back
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildTaskConfig {
    /// Stage-handler failures so far.
    #[serde(rename = "_retryCount", default)]
    pub retry_count: u32,

    /// The `building` version created by the knowledge stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_version_id: Option<SourceVersionId>,

    /// Per-task override of the controller's publish policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_on_partial_failure: Option<bool>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Outcome of recording one more stage failure against a task's retry budget.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Put the task back to `pending` with the updated config.
    Retry(BuildTaskConfig),
    /// Budget exhausted; move the task to `error`.
    GiveUp { attempts: u32 },
}

impl BuildTaskConfig {
    pub fn record_failure(&self, max_retries: u32) -> RetryDecision {
        let attempts = self.retry_count + 1;
        if attempts <= max_retries {
            RetryDecision::Retry(BuildTaskConfig {
                retry_count: attempts,
                ..self.clone()
            })
        } else {
            RetryDecision::GiveUp { attempts }
        }
    }
}

// ============================================================================
// BuildTask Model
// ============================================================================

/// One website build request moving through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BuildTask {
    pub id: BuildTaskId,
    pub source_id: Option<SourceId>,
    pub source_url: String,
    pub stage: BuildStage,
    pub stage_status: StageStatus,
    pub config: Json<BuildTaskConfig>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub knowledge_started_at: Option<DateTime<Utc>>,
    pub knowledge_completed_at: Option<DateTime<Utc>>,
    pub action_started_at: Option<DateTime<Utc>>,
    pub action_completed_at: Option<DateTime<Utc>>,
}

impl BuildTask {
    /// A fresh `init/pending` task for `source_url`.
    pub fn new(source_url: impl Into<String>, config: BuildTaskConfig) -> Self {
        let now = Utc::now();
        Self {
            id: BuildTaskId::new(),
            source_id: None,
            source_url: source_url.into(),
            stage: BuildStage::Init,
            stage_status: StageStatus::Pending,
            config: Json(config),
            error_message: None,
            created_at: now,
            updated_at: now,
            knowledge_started_at: None,
            knowledge_completed_at: None,
            action_started_at: None,
            action_completed_at: None,
        }
    }

    /// Whether the controller may claim this task.
    pub fn is_claimable(&self) -> bool {
        self.stage_status == StageStatus::Pending
            && matches!(
                self.stage,
                BuildStage::Init | BuildStage::KnowledgeBuild | BuildStage::ActionBuild
            )
    }

    pub fn retry_count(&self) -> u32 {
        self.config.retry_count
    }
}

// =============================================================================
// SQL Queries
// =============================================================================

impl BuildTask {
    pub async fn insert(&self, pool: &PgPool) -> Result<Self> {
        let task = sqlx::query_as::<_, BuildTask>(
            r#"
            INSERT INTO build_tasks (id, source_id, source_url, stage, stage_status, config, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(self.source_id)
        .bind(&self.source_url)
        .bind(self.stage)
        .bind(self.stage_status)
        .bind(&self.config)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(pool)
        .await?;
        Ok(task)
    }

    pub async fn find_by_id(id: BuildTaskId, pool: &PgPool) -> Result<Option<Self>> {
        let task = sqlx::query_as::<_, BuildTask>("SELECT * FROM build_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(task)
    }

    /// Claim the oldest pending task in a single conditional statement.
    ///
    /// An `init` task moves straight to `knowledge_build/running`. Tasks
    /// already in a later stage keep their stage and become `running` again
    /// (retry or resume). Concurrent controllers skip locked rows, so each
    /// row has exactly one winner.
    pub async fn claim_next(pool: &PgPool) -> Result<Option<Self>> {
        let task = sqlx::query_as::<_, BuildTask>(
            r#"
            UPDATE build_tasks
            SET stage = CASE WHEN stage = 'init' THEN 'knowledge_build'::build_stage ELSE stage END,
                stage_status = 'running',
                knowledge_started_at = CASE WHEN stage = 'init' THEN NOW() ELSE knowledge_started_at END,
                action_started_at = CASE
                    WHEN stage = 'action_build' THEN COALESCE(action_started_at, NOW())
                    ELSE action_started_at
                END,
                updated_at = NOW()
            WHERE id = (
                SELECT id
                FROM build_tasks
                WHERE stage_status = 'pending'
                  AND stage IN ('init', 'knowledge_build', 'action_build')
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND stage_status = 'pending'
            RETURNING *
            "#,
        )
        .fetch_optional(pool)
        .await?;
        Ok(task)
    }

    /// Knowledge stage finished: attach the source, remember the building
    /// version and queue the task for the action stage.
    pub async fn advance_to_action_stage(
        id: BuildTaskId,
        source_id: SourceId,
        config: &BuildTaskConfig,
        conn: &mut PgConnection,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE build_tasks
            SET source_id = $2,
                config = $3,
                stage = 'action_build',
                stage_status = 'pending',
                error_message = NULL,
                knowledge_completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND stage = 'knowledge_build'
              AND stage_status = 'running'
            "#,
        )
        .bind(id)
        .bind(source_id)
        .bind(Json(config))
        .execute(conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn reset_for_retry(
        id: BuildTaskId,
        config: &BuildTaskConfig,
        error: &str,
        pool: &PgPool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE build_tasks
            SET stage_status = 'pending',
                config = $2,
                error_message = $3,
                updated_at = NOW()
            WHERE id = $1 AND stage_status = 'running'
            "#,
        )
        .bind(id)
        .bind(Json(config))
        .bind(error)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_error(id: BuildTaskId, error: &str, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE build_tasks
            SET stage = 'error',
                stage_status = 'error',
                error_message = $2,
                updated_at = NOW()
            WHERE id = $1 AND stage_status = 'running'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_completed(id: BuildTaskId, summary: Option<&str>, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE build_tasks
            SET stage = 'completed',
                stage_status = 'completed',
                error_message = $2,
                action_completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND stage = 'action_build'
              AND stage_status = 'running'
            "#,
        )
        .bind(id)
        .bind(summary)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
