//! PostgreSQL-backed task store.
//!
//! Thin wrapper around the model queries; the only logic here is how
//! multi-statement operations are grouped into transactions.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, info};

use super::{
    ActionStagePlan, ActionStageStarted, BuildTaskStore, RecordingTaskStore, VersionStore,
};
use crate::common::{BuildTaskId, RecordingTaskId, SourceId, SourceVersionId};
use crate::domains::build_tasks::models::{BuildTask, BuildTaskConfig};
use crate::domains::recording::models::{
    RecordingStatus, RecordingTask, RecordingTaskConfig, RecordingTaskCounts, StaleRecoveryReport,
};
use crate::domains::versions::PublishError;
use crate::domains::versions::models::{Source, SourceVersion};

#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BuildTaskStore for PostgresTaskStore {
    async fn create_build_task(&self, task: BuildTask) -> Result<BuildTask> {
        task.insert(&self.pool).await
    }

    async fn find_build_task(&self, id: BuildTaskId) -> Result<Option<BuildTask>> {
        BuildTask::find_by_id(id, &self.pool).await
    }

    async fn claim_build_task(&self) -> Result<Option<BuildTask>> {
        BuildTask::claim_next(&self.pool).await
    }

    async fn begin_action_stage(
        &self,
        id: BuildTaskId,
        plan: ActionStagePlan,
    ) -> Result<ActionStageStarted> {
        let mut tx = self.pool.begin().await.context("failed to open transaction")?;

        let source = Source::upsert_locked(&plan.source_name, &plan.source_url, &mut *tx).await?;
        let version = SourceVersion::insert_next_building(
            source.id,
            plan.commit_message.as_deref(),
            plan.created_by.as_deref(),
            &mut *tx,
        )
        .await?;

        for chunk_ids in &plan.chunk_batches {
            let mut config = RecordingTaskConfig::for_version(version.id);
            config.start_url = plan.start_url.clone();
            RecordingTask::new_pending(id, source.id, chunk_ids.clone(), config)
                .insert(&mut *tx)
                .await?;
        }

        let config = BuildTaskConfig {
            source_version_id: Some(version.id),
            ..plan.config
        };
        if !BuildTask::advance_to_action_stage(id, source.id, &config, &mut *tx).await? {
            // Dropping the transaction rolls back the version and batch.
            bail!("build task {} is no longer in knowledge_build/running", id);
        }

        tx.commit().await.context("failed to commit action stage")?;

        debug!(
            build_task_id = %id,
            source_id = %source.id,
            version_id = %version.id,
            version_number = version.version_number,
            "created building version"
        );

        Ok(ActionStageStarted {
            source,
            version,
            recording_tasks: plan.chunk_batches.len(),
        })
    }

    async fn reset_build_task_for_retry(
        &self,
        id: BuildTaskId,
        config: &BuildTaskConfig,
        error: &str,
    ) -> Result<bool> {
        BuildTask::reset_for_retry(id, config, error, &self.pool).await
    }

    async fn fail_build_task(&self, id: BuildTaskId, error: &str) -> Result<bool> {
        BuildTask::mark_error(id, error, &self.pool).await
    }

    async fn complete_build_task(&self, id: BuildTaskId, summary: Option<&str>) -> Result<bool> {
        BuildTask::mark_completed(id, summary, &self.pool).await
    }
}

#[async_trait]
impl VersionStore for PostgresTaskStore {
    async fn find_source(&self, id: SourceId) -> Result<Option<Source>> {
        Source::find_by_id(id, &self.pool).await
    }

    async fn find_source_version(&self, id: SourceVersionId) -> Result<Option<SourceVersion>> {
        SourceVersion::find_by_id(id, &self.pool).await
    }

    async fn active_source_version(&self, source_id: SourceId) -> Result<Option<SourceVersion>> {
        SourceVersion::find_active(source_id, &self.pool).await
    }

    async fn source_versions(&self, source_id: SourceId) -> Result<Vec<SourceVersion>> {
        SourceVersion::find_for_source(source_id, &self.pool).await
    }

    async fn swap_active_version(
        &self,
        version_id: SourceVersionId,
        source_id: SourceId,
    ) -> Result<SourceVersion, PublishError> {
        let mut tx = self.pool.begin().await?;

        // Serializes publishers of the same source.
        if Source::lock(source_id, &mut *tx).await?.is_none() {
            return Err(PublishError::SourceNotFound(source_id));
        }

        let archived = SourceVersion::archive_active(source_id, version_id, &mut *tx).await?;
        let Some(version) = SourceVersion::activate(version_id, source_id, &mut *tx).await? else {
            tx.rollback().await?;
            return Err(match SourceVersion::find_by_id(version_id, &self.pool).await? {
                None => PublishError::VersionNotFound(version_id),
                Some(v) if v.source_id != source_id => PublishError::SourceMismatch {
                    version_id,
                    expected: source_id,
                    actual: v.source_id,
                },
                Some(_) => PublishError::Archived(version_id),
            });
        };
        Source::set_current_version(source_id, version_id, &mut *tx).await?;

        tx.commit().await?;

        info!(
            source_id = %source_id,
            version_id = %version_id,
            version_number = version.version_number,
            archived,
            "published source version"
        );
        Ok(version)
    }
}

#[async_trait]
impl RecordingTaskStore for PostgresTaskStore {
    async fn claim_recording_task(&self, worker_id: &str) -> Result<Option<RecordingTask>> {
        RecordingTask::claim_next(worker_id, &self.pool).await
    }

    async fn heartbeat_recording_tasks(
        &self,
        ids: &[RecordingTaskId],
        worker_id: &str,
    ) -> Result<u64> {
        RecordingTask::heartbeat_many(ids, worker_id, &self.pool).await
    }

    async fn complete_recording_task(&self, id: RecordingTaskId, worker_id: &str) -> Result<bool> {
        RecordingTask::mark_completed(id, worker_id, &self.pool).await
    }

    async fn fail_recording_task_attempt(
        &self,
        id: RecordingTaskId,
        worker_id: &str,
        error: &str,
        max_attempts: i32,
    ) -> Result<Option<RecordingStatus>> {
        RecordingTask::record_failed_attempt(id, worker_id, error, max_attempts, &self.pool).await
    }

    async fn recover_stale_recording_tasks(
        &self,
        stale_after: Duration,
        max_attempts: i32,
    ) -> Result<StaleRecoveryReport> {
        RecordingTask::recover_stale(stale_after, max_attempts, &self.pool).await
    }

    async fn recording_task_counts(&self, build_task_id: BuildTaskId) -> Result<RecordingTaskCounts> {
        RecordingTask::counts_for_build_task(build_task_id, &self.pool).await
    }

    async fn outstanding_tasks_for_version(&self, version_id: SourceVersionId) -> Result<i64> {
        RecordingTask::count_outstanding_for_version(version_id, &self.pool).await
    }

    async fn find_recording_task(&self, id: RecordingTaskId) -> Result<Option<RecordingTask>> {
        RecordingTask::find_by_id(id, &self.pool).await
    }

    async fn recording_tasks_for_build_task(
        &self,
        build_task_id: BuildTaskId,
    ) -> Result<Vec<RecordingTask>> {
        RecordingTask::find_for_build_task(build_task_id, &self.pool).await
    }
}
