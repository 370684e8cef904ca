//! Stage handlers for claimed build tasks.
//!
//! ```text
//! knowledge_build ──► KnowledgeBuilder::build
//!                     └─► begin_action_stage (source, building version, recording batch)
//! action_build    ──► poll recording task counts until all terminal
//!                     ├─► no failures / AllowPartial ──► publish ──► completed
//!                     └─► failures + RequireAllCompleted ──► error
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::controller::{ControllerConfig, PublishPolicy};
use crate::common::SourceVersionId;
use crate::domains::build_tasks::models::{BuildStage, BuildTask};
use crate::domains::recording::models::RecordingTaskCounts;
use crate::domains::versions::{PublishError, VersionPublisher};
use crate::kernel::store::{ActionStagePlan, TaskStore};
use crate::kernel::traits::BaseKnowledgeBuilder;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("knowledge build failed: {0:#}")]
    Knowledge(anyhow::Error),

    #[error("knowledge build produced no recording tasks")]
    NothingToRecord,

    #[error("build task has no {0} to record into")]
    MissingVersion(&'static str),

    #[error("no handler for stage {0}")]
    UnexpectedStage(BuildStage),

    #[error("timed out after {}s waiting for recording tasks ({outstanding} of {total} outstanding)", .waited.as_secs())]
    Timeout {
        waited: Duration,
        outstanding: i64,
        total: i64,
    },

    #[error("{failed} of {total} recording tasks exhausted retries")]
    RecordingFailed { failed: i64, total: i64 },

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl StageError {
    /// Whether running the stage again could succeed.
    ///
    /// Exhausted recording tasks stay exhausted, so retrying the action stage
    /// would only re-read the same counts.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            StageError::RecordingFailed { .. } | StageError::UnexpectedStage(_)
        )
    }
}

pub(crate) struct StageRunner<S> {
    pub(crate) store: Arc<S>,
    pub(crate) builder: Arc<dyn BaseKnowledgeBuilder>,
    pub(crate) publisher: VersionPublisher<S>,
    pub(crate) config: ControllerConfig,
}

impl<S: TaskStore + 'static> StageRunner<S> {
    pub(crate) async fn run(&self, task: &BuildTask) -> Result<(), StageError> {
        match task.stage {
            BuildStage::KnowledgeBuild => self.knowledge_build(task).await,
            BuildStage::ActionBuild => self.action_build(task).await,
            other => Err(StageError::UnexpectedStage(other)),
        }
    }

    async fn knowledge_build(&self, task: &BuildTask) -> Result<(), StageError> {
        let output = self
            .builder
            .build(task)
            .await
            .map_err(StageError::Knowledge)?;

        let chunk_batches: Vec<Vec<i64>> = output
            .chunk_batches
            .into_iter()
            .filter(|batch| !batch.is_empty())
            .collect();
        if chunk_batches.is_empty() {
            return Err(StageError::NothingToRecord);
        }

        let plan = ActionStagePlan {
            source_name: output.source_name,
            source_url: task.source_url.clone(),
            commit_message: output.commit_message,
            created_by: Some(self.config.created_by.clone()),
            chunk_batches,
            start_url: Some(task.source_url.clone()),
            config: task.config.0.clone(),
        };
        let started = self.store.begin_action_stage(task.id, plan).await?;

        info!(
            build_task_id = %task.id,
            source_id = %started.source.id,
            version_id = %started.version.id,
            version_number = started.version.version_number,
            recording_tasks = started.recording_tasks,
            "knowledge build complete; recording tasks queued"
        );
        Ok(())
    }

    async fn action_build(&self, task: &BuildTask) -> Result<(), StageError> {
        let version_id = task
            .config
            .source_version_id
            .ok_or(StageError::MissingVersion("source version"))?;
        let source_id = task.source_id.ok_or(StageError::MissingVersion("source"))?;

        let counts = self.wait_for_recording(task, version_id).await?;

        let policy = self.config.publish_policy.for_task(&task.config);
        if counts.failed > 0 && policy == PublishPolicy::RequireAllCompleted {
            return Err(StageError::RecordingFailed {
                failed: counts.failed,
                total: counts.total(),
            });
        }

        let version = self.publisher.publish_version(version_id, source_id).await?;

        let summary = (counts.failed > 0).then(|| {
            format!(
                "published with {} of {} recording tasks failed",
                counts.failed,
                counts.total()
            )
        });
        if let Some(summary) = &summary {
            warn!(build_task_id = %task.id, version_id = %version.id, "{}", summary);
        }

        if !self
            .store
            .complete_build_task(task.id, summary.as_deref())
            .await?
        {
            warn!(build_task_id = %task.id, "build task was no longer running; completion not recorded");
            return Ok(());
        }

        info!(
            build_task_id = %task.id,
            source_id = %source_id,
            version_id = %version.id,
            version_number = version.version_number,
            completed = counts.completed,
            "build task completed"
        );
        Ok(())
    }

    /// Poll the batch until no task is pending or running.
    async fn wait_for_recording(
        &self,
        task: &BuildTask,
        version_id: SourceVersionId,
    ) -> Result<RecordingTaskCounts, StageError> {
        let started = Instant::now();
        let deadline = started + self.config.task_timeout;

        loop {
            let counts = self.store.recording_task_counts(task.id).await?;
            if counts.all_terminal() {
                return Ok(counts);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StageError::Timeout {
                    waited: started.elapsed(),
                    outstanding: counts.outstanding(),
                    total: counts.total(),
                });
            }

            debug!(
                build_task_id = %task.id,
                version_id = %version_id,
                pending = counts.pending,
                running = counts.running,
                completed = counts.completed,
                failed = counts.failed,
                "waiting for recording tasks"
            );
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }
}
