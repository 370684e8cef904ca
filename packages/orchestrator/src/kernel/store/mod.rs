//! Task store: the only state shared between controller and worker processes.
//!
//! Three narrow traits cover what each component needs:
//! - [`BuildTaskStore`] - claim and advance build tasks (controller)
//! - [`VersionStore`] - sources, versions and the publish swap (publisher)
//! - [`RecordingTaskStore`] - claim/heartbeat/reconcile recording tasks (worker pool)
//!
//! [`TaskStore`] is the umbrella implemented by anything providing all three.
//!
//! # Implementations
//!
//! ```text
//! PostgresTaskStore   production; every transition is one conditional statement
//!                     or one transaction, see domains/*/models
//! InMemoryTaskStore   single mutex; every method is atomic, used by tests
//! ```

mod memory;
mod postgres;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::common::{BuildTaskId, RecordingTaskId, SourceId, SourceVersionId};
use crate::domains::build_tasks::models::{BuildTask, BuildTaskConfig};
use crate::domains::recording::models::{
    RecordingStatus, RecordingTask, RecordingTaskCounts, StaleRecoveryReport,
};
use crate::domains::versions::models::{Source, SourceVersion};
use crate::domains::versions::PublishError;

/// Everything the knowledge stage hands over to start the action stage.
#[derive(Debug, Clone)]
pub struct ActionStagePlan {
    pub source_name: String,
    pub source_url: String,
    pub commit_message: Option<String>,
    pub created_by: Option<String>,
    /// One recording task is created per batch.
    pub chunk_batches: Vec<Vec<i64>>,
    pub start_url: Option<String>,
    /// Build task config to persist (retry count etc.); the store fills in
    /// `source_version_id`.
    pub config: BuildTaskConfig,
}

/// Result of [`BuildTaskStore::begin_action_stage`].
#[derive(Debug, Clone)]
pub struct ActionStageStarted {
    pub source: Source,
    pub version: SourceVersion,
    pub recording_tasks: usize,
}

#[async_trait]
pub trait BuildTaskStore: Send + Sync {
    async fn create_build_task(&self, task: BuildTask) -> Result<BuildTask>;

    async fn find_build_task(&self, id: BuildTaskId) -> Result<Option<BuildTask>>;

    /// Atomically claim at most one pending build task.
    ///
    /// `init` tasks come back as `knowledge_build/running`; tasks in later
    /// stages come back `running` in their current stage.
    async fn claim_build_task(&self) -> Result<Option<BuildTask>>;

    /// In one transaction: find-or-create the source, insert the next
    /// `building` version, insert the recording batch and move the task to
    /// `action_build/pending`.
    ///
    /// Fails (and writes nothing) if the task is no longer
    /// `knowledge_build/running`.
    async fn begin_action_stage(
        &self,
        id: BuildTaskId,
        plan: ActionStagePlan,
    ) -> Result<ActionStageStarted>;

    /// Back to `pending` in the same stage, recording the error and config.
    async fn reset_build_task_for_retry(
        &self,
        id: BuildTaskId,
        config: &BuildTaskConfig,
        error: &str,
    ) -> Result<bool>;

    /// Move a running task to `error/error`.
    async fn fail_build_task(&self, id: BuildTaskId, error: &str) -> Result<bool>;

    /// Move a running `action_build` task to `completed/completed`.
    async fn complete_build_task(&self, id: BuildTaskId, summary: Option<&str>) -> Result<bool>;
}

#[async_trait]
pub trait VersionStore: Send + Sync {
    async fn find_source(&self, id: SourceId) -> Result<Option<Source>>;

    async fn find_source_version(&self, id: SourceVersionId) -> Result<Option<SourceVersion>>;

    async fn active_source_version(&self, source_id: SourceId) -> Result<Option<SourceVersion>>;

    async fn source_versions(&self, source_id: SourceId) -> Result<Vec<SourceVersion>>;

    /// The atomic swap: archive the active version, activate `version_id`,
    /// point the source at it.
    async fn swap_active_version(
        &self,
        version_id: SourceVersionId,
        source_id: SourceId,
    ) -> Result<SourceVersion, PublishError>;
}

#[async_trait]
pub trait RecordingTaskStore: Send + Sync {
    /// Atomically move one pending task to `running` owned by `worker_id`.
    async fn claim_recording_task(&self, worker_id: &str) -> Result<Option<RecordingTask>>;

    /// Renew heartbeats for the listed tasks still owned by `worker_id`.
    async fn heartbeat_recording_tasks(
        &self,
        ids: &[RecordingTaskId],
        worker_id: &str,
    ) -> Result<u64>;

    /// `running → completed`; `false` if the worker no longer owns the task.
    async fn complete_recording_task(&self, id: RecordingTaskId, worker_id: &str) -> Result<bool>;

    /// Count a failed attempt. Returns the new status, or `None` if the
    /// worker no longer owns the task.
    async fn fail_recording_task_attempt(
        &self,
        id: RecordingTaskId,
        worker_id: &str,
        error: &str,
        max_attempts: i32,
    ) -> Result<Option<RecordingStatus>>;

    async fn recover_stale_recording_tasks(
        &self,
        stale_after: Duration,
        max_attempts: i32,
    ) -> Result<StaleRecoveryReport>;

    async fn recording_task_counts(&self, build_task_id: BuildTaskId) -> Result<RecordingTaskCounts>;

    /// Pending or running tasks recording into `version_id`.
    async fn outstanding_tasks_for_version(&self, version_id: SourceVersionId) -> Result<i64>;

    async fn find_recording_task(&self, id: RecordingTaskId) -> Result<Option<RecordingTask>>;

    async fn recording_tasks_for_build_task(
        &self,
        build_task_id: BuildTaskId,
    ) -> Result<Vec<RecordingTask>>;
}

/// A store providing every table the orchestrator touches.
pub trait TaskStore: BuildTaskStore + VersionStore + RecordingTaskStore {}

impl<T> TaskStore for T where T: BuildTaskStore + VersionStore + RecordingTaskStore {}
