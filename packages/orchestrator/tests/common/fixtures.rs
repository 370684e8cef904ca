//! Test fixtures for creating test data.
//!
//! These go through the store traits, so the same fixture seeds either the
//! in-memory store or a Postgres harness.

use anyhow::{Result, ensure};
use chrono::Utc;
use orchestrator_core::common::{BuildTaskId, SourceId, SourceVersionId};
use orchestrator_core::domains::build_tasks::models::{BuildTask, BuildTaskConfig};
use orchestrator_core::domains::recording::models::{
    RecordingStatus, RecordingTask, RecordingTaskConfig,
};
use orchestrator_core::domains::versions::models::{Source, SourceVersion};
use orchestrator_core::kernel::store::ActionStagePlan;
use orchestrator_core::kernel::{InMemoryTaskStore, TaskStore};

/// A build task sitting in `action_build/running` with its recording batch
/// queued, as the controller leaves it while it waits on the workers.
pub struct QueuedBatch {
    pub build_task: BuildTask,
    pub source: Source,
    pub version: SourceVersion,
}

/// Run a build task through the knowledge stage by hand.
pub async fn queue_recording_batch<S: TaskStore>(
    store: &S,
    source_url: &str,
    chunk_batches: Vec<Vec<i64>>,
) -> Result<QueuedBatch> {
    let task = store
        .create_build_task(BuildTask::new(source_url, BuildTaskConfig::default()))
        .await?;

    let claimed = store.claim_build_task().await?;
    ensure!(
        claimed.as_ref().map(|t| t.id) == Some(task.id),
        "fixture expected to claim its own build task"
    );

    let started = store
        .begin_action_stage(
            task.id,
            ActionStagePlan {
                source_name: "fixture".to_string(),
                source_url: source_url.to_string(),
                commit_message: Some("fixture batch".to_string()),
                created_by: Some("tests".to_string()),
                chunk_batches,
                start_url: None,
                config: BuildTaskConfig::default(),
            },
        )
        .await?;

    // Claim again so the task is `running` and later fixtures claim their own.
    let build_task = store.claim_build_task().await?;
    ensure!(
        build_task.as_ref().map(|t| t.id) == Some(task.id),
        "fixture expected to re-claim its build task for the action stage"
    );

    Ok(QueuedBatch {
        build_task: build_task.unwrap_or(task),
        source: started.source,
        version: started.version,
    })
}

/// A pending recording task not tied to any build (in-memory store only).
pub fn insert_pending_task(store: &InMemoryTaskStore) -> RecordingTask {
    store.insert_recording_task(RecordingTask::new_pending(
        BuildTaskId::new(),
        SourceId::new(),
        vec![1, 2, 3],
        RecordingTaskConfig::for_version(SourceVersionId::new()),
    ))
}

/// A running task owned by a worker that went away `minutes_silent` ago.
pub fn insert_abandoned_task(
    store: &InMemoryTaskStore,
    attempt_count: i32,
    minutes_silent: i64,
) -> RecordingTask {
    let mut task = RecordingTask::new_pending(
        BuildTaskId::new(),
        SourceId::new(),
        vec![42],
        RecordingTaskConfig::for_version(SourceVersionId::new()),
    );
    task.status = RecordingStatus::Running;
    task.worker_id = Some("crashed-worker".to_string());
    task.attempt_count = attempt_count;
    task.last_heartbeat = Some(Utc::now() - chrono::Duration::minutes(minutes_silent));
    store.insert_recording_task(task)
}
