//! Build task controller: stage transitions, retries, publishing, shutdown.
//!
//! Most tests drive the controller one `check_once` at a time and settle the
//! recording batch by hand, so every stage boundary is observable.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, wait_until};
use orchestrator_core::common::BuildTaskId;
use orchestrator_core::domains::build_tasks::models::{
    BuildStage, BuildTask, BuildTaskConfig, StageStatus,
};
use orchestrator_core::domains::build_tasks::{
    BuildTaskController, ControllerConfig, PublishPolicy,
};
use orchestrator_core::domains::recording::models::RecordingStatus;
use orchestrator_core::domains::recording::{RecordingTaskQueueWorker, WorkerConfig};
use orchestrator_core::domains::versions::models::VersionStatus;
use orchestrator_core::kernel::{
    BuildTaskStore, InMemoryTaskStore, MockKnowledgeBuilder, MockTaskExecutor,
    RecordingTaskStore, VersionStore,
};
use tokio_test::{assert_err, assert_ok};

const SITE: &str = "https://example.com";

fn fast_config() -> ControllerConfig {
    ControllerConfig::builder()
        .poll_interval(Duration::from_millis(20))
        .task_timeout(Duration::from_secs(5))
        .build()
}

fn controller(
    store: &Arc<InMemoryTaskStore>,
    builder: MockKnowledgeBuilder,
    config: ControllerConfig,
) -> (BuildTaskController<InMemoryTaskStore>, Arc<MockKnowledgeBuilder>) {
    let builder = Arc::new(builder);
    let controller = BuildTaskController::new(store.clone(), builder.clone(), config);
    (controller, builder)
}

async fn enqueue(store: &InMemoryTaskStore, config: BuildTaskConfig) -> BuildTask {
    store
        .create_build_task(BuildTask::new(SITE, config))
        .await
        .unwrap()
}

async fn reload(store: &InMemoryTaskStore, id: BuildTaskId) -> BuildTask {
    store.find_build_task(id).await.unwrap().unwrap()
}

/// Play the recording worker: complete every pending task, except that the
/// first `failures` claimed are failed permanently.
async fn settle_recordings(store: &InMemoryTaskStore, mut failures: usize) {
    while let Some(task) = store.claim_recording_task("manual-worker").await.unwrap() {
        if failures > 0 {
            failures -= 1;
            store
                .fail_recording_task_attempt(task.id, "manual-worker", "page gone", 1)
                .await
                .unwrap();
        } else {
            store.complete_recording_task(task.id, "manual-worker").await.unwrap();
        }
    }
}

#[tokio::test]
async fn empty_store_claims_nothing() {
    let store = Arc::new(InMemoryTaskStore::new());
    let (controller, builder) = controller(
        &store,
        MockKnowledgeBuilder::with_batches(vec![vec![1]]),
        fast_config(),
    );

    assert!(!controller.check_once().await.unwrap());
    assert!(builder.calls().is_empty());
}

#[tokio::test]
async fn knowledge_stage_queues_one_recording_task_per_batch() {
    init_tracing();
    let store = Arc::new(InMemoryTaskStore::new());
    let (controller, builder) = controller(
        &store,
        MockKnowledgeBuilder::with_batches(vec![vec![1, 2], vec![], vec![3]])
            .with_source_name("Example"),
        fast_config(),
    );
    let task = enqueue(&store, BuildTaskConfig::default()).await;

    assert!(controller.check_once().await.unwrap());
    assert_eq!(builder.calls(), vec![task.id]);

    let task = reload(&store, task.id).await;
    assert_eq!(task.stage, BuildStage::ActionBuild);
    assert_eq!(task.stage_status, StageStatus::Pending);
    assert!(task.knowledge_started_at.is_some());
    assert!(task.knowledge_completed_at.is_some());

    let source_id = task.source_id.unwrap();
    let version_id = task.config.source_version_id.unwrap();
    let source = store.find_source(source_id).await.unwrap().unwrap();
    assert_eq!(source.name, "Example");
    assert_eq!(source.base_url, SITE);
    assert!(source.current_version_id.is_none());

    let version = store.find_source_version(version_id).await.unwrap().unwrap();
    assert_eq!(version.status, VersionStatus::Building);
    assert_eq!(version.version_number, 1);
    assert_eq!(version.created_by.as_deref(), Some("build-controller"));

    // The empty batch is dropped.
    let recordings = store.recording_tasks_for_build_task(task.id).await.unwrap();
    assert_eq!(recordings.len(), 2);
    assert!(recordings.iter().all(|r| r.status == RecordingStatus::Pending));
    assert!(recordings.iter().all(|r| r.source_version_id() == version_id));
    assert!(recordings
        .iter()
        .all(|r| r.config.start_url.as_deref() == Some(SITE)));
}

#[tokio::test]
async fn action_stage_publishes_when_every_recording_completes() {
    init_tracing();
    let store = Arc::new(InMemoryTaskStore::new());
    let (controller, _) = controller(
        &store,
        MockKnowledgeBuilder::with_batches(vec![vec![1], vec![2], vec![3]]),
        fast_config(),
    );
    let task = enqueue(&store, BuildTaskConfig::default()).await;

    controller.check_once().await.unwrap();
    settle_recordings(&store, 0).await;
    assert!(controller.check_once().await.unwrap());

    let task = reload(&store, task.id).await;
    assert_eq!(task.stage, BuildStage::Completed);
    assert_eq!(task.stage_status, StageStatus::Completed);
    assert!(task.error_message.is_none());
    assert!(task.action_started_at.is_some());
    assert!(task.action_completed_at.is_some());

    let version_id = task.config.source_version_id.unwrap();
    let version = store.find_source_version(version_id).await.unwrap().unwrap();
    assert_eq!(version.status, VersionStatus::Active);
    assert!(version.published_at.is_some());

    let source = store.find_source(task.source_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(source.current_version_id, Some(version_id));

    // Nothing left to claim.
    assert!(!controller.check_once().await.unwrap());
}

#[tokio::test]
async fn knowledge_failure_is_retried() {
    init_tracing();
    let store = Arc::new(InMemoryTaskStore::new());
    let (controller, builder) = controller(
        &store,
        MockKnowledgeBuilder::with_batches(vec![vec![1]]).failing_once("crawl blocked"),
        fast_config(),
    );
    let task = enqueue(&store, BuildTaskConfig::default()).await;

    assert!(controller.check_once().await.unwrap());
    let failed = reload(&store, task.id).await;
    assert_eq!(failed.stage, BuildStage::KnowledgeBuild);
    assert_eq!(failed.stage_status, StageStatus::Pending);
    assert_eq!(failed.retry_count(), 1);
    assert_eq!(
        failed.error_message.as_deref(),
        Some("knowledge build failed: crawl blocked")
    );

    assert!(controller.check_once().await.unwrap());
    let retried = reload(&store, task.id).await;
    assert_eq!(retried.stage, BuildStage::ActionBuild);
    assert!(retried.error_message.is_none());
    assert_eq!(builder.calls().len(), 2);
}

#[tokio::test]
async fn knowledge_failures_give_up_after_max_retries() {
    init_tracing();
    let store = Arc::new(InMemoryTaskStore::new());
    let config = ControllerConfig::builder()
        .poll_interval(Duration::from_millis(20))
        .max_retries(1u32)
        .build();
    let (controller, builder) = controller(
        &store,
        MockKnowledgeBuilder::with_batches(vec![vec![1]])
            .failing_once("crawl blocked")
            .failing_once("crawl blocked"),
        config,
    );
    let task = enqueue(&store, BuildTaskConfig::default()).await;

    controller.check_once().await.unwrap();
    controller.check_once().await.unwrap();

    let task = reload(&store, task.id).await;
    assert_eq!(task.stage, BuildStage::Error);
    assert_eq!(task.stage_status, StageStatus::Error);
    assert_eq!(
        task.error_message.as_deref(),
        Some("knowledge build failed: crawl blocked (gave up after 2 attempts)")
    );
    assert_eq!(builder.calls().len(), 2);

    // Terminal tasks are never claimed again.
    assert!(!controller.check_once().await.unwrap());
    assert!(store.recording_tasks().is_empty());
}

#[tokio::test]
async fn empty_knowledge_output_creates_nothing() {
    let store = Arc::new(InMemoryTaskStore::new());
    let (controller, _) = controller(
        &store,
        MockKnowledgeBuilder::with_batches(vec![vec![]]),
        fast_config(),
    );
    let task = enqueue(&store, BuildTaskConfig::default()).await;

    controller.check_once().await.unwrap();

    let task = reload(&store, task.id).await;
    assert_eq!(task.stage, BuildStage::KnowledgeBuild);
    assert_eq!(task.stage_status, StageStatus::Pending);
    assert_eq!(
        task.error_message.as_deref(),
        Some("knowledge build produced no recording tasks")
    );
    assert!(task.source_id.is_none());
    assert!(store.recording_tasks().is_empty());
}

#[tokio::test]
async fn failed_recordings_block_publish_by_default() {
    init_tracing();
    let store = Arc::new(InMemoryTaskStore::new());
    let (controller, _) = controller(
        &store,
        MockKnowledgeBuilder::with_batches(vec![vec![1], vec![2]]),
        fast_config(),
    );
    let task = enqueue(&store, BuildTaskConfig::default()).await;

    controller.check_once().await.unwrap();
    settle_recordings(&store, 1).await;
    controller.check_once().await.unwrap();

    let task = reload(&store, task.id).await;
    assert_eq!(task.stage, BuildStage::Error);
    assert_eq!(
        task.error_message.as_deref(),
        Some("1 of 2 recording tasks exhausted retries")
    );

    let version_id = task.config.source_version_id.unwrap();
    let version = store.find_source_version(version_id).await.unwrap().unwrap();
    assert_eq!(version.status, VersionStatus::Building);
    assert!(store
        .active_source_version(task.source_id.unwrap())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn allow_partial_publishes_and_notes_failures() {
    init_tracing();
    let store = Arc::new(InMemoryTaskStore::new());
    let config = ControllerConfig::builder()
        .poll_interval(Duration::from_millis(20))
        .publish_policy(PublishPolicy::AllowPartial)
        .build();
    let (controller, _) = controller(
        &store,
        MockKnowledgeBuilder::with_batches(vec![vec![1], vec![2]]),
        config,
    );
    let task = enqueue(&store, BuildTaskConfig::default()).await;

    controller.check_once().await.unwrap();
    settle_recordings(&store, 1).await;
    controller.check_once().await.unwrap();

    let task = reload(&store, task.id).await;
    assert_eq!(task.stage, BuildStage::Completed);
    assert_eq!(
        task.error_message.as_deref(),
        Some("published with 1 of 2 recording tasks failed")
    );
    let active = store
        .active_source_version(task.source_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Some(active.id), task.config.source_version_id);
}

#[tokio::test]
async fn task_level_override_allows_partial_publish() {
    let store = Arc::new(InMemoryTaskStore::new());
    let (controller, _) = controller(
        &store,
        MockKnowledgeBuilder::with_batches(vec![vec![1], vec![2], vec![3]]),
        fast_config(),
    );
    let task = enqueue(
        &store,
        BuildTaskConfig {
            publish_on_partial_failure: Some(true),
            ..BuildTaskConfig::default()
        },
    )
    .await;

    controller.check_once().await.unwrap();
    settle_recordings(&store, 2).await;
    controller.check_once().await.unwrap();

    let task = reload(&store, task.id).await;
    assert_eq!(task.stage, BuildStage::Completed);
    assert_eq!(
        task.error_message.as_deref(),
        Some("published with 2 of 3 recording tasks failed")
    );
}

#[tokio::test]
async fn action_timeout_is_retried_then_completes() {
    init_tracing();
    let store = Arc::new(InMemoryTaskStore::new());
    let config = ControllerConfig::builder()
        .poll_interval(Duration::from_millis(20))
        .task_timeout(Duration::from_millis(100))
        .build();
    let (controller, _) = controller(
        &store,
        MockKnowledgeBuilder::with_batches(vec![vec![1], vec![2]]),
        config,
    );
    let task = enqueue(&store, BuildTaskConfig::default()).await;

    controller.check_once().await.unwrap();
    // Nobody records anything, so the action stage runs out of time.
    controller.check_once().await.unwrap();

    let timed_out = reload(&store, task.id).await;
    assert_eq!(timed_out.stage, BuildStage::ActionBuild);
    assert_eq!(timed_out.stage_status, StageStatus::Pending);
    assert_eq!(timed_out.retry_count(), 1);
    let message = timed_out.error_message.unwrap_or_default();
    assert!(message.starts_with("timed out after"), "got {:?}", message);
    assert!(message.contains("(2 of 2 outstanding)"), "got {:?}", message);
    // The retry keeps the version it was recording into.
    assert_eq!(
        timed_out.config.source_version_id,
        task_version(&store, task.id).await
    );

    settle_recordings(&store, 0).await;
    controller.check_once().await.unwrap();

    let task = reload(&store, task.id).await;
    assert_eq!(task.stage, BuildStage::Completed);
    assert!(task.error_message.is_none());
}

async fn task_version(
    store: &InMemoryTaskStore,
    id: BuildTaskId,
) -> Option<orchestrator_core::common::SourceVersionId> {
    store
        .recording_tasks_for_build_task(id)
        .await
        .unwrap()
        .first()
        .map(|r| r.source_version_id())
}

#[tokio::test]
async fn rebuild_archives_the_previous_version() {
    init_tracing();
    let store = Arc::new(InMemoryTaskStore::new());
    let (controller, _) = controller(
        &store,
        MockKnowledgeBuilder::with_batches(vec![vec![1]]),
        fast_config(),
    );

    let mut builds = Vec::new();
    for _ in 0..2 {
        let task = enqueue(&store, BuildTaskConfig::default()).await;
        controller.check_once().await.unwrap();
        settle_recordings(&store, 0).await;
        controller.check_once().await.unwrap();
        builds.push(reload(&store, task.id).await);
    }

    assert!(builds.iter().all(|b| b.stage == BuildStage::Completed));
    let source_id = builds[0].source_id.unwrap();
    assert_eq!(builds[1].source_id, Some(source_id));

    let versions = store.source_versions(source_id).await.unwrap();
    let summary: Vec<(i32, VersionStatus)> = versions
        .iter()
        .map(|v| (v.version_number, v.status))
        .collect();
    assert_eq!(
        summary,
        vec![(1, VersionStatus::Archived), (2, VersionStatus::Active)]
    );

    let source = store.find_source(source_id).await.unwrap().unwrap();
    assert_eq!(source.current_version_id, Some(versions[1].id));
}

#[tokio::test]
async fn competing_controllers_claim_a_task_once() {
    init_tracing();
    let store = Arc::new(InMemoryTaskStore::new());
    let builder = Arc::new(
        MockKnowledgeBuilder::with_batches(vec![vec![1]]).with_delay(Duration::from_millis(100)),
    );
    let first = BuildTaskController::new(store.clone(), builder.clone(), fast_config());
    let second = BuildTaskController::new(store.clone(), builder.clone(), fast_config());
    enqueue(&store, BuildTaskConfig::default()).await;

    let (a, b) = tokio::join!(first.check_once(), second.check_once());
    let claimed = [a.unwrap(), b.unwrap()];

    assert_eq!(claimed.iter().filter(|c| **c).count(), 1);
    assert_eq!(builder.calls().len(), 1);
    assert_eq!(store.recording_tasks().len(), 1);
}

#[tokio::test]
async fn stop_marks_the_running_task_with_the_reason() {
    init_tracing();
    let store = Arc::new(InMemoryTaskStore::new());
    let (controller, _) = controller(
        &store,
        MockKnowledgeBuilder::with_batches(vec![vec![1]]).with_delay(Duration::from_secs(5)),
        fast_config(),
    );
    let task = enqueue(&store, BuildTaskConfig::default()).await;

    controller.start().await.unwrap();
    assert!(controller.is_running().await);
    wait_until(Duration::from_secs(2), "knowledge stage running", || async {
        let current = reload(&store, task.id).await;
        current.stage == BuildStage::KnowledgeBuild && current.stage_status == StageStatus::Running
    })
    .await;

    controller.stop("deploy in progress").await;
    assert!(!controller.is_running().await);

    let task = reload(&store, task.id).await;
    assert_eq!(task.stage, BuildStage::Error);
    assert_eq!(task.stage_status, StageStatus::Error);
    assert_eq!(task.error_message.as_deref(), Some("deploy in progress"));
    assert!(store.recording_tasks().is_empty());
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let store = Arc::new(InMemoryTaskStore::new());
    let (controller, _) = controller(
        &store,
        MockKnowledgeBuilder::with_batches(vec![vec![1]]),
        fast_config(),
    );

    assert_ok!(controller.start().await);
    assert_err!(controller.start().await);
    controller.stop("test finished").await;

    // A stopped controller can be started again.
    assert_ok!(controller.start().await);
    controller.stop("test finished").await;
}

#[tokio::test]
async fn controller_and_worker_build_end_to_end() {
    init_tracing();
    let store = Arc::new(InMemoryTaskStore::new());
    let (controller, builder) = controller(
        &store,
        MockKnowledgeBuilder::with_batches(vec![vec![1, 2], vec![3], vec![4, 5, 6]]),
        fast_config(),
    );
    let executor = Arc::new(MockTaskExecutor::new().with_delay(Duration::from_millis(50)));
    let worker = RecordingTaskQueueWorker::new(
        store.clone(),
        executor.clone(),
        WorkerConfig {
            worker_id: "e2e-worker".to_string(),
            concurrency: 2,
            idle_wait: Duration::from_millis(20),
            ..WorkerConfig::default()
        },
    );
    let task = enqueue(&store, BuildTaskConfig::default()).await;

    worker.start().await.unwrap();
    controller.start().await.unwrap();

    wait_until(Duration::from_secs(5), "build task completed", || async {
        reload(&store, task.id).await.stage == BuildStage::Completed
    })
    .await;

    controller.stop("test finished").await;
    let report = worker.stop(Duration::from_secs(1)).await;
    assert_eq!(report.abandoned, 0);

    assert_eq!(builder.calls(), vec![task.id]);
    assert_eq!(executor.call_count(), 3);
    assert!(executor.max_in_flight() <= 2);
    assert_eq!(store.count_recording_tasks(RecordingStatus::Completed), 3);

    let task = reload(&store, task.id).await;
    let active = store
        .active_source_version(task.source_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Some(active.id), task.config.source_version_id);
    assert_eq!(active.version_number, 1);
}
