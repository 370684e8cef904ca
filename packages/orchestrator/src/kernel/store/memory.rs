//! In-memory task store.
//!
//! Holds all four tables behind one mutex, so each method observes and
//! mutates a consistent snapshot exactly like a single conditional statement
//! against Postgres would. Backs the integration tests.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;

use super::{
    ActionStagePlan, ActionStageStarted, BuildTaskStore, RecordingTaskStore, VersionStore,
};
use crate::common::{BuildTaskId, RecordingTaskId, SourceId, SourceVersionId};
use crate::domains::build_tasks::models::{BuildStage, BuildTask, BuildTaskConfig, StageStatus};
use crate::domains::recording::models::{
    RecordingStatus, RecordingTask, RecordingTaskConfig, RecordingTaskCounts, StaleRecoveryReport,
};
use crate::domains::versions::PublishError;
use crate::domains::versions::models::{Source, SourceVersion, VersionStatus};

#[derive(Default)]
struct Tables {
    build_tasks: Vec<BuildTask>,
    sources: Vec<Source>,
    versions: Vec<SourceVersion>,
    recording_tasks: Vec<RecordingTask>,
}

impl Tables {
    fn build_task_mut(&mut self, id: BuildTaskId) -> Option<&mut BuildTask> {
        self.build_tasks.iter_mut().find(|t| t.id == id)
    }

    fn recording_task_mut(&mut self, id: RecordingTaskId) -> Option<&mut RecordingTask> {
        self.recording_tasks.iter_mut().find(|t| t.id == id)
    }

    fn owned_running_mut(&mut self, id: RecordingTaskId, worker_id: &str) -> Option<&mut RecordingTask> {
        self.recording_task_mut(id).filter(|t| {
            t.status == RecordingStatus::Running && t.worker_id.as_deref() == Some(worker_id)
        })
    }
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    tables: Mutex<Tables>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        // A panic while holding the lock leaves the rows as they were; keep going.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a recording task as-is (fixtures).
    pub fn insert_recording_task(&self, task: RecordingTask) -> RecordingTask {
        self.tables().recording_tasks.push(task.clone());
        task
    }

    /// Insert a source as-is (fixtures).
    pub fn insert_source(&self, source: Source) -> Source {
        self.tables().sources.push(source.clone());
        source
    }

    /// Insert a version as-is (fixtures).
    pub fn insert_source_version(&self, version: SourceVersion) -> SourceVersion {
        self.tables().versions.push(version.clone());
        version
    }

    /// Rewrite a task's heartbeat, e.g. to age it past the stale timeout.
    pub fn set_last_heartbeat(&self, id: RecordingTaskId, at: DateTime<Utc>) -> bool {
        match self.tables().recording_task_mut(id) {
            Some(task) => {
                task.last_heartbeat = Some(at);
                true
            }
            None => false,
        }
    }

    pub fn recording_tasks(&self) -> Vec<RecordingTask> {
        self.tables().recording_tasks.clone()
    }

    pub fn build_tasks(&self) -> Vec<BuildTask> {
        self.tables().build_tasks.clone()
    }

    pub fn count_recording_tasks(&self, status: RecordingStatus) -> usize {
        self.tables()
            .recording_tasks
            .iter()
            .filter(|t| t.status == status)
            .count()
    }
}

#[async_trait]
impl BuildTaskStore for InMemoryTaskStore {
    async fn create_build_task(&self, task: BuildTask) -> Result<BuildTask> {
        let mut tables = self.tables();
        if tables.build_tasks.iter().any(|t| t.id == task.id) {
            bail!("build task {} already exists", task.id);
        }
        tables.build_tasks.push(task.clone());
        Ok(task)
    }

    async fn find_build_task(&self, id: BuildTaskId) -> Result<Option<BuildTask>> {
        Ok(self.tables().build_tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn claim_build_task(&self) -> Result<Option<BuildTask>> {
        let mut tables = self.tables();
        let now = Utc::now();
        let Some(task) = tables
            .build_tasks
            .iter_mut()
            .filter(|t| t.is_claimable())
            .min_by_key(|t| (t.created_at, t.id))
        else {
            return Ok(None);
        };

        match task.stage {
            BuildStage::Init => {
                task.stage = BuildStage::KnowledgeBuild;
                task.knowledge_started_at = Some(now);
            }
            BuildStage::ActionBuild => {
                task.action_started_at.get_or_insert(now);
            }
            _ => {}
        }
        task.stage_status = StageStatus::Running;
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn begin_action_stage(
        &self,
        id: BuildTaskId,
        plan: ActionStagePlan,
    ) -> Result<ActionStageStarted> {
        let mut tables = self.tables();
        let now = Utc::now();

        match tables.build_tasks.iter().find(|t| t.id == id) {
            Some(t)
                if t.stage == BuildStage::KnowledgeBuild
                    && t.stage.can_transition_to(BuildStage::ActionBuild)
                    && t.stage_status == StageStatus::Running => {}
            Some(_) => bail!("build task {} is no longer in knowledge_build/running", id),
            None => bail!("build task {} not found", id),
        }

        let existing = tables.sources.iter().position(|s| s.base_url == plan.source_url);
        let source = match existing {
            Some(index) => {
                let source = &mut tables.sources[index];
                source.updated_at = now;
                source.clone()
            }
            None => {
                let source = Source::new(&plan.source_name, &plan.source_url);
                tables.sources.push(source.clone());
                source
            }
        };

        let version_number = tables
            .versions
            .iter()
            .filter(|v| v.source_id == source.id)
            .map(|v| v.version_number)
            .max()
            .unwrap_or(0)
            + 1;
        let version = SourceVersion::building(
            source.id,
            version_number,
            plan.commit_message.clone(),
            plan.created_by.clone(),
        );
        tables.versions.push(version.clone());

        for chunk_ids in &plan.chunk_batches {
            let mut config = RecordingTaskConfig::for_version(version.id);
            config.start_url = plan.start_url.clone();
            tables
                .recording_tasks
                .push(RecordingTask::new_pending(id, source.id, chunk_ids.clone(), config));
        }

        let config = BuildTaskConfig {
            source_version_id: Some(version.id),
            ..plan.config
        };
        if let Some(task) = tables.build_task_mut(id) {
            task.source_id = Some(source.id);
            task.config = Json(config);
            task.stage = BuildStage::ActionBuild;
            task.stage_status = StageStatus::Pending;
            task.error_message = None;
            task.knowledge_completed_at = Some(now);
            task.updated_at = now;
        }

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
        let mut tables = self.tables();
        match tables.build_task_mut(id) {
            Some(task) if task.stage_status == StageStatus::Running => {
                task.stage_status = StageStatus::Pending;
                task.config = Json(config.clone());
                task.error_message = Some(error.to_string());
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_build_task(&self, id: BuildTaskId, error: &str) -> Result<bool> {
        let mut tables = self.tables();
        match tables.build_task_mut(id) {
            Some(task)
                if task.stage_status == StageStatus::Running
                    && task.stage.can_transition_to(BuildStage::Error) =>
            {
                task.stage = BuildStage::Error;
                task.stage_status = StageStatus::Error;
                task.error_message = Some(error.to_string());
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_build_task(&self, id: BuildTaskId, summary: Option<&str>) -> Result<bool> {
        let mut tables = self.tables();
        match tables.build_task_mut(id) {
            Some(task)
                if task.stage == BuildStage::ActionBuild
                    && task.stage.can_transition_to(BuildStage::Completed)
                    && task.stage_status == StageStatus::Running =>
            {
                let now = Utc::now();
                task.stage = BuildStage::Completed;
                task.stage_status = StageStatus::Completed;
                task.error_message = summary.map(str::to_string);
                task.action_completed_at = Some(now);
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl VersionStore for InMemoryTaskStore {
    async fn find_source(&self, id: SourceId) -> Result<Option<Source>> {
        Ok(self.tables().sources.iter().find(|s| s.id == id).cloned())
    }

    async fn find_source_version(&self, id: SourceVersionId) -> Result<Option<SourceVersion>> {
        Ok(self.tables().versions.iter().find(|v| v.id == id).cloned())
    }

    async fn active_source_version(&self, source_id: SourceId) -> Result<Option<SourceVersion>> {
        Ok(self
            .tables()
            .versions
            .iter()
            .find(|v| v.source_id == source_id && v.status == VersionStatus::Active)
            .cloned())
    }

    async fn source_versions(&self, source_id: SourceId) -> Result<Vec<SourceVersion>> {
        let mut versions: Vec<SourceVersion> = self
            .tables()
            .versions
            .iter()
            .filter(|v| v.source_id == source_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version_number);
        Ok(versions)
    }

    async fn swap_active_version(
        &self,
        version_id: SourceVersionId,
        source_id: SourceId,
    ) -> Result<SourceVersion, PublishError> {
        let mut tables = self.tables();

        if !tables.sources.iter().any(|s| s.id == source_id) {
            return Err(PublishError::SourceNotFound(source_id));
        }
        let Some(target) = tables.versions.iter().find(|v| v.id == version_id) else {
            return Err(PublishError::VersionNotFound(version_id));
        };
        if target.source_id != source_id {
            return Err(PublishError::SourceMismatch {
                version_id,
                expected: source_id,
                actual: target.source_id,
            });
        }
        if !target.is_publishable() {
            return Err(PublishError::Archived(version_id));
        }

        let now = Utc::now();
        let mut published = None;
        for version in tables.versions.iter_mut().filter(|v| v.source_id == source_id) {
            if version.id == version_id {
                version.status = VersionStatus::Active;
                version.published_at = Some(now);
                published = Some(version.clone());
            } else if version.status == VersionStatus::Active {
                version.status = VersionStatus::Archived;
            }
        }
        if let Some(source) = tables.sources.iter_mut().find(|s| s.id == source_id) {
            source.current_version_id = Some(version_id);
            source.updated_at = now;
        }

        published.ok_or(PublishError::VersionNotFound(version_id))
    }
}

#[async_trait]
impl RecordingTaskStore for InMemoryTaskStore {
    async fn claim_recording_task(&self, worker_id: &str) -> Result<Option<RecordingTask>> {
        let mut tables = self.tables();
        let Some(task) = tables
            .recording_tasks
            .iter_mut()
            .filter(|t| t.status == RecordingStatus::Pending)
            .min_by_key(|t| (t.created_at, t.id))
        else {
            return Ok(None);
        };

        let now = Utc::now();
        task.status = RecordingStatus::Running;
        task.worker_id = Some(worker_id.to_string());
        task.last_heartbeat = Some(now);
        task.updated_at = now;
        Ok(Some(task.clone()))
    }

    async fn heartbeat_recording_tasks(
        &self,
        ids: &[RecordingTaskId],
        worker_id: &str,
    ) -> Result<u64> {
        let mut tables = self.tables();
        let now = Utc::now();
        let mut renewed = 0;
        for task in tables.recording_tasks.iter_mut().filter(|t| {
            ids.contains(&t.id)
                && t.status == RecordingStatus::Running
                && t.worker_id.as_deref() == Some(worker_id)
        }) {
            task.last_heartbeat = Some(now);
            task.updated_at = now;
            renewed += 1;
        }
        Ok(renewed)
    }

    async fn complete_recording_task(&self, id: RecordingTaskId, worker_id: &str) -> Result<bool> {
        let mut tables = self.tables();
        let Some(task) = tables.owned_running_mut(id, worker_id) else {
            return Ok(false);
        };
        let now = Utc::now();
        task.status = RecordingStatus::Completed;
        task.worker_id = None;
        task.error_message = None;
        task.completed_at = Some(now);
        task.updated_at = now;
        Ok(true)
    }

    async fn fail_recording_task_attempt(
        &self,
        id: RecordingTaskId,
        worker_id: &str,
        error: &str,
        max_attempts: i32,
    ) -> Result<Option<RecordingStatus>> {
        let mut tables = self.tables();
        let Some(task) = tables.owned_running_mut(id, worker_id) else {
            return Ok(None);
        };
        let now = Utc::now();
        let status = RecordingTask::status_after_failure(task.attempt_count, max_attempts);
        task.attempt_count += 1;
        task.status = status;
        task.worker_id = None;
        task.error_message = Some(error.to_string());
        task.completed_at = status.is_terminal().then_some(now);
        task.updated_at = now;
        Ok(Some(status))
    }

    async fn recover_stale_recording_tasks(
        &self,
        stale_after: Duration,
        max_attempts: i32,
    ) -> Result<StaleRecoveryReport> {
        let mut tables = self.tables();
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(stale_after)?;
        let mut report = StaleRecoveryReport::default();

        for task in tables.recording_tasks.iter_mut().filter(|t| {
            t.status == RecordingStatus::Running && t.last_heartbeat.is_some_and(|hb| hb < cutoff)
        }) {
            let (status, attempts) = RecordingTask::recovered_from_stale(task.attempt_count, max_attempts);
            task.status = status;
            task.attempt_count = attempts;
            task.worker_id = None;
            task.updated_at = now;
            if status == RecordingStatus::Failed {
                task.completed_at = Some(now);
                task.error_message = Some("heartbeat lost after final attempt".to_string());
                report.failed += 1;
            } else {
                report.requeued += 1;
            }
        }
        Ok(report)
    }

    async fn recording_task_counts(&self, build_task_id: BuildTaskId) -> Result<RecordingTaskCounts> {
        let tables = self.tables();
        let mut counts = RecordingTaskCounts::default();
        for task in tables.recording_tasks.iter().filter(|t| t.build_task_id == build_task_id) {
            match task.status {
                RecordingStatus::Pending => counts.pending += 1,
                RecordingStatus::Running => counts.running += 1,
                RecordingStatus::Completed => counts.completed += 1,
                RecordingStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn outstanding_tasks_for_version(&self, version_id: SourceVersionId) -> Result<i64> {
        let count = self
            .tables()
            .recording_tasks
            .iter()
            .filter(|t| t.source_version_id() == version_id && !t.status.is_terminal())
            .count();
        Ok(count as i64)
    }

    async fn find_recording_task(&self, id: RecordingTaskId) -> Result<Option<RecordingTask>> {
        Ok(self.tables().recording_tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn recording_tasks_for_build_task(
        &self,
        build_task_id: BuildTaskId,
    ) -> Result<Vec<RecordingTask>> {
        Ok(self
            .tables()
            .recording_tasks
            .iter()
            .filter(|t| t.build_task_id == build_task_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_task(store: &InMemoryTaskStore) -> RecordingTask {
        let version = SourceVersionId::new();
        store.insert_recording_task(RecordingTask::new_pending(
            BuildTaskId::new(),
            SourceId::new(),
            vec![1, 2],
            RecordingTaskConfig::for_version(version),
        ))
    }

    #[tokio::test]
    async fn finished_build_task_cannot_move_to_error() {
        let store = InMemoryTaskStore::new();
        let mut task = BuildTask::new("https://docs.example.com", BuildTaskConfig::default());
        task.stage = BuildStage::Completed;
        task.stage_status = StageStatus::Running;
        let task = store.create_build_task(task).await.unwrap();

        assert!(!store.fail_build_task(task.id, "late failure").await.unwrap());
        let task = store.find_build_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.stage, BuildStage::Completed);
        assert!(task.error_message.is_none());
    }

    #[tokio::test]
    async fn claimed_task_is_owned_by_the_claimant() {
        let store = InMemoryTaskStore::new();
        let task = pending_task(&store);

        let claimed = store.claim_recording_task("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);
        assert_eq!(claimed.status, RecordingStatus::Running);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
        assert!(claimed.last_heartbeat.is_some());

        assert!(store.claim_recording_task("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_owner_cannot_complete_or_heartbeat() {
        let store = InMemoryTaskStore::new();
        let task = pending_task(&store);
        store.claim_recording_task("w1").await.unwrap();

        assert!(!store.complete_recording_task(task.id, "w2").await.unwrap());
        assert_eq!(store.heartbeat_recording_tasks(&[task.id], "w2").await.unwrap(), 0);
        assert!(store.complete_recording_task(task.id, "w1").await.unwrap());
        assert!(!store.complete_recording_task(task.id, "w1").await.unwrap());
    }

    #[tokio::test]
    async fn failed_attempts_requeue_then_fail() {
        let store = InMemoryTaskStore::new();
        let task = pending_task(&store);

        for expected in [RecordingStatus::Pending, RecordingStatus::Pending, RecordingStatus::Failed] {
            store.claim_recording_task("w1").await.unwrap().unwrap();
            let status = store
                .fail_recording_task_attempt(task.id, "w1", "boom", 3)
                .await
                .unwrap();
            assert_eq!(status, Some(expected));
        }

        let task = store.find_recording_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.attempt_count, 3);
        assert_eq!(task.error_message.as_deref(), Some("boom"));
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn begin_action_stage_requires_a_running_knowledge_task() {
        let store = InMemoryTaskStore::new();
        let task = store
            .create_build_task(BuildTask::new("https://example.com", BuildTaskConfig::default()))
            .await
            .unwrap();

        let plan = ActionStagePlan {
            source_name: "example.com".into(),
            source_url: "https://example.com".into(),
            commit_message: None,
            created_by: None,
            chunk_batches: vec![vec![1]],
            start_url: None,
            config: BuildTaskConfig::default(),
        };
        assert!(store.begin_action_stage(task.id, plan).await.is_err());
        assert!(store.recording_tasks().is_empty());
    }
}
