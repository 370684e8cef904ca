//! Build task controller.
//!
//! Polls the store for one claimable build task at a time and runs the
//! handler for its stage:
//!
//! ```text
//! BuildTaskController
//!     │
//!     ├─► claim_build_task        init → knowledge_build/running, or resume a
//!     │                           pending knowledge_build / action_build task
//!     ├─► StageRunner::run        knowledge stage or action stage
//!     └─► on failure              retry (pending, _retryCount + 1) or error
//! ```
//!
//! Several controllers may poll the same store; the claim has one winner.

use std::str::FromStr;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use super::stages::{StageError, StageRunner};
use crate::domains::build_tasks::models::{BuildTask, BuildTaskConfig, RetryDecision};
use crate::domains::versions::VersionPublisher;
use crate::kernel::store::TaskStore;
use crate::kernel::traits::BaseKnowledgeBuilder;

/// Recorded on a task interrupted by `stop` without an explicit reason.
pub const DEFAULT_STOP_REASON: &str = "controller stopped while the stage was running";

/// What to do when some recording tasks of a batch failed permanently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishPolicy {
    /// Any failed recording task fails the build; nothing is published.
    #[default]
    RequireAllCompleted,
    /// Publish whatever completed and note the failures on the build task.
    AllowPartial,
}

impl PublishPolicy {
    /// Apply a task's `publishOnPartialFailure` override.
    pub fn for_task(self, config: &BuildTaskConfig) -> PublishPolicy {
        match config.publish_on_partial_failure {
            Some(true) => PublishPolicy::AllowPartial,
            Some(false) => PublishPolicy::RequireAllCompleted,
            None => self,
        }
    }
}

impl std::fmt::Display for PublishPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishPolicy::RequireAllCompleted => write!(f, "require_all_completed"),
            PublishPolicy::AllowPartial => write!(f, "allow_partial"),
        }
    }
}

impl FromStr for PublishPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "require_all_completed" => Ok(PublishPolicy::RequireAllCompleted),
            "allow_partial" => Ok(PublishPolicy::AllowPartial),
            _ => Err(anyhow::anyhow!("Invalid publish policy: {}", s)),
        }
    }
}

/// Configuration for the build task controller.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ControllerConfig {
    /// Wait between claims when nothing was claimable; also the action
    /// stage's count polling interval
    #[builder(default = Duration::from_secs(5))]
    pub poll_interval: Duration,
    /// How long the action stage waits for its recording tasks
    #[builder(default = Duration::from_secs(60 * 60))]
    pub task_timeout: Duration,
    /// Stage failures tolerated before a task moves to `error`
    #[builder(default = 3)]
    pub max_retries: u32,
    #[builder(default)]
    pub publish_policy: PublishPolicy,
    /// Written to `source_versions.created_by`
    #[builder(default = "build-controller".to_string())]
    pub created_by: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

struct Inner<S> {
    store: Arc<S>,
    stages: StageRunner<S>,
    stop_reason: std::sync::Mutex<Option<String>>,
}

struct PollLoop {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BuildTaskController<S> {
    inner: Arc<Inner<S>>,
    poll_loop: Mutex<Option<PollLoop>>,
}

impl<S: TaskStore + 'static> BuildTaskController<S> {
    pub fn new(
        store: Arc<S>,
        builder: Arc<dyn BaseKnowledgeBuilder>,
        config: ControllerConfig,
    ) -> Self {
        let publisher = VersionPublisher::new(store.clone());
        Self {
            inner: Arc::new(Inner {
                store: store.clone(),
                stages: StageRunner {
                    store,
                    builder,
                    publisher,
                    config,
                },
                stop_reason: std::sync::Mutex::new(None),
            }),
            poll_loop: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.stages.config
    }

    /// Claim at most one task and run its stage handler.
    ///
    /// Returns whether a task was claimed. Handler failures are recorded on
    /// the task (retry or error); only store failures are returned.
    pub async fn check_once(&self) -> Result<bool> {
        self.inner.check_once(&CancellationToken::new()).await
    }

    /// Poll every `poll_interval` until `stop`; re-checks immediately after
    /// doing work.
    pub async fn start(&self) -> Result<()> {
        let mut poll_loop = self.poll_loop.lock().await;
        if poll_loop.is_some() {
            bail!("build task controller is already running");
        }

        *self
            .inner
            .stop_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        let stop = CancellationToken::new();
        let inner = self.inner.clone();
        let loop_stop = stop.clone();
        let handle = tokio::spawn(async move { inner.run(loop_stop).await });

        info!(
            poll_interval_ms = self.config().poll_interval.as_millis() as u64,
            max_retries = self.config().max_retries,
            publish_policy = %self.config().publish_policy,
            "build task controller started"
        );
        *poll_loop = Some(PollLoop { stop, handle });
        Ok(())
    }

    /// Stop polling. A stage running at this moment is abandoned and its task
    /// moves to `error` with `reason`. Returns once the loop has exited.
    pub async fn stop(&self, reason: &str) {
        let Some(poll_loop) = self.poll_loop.lock().await.take() else {
            return;
        };

        *self
            .inner
            .stop_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
        poll_loop.stop.cancel();

        if let Err(e) = poll_loop.handle.await {
            error!(error = %e, "build task controller loop ended abnormally");
        }
        info!(reason, "build task controller stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.poll_loop.lock().await.is_some()
    }
}

impl<S: TaskStore + 'static> Inner<S> {
    async fn run(&self, stop: CancellationToken) {
        loop {
            if stop.is_cancelled() {
                break;
            }

            match self.check_once(&stop).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!(error = %e, "build task check failed"),
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.stages.config.poll_interval) => {}
            }
        }
        debug!("build task poll loop exited");
    }

    async fn check_once(&self, stop: &CancellationToken) -> Result<bool> {
        let Some(task) = self.store.claim_build_task().await? else {
            return Ok(false);
        };

        info!(
            build_task_id = %task.id,
            stage = %task.stage,
            source_url = %task.source_url,
            retry_count = task.retry_count(),
            "claimed build task"
        );

        let result = tokio::select! {
            biased;
            _ = stop.cancelled() => None,
            result = self.stages.run(&task) => Some(result),
        };

        match result {
            Some(Ok(())) => {}
            Some(Err(err)) => self.handle_failure(&task, err).await?,
            None => self.handle_interrupted(&task).await?,
        }
        Ok(true)
    }

    async fn handle_failure(&self, task: &BuildTask, err: StageError) -> Result<()> {
        let message = err.to_string();

        if !err.is_retryable() {
            error!(build_task_id = %task.id, stage = %task.stage, error = %message, "build task failed");
            self.store.fail_build_task(task.id, &message).await?;
            return Ok(());
        }

        match task.config.record_failure(self.stages.config.max_retries) {
            RetryDecision::Retry(config) => {
                warn!(
                    build_task_id = %task.id,
                    stage = %task.stage,
                    attempt = config.retry_count,
                    max_retries = self.stages.config.max_retries,
                    error = %message,
                    "stage failed; will retry"
                );
                self.store
                    .reset_build_task_for_retry(task.id, &config, &message)
                    .await?;
            }
            RetryDecision::GiveUp { attempts } => {
                error!(
                    build_task_id = %task.id,
                    stage = %task.stage,
                    attempts,
                    error = %message,
                    "stage failed; retries exhausted"
                );
                let message = format!("{} (gave up after {} attempts)", message, attempts);
                self.store.fail_build_task(task.id, &message).await?;
            }
        }
        Ok(())
    }

    async fn handle_interrupted(&self, task: &BuildTask) -> Result<()> {
        let reason = self
            .stop_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| DEFAULT_STOP_REASON.to_string());

        if self.store.fail_build_task(task.id, &reason).await? {
            warn!(build_task_id = %task.id, stage = %task.stage, reason = %reason, "build task interrupted");
        } else {
            // The stage finished its last write before the stop landed.
            debug!(build_task_id = %task.id, "interrupted build task had already moved on");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.publish_policy, PublishPolicy::RequireAllCompleted);
    }

    #[test]
    fn test_config_builder_overrides() {
        let config = ControllerConfig::builder()
            .poll_interval(Duration::from_millis(20))
            .publish_policy(PublishPolicy::AllowPartial)
            .created_by("ops")
            .build();
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.publish_policy, PublishPolicy::AllowPartial);
        assert_eq!(config.created_by, "ops");
    }

    #[test]
    fn task_override_wins_over_process_policy() {
        let mut config = BuildTaskConfig::default();
        assert_eq!(
            PublishPolicy::AllowPartial.for_task(&config),
            PublishPolicy::AllowPartial
        );

        config.publish_on_partial_failure = Some(false);
        assert_eq!(
            PublishPolicy::AllowPartial.for_task(&config),
            PublishPolicy::RequireAllCompleted
        );

        config.publish_on_partial_failure = Some(true);
        assert_eq!(
            PublishPolicy::RequireAllCompleted.for_task(&config),
            PublishPolicy::AllowPartial
        );
    }

    #[test]
    fn publish_policy_parses_its_display_form() {
        for policy in [PublishPolicy::RequireAllCompleted, PublishPolicy::AllowPartial] {
            assert_eq!(policy.to_string().parse::<PublishPolicy>().unwrap(), policy);
        }
        assert!("sometimes".parse::<PublishPolicy>().is_err());
    }
}
