//! Recording task queue worker.
//!
//! The `RecordingTaskQueueWorker` is a concurrency-bounded pool that:
//! - Claims pending recording tasks (at most `concurrency` in flight)
//! - Runs each one through the task executor on its own tokio task
//! - Renews heartbeats for everything in flight from a single timer
//! - Sweeps stale tasks left behind by dead workers
//! - Reconciles the outcome (completed, re-queued or failed)
//!
//! # Architecture
//!
//! ```text
//! RecordingTaskQueueWorker
//!     │
//!     ├─► claim loop      acquire permit → claim → spawn execution
//!     │       └─► execution   executor.execute(task) → complete / fail attempt
//!     ├─► heartbeat timer renew last_heartbeat for the in-flight set
//!     └─► stale sweep     StaleRecovery::recover_stale_tasks
//! ```
//!
//! `stop` halts claiming (and the stale sweep) right away, waits a bounded
//! time for in-flight executions, then stops the heartbeat timer. Executions
//! still running at that point are left alone; without heartbeats they age
//! into stale recovery.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::stale_recovery::StaleRecovery;
use crate::common::{BuildTaskId, RecordingTaskId};
use crate::domains::recording::models::{RecordingStatus, RecordingTask};
use crate::kernel::store::RecordingTaskStore;
use crate::kernel::traits::{BaseTaskExecutor, ExecutionOutcome};

/// Granularity of the drain wait in `stop`.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Back-off after a failed claim query.
const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Configuration for the recording worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Owner id written to claimed rows
    pub worker_id: String,
    /// Maximum tasks executing at once
    pub concurrency: usize,
    /// How long to wait when nothing is pending
    pub idle_wait: Duration,
    /// How often in-flight tasks renew their heartbeat
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a running task counts as abandoned
    pub stale_timeout: Duration,
    /// How often this instance runs the stale sweep
    pub stale_check_interval: Duration,
    /// Attempts before a task is marked failed
    pub max_attempts: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: 3,
            idle_wait: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            stale_timeout: Duration::from_secs(15 * 60),
            stale_check_interval: Duration::from_secs(60),
            max_attempts: 3,
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Reject settings under which the timers can't run or heartbeats
    /// can't keep a claim alive.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("worker concurrency must be at least 1");
        }
        if self.max_attempts < 1 {
            bail!("max attempts must be at least 1");
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be greater than zero");
        }
        if self.stale_check_interval.is_zero() {
            bail!("stale check interval must be greater than zero");
        }
        if self.heartbeat_interval >= self.stale_timeout {
            bail!(
                "heartbeat interval ({:?}) must be shorter than the stale timeout ({:?})",
                self.heartbeat_interval,
                self.stale_timeout
            );
        }
        Ok(())
    }
}

/// Point-in-time view of a worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerState {
    pub running: bool,
    pub in_flight: Vec<RecordingTaskId>,
    pub completed: u64,
    pub failed: u64,
}

/// What `stop` managed to wait for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// In-flight tasks that finished during the drain
    pub drained: usize,
    /// Tasks still executing when the drain timeout expired
    pub abandoned: usize,
}

#[derive(Debug, Clone, Copy)]
struct InFlightTask {
    build_task_id: BuildTaskId,
    started_at: Instant,
}

struct Shared<S> {
    store: Arc<S>,
    executor: Arc<dyn BaseTaskExecutor>,
    stale_recovery: StaleRecovery<S>,
    config: WorkerConfig,
    in_flight: RwLock<HashMap<RecordingTaskId, InFlightTask>>,
    completed: AtomicU64,
    failed: AtomicU64,
}

struct Lifecycle {
    stop_claiming: CancellationToken,
    stop_heartbeat: CancellationToken,
    claim_loop: JoinHandle<()>,
    stale_sweep: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

pub struct RecordingTaskQueueWorker<S> {
    shared: Arc<Shared<S>>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl<S: RecordingTaskStore + 'static> RecordingTaskQueueWorker<S> {
    pub fn new(store: Arc<S>, executor: Arc<dyn BaseTaskExecutor>, config: WorkerConfig) -> Self {
        let stale_recovery =
            StaleRecovery::new(store.clone(), config.stale_timeout, config.max_attempts);
        Self {
            shared: Arc::new(Shared {
                store,
                executor,
                stale_recovery,
                config,
                in_flight: RwLock::new(HashMap::new()),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            lifecycle: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.config.worker_id
    }

    /// Start claiming. Fails if the pool is already running.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            bail!("worker {} is already running", self.worker_id());
        }

        let config = &self.shared.config;
        config.validate()?;
        info!(
            worker_id = %config.worker_id,
            concurrency = config.concurrency,
            heartbeat_interval_ms = config.heartbeat_interval.as_millis() as u64,
            stale_timeout_secs = config.stale_timeout.as_secs(),
            "recording worker starting"
        );

        let stop_claiming = CancellationToken::new();
        let stop_heartbeat = CancellationToken::new();

        *lifecycle = Some(Lifecycle {
            claim_loop: tokio::spawn(claim_loop(self.shared.clone(), stop_claiming.clone())),
            stale_sweep: tokio::spawn(stale_sweep_loop(self.shared.clone(), stop_claiming.clone())),
            heartbeat: tokio::spawn(heartbeat_loop(self.shared.clone(), stop_heartbeat.clone())),
            stop_claiming,
            stop_heartbeat,
        });
        Ok(())
    }

    /// Stop claiming, wait up to `timeout` for in-flight tasks, then stop
    /// heartbeating. Never cancels a running execution.
    pub async fn stop(&self, timeout: Duration) -> DrainReport {
        let Some(lifecycle) = self.lifecycle.lock().await.take() else {
            return DrainReport::default();
        };

        lifecycle.stop_claiming.cancel();
        // Once the claim loop has exited the in-flight set can only shrink.
        if let Err(e) = lifecycle.claim_loop.await {
            error!(worker_id = %self.worker_id(), error = %e, "claim loop ended abnormally");
        }
        if let Err(e) = lifecycle.stale_sweep.await {
            error!(worker_id = %self.worker_id(), error = %e, "stale sweep ended abnormally");
        }

        let waiting = self.shared.in_flight.read().await.len();
        if waiting > 0 {
            info!(
                worker_id = %self.worker_id(),
                count = waiting,
                timeout_ms = timeout.as_millis() as u64,
                "waiting for in-flight recording tasks"
            );
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.in_flight.read().await.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(DRAIN_POLL.min(deadline - now)).await;
        }

        let abandoned = {
            let in_flight = self.shared.in_flight.read().await;
            for (task_id, task) in in_flight.iter() {
                warn!(
                    worker_id = %self.worker_id(),
                    task_id = %task_id,
                    build_task_id = %task.build_task_id,
                    running_secs = task.started_at.elapsed().as_secs(),
                    "abandoning in-flight recording task"
                );
            }
            in_flight.len()
        };
        lifecycle.stop_heartbeat.cancel();
        if let Err(e) = lifecycle.heartbeat.await {
            error!(worker_id = %self.worker_id(), error = %e, "heartbeat timer ended abnormally");
        }

        let report = DrainReport {
            drained: waiting.saturating_sub(abandoned),
            abandoned,
        };
        if abandoned > 0 {
            warn!(
                worker_id = %self.worker_id(),
                abandoned,
                "drain timed out; abandoned tasks will be recovered as stale"
            );
        }
        info!(worker_id = %self.worker_id(), drained = report.drained, "recording worker stopped");
        report
    }

    pub async fn state(&self) -> WorkerState {
        let running = self.lifecycle.lock().await.is_some();
        let mut in_flight: Vec<RecordingTaskId> =
            self.shared.in_flight.read().await.keys().copied().collect();
        in_flight.sort();
        WorkerState {
            running,
            in_flight,
            completed: self.shared.completed.load(Ordering::SeqCst),
            failed: self.shared.failed.load(Ordering::SeqCst),
        }
    }
}

async fn claim_loop<S: RecordingTaskStore + 'static>(shared: Arc<Shared<S>>, stop: CancellationToken) {
    let config = &shared.config;
    let permits = Arc::new(Semaphore::new(config.concurrency));

    loop {
        let permit = tokio::select! {
            _ = stop.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        if stop.is_cancelled() {
            break;
        }

        let claimed = shared.store.claim_recording_task(&config.worker_id).await;
        let task = match claimed {
            Ok(Some(task)) => task,
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(config.idle_wait) => {}
                }
                continue;
            }
            Err(e) => {
                drop(permit);
                error!(worker_id = %config.worker_id, error = %e, "failed to claim recording task");
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(CLAIM_ERROR_BACKOFF) => {}
                }
                continue;
            }
        };

        debug!(
            worker_id = %config.worker_id,
            task_id = %task.id,
            build_task_id = %task.build_task_id,
            attempt = task.attempt_count + 1,
            "claimed recording task"
        );

        // Registered before spawning so `stop` never misses it.
        shared.in_flight.write().await.insert(
            task.id,
            InFlightTask {
                build_task_id: task.build_task_id,
                started_at: Instant::now(),
            },
        );

        let task_shared = shared.clone();
        tokio::spawn(async move {
            let id = task.id;
            run_task(&task_shared, task).await;
            task_shared.in_flight.write().await.remove(&id);
            drop(permit);
        });
    }

    debug!(worker_id = %config.worker_id, "claim loop stopped");
}

async fn run_task<S: RecordingTaskStore + 'static>(shared: &Shared<S>, task: RecordingTask) {
    let worker_id = shared.config.worker_id.as_str();
    let task_id = task.id;
    let build_task_id = task.build_task_id;
    let started = Instant::now();

    // Separate tokio task so a panicking executor surfaces as a JoinError.
    let executor = shared.executor.clone();
    let execution = tokio::spawn(async move { executor.execute(&task).await });

    let outcome = match execution.await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => ExecutionOutcome::failed(format!("{:#}", e), elapsed_ms(started)),
        Err(join_error) => {
            let message = if join_error.is_panic() {
                format!("executor panicked: {}", panic_message(join_error.into_panic()))
            } else {
                "execution was cancelled".to_string()
            };
            ExecutionOutcome::failed(message, elapsed_ms(started))
        }
    };

    if outcome.success {
        match shared.store.complete_recording_task(task_id, worker_id).await {
            Ok(true) => {
                shared.completed.fetch_add(1, Ordering::SeqCst);
                info!(
                    worker_id,
                    task_id = %task_id,
                    build_task_id = %build_task_id,
                    artifacts = outcome.artifacts_created,
                    duration_ms = outcome.duration_ms,
                    "recording task completed"
                );
            }
            Ok(false) => warn!(
                worker_id,
                task_id = %task_id,
                "recording task finished after losing ownership; result discarded"
            ),
            Err(e) => error!(worker_id, task_id = %task_id, error = %e, "failed to mark recording task completed"),
        }
        return;
    }

    let message = outcome
        .error
        .unwrap_or_else(|| "executor reported failure".to_string());
    match shared
        .store
        .fail_recording_task_attempt(task_id, worker_id, &message, shared.config.max_attempts)
        .await
    {
        Ok(Some(RecordingStatus::Failed)) => {
            shared.failed.fetch_add(1, Ordering::SeqCst);
            error!(
                worker_id,
                task_id = %task_id,
                build_task_id = %build_task_id,
                error = %message,
                "recording task failed permanently"
            );
        }
        Ok(Some(status)) => warn!(
            worker_id,
            task_id = %task_id,
            build_task_id = %build_task_id,
            status = %status,
            error = %message,
            "recording task attempt failed; re-queued"
        ),
        Ok(None) => warn!(
            worker_id,
            task_id = %task_id,
            "recording task failed after losing ownership; result discarded"
        ),
        Err(e) => error!(worker_id, task_id = %task_id, error = %e, "failed to record failed attempt"),
    }
}

async fn heartbeat_loop<S: RecordingTaskStore + 'static>(shared: Arc<Shared<S>>, stop: CancellationToken) {
    let config = &shared.config;
    let mut interval = tokio::time::interval(config.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                let ids: Vec<RecordingTaskId> = {
                    let in_flight = shared.in_flight.read().await;
                    if let Some(oldest) = in_flight.values().map(|t| t.started_at).min() {
                        debug!(
                            worker_id = %config.worker_id,
                            count = in_flight.len(),
                            oldest_secs = oldest.elapsed().as_secs(),
                            "renewing heartbeats"
                        );
                    }
                    in_flight.keys().copied().collect()
                };
                if ids.is_empty() {
                    continue;
                }
                match shared.store.heartbeat_recording_tasks(&ids, &config.worker_id).await {
                    Ok(renewed) if (renewed as usize) < ids.len() => warn!(
                        worker_id = %config.worker_id,
                        renewed,
                        in_flight = ids.len(),
                        "some in-flight tasks are no longer owned by this worker"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(worker_id = %config.worker_id, error = %e, "heartbeat failed"),
                }
            }
        }
    }
}

async fn stale_sweep_loop<S: RecordingTaskStore + 'static>(shared: Arc<Shared<S>>, stop: CancellationToken) {
    let mut interval = tokio::time::interval(shared.config.stale_check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = shared.stale_recovery.recover_stale_tasks().await {
                    error!(worker_id = %shared.config.worker_id, error = %e, "stale recovery sweep failed");
                }
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
