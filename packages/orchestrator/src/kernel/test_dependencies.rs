// Mock collaborators for tests
//
// Both mocks record their calls and can be scripted per call; the executor
// can also be slowed down or held behind a gate to observe in-flight state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::watch;

use super::traits::{BaseKnowledgeBuilder, BaseTaskExecutor, ExecutionOutcome, KnowledgeOutput};
use crate::common::{BuildTaskId, RecordingTaskId};
use crate::domains::build_tasks::models::BuildTask;
use crate::domains::recording::models::RecordingTask;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Gate
// =============================================================================

/// Holds executions until opened. Opening is permanent.
#[derive(Clone)]
pub struct ExecutorGate {
    tx: Arc<watch::Sender<bool>>,
}

impl ExecutorGate {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel can't close under us.
        let _ = rx.wait_for(|open| *open).await;
    }
}

// =============================================================================
// Mock Task Executor
// =============================================================================

/// What one scripted execution does.
#[derive(Debug, Clone)]
pub enum MockExecution {
    Succeed,
    /// Returns `Ok` with `success == false`.
    Fail(String),
    /// Returns `Err`.
    Error(String),
    Panic(String),
}

pub struct MockTaskExecutor {
    delay: Duration,
    default: MockExecution,
    script: Mutex<VecDeque<MockExecution>>,
    gate: Option<ExecutorGate>,
    calls: Mutex<Vec<RecordingTaskId>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockTaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTaskExecutor {
    /// Succeeds immediately unless configured otherwise.
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            default: MockExecution::Succeed,
            script: Mutex::new(VecDeque::new()),
            gate: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every execution takes this long.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Behavior once the script is used up.
    pub fn by_default(mut self, execution: MockExecution) -> Self {
        self.default = execution;
        self
    }

    /// Queue the behavior of the next unscripted call.
    pub fn then(self, execution: MockExecution) -> Self {
        lock(&self.script).push_back(execution);
        self
    }

    /// Hold every execution until the returned gate is opened.
    pub fn gated(mut self) -> (Self, ExecutorGate) {
        let gate = ExecutorGate::new();
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub fn calls(&self) -> Vec<RecordingTaskId> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of executions observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BaseTaskExecutor for MockTaskExecutor {
    async fn execute(&self, task: &RecordingTask) -> Result<ExecutionOutcome> {
        lock(&self.calls).push(task.id);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let execution = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        if let Some(gate) = &self.gate {
            gate.wait().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let duration_ms = self.delay.as_millis() as u64;
        match execution {
            MockExecution::Succeed => Ok(ExecutionOutcome::succeeded(task.chunk_ids.len() as u32, duration_ms)),
            MockExecution::Fail(message) => Ok(ExecutionOutcome::failed(message, duration_ms)),
            MockExecution::Error(message) => Err(anyhow!(message)),
            MockExecution::Panic(message) => panic!("{}", message),
        }
    }
}

// =============================================================================
// Mock Knowledge Builder
// =============================================================================

pub struct MockKnowledgeBuilder {
    output: KnowledgeOutput,
    delay: Duration,
    failures: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<BuildTaskId>>,
}

impl MockKnowledgeBuilder {
    /// Produces one recording task per batch.
    pub fn with_batches(chunk_batches: Vec<Vec<i64>>) -> Self {
        Self {
            output: KnowledgeOutput {
                source_name: "example".to_string(),
                chunk_batches,
                commit_message: Some("mock knowledge build".to_string()),
            },
            delay: Duration::ZERO,
            failures: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_source_name(mut self, name: &str) -> Self {
        self.output.source_name = name.to_string();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next call with `message` (stackable).
    pub fn failing_once(self, message: &str) -> Self {
        lock(&self.failures).push_back(message.to_string());
        self
    }

    pub fn calls(&self) -> Vec<BuildTaskId> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl BaseKnowledgeBuilder for MockKnowledgeBuilder {
    async fn build(&self, task: &BuildTask) -> Result<KnowledgeOutput> {
        lock(&self.calls).push(task.id);
        let failure = lock(&self.failures).pop_front();

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match failure {
            Some(message) => Err(anyhow!(message)),
            None => Ok(self.output.clone()),
        }
    }
}
