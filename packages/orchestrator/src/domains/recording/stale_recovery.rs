//! Stale recovery for recording tasks.
//!
//! A worker that dies (or hangs) stops renewing `last_heartbeat`. Any worker
//! instance periodically sweeps running tasks whose heartbeat is older than
//! the stale timeout: they go back to `pending` while attempts remain and to
//! `failed` once they don't.
//!
//! Re-queueing counts the lost run as an attempt, so a task that keeps
//! killing its worker still runs out of attempts.
//!
//! The sweep is a single conditional statement, so several instances can run
//! it at the same time and a repeated sweep with nothing newly stale changes
//! nothing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use crate::domains::recording::models::StaleRecoveryReport;
use crate::kernel::store::RecordingTaskStore;

pub struct StaleRecovery<S> {
    store: Arc<S>,
    stale_timeout: Duration,
    max_attempts: i32,
}

impl<S: RecordingTaskStore> StaleRecovery<S> {
    pub fn new(store: Arc<S>, stale_timeout: Duration, max_attempts: i32) -> Self {
        Self {
            store,
            stale_timeout,
            max_attempts,
        }
    }

    pub async fn recover_stale_tasks(&self) -> Result<StaleRecoveryReport> {
        let report = self
            .store
            .recover_stale_recording_tasks(self.stale_timeout, self.max_attempts)
            .await?;

        if report.is_empty() {
            debug!("no stale recording tasks");
        } else {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                stale_timeout_secs = self.stale_timeout.as_secs(),
                "recovered stale recording tasks"
            );
        }
        Ok(report)
    }
}
