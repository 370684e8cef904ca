pub mod models;
pub mod stale_recovery;
pub mod worker;

pub use stale_recovery::StaleRecovery;
pub use worker::{DrainReport, RecordingTaskQueueWorker, WorkerConfig, WorkerState};
