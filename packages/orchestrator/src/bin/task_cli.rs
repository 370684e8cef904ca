//! Operations CLI for the task store
//!
//! Enqueues builds, inspects progress, publishes versions by hand and runs
//! one-off stale sweeps. Every command prints a single JSON document.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use orchestrator_core::common::{BuildTaskId, SourceId, SourceVersionId};
use orchestrator_core::config::Config;
use orchestrator_core::domains::build_tasks::models::{BuildTask, BuildTaskConfig};
use orchestrator_core::domains::recording::StaleRecovery;
use orchestrator_core::domains::recording::models::RecordingTaskCounts;
use orchestrator_core::domains::versions::VersionPublisher;
use orchestrator_core::domains::versions::models::SourceVersion;
use orchestrator_core::kernel::{
    BuildTaskStore, PostgresTaskStore, RecordingTaskStore, VersionStore,
};
use orchestrator_core::MIGRATOR;

#[derive(Parser)]
#[command(name = "task_cli")]
#[command(about = "Build task store operations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Create a build task for a website
    Enqueue {
        source_url: String,
        /// Publish even if some recording tasks fail
        #[arg(long)]
        allow_partial: bool,
    },

    /// Show a build task and its recording progress
    Status { build_task_id: Uuid },

    /// List the versions of a source
    Versions { source_id: Uuid },

    /// Make a version the active one
    Publish { version_id: Uuid, source_id: Uuid },

    /// Run one stale recovery sweep (a re-queued task's lost run counts as an attempt)
    RecoverStale,
}

// ============================================================================
// JSON Response Types
// ============================================================================

#[derive(Serialize)]
struct Response<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct StatusResponse {
    task: BuildTask,
    recording: CountsResponse,
}

#[derive(Serialize)]
struct CountsResponse {
    pending: i64,
    running: i64,
    completed: i64,
    failed: i64,
}

impl From<RecordingTaskCounts> for CountsResponse {
    fn from(counts: RecordingTaskCounts) -> Self {
        Self {
            pending: counts.pending,
            running: counts.running,
            completed: counts.completed,
            failed: counts.failed,
        }
    }
}

#[derive(Serialize)]
struct RecoveryResponse {
    requeued: i64,
    failed: i64,
}

fn output<T: Serialize>(data: T) -> Result<()> {
    output_with_message(None, data)
}

fn output_with_message<T: Serialize>(message: Option<String>, data: T) -> Result<()> {
    let resp = Response {
        success: true,
        message,
        data: Some(data),
    };
    println!("{}", serde_json::to_string(&resp)?);
    Ok(())
}

fn output_error(message: String) -> Result<()> {
    let resp: Response<()> = Response {
        success: false,
        message: Some(message),
        data: None,
    };
    println!("{}", serde_json::to_string(&resp)?);
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    match cli.command {
        Commands::Migrate => cmd_migrate(&pool).await,
        Commands::Enqueue {
            source_url,
            allow_partial,
        } => cmd_enqueue(&pool, source_url, allow_partial).await,
        Commands::Status { build_task_id } => cmd_status(&pool, build_task_id.into()).await,
        Commands::Versions { source_id } => cmd_versions(&pool, source_id.into()).await,
        Commands::Publish {
            version_id,
            source_id,
        } => cmd_publish(&pool, version_id.into(), source_id.into()).await,
        Commands::RecoverStale => cmd_recover_stale(&pool, &config).await,
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_migrate(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await.context("Failed to run migrations")?;
    output(serde_json::json!({ "migrations": MIGRATOR.iter().count() }))
}

async fn cmd_enqueue(pool: &PgPool, source_url: String, allow_partial: bool) -> Result<()> {
    let store = PostgresTaskStore::new(pool.clone());
    let config = BuildTaskConfig {
        publish_on_partial_failure: allow_partial.then_some(true),
        ..Default::default()
    };
    let task = store
        .create_build_task(BuildTask::new(source_url, config))
        .await?;
    output(task)
}

async fn cmd_status(pool: &PgPool, id: BuildTaskId) -> Result<()> {
    let store = PostgresTaskStore::new(pool.clone());
    let Some(task) = store.find_build_task(id).await? else {
        return output_error(format!("Build task '{}' not found", id));
    };
    let counts = store.recording_task_counts(id).await?;
    output(StatusResponse {
        task,
        recording: counts.into(),
    })
}

async fn cmd_versions(pool: &PgPool, source_id: SourceId) -> Result<()> {
    let store = PostgresTaskStore::new(pool.clone());
    let versions: Vec<SourceVersion> = store.source_versions(source_id).await?;
    output(versions)
}

async fn cmd_publish(pool: &PgPool, version_id: SourceVersionId, source_id: SourceId) -> Result<()> {
    let publisher = VersionPublisher::new(Arc::new(PostgresTaskStore::new(pool.clone())));
    match publisher.publish_version(version_id, source_id).await {
        Ok(version) => output(version),
        Err(e) => output_error(e.to_string()),
    }
}

async fn cmd_recover_stale(pool: &PgPool, config: &Config) -> Result<()> {
    let recovery = StaleRecovery::new(
        Arc::new(PostgresTaskStore::new(pool.clone())),
        config.worker.stale_timeout,
        config.worker.max_attempts,
    );
    let report = recovery.recover_stale_tasks().await?;
    output_with_message(
        recovery_message(report.requeued),
        RecoveryResponse {
            requeued: report.requeued,
            failed: report.failed,
        },
    )
}

fn recovery_message(requeued: i64) -> Option<String> {
    (requeued > 0).then(|| {
        format!(
            "{} task(s) re-queued; each lost run was counted as an attempt",
            requeued
        )
    })
}
