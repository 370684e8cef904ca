// Main entry point for a build worker process
//
// Runs the build task controller and the recording worker pool against the
// shared task store until SIGINT/SIGTERM, then drains gracefully.

use std::sync::Arc;

use anyhow::{Context, Result};
use orchestrator_core::domains::build_tasks::BuildTaskController;
use orchestrator_core::domains::recording::RecordingTaskQueueWorker;
use orchestrator_core::kernel::{
    CommandKnowledgeBuilder, CommandLine, CommandTaskExecutor, PostgresTaskStore,
};
use orchestrator_core::{Config, MIGRATOR};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchestrator_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting build worker");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    let executor_command = CommandLine::parse(
        config
            .executor_command
            .as_deref()
            .context("EXECUTOR_COMMAND must be set")?,
    )
    .context("EXECUTOR_COMMAND is invalid")?;
    let builder_command = CommandLine::parse(
        config
            .knowledge_builder_command
            .as_deref()
            .context("KNOWLEDGE_BUILDER_COMMAND must be set")?,
    )
    .context("KNOWLEDGE_BUILDER_COMMAND is invalid")?;
    tracing::info!(worker_id = %config.worker.worker_id, "Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let store = Arc::new(PostgresTaskStore::new(pool.clone()));

    let controller = BuildTaskController::new(
        store.clone(),
        Arc::new(CommandKnowledgeBuilder::new(builder_command)),
        config.controller.clone(),
    );
    let worker = RecordingTaskQueueWorker::new(
        store,
        Arc::new(CommandTaskExecutor::new(executor_command)),
        config.worker.clone(),
    );

    controller.start().await?;
    worker.start().await?;

    let signal = shutdown_signal().await;
    tracing::info!(signal, "Shutdown requested");

    controller.stop(&format!("worker shut down ({})", signal)).await;
    let report = worker.stop(config.drain_timeout).await;
    tracing::info!(
        drained = report.drained,
        abandoned = report.abandoned,
        "Build worker stopped"
    );

    pool.close().await;
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler; only Ctrl-C will stop the worker");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "Ctrl-C"
}
