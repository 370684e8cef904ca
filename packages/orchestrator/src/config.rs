use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::domains::build_tasks::ControllerConfig;
use crate::domains::recording::WorkerConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub worker: WorkerConfig,
    pub controller: ControllerConfig,
    /// How long shutdown waits for in-flight recording tasks
    pub drain_timeout: Duration,
    /// Program that executes one recording task (JSON on stdin/stdout)
    pub executor_command: Option<String>,
    /// Program that runs the knowledge stage (JSON on stdin/stdout)
    pub knowledge_builder_command: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup (tests use a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let worker_defaults = WorkerConfig::default();
        let controller_defaults = ControllerConfig::default();

        let worker = WorkerConfig {
            worker_id: lookup("WORKER_ID").unwrap_or(worker_defaults.worker_id),
            concurrency: parse_or(&lookup, "WORKER_CONCURRENCY", worker_defaults.concurrency)?,
            idle_wait: millis_or(&lookup, "WORKER_IDLE_WAIT_MS", worker_defaults.idle_wait)?,
            heartbeat_interval: millis_or(
                &lookup,
                "HEARTBEAT_INTERVAL_MS",
                worker_defaults.heartbeat_interval,
            )?,
            stale_timeout: Duration::from_secs(
                60 * parse_or(
                    &lookup,
                    "STALE_TIMEOUT_MINUTES",
                    worker_defaults.stale_timeout.as_secs() / 60,
                )?,
            ),
            stale_check_interval: millis_or(
                &lookup,
                "STALE_CHECK_INTERVAL_MS",
                worker_defaults.stale_check_interval,
            )?,
            max_attempts: parse_or(&lookup, "MAX_ATTEMPTS", worker_defaults.max_attempts)?,
        };
        if worker.concurrency == 0 {
            anyhow::bail!("WORKER_CONCURRENCY must be at least 1");
        }
        if worker.max_attempts < 1 {
            anyhow::bail!("MAX_ATTEMPTS must be at least 1");
        }
        if worker.heartbeat_interval.is_zero() {
            anyhow::bail!("HEARTBEAT_INTERVAL_MS must be greater than zero");
        }
        if worker.stale_check_interval.is_zero() {
            anyhow::bail!("STALE_CHECK_INTERVAL_MS must be greater than zero");
        }
        if worker.heartbeat_interval >= worker.stale_timeout {
            anyhow::bail!(
                "HEARTBEAT_INTERVAL_MS ({} ms) must be shorter than STALE_TIMEOUT_MINUTES ({} min)",
                worker.heartbeat_interval.as_millis(),
                worker.stale_timeout.as_secs() / 60
            );
        }

        let controller = ControllerConfig {
            poll_interval: millis_or(&lookup, "POLL_INTERVAL_MS", controller_defaults.poll_interval)?,
            task_timeout: millis_or(&lookup, "TASK_TIMEOUT_MS", controller_defaults.task_timeout)?,
            max_retries: parse_or(&lookup, "MAX_RETRIES", controller_defaults.max_retries)?,
            publish_policy: parse_or(
                &lookup,
                "PUBLISH_POLICY",
                controller_defaults.publish_policy,
            )?,
            created_by: worker.worker_id.clone(),
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL").context("DATABASE_URL must be set")?,
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            worker,
            controller,
            drain_timeout: millis_or(&lookup, "DRAIN_TIMEOUT_MS", Duration::from_secs(30))?,
            executor_command: lookup("EXECUTOR_COMMAND").filter(|s| !s.trim().is_empty()),
            knowledge_builder_command: lookup("KNOWLEDGE_BUILDER_COMMAND")
                .filter(|s| !s.trim().is_empty()),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(default),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    let millis = parse_or(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}
