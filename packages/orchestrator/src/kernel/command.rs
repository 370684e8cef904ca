//! Collaborators backed by an external program.
//!
//! The program receives the task as one JSON document on stdin and must print
//! its result as JSON on stdout. A non-zero exit status is a failed run;
//! stderr is kept for the error message.

use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::traits::{BaseKnowledgeBuilder, BaseTaskExecutor, ExecutionOutcome, KnowledgeOutput};
use crate::domains::build_tasks::models::BuildTask;
use crate::domains::recording::models::RecordingTask;

/// Keeps error messages stored on task rows readable.
const MAX_STDERR_CHARS: usize = 2000;

/// Program plus arguments, parsed from a whitespace-separated command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let Some(program) = parts.next() else {
            bail!("command line is empty");
        };
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

enum RunResult<T> {
    Parsed(T),
    Exited { code: Option<i32>, stderr: String },
}

async fn run_json<I, O>(command: &CommandLine, input: &I) -> Result<RunResult<O>>
where
    I: Serialize,
    O: DeserializeOwned,
{
    let payload = serde_json::to_vec(input).context("failed to serialize command input")?;

    debug!(program = %command.program, args = ?command.args, "spawning collaborator");

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // A dropped future (controller stop) must not leave the process behind.
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn {}", command.program))?;

    if let Some(mut stdin) = child.stdin.take() {
        // Programs that ignore their input may exit before reading it.
        if let Err(err) = stdin.write_all(&payload).await {
            if err.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(err).context("failed to write command input");
            }
        }
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .await
        .with_context(|| format!("failed to wait for {}", command.program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Ok(RunResult::Exited {
            code: output.status.code(),
            stderr: stderr.trim().chars().take(MAX_STDERR_CHARS).collect(),
        });
    }

    let parsed = serde_json::from_slice(&output.stdout)
        .with_context(|| format!("{} printed invalid JSON", command.program))?;
    Ok(RunResult::Parsed(parsed))
}

fn exit_message(program: &str, code: Option<i32>, stderr: &str) -> String {
    let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
    if stderr.is_empty() {
        format!("{} exited with {}", program, code)
    } else {
        format!("{} exited with {}: {}", program, code, stderr)
    }
}

/// Runs each recording task through an external program.
pub struct CommandTaskExecutor {
    command: CommandLine,
}

impl CommandTaskExecutor {
    pub fn new(command: CommandLine) -> Self {
        Self { command }
    }
}

#[async_trait]
impl BaseTaskExecutor for CommandTaskExecutor {
    async fn execute(&self, task: &RecordingTask) -> Result<ExecutionOutcome> {
        let started = Instant::now();
        let result = run_json::<_, ExecutionOutcome>(&self.command, task).await?;
        let elapsed = started.elapsed().as_millis() as u64;

        Ok(match result {
            RunResult::Parsed(mut outcome) => {
                if outcome.duration_ms == 0 {
                    outcome.duration_ms = elapsed;
                }
                outcome
            }
            RunResult::Exited { code, stderr } => {
                ExecutionOutcome::failed(exit_message(&self.command.program, code, &stderr), elapsed)
            }
        })
    }
}

/// Runs the knowledge stage through an external program.
pub struct CommandKnowledgeBuilder {
    command: CommandLine,
}

impl CommandKnowledgeBuilder {
    pub fn new(command: CommandLine) -> Self {
        Self { command }
    }
}

#[async_trait]
impl BaseKnowledgeBuilder for CommandKnowledgeBuilder {
    async fn build(&self, task: &BuildTask) -> Result<KnowledgeOutput> {
        match run_json::<_, KnowledgeOutput>(&self.command, task).await? {
            RunResult::Parsed(output) => Ok(output),
            RunResult::Exited { code, stderr } => {
                bail!("{}", exit_message(&self.command.program, code, &stderr))
            }
        }
    }
}
