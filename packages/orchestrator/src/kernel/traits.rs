// Trait definitions for the external collaborators
//
// The orchestrator decides when work runs and what happens to its result;
// these traits do the work itself.
//
// Naming convention: Base* for trait names (e.g., BaseTaskExecutor)

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domains::build_tasks::models::BuildTask;
use crate::domains::recording::models::RecordingTask;

// =============================================================================
// Task Executor (browser-driven recording of one task)
// =============================================================================

/// What one execution of a recording task produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default)]
    pub artifacts_created: u32,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn succeeded(artifacts_created: u32, duration_ms: u64) -> Self {
        Self {
            success: true,
            artifacts_created,
            duration_ms,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            artifacts_created: 0,
            duration_ms,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait BaseTaskExecutor: Send + Sync {
    /// Run one recording task to completion.
    ///
    /// An `Err` (or a panic) counts as a failed attempt, same as an outcome
    /// with `success == false`.
    async fn execute(&self, task: &RecordingTask) -> Result<ExecutionOutcome>;
}

// =============================================================================
// Knowledge Builder (crawl + analysis for one build task)
// =============================================================================

/// Result of the knowledge stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeOutput {
    /// Display name for the source row, when one has to be created.
    pub source_name: String,
    /// Chunk ids grouped into recording tasks, one task per batch.
    pub chunk_batches: Vec<Vec<i64>>,
    #[serde(default)]
    pub commit_message: Option<String>,
}

#[async_trait]
pub trait BaseKnowledgeBuilder: Send + Sync {
    async fn build(&self, task: &BuildTask) -> Result<KnowledgeOutput>;
}
