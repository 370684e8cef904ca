//! Kernel module - storage and collaborator seams shared by the domains.

pub mod command;
pub mod store;
pub mod test_dependencies;
pub mod traits;

pub use command::{CommandKnowledgeBuilder, CommandLine, CommandTaskExecutor};
pub use store::{
    BuildTaskStore, InMemoryTaskStore, PostgresTaskStore, RecordingTaskStore, TaskStore,
    VersionStore,
};
pub use test_dependencies::{ExecutorGate, MockExecution, MockKnowledgeBuilder, MockTaskExecutor};
pub use traits::*;
