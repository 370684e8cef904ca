// Common types shared across the orchestrator

pub mod entity_ids;
pub mod id;

pub use entity_ids::*;
pub use id::Id;
