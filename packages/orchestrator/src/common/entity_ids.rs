//! Typed ID definitions for the task store entities.

pub use super::id::Id;

// ============================================================================
// Entity marker types
// ============================================================================

/// Marker type for BuildTask rows.
pub struct BuildTask;

/// Marker type for Source rows (one per website).
pub struct Source;

/// Marker type for SourceVersion rows.
pub struct SourceVersion;

/// Marker type for RecordingTask rows.
pub struct RecordingTask;

// ============================================================================
// Type aliases
// ============================================================================

pub type BuildTaskId = Id<BuildTask>;

pub type SourceId = Id<Source>;

pub type SourceVersionId = Id<SourceVersion>;

pub type RecordingTaskId = Id<RecordingTask>;
