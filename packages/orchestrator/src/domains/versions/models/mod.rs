pub mod source;
pub mod source_version;

pub use source::Source;
pub use source_version::{SourceVersion, VersionStatus};
