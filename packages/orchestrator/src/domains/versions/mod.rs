pub mod models;
pub mod publisher;

pub use publisher::{PublishError, VersionPublisher};
