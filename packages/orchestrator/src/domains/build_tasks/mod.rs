pub mod controller;
pub mod models;
pub mod stages;

pub use controller::{BuildTaskController, ControllerConfig, PublishPolicy, DEFAULT_STOP_REASON};
pub use stages::StageError;
