pub mod recording_task;

pub use recording_task::*;
