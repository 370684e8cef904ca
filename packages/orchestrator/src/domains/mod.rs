pub mod build_tasks;
pub mod recording;
pub mod versions;
