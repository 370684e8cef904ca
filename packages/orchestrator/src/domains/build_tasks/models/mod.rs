pub mod build_task;

pub use build_task::*;
