// Build Orchestrator - Core
//
// Drives website capability-manual builds through their stages and runs the
// distributed recording task queue behind them. Processes coordinate only
// through the task store.
//
// Domains live in domains/*; storage and collaborator seams in kernel/.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use config::*;

/// Embedded migrations for the task store tables.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
