//! Backup and restore controllers for strongbox
//!
//! - **backup_controller**: drives a DatabaseBackup through
//!   `Pending → Running → {Completed, Failed}` and expires it after its TTL
//! - **restore_controller**: resolves a restore source and drives a
//!   DatabaseRestore the same way
//! - **schedule_controller**: creates DatabaseBackups on a cron cadence with
//!   deterministic names and triggers retention
//! - **retention**: tiered object pruning and keep-last record pruning
//! - **backup_store_controller**: validates BackupStores
//! - **guard**: fingerprints and the per-cluster concurrency ceiling
//! - **dispatcher**: execution Jobs (create, poll, cancel)

pub mod backup_controller;
pub mod backup_store_controller;
pub mod client;
pub mod context;
pub mod cron;
pub mod dispatcher;
pub mod error;
pub mod guard;
pub mod jobs;
pub mod resolve;
pub mod restore_controller;
pub mod retention;
pub mod schedule_controller;
pub mod storage;

pub use context::{Context, ContextBuilder, OperatorConfig};
pub use error::ReconcileError;

/// Field manager for every patch the operator issues
pub const FIELD_MANAGER: &str = "strongbox-controller";

/// Requeue interval while an execution Job is running
const REQUEUE_POLL_SECS: u64 = 10;

/// Requeue interval while a dependency is not ready
const REQUEUE_DEPENDENCY_SECS: u64 = 15;

/// Requeue interval after a reconcile error
const REQUEUE_ERROR_SECS: u64 = 30;
