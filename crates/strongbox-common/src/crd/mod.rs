//! Custom Resource Definitions for strongbox
//!
//! This module contains all CRD definitions used by the strongbox operator.

mod backup;
mod backup_store;
mod database;
mod restore;
mod retention;
mod schedule;
mod types;

pub use backup::{
    DatabaseBackup, DatabaseBackupSpec, DatabaseBackupStatus, DEFAULT_FILENAME_TEMPLATE,
};
pub use backup_store::{
    AzureStorageConfig, BackupStorageProvider, BackupStorageSpec, BackupStore, BackupStoreSpec,
    BackupStoreStatus, GcsStorageConfig, LocalStorageConfig, S3StorageConfig,
    AZURE_ACCOUNT_KEY_KEY, GCS_SERVICE_ACCOUNT_KEY, S3_ACCESS_KEY_ID_KEY,
    S3_SECRET_ACCESS_KEY_KEY,
};
pub use database::{
    Database, DatabaseCluster, DatabaseClusterSpec, DatabaseEngine, DatabaseSpec, DatabaseStatus,
};
pub use restore::{
    BackupReference, ConflictPolicy, DatabaseRestore, DatabaseRestoreSpec, DatabaseRestoreStatus,
    LatestBackupSelector, RestoreSource,
};
pub use retention::RetentionPolicy;
pub use schedule::{BackupSchedule, BackupScheduleSpec, BackupScheduleStatus, SchedulePhase};
pub use types::{OperationPhase, ReadinessPhase};
