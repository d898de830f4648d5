//! DatabaseRestore Custom Resource Definition
//!
//! A DatabaseRestore loads one backup output into a target Database. The
//! source is exactly one of an explicit DatabaseBackup, the latest completed
//! backup of a database, or a literal object key.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::OperationPhase;
use crate::Error;

/// How the restore treats existing objects in the target database
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConflictPolicy {
    /// Abort if the target database is not empty
    #[default]
    Fail,
    /// Drop and recreate the target database first
    Drop,
    /// Restore over existing objects
    Overwrite,
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fail => write!(f, "fail"),
            Self::Drop => write!(f, "drop"),
            Self::Overwrite => write!(f, "overwrite"),
        }
    }
}

/// Reference to a DatabaseBackup, optionally in another namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupReference {
    /// DatabaseBackup name
    pub name: String,

    /// Namespace, defaults to the restore's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Selects the latest completed backup of a database
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LatestBackupSelector {
    /// Database name the backups reference (`spec.databaseRef`)
    pub database: String,

    /// Namespace to search, defaults to the restore's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Validated restore source
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreSource<'a> {
    /// An explicit DatabaseBackup
    Backup(&'a BackupReference),
    /// The most recently completed backup of a database
    Latest(&'a LatestBackupSelector),
    /// A literal object key in an explicit store
    Path {
        /// Object key
        path: &'a str,
        /// BackupStore holding the object
        store: &'a str,
    },
}

/// Status of a DatabaseRestore
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRestoreStatus {
    /// Current phase
    #[serde(default)]
    pub phase: OperationPhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Digest of the parameters the current run was dispatched with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    /// Name of the execution Job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    /// Run identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// DatabaseCluster the run counts against for throttling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_cluster: Option<String>,

    /// Object key restored from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,

    /// DatabaseBackup restored from (`namespace/name`), when one was resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_backup: Option<String>,

    /// Run duration, human readable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    /// When the Job was dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the restore reached a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// When the restore first started waiting on a dependency
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_since: Option<DateTime<Utc>>,

    /// Observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Specification for a DatabaseRestore
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "strongbox.dev",
    version = "v1alpha1",
    kind = "DatabaseRestore",
    plural = "databaserestores",
    shortname = "dbr",
    namespaced,
    status = "DatabaseRestoreStatus",
    printcolumn = r#"{"name":"Database","type":"string","jsonPath":".spec.databaseRef"}"#,
    printcolumn = r#"{"name":"Source","type":"string","jsonPath":".status.sourcePath"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRestoreSpec {
    /// Restore from this DatabaseBackup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_ref: Option<BackupReference>,

    /// Restore from the latest completed backup of a database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_from: Option<LatestBackupSelector>,

    /// Restore from this object key (requires `storeRef`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// BackupStore holding the source object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_ref: Option<String>,

    /// Name of the Database (same namespace) to restore into
    pub database_ref: String,

    /// What to do when the target database already has data
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

impl DatabaseRestoreSpec {
    /// Validate that exactly one source selector is set and return it
    pub fn source(&self, restore: &str) -> Result<RestoreSource<'_>, Error> {
        let path = self.path.as_deref().filter(|p| !p.trim().is_empty());
        let set = [
            self.backup_ref.is_some(),
            self.latest_from.is_some(),
            path.is_some(),
        ]
        .iter()
        .filter(|s| **s)
        .count();

        if set != 1 {
            return Err(Error::validation_for_field(
                restore,
                "spec",
                format!(
                    "exactly one of backupRef, latestFrom or path must be set, found {}",
                    set
                ),
            ));
        }

        if let Some(reference) = &self.backup_ref {
            return Ok(RestoreSource::Backup(reference));
        }
        if let Some(selector) = &self.latest_from {
            return Ok(RestoreSource::Latest(selector));
        }

        let path = path.unwrap_or_default();
        match self.store_ref.as_deref().filter(|s| !s.is_empty()) {
            Some(store) => Ok(RestoreSource::Path { path, store }),
            None => Err(Error::validation_for_field(
                restore,
                "spec.storeRef",
                "storeRef is required when restoring from a literal path",
            )),
        }
    }
}

impl DatabaseRestore {
    /// Current phase, `Pending` when no status has been written yet
    pub fn phase(&self) -> OperationPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}
