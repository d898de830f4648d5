//! DatabaseBackup Custom Resource Definition
//!
//! A DatabaseBackup is a single on-demand backup of one Database. It is
//! created by a user or by a BackupSchedule and driven to a terminal phase by
//! the backup reconciler.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::OperationPhase;
use crate::Error;

/// Output file name template used when a backup does not set one
pub const DEFAULT_FILENAME_TEMPLATE: &str = "{{ database }}-{{ timestamp }}-{{ run_id }}.dump";

/// Status of a DatabaseBackup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseBackupStatus {
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

    /// Run identifier shared by the Job name and the output file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// DatabaseCluster the run counts against for throttling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_cluster: Option<String>,

    /// Object key the backup was written to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,

    /// Output size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    /// Output size, human readable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Run duration, human readable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    /// When the Job was dispatched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the backup reached a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// When the backup first started waiting on a dependency
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_since: Option<DateTime<Utc>>,

    /// Observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Specification for a DatabaseBackup
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "strongbox.dev",
    version = "v1alpha1",
    kind = "DatabaseBackup",
    plural = "databasebackups",
    shortname = "dbb",
    namespaced,
    status = "DatabaseBackupStatus",
    printcolumn = r#"{"name":"Database","type":"string","jsonPath":".spec.databaseRef"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Size","type":"string","jsonPath":".status.size"}"#,
    printcolumn = r#"{"name":"Duration","type":"string","jsonPath":".status.duration"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseBackupSpec {
    /// Name of the Database (same namespace) to back up
    pub database_ref: String,

    /// Name of the BackupStore to write to; the namespace default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_ref: Option<String>,

    /// Key prefix under the store, defaults to `backups/{namespace}/{name}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,

    /// Output file name template (minijinja)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_template: Option<String>,

    /// Delete the record this long after it completes (e.g. `72h`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

impl DatabaseBackupSpec {
    /// Template for the output file name
    pub fn filename_template(&self) -> &str {
        self.filename_template
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(DEFAULT_FILENAME_TEMPLATE)
    }

    /// Parsed `ttl`, if set
    pub fn ttl_duration(&self, backup: &str) -> Result<Option<Duration>, Error> {
        self.ttl
            .as_deref()
            .map(|ttl| {
                humantime::parse_duration(ttl).map_err(|e| {
                    Error::validation_for_field(backup, "spec.ttl", format!("invalid ttl: {}", e))
                })
            })
            .transpose()
    }
}

impl DatabaseBackup {
    /// Key prefix under the store for this backup's output
    pub fn effective_path_prefix(&self) -> String {
        match self.spec.path_prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => prefix.to_string(),
            _ => format!(
                "backups/{}/{}",
                self.metadata.namespace.as_deref().unwrap_or("default"),
                self.metadata.name.as_deref().unwrap_or_default()
            ),
        }
    }

    /// Current phase, `Pending` when no status has been written yet
    pub fn phase(&self) -> OperationPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Whether the backup finished successfully with a usable output path
    pub fn is_restorable(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.phase == OperationPhase::Completed
                && s.output_path.as_deref().is_some_and(|p| !p.is_empty())
        })
    }
}
