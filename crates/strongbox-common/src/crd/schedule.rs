//! BackupSchedule Custom Resource Definition
//!
//! A BackupSchedule creates DatabaseBackups on a cron cadence and prunes them
//! under an optional tiered retention policy.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::retention::RetentionPolicy;

/// Phase of a BackupSchedule
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SchedulePhase {
    /// Schedule is triggering backups
    #[default]
    Active,
    /// Schedule is suspended
    Suspended,
    /// Schedule is invalid (e.g. malformed cron expression)
    Failed,
}

impl std::fmt::Display for SchedulePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Suspended => write!(f, "Suspended"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Status of a BackupSchedule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleStatus {
    /// Current phase
    #[serde(default)]
    pub phase: SchedulePhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Cron slot of the most recent trigger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_trigger_time: Option<DateTime<Utc>>,

    /// Next cron slot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_scheduled_time: Option<DateTime<Utc>>,

    /// Name of the most recently created backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup_name: Option<String>,

    /// Number of DatabaseBackups owned by this schedule
    #[serde(default)]
    pub backup_count: u32,

    /// When retention last pruned this schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retention_run: Option<DateTime<Utc>>,

    /// Observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Specification for a BackupSchedule
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "strongbox.dev",
    version = "v1alpha1",
    kind = "BackupSchedule",
    plural = "backupschedules",
    shortname = "bsch",
    namespaced,
    status = "BackupScheduleStatus",
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Database","type":"string","jsonPath":".spec.databaseRef"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Last","type":"date","jsonPath":".status.lastTriggerTime"}"#,
    printcolumn = r#"{"name":"Next","type":"date","jsonPath":".status.nextScheduledTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupScheduleSpec {
    /// Five-field cron expression, evaluated in UTC
    pub schedule: String,

    /// Name of the Database (same namespace) to back up
    pub database_ref: String,

    /// Name of the BackupStore to write to; the namespace default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_ref: Option<String>,

    /// Output file name template inherited by created backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_template: Option<String>,

    /// Retention policy for created backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionPolicy>,

    /// Stop triggering new backups (running ones are unaffected)
    #[serde(default)]
    pub suspend: bool,
}

impl BackupSchedule {
    /// Key prefix under the store shared by every backup of this schedule
    pub fn path_prefix(&self) -> String {
        format!(
            "schedules/{}/{}",
            self.metadata.namespace.as_deref().unwrap_or("default"),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    /// Retention policy, only when at least one tier is set
    pub fn retention(&self) -> Option<&RetentionPolicy> {
        self.spec.retention.as_ref().filter(|r| r.is_configured())
    }
}
