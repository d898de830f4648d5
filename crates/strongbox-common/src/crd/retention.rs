//! Tiered retention policy
//!
//! Each tier is independent; `None` means the tier keeps nothing.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Grandfather-father-son retention policy for a BackupSchedule
///
/// `keep_last` bounds both the backup records and the stored objects.
/// The daily, weekly and monthly tiers apply to stored objects only.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    /// Always keep the N most recent backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_last: Option<u32>,

    /// Keep the first backup of each of the last N days
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_daily: Option<u32>,

    /// Keep the first backup of each of the last N ISO weeks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_weekly: Option<u32>,

    /// Keep the first backup of each of the last N calendar months
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_monthly: Option<u32>,
}

impl RetentionPolicy {
    /// Whether any tier is configured
    pub fn is_configured(&self) -> bool {
        self.keep_last.is_some()
            || self.keep_daily.is_some()
            || self.keep_weekly.is_some()
            || self.keep_monthly.is_some()
    }
}
