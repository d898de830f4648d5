//! Common types for strongbox: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all strongbox custom resources
pub const API_GROUP: &str = "strongbox.dev";

/// Value of `app.kubernetes.io/managed-by` on everything the operator creates
pub const MANAGED_BY: &str = "strongbox";

/// Label key for the standard managed-by label
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Label on a DatabaseBackup naming the BackupSchedule that created it
pub const SCHEDULE_LABEL: &str = "strongbox.dev/schedule";

/// Label on an execution Job naming the kind of its owning request
pub const OWNER_KIND_LABEL: &str = "strongbox.dev/owner-kind";

/// Label on an execution Job naming its owning request
pub const OWNER_NAME_LABEL: &str = "strongbox.dev/owner-name";

/// Label on an execution Job carrying the run identifier
pub const RUN_ID_LABEL: &str = "strongbox.dev/run-id";

/// Finalizer guarding DatabaseBackup and DatabaseRestore deletion until
/// their execution Job has been cancelled
pub const OPERATION_FINALIZER: &str = "strongbox.dev/cancel-job";

/// Finalizer guarding BackupSchedule deletion until its backups are removed
pub const SCHEDULE_FINALIZER: &str = "strongbox.dev/cascade-backups";

/// Annotation holding the last retention run of a BackupSchedule (RFC 3339)
pub const RETENTION_MARKER_ANNOTATION: &str = "strongbox.dev/retention-last-run";
