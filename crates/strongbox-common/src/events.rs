//! Kubernetes Event recording for strongbox controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "BackupStarted")
    /// * `action` - What action was taken (e.g. "Dispatch")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "strongbox-backup-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    // Backup and restore lifecycle
    /// Execution Job created
    pub const JOB_DISPATCHED: &str = "JobDispatched";
    /// Execution Job succeeded
    pub const COMPLETED: &str = "Completed";
    /// Execution Job failed or the request is invalid
    pub const FAILED: &str = "Failed";
    /// Deferred by the per-cluster concurrency ceiling
    pub const THROTTLED: &str = "Throttled";
    /// A dependency stayed unready past the pending timeout
    pub const PENDING_TIMEOUT: &str = "PendingTimeout";
    /// Backup removed after its TTL elapsed
    pub const EXPIRED: &str = "Expired";

    // Schedule lifecycle
    /// A scheduled backup was created
    pub const BACKUP_TRIGGERED: &str = "BackupTriggered";
    /// Retention deleted objects or records
    pub const RETENTION_PRUNED: &str = "RetentionPruned";
    /// Cron expression or other spec field is invalid
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating an execution Job
    pub const DISPATCH: &str = "Dispatch";
    /// Creating a scheduled backup
    pub const TRIGGER: &str = "Trigger";
    /// Pruning expired backups
    pub const PRUNE: &str = "Prune";
    /// Deleting resources
    pub const DELETE: &str = "Delete";
}
