//! DatabaseBackup controller
//!
//! Drives one backup through `Pending → Running → {Completed, Failed}`:
//! finalizer first, then the fingerprint short-circuit, then either polling
//! the recorded Job or resolving inputs, asking the guard for a slot and
//! dispatching a new Job. Terminal backups with a `ttl` are deleted once it
//! has passed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use strongbox_common::crd::{DatabaseBackup, DatabaseBackupStatus, OperationPhase};
use strongbox_common::events::{actions, reasons};
use strongbox_common::kube_utils::has_finalizer;
use strongbox_common::template::FilenameContext;
use strongbox_common::OPERATION_FINALIZER;

use crate::client::RecordKind;
use crate::context::Context;
use crate::dispatcher::{run_id_for, ExecutionSpec, OperationMode, UnitHandle, UnitState};
use crate::error::ReconcileError;
use crate::guard::{admit_or_defer, fingerprint, is_already_terminal, Admission, Requester};
use crate::resolve::{pending_expired, resolve_database, resolve_store, Resolution};
use crate::{REQUEUE_DEPENDENCY_SECS, REQUEUE_ERROR_SECS, REQUEUE_POLL_SECS};

const KIND: &str = "DatabaseBackup";

/// Fingerprint of the inputs that determine what a backup produces.
///
/// `ttl` only affects cleanup and is left out.
pub fn backup_fingerprint(backup: &DatabaseBackup) -> String {
    fingerprint(&[
        &backup.spec.database_ref,
        backup.spec.store_ref.as_deref().unwrap_or_default(),
        &backup.effective_path_prefix(),
        backup.spec.filename_template(),
    ])
}

/// Instant a terminal backup expires, when it has a valid `ttl`
pub fn expires_at(backup: &DatabaseBackup) -> Option<DateTime<Utc>> {
    let completed_at = backup.status.as_ref()?.completed_at?;
    let ttl = match backup.spec.ttl_duration(&backup.name_any()) {
        Ok(ttl) => ttl?,
        Err(e) => {
            warn!(backup = %backup.name_any(), error = %e, "ignoring invalid ttl");
            return None;
        }
    };
    Some(completed_at + chrono::Duration::from_std(ttl).ok()?)
}

/// Reconcile a DatabaseBackup
pub async fn reconcile(
    backup: Arc<DatabaseBackup>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let name = backup.name_any();
    let namespace = backup
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(name.clone()))?;

    info!(backup = %name, namespace = %namespace, "reconciling DatabaseBackup");

    if backup.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&backup, &namespace, &name, &ctx).await;
    }

    if !has_finalizer(backup.as_ref(), OPERATION_FINALIZER) {
        ctx.kube
            .add_finalizer(RecordKind::Backup, &namespace, &name, OPERATION_FINALIZER)
            .await?;
        debug!(backup = %name, "added finalizer");
        return Ok(Action::await_change());
    }

    let status = backup.status.clone().unwrap_or_default();
    let token = backup_fingerprint(&backup);

    if is_already_terminal(status.phase, status.fingerprint.as_deref(), &token) {
        return expire_or_wait(&backup, &namespace, &name, &ctx).await;
    }

    if status.phase == OperationPhase::Running {
        if let Some(job_name) = status.job_name.clone() {
            let handle = UnitHandle {
                namespace: namespace.clone(),
                name: job_name,
            };
            return poll(&backup, &namespace, &name, status, handle, &ctx).await;
        }
    }

    start(&backup, &namespace, &name, status, token, &ctx).await
}

/// Delete the backup once its ttl has passed, otherwise wait for it
async fn expire_or_wait(
    backup: &DatabaseBackup,
    namespace: &str,
    name: &str,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    let Some(expiry) = expires_at(backup) else {
        debug!(backup = %name, "backup already terminal, nothing to do");
        return Ok(Action::await_change());
    };

    let now = Utc::now();
    if now < expiry {
        let wait = (expiry - now).to_std().unwrap_or(Duration::ZERO);
        debug!(backup = %name, expires_at = %expiry, "backup terminal, waiting for ttl");
        return Ok(Action::requeue(wait));
    }

    info!(backup = %name, "backup ttl elapsed, deleting");
    ctx.events
        .publish(
            &backup.object_ref(&()),
            EventType::Normal,
            reasons::EXPIRED,
            actions::DELETE,
            Some(format!("TTL elapsed at {}", expiry.to_rfc3339())),
        )
        .await;
    ctx.kube.delete_backup(namespace, name).await?;
    Ok(Action::await_change())
}

async fn handle_deletion(
    backup: &DatabaseBackup,
    namespace: &str,
    name: &str,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    if !has_finalizer(backup, OPERATION_FINALIZER) {
        return Ok(Action::await_change());
    }

    if !backup.phase().is_terminal() {
        let job_name = backup.status.as_ref().and_then(|s| s.job_name.as_deref());
        ctx.dispatcher.cancel(namespace, job_name, KIND, name).await;
    }

    ctx.kube
        .remove_finalizer(RecordKind::Backup, namespace, name, OPERATION_FINALIZER)
        .await?;
    info!(backup = %name, "cleanup finished, finalizer removed");
    Ok(Action::await_change())
}

async fn poll(
    backup: &DatabaseBackup,
    namespace: &str,
    name: &str,
    status: DatabaseBackupStatus,
    handle: UnitHandle,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    match ctx.dispatcher.poll(&handle).await? {
        UnitState::Running => {
            debug!(backup = %name, job = %handle.name, "backup job still running");
            Ok(Action::requeue(Duration::from_secs(REQUEUE_POLL_SECS)))
        }
        UnitState::Succeeded(result) => {
            let output_path = result.path.or(status.output_path.clone());
            let next = DatabaseBackupStatus {
                phase: OperationPhase::Completed,
                message: Some("Backup completed".to_string()),
                output_path,
                size_bytes: result.size_bytes,
                size: result
                    .size_bytes
                    .map(|b| bytesize::ByteSize::b(b).to_string()),
                duration: result
                    .duration
                    .map(|d| humantime::format_duration(d).to_string()),
                completed_at: Some(Utc::now()),
                ..status
            };
            info!(backup = %name, size = ?next.size, duration = ?next.duration, "backup completed");
            update_status(ctx, backup, namespace, name, next.clone()).await?;
            publish(
                ctx,
                backup,
                EventType::Normal,
                reasons::COMPLETED,
                format!(
                    "Wrote {} ({})",
                    next.output_path.as_deref().unwrap_or("unknown path"),
                    next.size.as_deref().unwrap_or("unknown size")
                ),
            )
            .await;

            Ok(match expires_at_status(backup, &next) {
                Some(expiry) => {
                    Action::requeue((expiry - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                }
                None => Action::await_change(),
            })
        }
        UnitState::Failed(reason) => {
            warn!(backup = %name, job = %handle.name, %reason, "backup job failed");
            let next = DatabaseBackupStatus {
                phase: OperationPhase::Failed,
                message: Some(format!("Backup job failed: {}", reason)),
                completed_at: Some(Utc::now()),
                ..status
            };
            update_status(ctx, backup, namespace, name, next).await?;
            publish(ctx, backup, EventType::Warning, reasons::FAILED, reason).await;
            Ok(Action::await_change())
        }
    }
}

fn expires_at_status(backup: &DatabaseBackup, status: &DatabaseBackupStatus) -> Option<DateTime<Utc>> {
    let mut view = backup.clone();
    view.status = Some(status.clone());
    expires_at(&view)
}

async fn start(
    backup: &DatabaseBackup,
    namespace: &str,
    name: &str,
    status: DatabaseBackupStatus,
    token: String,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    let template = backup.spec.filename_template();
    let invalid = backup
        .spec
        .ttl_duration(name)
        .and_then(|_| ctx.renderer.validate(template));
    if let Err(e) = invalid {
        return fail(ctx, backup, namespace, name, token, reasons::VALIDATION_FAILED, e.to_string()).await;
    }

    // a new run after a terminal phase starts a fresh pending window
    let pending_since = match status.phase {
        OperationPhase::Pending => status.pending_since,
        _ => None,
    };

    let database = match resolve_database(ctx.kube.as_ref(), namespace, &backup.spec.database_ref).await? {
        Resolution::Ready(db) => db,
        Resolution::NotReady(reason) => {
            return wait_for_dependency(ctx, backup, namespace, name, token, pending_since, reason).await
        }
    };
    let store = match resolve_store(ctx.kube.as_ref(), namespace, backup.spec.store_ref.as_deref()).await? {
        Resolution::Ready(store) => store,
        Resolution::NotReady(reason) => {
            return wait_for_dependency(ctx, backup, namespace, name, token, pending_since, reason).await
        }
    };

    let requester = Requester {
        kind: RecordKind::Backup,
        namespace,
        name,
    };
    if let Admission::Defer(backoff) = admit_or_defer(
        ctx.kube.as_ref(),
        &database.cluster_key,
        requester,
        ctx.config.max_concurrent_per_cluster,
        ctx.config.throttle_backoff,
    )
    .await?
    {
        let message = format!(
            "Throttled: {} concurrent operations already running on DatabaseCluster {}",
            ctx.config.max_concurrent_per_cluster, database.cluster_key
        );
        let next = DatabaseBackupStatus {
            phase: OperationPhase::Pending,
            message: Some(message.clone()),
            fingerprint: Some(token),
            observed_generation: backup.metadata.generation,
            ..Default::default()
        };
        if update_status(ctx, backup, namespace, name, next).await? {
            publish(ctx, backup, EventType::Normal, reasons::THROTTLED, message).await;
        }
        return Ok(Action::requeue(backoff));
    }

    let run_id = run_id_for(&backup.uid().unwrap_or_default(), &token);
    let now = Utc::now();
    let engine = database.engine.to_string();
    let filename = match ctx.renderer.render(
        template,
        &FilenameContext {
            database: &database.name,
            database_name: &database.database_name,
            namespace,
            backup: name,
            engine: &engine,
            run_id: &run_id,
            time: now,
        },
    ) {
        Ok(filename) => filename,
        Err(e) => {
            return fail(ctx, backup, namespace, name, token, reasons::VALIDATION_FAILED, e.to_string()).await
        }
    };
    let output_path = store.object_key(&format!("{}/{}", backup.effective_path_prefix(), filename));

    let spec = ExecutionSpec {
        owner_kind: KIND.to_string(),
        owner_name: name.to_string(),
        namespace: namespace.to_string(),
        owner_ref: backup.controller_owner_ref(&()),
        run_id: run_id.clone(),
        mode: OperationMode::Backup,
        database: database.clone(),
        store,
        object_path: output_path.clone(),
        conflict_policy: None,
    };
    let handle = ctx.dispatcher.dispatch(&spec).await?;

    let next = DatabaseBackupStatus {
        phase: OperationPhase::Running,
        message: Some(format!("Job {} dispatched", handle.name)),
        fingerprint: Some(token),
        job_name: Some(handle.name.clone()),
        run_id: Some(run_id),
        target_cluster: Some(database.cluster_key.clone()),
        output_path: Some(output_path.clone()),
        started_at: Some(now),
        observed_generation: backup.metadata.generation,
        ..Default::default()
    };
    update_status(ctx, backup, namespace, name, next).await?;
    publish(
        ctx,
        backup,
        EventType::Normal,
        reasons::JOB_DISPATCHED,
        format!("Job {} writing {}", handle.name, output_path),
    )
    .await;

    Ok(Action::requeue(Duration::from_secs(REQUEUE_POLL_SECS)))
}

async fn wait_for_dependency(
    ctx: &Context,
    backup: &DatabaseBackup,
    namespace: &str,
    name: &str,
    token: String,
    pending_since: Option<DateTime<Utc>>,
    reason: String,
) -> Result<Action, ReconcileError> {
    let now = Utc::now();
    if pending_expired(pending_since, now, ctx.config.pending_timeout) {
        let message = format!(
            "Timed out after {} waiting for dependencies: {}",
            humantime::format_duration(ctx.config.pending_timeout),
            reason
        );
        return fail(ctx, backup, namespace, name, token, reasons::PENDING_TIMEOUT, message).await;
    }

    debug!(backup = %name, %reason, "dependencies not ready");
    let next = DatabaseBackupStatus {
        phase: OperationPhase::Pending,
        message: Some(reason),
        fingerprint: Some(token),
        pending_since: Some(pending_since.unwrap_or(now)),
        observed_generation: backup.metadata.generation,
        ..Default::default()
    };
    update_status(ctx, backup, namespace, name, next).await?;
    Ok(Action::requeue(Duration::from_secs(REQUEUE_DEPENDENCY_SECS)))
}

async fn fail(
    ctx: &Context,
    backup: &DatabaseBackup,
    namespace: &str,
    name: &str,
    token: String,
    reason: &str,
    message: String,
) -> Result<Action, ReconcileError> {
    warn!(backup = %name, %message, "backup failed");
    let next = DatabaseBackupStatus {
        phase: OperationPhase::Failed,
        message: Some(message.clone()),
        fingerprint: Some(token),
        completed_at: Some(Utc::now()),
        observed_generation: backup.metadata.generation,
        ..Default::default()
    };
    update_status(ctx, backup, namespace, name, next).await?;
    publish(ctx, backup, EventType::Warning, reason, message).await;
    Ok(Action::await_change())
}

/// Write `next` unless it matches the current status. Returns whether a
/// patch was sent.
async fn update_status(
    ctx: &Context,
    backup: &DatabaseBackup,
    namespace: &str,
    name: &str,
    next: DatabaseBackupStatus,
) -> Result<bool, ReconcileError> {
    if let Some(current) = &backup.status {
        if current.phase == next.phase
            && current.message == next.message
            && current.fingerprint == next.fingerprint
            && current.job_name == next.job_name
        {
            debug!(backup = %name, "status unchanged, skipping update");
            return Ok(false);
        }
    }
    ctx.kube.patch_backup_status(namespace, name, &next).await?;
    Ok(true)
}

async fn publish(
    ctx: &Context,
    backup: &DatabaseBackup,
    type_: EventType,
    reason: &str,
    note: String,
) {
    let action = match reason {
        r if r == reasons::JOB_DISPATCHED => actions::DISPATCH,
        _ => actions::RECONCILE,
    };
    ctx.events
        .publish(&backup.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

/// Requeue after a reconcile error
pub fn error_policy(
    backup: Arc<DatabaseBackup>,
    error: &ReconcileError,
    _ctx: Arc<Context>,
) -> Action {
    error!(?error, backup = %backup.name_any(), "reconciliation failed");
    Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
}
