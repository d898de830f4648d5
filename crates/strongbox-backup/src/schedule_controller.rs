//! BackupSchedule controller
//!
//! Evaluates the cron expression against the last trigger, creates the due
//! DatabaseBackup under a name derived from the slot, and sleeps until the
//! next slot. Two evaluations racing on the same slot produce the same name,
//! so the loser sees `AlreadyExists` and treats it as success once the
//! existing backup is confirmed to belong to this schedule.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use strongbox_common::crd::{
    BackupSchedule, BackupScheduleStatus, DatabaseBackup, DatabaseBackupSpec, SchedulePhase,
};
use strongbox_common::events::{actions, reasons};
use strongbox_common::kube_utils::{has_finalizer, label_value};
use strongbox_common::{
    MANAGED_BY, MANAGED_BY_LABEL, RETENTION_MARKER_ANNOTATION, SCHEDULE_FINALIZER, SCHEDULE_LABEL,
};

use crate::client::{CreateOutcome, RecordKind};
use crate::context::Context;
use crate::cron::{generate_name, CronSchedule};
use crate::error::ReconcileError;
use crate::retention::run_retention;
use crate::REQUEUE_ERROR_SECS;

/// Delay until `next`, never zero so a slot landing right now still requeues
pub fn requeue_delay(next: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (next - now)
        .to_std()
        .unwrap_or_default()
        .max(Duration::from_secs(1))
}

fn last_retention_run(schedule: &BackupSchedule) -> Option<DateTime<Utc>> {
    schedule
        .annotations()
        .get(RETENTION_MARKER_ANNOTATION)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// The DatabaseBackup a schedule creates for `slot`
pub fn scheduled_backup(schedule: &BackupSchedule, slot: DateTime<Utc>) -> DatabaseBackup {
    let schedule_name = schedule.name_any();

    let mut labels = BTreeMap::new();
    labels.insert(SCHEDULE_LABEL.to_string(), label_value(&schedule_name));
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());

    DatabaseBackup {
        metadata: ObjectMeta {
            name: Some(generate_name(&schedule_name, &slot)),
            namespace: schedule.namespace(),
            labels: Some(labels),
            owner_references: schedule.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: DatabaseBackupSpec {
            database_ref: schedule.spec.database_ref.clone(),
            store_ref: schedule.spec.store_ref.clone(),
            path_prefix: Some(schedule.path_prefix()),
            filename_template: schedule.spec.filename_template.clone(),
            ttl: None,
        },
        status: None,
    }
}

/// Reconcile a BackupSchedule
pub async fn reconcile(
    schedule: Arc<BackupSchedule>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let name = schedule.name_any();
    let namespace = schedule
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(name.clone()))?;

    info!(schedule = %name, namespace = %namespace, "reconciling BackupSchedule");

    if schedule.metadata.deletion_timestamp.is_some() {
        if has_finalizer(schedule.as_ref(), SCHEDULE_FINALIZER) {
            cascade_delete(&ctx, &namespace, &name).await?;
            ctx.kube
                .remove_finalizer(RecordKind::Schedule, &namespace, &name, SCHEDULE_FINALIZER)
                .await?;
            info!(schedule = %name, "owned backups deleted, finalizer removed");
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(schedule.as_ref(), SCHEDULE_FINALIZER) {
        ctx.kube
            .add_finalizer(RecordKind::Schedule, &namespace, &name, SCHEDULE_FINALIZER)
            .await?;
        debug!(schedule = %name, "added finalizer");
        return Ok(Action::await_change());
    }

    let current = schedule.status.clone().unwrap_or_default();
    let backup_count = ctx.kube.list_schedule_backups(&namespace, &name).await?.len();
    let base_status = BackupScheduleStatus {
        backup_count: u32::try_from(backup_count).unwrap_or(u32::MAX),
        last_retention_run: last_retention_run(&schedule),
        observed_generation: schedule.metadata.generation,
        ..current.clone()
    };

    let cron = match CronSchedule::parse(&schedule.spec.schedule) {
        Ok(cron) => cron,
        Err(e) => {
            warn!(schedule = %name, error = %e, "invalid cron expression");
            let next = BackupScheduleStatus {
                phase: SchedulePhase::Failed,
                message: Some(e.to_string()),
                next_scheduled_time: None,
                ..base_status
            };
            if update_status(&ctx, &schedule, &namespace, next).await? {
                ctx.events
                    .publish(
                        &schedule.object_ref(&()),
                        EventType::Warning,
                        reasons::VALIDATION_FAILED,
                        actions::RECONCILE,
                        Some(e.to_string()),
                    )
                    .await;
            }
            return Ok(Action::await_change());
        }
    };

    if schedule.spec.suspend {
        debug!(schedule = %name, "schedule suspended");
        let next = BackupScheduleStatus {
            phase: SchedulePhase::Suspended,
            message: Some("Schedule is suspended".to_string()),
            next_scheduled_time: None,
            ..base_status
        };
        update_status(&ctx, &schedule, &namespace, next).await?;
        return Ok(Action::await_change());
    }

    let now = Utc::now();
    let base = current
        .last_trigger_time
        .or_else(|| schedule.metadata.creation_timestamp.as_ref().map(|t| t.0))
        .unwrap_or(now);

    let mut next = BackupScheduleStatus {
        phase: SchedulePhase::Active,
        message: None,
        next_scheduled_time: cron.next_after(now),
        ..base_status
    };

    let triggered = match cron.latest_due(base, now) {
        Some(slot) => {
            next.last_trigger_time = Some(slot);
            match trigger(&ctx, &schedule, slot).await? {
                Trigger::Backup(backup_name) => next.last_backup_name = Some(backup_name),
                Trigger::Blocked(reason) => {
                    warn!(schedule = %name, %slot, %reason, "scheduled backup not created");
                    ctx.events
                        .publish(
                            &schedule.object_ref(&()),
                            EventType::Warning,
                            reasons::FAILED,
                            actions::TRIGGER,
                            Some(reason.clone()),
                        )
                        .await;
                    next.phase = SchedulePhase::Failed;
                    next.message = Some(reason);
                }
            }
            true
        }
        None => false,
    };

    update_status(&ctx, &schedule, &namespace, next.clone()).await?;

    if !triggered && schedule.retention().is_some() {
        let ctx = ctx.clone();
        let schedule = schedule.clone();
        tokio::spawn(async move {
            if let Err(e) = run_retention(&ctx, &schedule).await {
                warn!(schedule = %schedule.name_any(), error = %e, "retention pass failed");
            }
        });
    }

    match next.next_scheduled_time {
        Some(at) => {
            debug!(schedule = %name, next = %at, "waiting for next slot");
            Ok(Action::requeue(requeue_delay(at, now)))
        }
        None => Ok(Action::await_change()),
    }
}

/// Whether `backup` was created by `schedule`
pub fn created_by(backup: &DatabaseBackup, schedule: &BackupSchedule) -> bool {
    match schedule.uid() {
        Some(uid) => backup
            .owner_references()
            .iter()
            .any(|r| r.controller == Some(true) && r.uid == uid),
        None => {
            backup.labels().get(SCHEDULE_LABEL) == Some(&label_value(&schedule.name_any()))
        }
    }
}

/// Outcome of triggering one slot
enum Trigger {
    /// The slot's backup exists and belongs to this schedule
    Backup(String),
    /// The slot's name is taken by a record this schedule does not own
    Blocked(String),
}

async fn trigger(
    ctx: &Context,
    schedule: &BackupSchedule,
    slot: DateTime<Utc>,
) -> Result<Trigger, ReconcileError> {
    let backup = scheduled_backup(schedule, slot);
    let backup_name = backup.name_any();
    let namespace = backup.namespace().unwrap_or_default();

    match ctx.kube.create_backup(&backup).await? {
        CreateOutcome::Created => {
            info!(schedule = %schedule.name_any(), backup = %backup_name, %slot, "created scheduled backup");
            ctx.events
                .publish(
                    &schedule.object_ref(&()),
                    EventType::Normal,
                    reasons::BACKUP_TRIGGERED,
                    actions::TRIGGER,
                    Some(format!("Created DatabaseBackup {}", backup_name)),
                )
                .await;
        }
        CreateOutcome::AlreadyExists => {
            match ctx.kube.get_backup(&namespace, &backup_name).await? {
                Some(existing) if created_by(&existing, schedule) => {
                    debug!(backup = %backup_name, "scheduled backup already exists");
                }
                Some(_) => {
                    return Ok(Trigger::Blocked(format!(
                        "DatabaseBackup {} already exists and is not owned by this schedule",
                        backup_name
                    )));
                }
                // deleted between the create and the read; the next slot retries
                None => {
                    return Ok(Trigger::Blocked(format!(
                        "DatabaseBackup {} vanished while being created",
                        backup_name
                    )));
                }
            }
        }
    }
    Ok(Trigger::Backup(backup_name))
}

async fn cascade_delete(ctx: &Context, namespace: &str, name: &str) -> Result<(), ReconcileError> {
    let backups = ctx.kube.list_schedule_backups(namespace, name).await?;
    for backup in &backups {
        ctx.kube.delete_backup(namespace, &backup.name_any()).await?;
    }
    info!(schedule = %name, deleted = backups.len(), "deleted backups owned by schedule");
    Ok(())
}

async fn update_status(
    ctx: &Context,
    schedule: &BackupSchedule,
    namespace: &str,
    next: BackupScheduleStatus,
) -> Result<bool, ReconcileError> {
    if schedule.status.as_ref() == Some(&next) {
        debug!(schedule = %schedule.name_any(), "status unchanged, skipping update");
        return Ok(false);
    }
    ctx.kube
        .patch_schedule_status(namespace, &schedule.name_any(), &next)
        .await?;
    Ok(true)
}

/// Requeue after a reconcile error
pub fn error_policy(
    schedule: Arc<BackupSchedule>,
    error: &ReconcileError,
    _ctx: Arc<Context>,
) -> Action {
    error!(?error, schedule = %schedule.name_any(), "reconciliation failed");
    Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
}
