//! DatabaseRestore controller
//!
//! Same skeleton as the backup controller, with source resolution before
//! dispatch. The source is an explicit DatabaseBackup, the latest completed
//! backup of a database, or a literal object key. The conflict policy is
//! handed to the Job untouched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use strongbox_common::crd::{
    DatabaseBackup, DatabaseRestore, DatabaseRestoreStatus, OperationPhase, RestoreSource,
};
use strongbox_common::events::{actions, reasons};
use strongbox_common::kube_utils::has_finalizer;
use strongbox_common::{Error, OPERATION_FINALIZER};

use crate::client::{KubeClient, RecordKind};
use crate::context::Context;
use crate::dispatcher::{run_id_for, ExecutionSpec, OperationMode, UnitHandle, UnitState};
use crate::error::ReconcileError;
use crate::guard::{admit_or_defer, fingerprint, is_already_terminal, Admission, Requester};
use crate::resolve::{pending_expired, resolve_database, resolve_store, Resolution};
use crate::{REQUEUE_DEPENDENCY_SECS, REQUEUE_ERROR_SECS, REQUEUE_POLL_SECS};

const KIND: &str = "DatabaseRestore";

/// Fingerprint of the inputs that determine what a restore does
pub fn restore_fingerprint(restore: &DatabaseRestore) -> String {
    let namespace = restore.namespace().unwrap_or_default();
    let spec = &restore.spec;
    let policy = spec.conflict_policy.to_string();

    let source = if let Some(r) = &spec.backup_ref {
        ["backup", r.namespace.as_deref().unwrap_or(&namespace), r.name.as_str()]
    } else if let Some(l) = &spec.latest_from {
        ["latest", l.namespace.as_deref().unwrap_or(&namespace), l.database.as_str()]
    } else {
        ["path", spec.path.as_deref().unwrap_or_default(), ""]
    };

    let mut parts = source.to_vec();
    parts.extend([
        spec.database_ref.as_str(),
        policy.as_str(),
        spec.store_ref.as_deref().unwrap_or_default(),
    ]);
    fingerprint(&parts)
}

/// Where a restore reads from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSource {
    /// Object key to load
    pub path: String,
    /// Store holding the object; `None` means the namespace default
    pub store_ref: Option<String>,
    /// Source backup as `namespace/name`, when there is one
    pub backup: Option<String>,
}

/// Outcome of source resolution
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceResolution {
    /// Source found
    Ready(ResolvedSource),
    /// The source can never be used as written; the restore fails
    Invalid(String),
}

/// Newest restorable backup of `database` among `backups`
pub fn latest_restorable<'a>(
    backups: &'a [DatabaseBackup],
    database: &str,
) -> Option<&'a DatabaseBackup> {
    backups
        .iter()
        .filter(|b| b.spec.database_ref == database && b.is_restorable())
        .filter_map(|b| {
            let completed = b.status.as_ref()?.completed_at?;
            Some((completed, b))
        })
        .max_by_key(|(completed, _)| *completed)
        .map(|(_, b)| b)
}

fn from_backup(backup: &DatabaseBackup, store_override: Option<&str>) -> ResolvedSource {
    ResolvedSource {
        path: backup
            .status
            .as_ref()
            .and_then(|s| s.output_path.clone())
            .unwrap_or_default(),
        store_ref: store_override
            .map(String::from)
            .or_else(|| backup.spec.store_ref.clone()),
        backup: Some(format!(
            "{}/{}",
            backup.namespace().unwrap_or_default(),
            backup.name_any()
        )),
    }
}

/// Resolve the source of `restore`
pub async fn resolve_source(
    kube: &dyn KubeClient,
    restore: &DatabaseRestore,
    namespace: &str,
) -> Result<SourceResolution, Error> {
    let store_override = restore.spec.store_ref.as_deref().filter(|s| !s.is_empty());

    match restore.spec.source(&restore.name_any())? {
        RestoreSource::Backup(reference) => {
            let ns = reference.namespace.as_deref().unwrap_or(namespace);
            let Some(backup) = kube.get_backup(ns, &reference.name).await? else {
                return Ok(SourceResolution::Invalid(format!(
                    "DatabaseBackup {}/{} not found",
                    ns, reference.name
                )));
            };
            if !backup.is_restorable() {
                return Ok(SourceResolution::Invalid(format!(
                    "DatabaseBackup {}/{} is {} without an output path, it cannot be restored",
                    ns,
                    reference.name,
                    backup.phase()
                )));
            }
            Ok(SourceResolution::Ready(from_backup(&backup, store_override)))
        }
        RestoreSource::Latest(selector) => {
            let ns = selector.namespace.as_deref().unwrap_or(namespace);
            let backups = kube.list_backups(ns).await?;
            match latest_restorable(&backups, &selector.database) {
                Some(backup) => Ok(SourceResolution::Ready(from_backup(backup, store_override))),
                None => Ok(SourceResolution::Invalid(format!(
                    "no completed backup found for database {} in namespace {}",
                    selector.database, ns
                ))),
            }
        }
        RestoreSource::Path { path, store } => Ok(SourceResolution::Ready(ResolvedSource {
            path: path.to_string(),
            store_ref: Some(store.to_string()),
            backup: None,
        })),
    }
}

/// Reconcile a DatabaseRestore
pub async fn reconcile(
    restore: Arc<DatabaseRestore>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let name = restore.name_any();
    let namespace = restore
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(name.clone()))?;

    info!(restore = %name, namespace = %namespace, "reconciling DatabaseRestore");

    if restore.metadata.deletion_timestamp.is_some() {
        if has_finalizer(restore.as_ref(), OPERATION_FINALIZER) {
            if !restore.phase().is_terminal() {
                let job_name = restore.status.as_ref().and_then(|s| s.job_name.as_deref());
                ctx.dispatcher.cancel(&namespace, job_name, KIND, &name).await;
            }
            ctx.kube
                .remove_finalizer(RecordKind::Restore, &namespace, &name, OPERATION_FINALIZER)
                .await?;
            info!(restore = %name, "cleanup finished, finalizer removed");
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer(restore.as_ref(), OPERATION_FINALIZER) {
        ctx.kube
            .add_finalizer(RecordKind::Restore, &namespace, &name, OPERATION_FINALIZER)
            .await?;
        debug!(restore = %name, "added finalizer");
        return Ok(Action::await_change());
    }

    let status = restore.status.clone().unwrap_or_default();
    let token = restore_fingerprint(&restore);

    if is_already_terminal(status.phase, status.fingerprint.as_deref(), &token) {
        debug!(restore = %name, "restore already terminal, nothing to do");
        return Ok(Action::await_change());
    }

    if status.phase == OperationPhase::Running {
        if let Some(job_name) = status.job_name.clone() {
            let handle = UnitHandle {
                namespace: namespace.clone(),
                name: job_name,
            };
            return poll(&restore, &namespace, &name, status, handle, &ctx).await;
        }
    }

    start(&restore, &namespace, &name, status, token, &ctx).await
}

async fn poll(
    restore: &DatabaseRestore,
    namespace: &str,
    name: &str,
    status: DatabaseRestoreStatus,
    handle: UnitHandle,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    match ctx.dispatcher.poll(&handle).await? {
        UnitState::Running => {
            debug!(restore = %name, job = %handle.name, "restore job still running");
            Ok(Action::requeue(Duration::from_secs(REQUEUE_POLL_SECS)))
        }
        UnitState::Succeeded(result) => {
            let next = DatabaseRestoreStatus {
                phase: OperationPhase::Completed,
                message: Some("Restore completed".to_string()),
                duration: result
                    .duration
                    .map(|d| humantime::format_duration(d).to_string()),
                completed_at: Some(Utc::now()),
                ..status
            };
            info!(restore = %name, duration = ?next.duration, "restore completed");
            update_status(ctx, restore, namespace, name, next.clone()).await?;
            publish(
                ctx,
                restore,
                EventType::Normal,
                reasons::COMPLETED,
                format!(
                    "Restored {} into {}",
                    next.source_path.as_deref().unwrap_or("unknown path"),
                    restore.spec.database_ref
                ),
            )
            .await;
            Ok(Action::await_change())
        }
        UnitState::Failed(reason) => {
            warn!(restore = %name, job = %handle.name, %reason, "restore job failed");
            let next = DatabaseRestoreStatus {
                phase: OperationPhase::Failed,
                message: Some(format!("Restore job failed: {}", reason)),
                completed_at: Some(Utc::now()),
                ..status
            };
            update_status(ctx, restore, namespace, name, next).await?;
            publish(ctx, restore, EventType::Warning, reasons::FAILED, reason).await;
            Ok(Action::await_change())
        }
    }
}

async fn start(
    restore: &DatabaseRestore,
    namespace: &str,
    name: &str,
    status: DatabaseRestoreStatus,
    token: String,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    let source = match resolve_source(ctx.kube.as_ref(), restore, namespace).await {
        Ok(SourceResolution::Ready(source)) => source,
        Ok(SourceResolution::Invalid(message)) => {
            return fail(ctx, restore, namespace, name, token, reasons::FAILED, message).await
        }
        Err(e) if !e.is_retryable() => {
            return fail(ctx, restore, namespace, name, token, reasons::VALIDATION_FAILED, e.to_string()).await
        }
        Err(e) => return Err(e.into()),
    };

    let pending_since = match status.phase {
        OperationPhase::Pending => status.pending_since,
        _ => None,
    };

    let database = match resolve_database(ctx.kube.as_ref(), namespace, &restore.spec.database_ref).await? {
        Resolution::Ready(db) => db,
        Resolution::NotReady(reason) => {
            return wait_for_dependency(ctx, restore, namespace, name, token, pending_since, reason).await
        }
    };
    let store = match resolve_store(ctx.kube.as_ref(), namespace, source.store_ref.as_deref()).await? {
        Resolution::Ready(store) => store,
        Resolution::NotReady(reason) => {
            return wait_for_dependency(ctx, restore, namespace, name, token, pending_since, reason).await
        }
    };

    let requester = Requester {
        kind: RecordKind::Restore,
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
        let next = DatabaseRestoreStatus {
            phase: OperationPhase::Pending,
            message: Some(message.clone()),
            fingerprint: Some(token),
            observed_generation: restore.metadata.generation,
            ..Default::default()
        };
        if update_status(ctx, restore, namespace, name, next).await? {
            publish(ctx, restore, EventType::Normal, reasons::THROTTLED, message).await;
        }
        return Ok(Action::requeue(backoff));
    }

    let run_id = run_id_for(&restore.uid().unwrap_or_default(), &token);
    let spec = ExecutionSpec {
        owner_kind: KIND.to_string(),
        owner_name: name.to_string(),
        namespace: namespace.to_string(),
        owner_ref: restore.controller_owner_ref(&()),
        run_id: run_id.clone(),
        mode: OperationMode::Restore,
        database: database.clone(),
        store,
        object_path: source.path.clone(),
        conflict_policy: Some(restore.spec.conflict_policy),
    };
    let handle = ctx.dispatcher.dispatch(&spec).await?;

    let next = DatabaseRestoreStatus {
        phase: OperationPhase::Running,
        message: Some(format!("Job {} dispatched", handle.name)),
        fingerprint: Some(token),
        job_name: Some(handle.name.clone()),
        run_id: Some(run_id),
        target_cluster: Some(database.cluster_key.clone()),
        source_path: Some(source.path.clone()),
        source_backup: source.backup,
        started_at: Some(Utc::now()),
        observed_generation: restore.metadata.generation,
        ..Default::default()
    };
    update_status(ctx, restore, namespace, name, next).await?;
    publish(
        ctx,
        restore,
        EventType::Normal,
        reasons::JOB_DISPATCHED,
        format!("Job {} restoring {}", handle.name, source.path),
    )
    .await;

    Ok(Action::requeue(Duration::from_secs(REQUEUE_POLL_SECS)))
}

async fn wait_for_dependency(
    ctx: &Context,
    restore: &DatabaseRestore,
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
        return fail(ctx, restore, namespace, name, token, reasons::PENDING_TIMEOUT, message).await;
    }

    debug!(restore = %name, %reason, "dependencies not ready");
    let next = DatabaseRestoreStatus {
        phase: OperationPhase::Pending,
        message: Some(reason),
        fingerprint: Some(token),
        pending_since: Some(pending_since.unwrap_or(now)),
        observed_generation: restore.metadata.generation,
        ..Default::default()
    };
    update_status(ctx, restore, namespace, name, next).await?;
    Ok(Action::requeue(Duration::from_secs(REQUEUE_DEPENDENCY_SECS)))
}

async fn fail(
    ctx: &Context,
    restore: &DatabaseRestore,
    namespace: &str,
    name: &str,
    token: String,
    reason: &str,
    message: String,
) -> Result<Action, ReconcileError> {
    warn!(restore = %name, %message, "restore failed");
    let next = DatabaseRestoreStatus {
        phase: OperationPhase::Failed,
        message: Some(message.clone()),
        fingerprint: Some(token),
        completed_at: Some(Utc::now()),
        observed_generation: restore.metadata.generation,
        ..Default::default()
    };
    update_status(ctx, restore, namespace, name, next).await?;
    publish(ctx, restore, EventType::Warning, reason, message).await;
    Ok(Action::await_change())
}

async fn update_status(
    ctx: &Context,
    restore: &DatabaseRestore,
    namespace: &str,
    name: &str,
    next: DatabaseRestoreStatus,
) -> Result<bool, ReconcileError> {
    if let Some(current) = &restore.status {
        if current.phase == next.phase
            && current.message == next.message
            && current.fingerprint == next.fingerprint
            && current.job_name == next.job_name
        {
            debug!(restore = %name, "status unchanged, skipping update");
            return Ok(false);
        }
    }
    ctx.kube.patch_restore_status(namespace, name, &next).await?;
    Ok(true)
}

async fn publish(
    ctx: &Context,
    restore: &DatabaseRestore,
    type_: EventType,
    reason: &str,
    note: String,
) {
    let action = match reason {
        r if r == reasons::JOB_DISPATCHED => actions::DISPATCH,
        _ => actions::RECONCILE,
    };
    ctx.events
        .publish(&restore.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

/// Requeue after a reconcile error
pub fn error_policy(
    restore: Arc<DatabaseRestore>,
    error: &ReconcileError,
    _ctx: Arc<Context>,
) -> Action {
    error!(?error, restore = %restore.name_any(), "reconciliation failed");
    Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use rstest::rstest;
    use strongbox_common::crd::{DatabaseBackupSpec, DatabaseBackupStatus, ReadinessPhase};

    use crate::client::{CreateOutcome, MockKubeClient};
    use crate::jobs::MockJobClient;
    use crate::resolve::tests::{ready_cluster, ready_database, store};
    use crate::storage::MockStorageConnector;

    fn sample_restore(yaml: &str) -> DatabaseRestore {
        DatabaseRestore {
            metadata: ObjectMeta {
                name: Some("orders-rollback".to_string()),
                namespace: Some("shop".to_string()),
                uid: Some("5d1f7c3e-2222-4b8e-8d0a-1c9e2f4b6a77".to_string()),
                generation: Some(1),
                finalizers: Some(vec![OPERATION_FINALIZER.to_string()]),
                ..Default::default()
            },
            spec: serde_yaml::from_str(yaml).expect("parse spec"),
            status: None,
        }
    }

    fn completed_backup(name: &str, database: &str, hours_ago: i64) -> DatabaseBackup {
        let mut b = DatabaseBackup::new(
            name,
            DatabaseBackupSpec {
                database_ref: database.to_string(),
                store_ref: Some("s3-prod".to_string()),
                path_prefix: None,
                filename_template: None,
                ttl: None,
            },
        );
        b.metadata.namespace = Some("shop".to_string());
        b.status = Some(DatabaseBackupStatus {
            phase: OperationPhase::Completed,
            output_path: Some(format!("backups/shop/{}/{}.dump", name, database)),
            completed_at: Some(Utc::now() - chrono::Duration::hours(hours_ago)),
            ..Default::default()
        });
        b
    }

    fn context(kube: MockKubeClient, jobs: MockJobClient) -> Arc<Context> {
        Arc::new(Context::for_testing(
            Arc::new(kube),
            Arc::new(jobs),
            Arc::new(MockStorageConnector::new()),
        ))
    }

    fn ready_dependencies(kube: &mut MockKubeClient) {
        kube.expect_get_database()
            .returning(|_, _| Ok(Some(ready_database())));
        kube.expect_get_database_cluster()
            .returning(|_, _| Ok(Some(ready_cluster())));
        kube.expect_get_store()
            .returning(|_, name| Ok(Some(store(name, false, ReadinessPhase::Ready))));
        kube.expect_list_all_backups().returning(|| Ok(vec![]));
        kube.expect_list_all_restores().returning(|| Ok(vec![]));
    }

    #[test]
    fn test_latest_restorable_picks_newest_completion() {
        let mut failed = completed_backup("newest-failed", "orders", 0);
        if let Some(s) = failed.status.as_mut() {
            s.phase = OperationPhase::Failed;
        }
        let backups = vec![
            completed_backup("two-hours", "orders", 2),
            completed_backup("now", "orders", 0),
            completed_backup("one-hour", "orders", 1),
            completed_backup("other-db", "payments", 0),
            failed,
        ];

        let latest = latest_restorable(&backups, "orders").expect("a restorable backup");
        assert_eq!(latest.name_any(), "now");
        assert!(latest_restorable(&backups, "inventory").is_none());
    }

    #[tokio::test]
    async fn test_latest_from_resolves_newest_path() {
        let mut kube = MockKubeClient::new();
        kube.expect_list_backups()
            .withf(|ns| ns == "shop")
            .returning(|_| {
                Ok(vec![
                    completed_backup("t-2h", "orders", 2),
                    completed_backup("t-1h", "orders", 1),
                    completed_backup("t", "orders", 0),
                ])
            });

        let restore = sample_restore("databaseRef: orders\nlatestFrom:\n  database: orders\n");
        let resolved = resolve_source(&kube, &restore, "shop").await.expect("resolve");

        assert_eq!(
            resolved,
            SourceResolution::Ready(ResolvedSource {
                path: "backups/shop/t/orders.dump".to_string(),
                store_ref: Some("s3-prod".to_string()),
                backup: Some("shop/t".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn test_literal_path_is_verbatim() {
        let restore = sample_restore(
            "databaseRef: orders\npath: imports/legacy/orders.sql.gz\nstoreRef: s3-legacy\n",
        );
        let resolved = resolve_source(&MockKubeClient::new(), &restore, "shop")
            .await
            .expect("resolve");

        assert_eq!(
            resolved,
            SourceResolution::Ready(ResolvedSource {
                path: "imports/legacy/orders.sql.gz".to_string(),
                store_ref: Some("s3-legacy".to_string()),
                backup: None,
            })
        );
    }

    #[rstest]
    #[case::two_selectors(
        "databaseRef: orders\npath: a.dump\nstoreRef: s3\nlatestFrom:\n  database: orders\n",
        "found 2"
    )]
    #[case::no_selector("databaseRef: orders\n", "found 0")]
    #[case::path_without_store("databaseRef: orders\npath: a.dump\n", "storeRef is required")]
    #[tokio::test]
    async fn test_invalid_selectors_fail_without_retry(#[case] yaml: &str, #[case] expected: &str) {
        let expected = expected.to_string();
        let mut kube = MockKubeClient::new();
        kube.expect_patch_restore_status()
            .withf(move |_, _, status| {
                status.phase == OperationPhase::Failed
                    && status.message.as_deref().is_some_and(|m| m.contains(&expected))
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let action = reconcile(Arc::new(sample_restore(yaml)), context(kube, MockJobClient::new()))
            .await
            .expect("reconcile");
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_no_completed_backup_fails() {
        let mut kube = MockKubeClient::new();
        kube.expect_list_backups().returning(|_| {
            let mut running = completed_backup("in-progress", "orders", 0);
            if let Some(s) = running.status.as_mut() {
                s.phase = OperationPhase::Running;
            }
            Ok(vec![running])
        });
        kube.expect_patch_restore_status()
            .withf(|_, _, status| {
                status.phase == OperationPhase::Failed
                    && status
                        .message
                        .as_deref()
                        .is_some_and(|m| m.starts_with("no completed backup found"))
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let restore = sample_restore("databaseRef: orders\nlatestFrom:\n  database: orders\n");
        reconcile(Arc::new(restore), context(kube, MockJobClient::new()))
            .await
            .expect("reconcile");
    }

    #[tokio::test]
    async fn test_backup_ref_must_be_completed() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_backup()
            .withf(|ns, name| ns == "prod" && name == "orders-20260120-0200")
            .returning(|_, _| {
                let mut b = completed_backup("orders-20260120-0200", "orders", 0);
                b.status = Some(DatabaseBackupStatus {
                    phase: OperationPhase::Running,
                    ..Default::default()
                });
                Ok(Some(b))
            });
        kube.expect_patch_restore_status()
            .withf(|_, _, status| {
                status.phase == OperationPhase::Failed
                    && status.message.as_deref().is_some_and(|m| m.contains("cannot be restored"))
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let restore = sample_restore(
            "databaseRef: orders\nbackupRef:\n  name: orders-20260120-0200\n  namespace: prod\n",
        );
        reconcile(Arc::new(restore), context(kube, MockJobClient::new()))
            .await
            .expect("reconcile");
    }

    #[tokio::test]
    async fn test_restore_dispatches_with_conflict_policy() {
        let mut kube = MockKubeClient::new();
        ready_dependencies(&mut kube);
        kube.expect_get_backup().returning(|_, name| Ok(Some(completed_backup(name, "orders", 1))));
        kube.expect_patch_restore_status()
            .withf(|_, _, status| {
                status.phase == OperationPhase::Running
                    && status.source_path.as_deref() == Some("backups/shop/nightly-20260120-0200/orders.dump")
                    && status.source_backup.as_deref() == Some("shop/nightly-20260120-0200")
                    && status.target_cluster.as_deref() == Some("shop/pg-main")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut jobs = MockJobClient::new();
        jobs.expect_create_job()
            .withf(|_, job| {
                let env = job
                    .spec
                    .as_ref()
                    .and_then(|s| s.template.spec.as_ref())
                    .and_then(|p| p.containers[0].env.clone())
                    .unwrap_or_default();
                let value = |name: &str| {
                    env.iter()
                        .find(|e| e.name == name)
                        .and_then(|e| e.value.clone())
                };
                value("STRONGBOX_MODE").as_deref() == Some("restore")
                    && value("STRONGBOX_CONFLICT_POLICY").as_deref() == Some("drop")
                    && value("STRONGBOX_SOURCE_PATH").as_deref()
                        == Some("backups/shop/nightly-20260120-0200/orders.dump")
            })
            .times(1)
            .returning(|_, _| Ok(CreateOutcome::Created));

        let restore = sample_restore(
            "databaseRef: orders\nbackupRef:\n  name: nightly-20260120-0200\nconflictPolicy: drop\n",
        );
        let action = reconcile(Arc::new(restore), context(kube, jobs))
            .await
            .expect("reconcile");
        assert_eq!(action, Action::requeue(Duration::from_secs(REQUEUE_POLL_SECS)));
    }

    #[tokio::test]
    async fn test_terminal_restore_is_a_no_op() {
        let mut restore = sample_restore("databaseRef: orders\nlatestFrom:\n  database: orders\n");
        restore.status = Some(DatabaseRestoreStatus {
            phase: OperationPhase::Completed,
            fingerprint: Some(restore_fingerprint(&restore)),
            ..Default::default()
        });

        let action = reconcile(Arc::new(restore), context(MockKubeClient::new(), MockJobClient::new()))
            .await
            .expect("reconcile");
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn test_fingerprint_covers_policy_and_source() {
        let base = sample_restore("databaseRef: orders\nlatestFrom:\n  database: orders\n");
        let token = restore_fingerprint(&base);

        let mut other_policy = base.clone();
        other_policy.spec.conflict_policy = strongbox_common::crd::ConflictPolicy::Overwrite;
        assert_ne!(restore_fingerprint(&other_policy), token);

        let mut other_target = base.clone();
        other_target.spec.database_ref = "orders-staging".to_string();
        assert_ne!(restore_fingerprint(&other_target), token);

        let by_path = sample_restore("databaseRef: orders\npath: a.dump\nstoreRef: s3\n");
        assert_ne!(restore_fingerprint(&by_path), token);
    }

    #[tokio::test]
    async fn test_deleting_pending_restore_cancels_by_label() {
        let mut restore = sample_restore("databaseRef: orders\nlatestFrom:\n  database: orders\n");
        restore.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let mut jobs = MockJobClient::new();
        jobs.expect_list_jobs()
            .withf(|ns, selector| {
                ns == "shop" && selector.contains("strongbox.dev/owner-name=orders-rollback")
            })
            .times(1)
            .returning(|_, _| Ok(vec![]));

        let mut kube = MockKubeClient::new();
        kube.expect_remove_finalizer()
            .withf(|kind, _, _, _| *kind == RecordKind::Restore)
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let action = reconcile(Arc::new(restore), context(kube, jobs))
            .await
            .expect("reconcile");
        assert_eq!(action, Action::await_change());
    }
}
