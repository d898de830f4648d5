//! Controller runner - builds one controller future per record kind
//!
//! Execution Jobs are owned by their backup or restore, and scheduled
//! backups by their schedule, so child changes wake the owner.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use strongbox_backup::{
    backup_controller, backup_store_controller, restore_controller, schedule_controller, Context,
};
use strongbox_common::crd::{BackupSchedule, BackupStore, DatabaseBackup, DatabaseRestore};
use strongbox_common::{MANAGED_BY, MANAGED_BY_LABEL};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Only the Jobs this operator created
fn job_watcher_config() -> WatcherConfig {
    watcher_config().labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY))
}

/// Build every controller future
pub fn build_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let jobs: Api<Job> = Api::all(client.clone());

    let backups = Controller::new(Api::<DatabaseBackup>::all(client.clone()), watcher_config())
        .owns(jobs.clone(), job_watcher_config())
        .shutdown_on_signal()
        .run(
            backup_controller::reconcile,
            backup_controller::error_policy,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("DatabaseBackup"));

    let restores = Controller::new(Api::<DatabaseRestore>::all(client.clone()), watcher_config())
        .owns(jobs, job_watcher_config())
        .shutdown_on_signal()
        .run(
            restore_controller::reconcile,
            restore_controller::error_policy,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("DatabaseRestore"));

    let schedules = Controller::new(Api::<BackupSchedule>::all(client.clone()), watcher_config())
        .owns(Api::<DatabaseBackup>::all(client.clone()), watcher_config())
        .shutdown_on_signal()
        .run(
            schedule_controller::reconcile,
            schedule_controller::error_policy,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("BackupSchedule"));

    let stores = Controller::new(Api::<BackupStore>::all(client), watcher_config())
        .shutdown_on_signal()
        .run(
            backup_store_controller::reconcile,
            backup_store_controller::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("BackupStore"));

    tracing::info!("- DatabaseBackup controller");
    tracing::info!("- DatabaseRestore controller");
    tracing::info!("- BackupSchedule controller");
    tracing::info!("- BackupStore controller");

    vec![
        Box::pin(backups),
        Box::pin(restores),
        Box::pin(schedules),
        Box::pin(stores),
    ]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_watch_is_label_scoped() {
        let config = job_watcher_config();
        assert_eq!(
            config.label_selector.as_deref(),
            Some("app.kubernetes.io/managed-by=strongbox")
        );
        assert_eq!(config.timeout, Some(WATCH_TIMEOUT_SECS));
    }
}
