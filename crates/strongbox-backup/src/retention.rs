//! Retention engine
//!
//! Two prunings per BackupSchedule, both gated on a configured policy and
//! debounced through the `strongbox.dev/retention-last-run` annotation:
//!
//! - **Objects**: every output object under the schedule's prefix is
//!   classified with the tiered (grandfather-father-son) rule and whatever no
//!   tier keeps is deleted. Per-object failures are logged, not fatal.
//! - **Records**: with `keepLast`, terminal DatabaseBackups beyond the newest
//!   `keepLast` are deleted. Pending and Running records are never pruned.
//!
//! Buckets are UTC calendar days, ISO weeks and calendar months.

use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use strongbox_common::crd::{BackupSchedule, DatabaseBackup, RetentionPolicy};
use strongbox_common::events::{actions, reasons};
use strongbox_common::retry::{retry_when, RetryConfig};
use strongbox_common::{Error, RETENTION_MARKER_ANNOTATION};

use crate::context::Context;
use crate::resolve::{resolve_store, Resolution};
use crate::storage::StoredObject;

/// Attempts to claim the debounce marker before giving up for this pass
const CLAIM_ATTEMPTS: u32 = 3;

/// Calendar tier of a retention policy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tier {
    Daily,
    Weekly,
    Monthly,
}

impl Tier {
    fn bucket(self, t: DateTime<Utc>) -> (i32, u32) {
        match self {
            Tier::Daily => (t.year(), t.ordinal()),
            Tier::Weekly => {
                let week = t.iso_week();
                (week.year(), week.week())
            }
            Tier::Monthly => (t.year(), t.month()),
        }
    }
}

/// Objects split into those to keep and those to delete
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Kept, newest first
    pub keep: Vec<StoredObject>,
    /// To delete, newest first
    pub expire: Vec<StoredObject>,
}

/// Classify `objects` under `policy`
pub fn classify(objects: &[StoredObject], policy: &RetentionPolicy) -> RetentionPlan {
    let mut sorted: Vec<&StoredObject> = objects.iter().collect();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.key.cmp(&b.key)));

    let keep_last = policy.keep_last.unwrap_or(0) as usize;
    let recent: Vec<bool> = (0..sorted.len()).map(|i| i < keep_last).collect();
    let mut kept = recent.clone();

    for (tier, count) in [
        (Tier::Daily, policy.keep_daily),
        (Tier::Weekly, policy.keep_weekly),
        (Tier::Monthly, policy.keep_monthly),
    ] {
        let Some(count) = count.filter(|c| *c > 0) else {
            continue;
        };

        // sorted newest first, so each bucket is a contiguous run
        let mut buckets: Vec<((i32, u32), Vec<usize>)> = Vec::new();
        for (i, object) in sorted.iter().enumerate() {
            let key = tier.bucket(object.created_at);
            match buckets.last_mut() {
                Some((last, members)) if *last == key => members.push(i),
                _ => buckets.push((key, vec![i])),
            }
        }

        // days already represented by keepLast do not use up a daily slot;
        // weekly and monthly always look at their own newest buckets
        let mut taken = 0;
        for (_, members) in buckets {
            if taken == count {
                break;
            }
            if tier == Tier::Daily && members.iter().any(|i| recent[*i]) {
                continue;
            }
            if let Some(earliest) = members.last() {
                kept[*earliest] = true;
                taken += 1;
            }
        }
    }

    let mut plan = RetentionPlan::default();
    for (object, keep) in sorted.into_iter().zip(kept) {
        if keep {
            plan.keep.push(object.clone());
        } else {
            plan.expire.push(object.clone());
        }
    }
    plan
}

/// Names of terminal records beyond the newest `keep_last`
pub fn records_to_prune(records: &[DatabaseBackup], keep_last: u32) -> Vec<String> {
    let mut sorted: Vec<&DatabaseBackup> = records.iter().collect();
    sorted.sort_by(|a, b| {
        let created = |r: &DatabaseBackup| r.metadata.creation_timestamp.as_ref().map(|t| t.0);
        created(b)
            .cmp(&created(a))
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });

    sorted
        .into_iter()
        .skip(keep_last as usize)
        .filter(|r| r.phase().is_terminal())
        .map(|r| r.name_any())
        .collect()
}

/// Whether retention may run again given the last-run `marker`
pub fn debounce_elapsed(marker: Option<&str>, now: DateTime<Utc>, interval: Duration) -> bool {
    let Some(last) = marker.and_then(|m| DateTime::parse_from_rfc3339(m).ok()) else {
        return true;
    };
    match (now - last.with_timezone(&Utc)).to_std() {
        Ok(elapsed) => elapsed >= interval,
        // marker in the future: clock skew between replicas
        Err(_) => false,
    }
}

/// Result of one retention pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetentionOutcome {
    /// Whether this pass did any work
    pub ran: bool,
    /// Objects deleted
    pub objects_deleted: usize,
    /// Objects whose deletion failed
    pub objects_failed: usize,
    /// Records deleted
    pub records_deleted: usize,
}

/// Claim the debounce marker. Returns false when another pass ran recently.
async fn claim(ctx: &Context, namespace: &str, name: &str, now: DateTime<Utc>) -> Result<bool, Error> {
    let config = RetryConfig {
        max_attempts: CLAIM_ATTEMPTS,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
    };
    let marker_value = now.to_rfc3339();

    retry_when(&config, "retention_claim", Error::is_conflict, || {
        let marker_value = marker_value.clone();
        async move {
            let Some(current) = ctx.kube.get_schedule(namespace, name).await? else {
                return Ok(false);
            };
            let marker = current.annotations().get(RETENTION_MARKER_ANNOTATION);
            if !debounce_elapsed(marker.map(String::as_str), now, ctx.config.retention_interval) {
                debug!(schedule = %name, "retention ran recently, skipping");
                return Ok(false);
            }
            let version = current.resource_version().unwrap_or_default();
            ctx.kube
                .annotate_schedule(
                    namespace,
                    name,
                    &version,
                    RETENTION_MARKER_ANNOTATION,
                    &marker_value,
                )
                .await?;
            Ok(true)
        }
    })
    .await
}

/// Run both prunings for `schedule` if its policy is set and the debounce
/// interval has elapsed
pub async fn run_retention(
    ctx: &Context,
    schedule: &BackupSchedule,
) -> Result<RetentionOutcome, Error> {
    let Some(policy) = schedule.retention() else {
        return Ok(RetentionOutcome::default());
    };
    let name = schedule.name_any();
    let namespace = schedule.namespace().unwrap_or_default();
    let now = Utc::now();

    if !claim(ctx, &namespace, &name, now).await? {
        return Ok(RetentionOutcome::default());
    }

    let mut outcome = RetentionOutcome {
        ran: true,
        ..Default::default()
    };

    match resolve_store(ctx.kube.as_ref(), &namespace, schedule.spec.store_ref.as_deref()).await? {
        Resolution::Ready(store) => {
            let prefix = store.object_key(&schedule.path_prefix());
            let storage = ctx.storage.connect(&store).await?;
            let objects = storage.list(&prefix).await?;
            let plan = classify(&objects, policy);
            debug!(
                schedule = %name,
                listed = objects.len(),
                keep = plan.keep.len(),
                expire = plan.expire.len(),
                "classified backup objects"
            );

            if !plan.expire.is_empty() {
                let keys: Vec<String> = plan.expire.into_iter().map(|o| o.key).collect();
                for result in storage.delete(&keys).await {
                    match result.error {
                        None => outcome.objects_deleted += 1,
                        Some(error) => {
                            outcome.objects_failed += 1;
                            warn!(schedule = %name, key = %result.key, %error, "failed to delete backup object");
                        }
                    }
                }
            }
        }
        Resolution::NotReady(reason) => {
            warn!(schedule = %name, %reason, "skipping object retention");
        }
    }

    if let Some(keep_last) = policy.keep_last {
        let records = ctx.kube.list_schedule_backups(&namespace, &name).await?;
        for record in records_to_prune(&records, keep_last) {
            match ctx.kube.delete_backup(&namespace, &record).await {
                Ok(()) => outcome.records_deleted += 1,
                Err(e) => warn!(schedule = %name, backup = %record, error = %e, "failed to prune backup record"),
            }
        }
    }

    info!(
        schedule = %name,
        objects_deleted = outcome.objects_deleted,
        objects_failed = outcome.objects_failed,
        records_deleted = outcome.records_deleted,
        "retention pass finished"
    );

    if outcome.objects_deleted + outcome.records_deleted > 0 {
        ctx.events
            .publish(
                &schedule.object_ref(&()),
                EventType::Normal,
                reasons::RETENTION_PRUNED,
                actions::PRUNE,
                Some(format!(
                    "Pruned {} objects and {} records",
                    outcome.objects_deleted, outcome.records_deleted
                )),
            )
            .await;
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use strongbox_common::crd::{
        BackupScheduleSpec, DatabaseBackupSpec, DatabaseBackupStatus, OperationPhase,
        ReadinessPhase,
    };

    use crate::client::MockKubeClient;
    use crate::jobs::MockJobClient;
    use crate::storage::{DeleteResult, MockObjectStorage, MockStorageConnector, ObjectStorage};

    fn day(n: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 2, 0, 0).unwrap() + chrono::Duration::days(n as i64)
    }

    fn object(key: &str, created_at: DateTime<Utc>) -> StoredObject {
        StoredObject {
            key: key.to_string(),
            size: 1024,
            created_at,
        }
    }

    fn policy(yaml: &str) -> RetentionPolicy {
        serde_yaml::from_str(yaml).expect("parse policy")
    }

    fn record(name: &str, phase: OperationPhase, age_hours: i64) -> DatabaseBackup {
        let mut b = DatabaseBackup::new(
            name,
            DatabaseBackupSpec {
                database_ref: "orders".to_string(),
                store_ref: None,
                path_prefix: None,
                filename_template: None,
                ttl: None,
            },
        );
        b.metadata.creation_timestamp =
            Some(Time(day(30) - chrono::Duration::hours(age_hours)));
        b.status = Some(DatabaseBackupStatus {
            phase,
            ..Default::default()
        });
        b
    }

    fn schedule_with_retention() -> BackupSchedule {
        let spec: BackupScheduleSpec = serde_yaml::from_str(
            r#"
schedule: "0 2 * * *"
databaseRef: orders
storeRef: s3-prod
retention:
  keepLast: 3
  keepDaily: 7
"#,
        )
        .expect("parse schedule");
        let mut schedule = BackupSchedule::new("nightly", spec);
        schedule.metadata.namespace = Some("shop".to_string());
        schedule.metadata.resource_version = Some("1".to_string());
        schedule
    }

    #[test]
    fn test_keep_last_plus_daily_over_forty_days() {
        let objects: Vec<StoredObject> = (0..40)
            .map(|d| object(&format!("orders-{:02}.dump", d), day(d)))
            .collect();

        let plan = classify(&objects, &policy("keepLast: 3\nkeepDaily: 7\n"));

        let kept: Vec<&str> = plan.keep.iter().map(|o| o.key.as_str()).collect();
        let expected: Vec<String> = (30..40).rev().map(|d| format!("orders-{:02}.dump", d)).collect();
        assert_eq!(kept, expected.iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(plan.expire.len(), 30);
    }

    #[test]
    fn test_daily_keeps_earliest_of_each_day() {
        let objects = vec![
            object("d1-late", day(1) + chrono::Duration::hours(12)),
            object("d1-early", day(1)),
            object("d0-late", day(0) + chrono::Duration::hours(12)),
            object("d0-early", day(0)),
        ];

        let plan = classify(&objects, &policy("keepDaily: 2\n"));

        let mut kept: Vec<&str> = plan.keep.iter().map(|o| o.key.as_str()).collect();
        kept.sort();
        assert_eq!(kept, vec!["d0-early", "d1-early"]);
    }

    #[test]
    fn test_weekly_and_monthly_tiers() {
        // one object per day through January and February 2026
        let objects: Vec<StoredObject> = (0..59)
            .map(|d| object(&format!("o-{:02}", d), day(d)))
            .collect();

        let plan = classify(&objects, &policy("keepWeekly: 2\nkeepMonthly: 2\n"));

        let mut kept: Vec<String> = plan.keep.iter().map(|o| o.key.clone()).collect();
        kept.sort();
        // 2026-02-23 (Mon) and 2026-02-16 (Mon) start the two newest ISO
        // weeks; the months keep Jan 1 and Feb 1 regardless
        assert_eq!(kept, vec!["o-00", "o-31", "o-46", "o-53"]);
    }

    #[test]
    fn test_repeated_passes_keep_first_of_month() {
        let policy = policy("keepDaily: 7\nkeepMonthly: 2\n");
        let mut stored: Vec<StoredObject> = Vec::new();

        // one backup a day from 2026-01-01, retention after each
        for d in 0..45 {
            stored.push(object(&format!("o-{:02}", d), day(d)));
            stored = classify(&stored, &policy).keep;
        }

        let mut kept: Vec<String> = stored.into_iter().map(|o| o.key).collect();
        kept.sort();
        let mut expected = vec!["o-00".to_string(), "o-31".to_string()];
        expected.extend((38..45).map(|d| format!("o-{:02}", d)));
        assert_eq!(kept, expected);
    }

    #[test]
    fn test_no_policy_keeps_nothing_tiered() {
        let objects = vec![object("a", day(0))];
        let plan = classify(&objects, &RetentionPolicy::default());
        assert!(plan.keep.is_empty());
        assert_eq!(plan.expire.len(), 1);
    }

    #[test]
    fn test_record_pruning_never_touches_running() {
        let records = vec![
            record("running-old", OperationPhase::Running, 100),
            record("c1", OperationPhase::Completed, 1),
            record("c2", OperationPhase::Completed, 2),
            record("f3", OperationPhase::Failed, 3),
            record("c4", OperationPhase::Completed, 4),
            record("c5", OperationPhase::Completed, 5),
        ];

        let mut pruned = records_to_prune(&records, 2);
        pruned.sort();
        assert_eq!(pruned, vec!["c4", "c5", "f3"]);
    }

    #[test]
    fn test_debounce_window() {
        let now = day(10);
        let interval = Duration::from_secs(60);
        let recent = (now - chrono::Duration::seconds(30)).to_rfc3339();
        let old = (now - chrono::Duration::seconds(61)).to_rfc3339();

        assert!(debounce_elapsed(None, now, interval));
        assert!(debounce_elapsed(Some("garbage"), now, interval));
        assert!(!debounce_elapsed(Some(&recent), now, interval));
        assert!(debounce_elapsed(Some(&old), now, interval));
    }

    #[tokio::test]
    async fn test_two_triggers_scan_storage_once() {
        let state = Arc::new(Mutex::new(schedule_with_retention()));

        let mut kube = MockKubeClient::new();
        let read = state.clone();
        kube.expect_get_schedule()
            .returning(move |_, _| Ok(Some(read.lock().expect("lock").clone())));
        let write = state.clone();
        kube.expect_annotate_schedule()
            .times(1)
            .returning(move |_, _, version, key, value| {
                let mut schedule = write.lock().expect("lock");
                assert_eq!(schedule.metadata.resource_version.as_deref(), Some(version));
                let mut annotations = BTreeMap::new();
                annotations.insert(key.to_string(), value.to_string());
                schedule.metadata.annotations = Some(annotations);
                schedule.metadata.resource_version = Some("2".to_string());
                Ok(())
            });
        kube.expect_get_store().returning(|_, name| {
            Ok(Some(crate::resolve::tests::store(
                name,
                false,
                ReadinessPhase::Ready,
            )))
        });
        kube.expect_list_schedule_backups()
            .returning(|_, _| Ok(vec![]));

        let mut objects = MockObjectStorage::new();
        objects
            .expect_list()
            .withf(|prefix| prefix == "schedules/shop/nightly")
            .times(1)
            .returning(|_| {
                Ok((0..5)
                    .map(|d| object(&format!("schedules/shop/nightly/o-{}", d), day(d)))
                    .collect())
            });
        objects.expect_delete().returning(|keys| {
            keys.iter()
                .map(|k| DeleteResult {
                    key: k.clone(),
                    error: None,
                })
                .collect()
        });
        let objects: Arc<dyn ObjectStorage> = Arc::new(objects);
        let mut storage = MockStorageConnector::new();
        storage
            .expect_connect()
            .returning(move |_| Ok(objects.clone()));

        let ctx = Context::for_testing(
            Arc::new(kube),
            Arc::new(MockJobClient::new()),
            Arc::new(storage),
        );
        let schedule = schedule_with_retention();

        let first = run_retention(&ctx, &schedule).await.expect("first pass");
        let second = run_retention(&ctx, &schedule).await.expect("second pass");

        assert!(first.ran);
        assert_eq!(first.objects_deleted, 0);
        assert!(!second.ran);
    }

    #[tokio::test]
    async fn test_partial_delete_failure_is_tolerated() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_schedule()
            .returning(|_, _| Ok(Some(schedule_with_retention())));
        kube.expect_annotate_schedule()
            .returning(|_, _, _, _, _| Ok(()));
        kube.expect_get_store().returning(|_, name| {
            Ok(Some(crate::resolve::tests::store(
                name,
                false,
                ReadinessPhase::Ready,
            )))
        });
        kube.expect_list_schedule_backups()
            .returning(|_, _| Ok(vec![]));

        let mut objects = MockObjectStorage::new();
        objects.expect_list().returning(|_| {
            Ok((0..20)
                .map(|d| object(&format!("o-{:02}", d), day(d)))
                .collect())
        });
        objects.expect_delete().returning(|keys| {
            keys.iter()
                .map(|k| DeleteResult {
                    key: k.clone(),
                    error: (k == "o-00").then(|| "access denied".to_string()),
                })
                .collect()
        });
        let objects: Arc<dyn ObjectStorage> = Arc::new(objects);
        let mut storage = MockStorageConnector::new();
        storage
            .expect_connect()
            .returning(move |_| Ok(objects.clone()));

        let ctx = Context::for_testing(
            Arc::new(kube),
            Arc::new(MockJobClient::new()),
            Arc::new(storage),
        );

        let outcome = run_retention(&ctx, &schedule_with_retention())
            .await
            .expect("retention");
        assert_eq!(outcome.objects_deleted, 9);
        assert_eq!(outcome.objects_failed, 1);
    }
}
