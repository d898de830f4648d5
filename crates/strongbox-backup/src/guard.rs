//! Idempotency and concurrency guard
//!
//! Reconciliation is driven by at-least-once change notifications, so every
//! pass first checks whether the request already reached a terminal phase
//! for the same inputs. Dispatch is then gated by a per-cluster ceiling on
//! running operations, recomputed from the record store on every check.

use std::time::Duration;

use tracing::debug;

use strongbox_common::crd::{DatabaseBackup, DatabaseRestore, OperationPhase};
use strongbox_common::kube_utils::digest_hex;
use strongbox_common::Error;

use crate::client::{KubeClient, RecordKind};

/// Separator between fingerprint parts; cannot occur in Kubernetes names
const PART_SEPARATOR: char = '\u{1f}';

/// Digest of an operation's meaningful parameters
pub fn fingerprint(parts: &[&str]) -> String {
    let mut joined = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            joined.push(PART_SEPARATOR);
        }
        joined.push_str(part);
    }
    digest_hex(&joined)
}

/// True when `phase` is terminal and was reached for the same fingerprint
pub fn is_already_terminal(phase: OperationPhase, recorded: Option<&str>, token: &str) -> bool {
    phase.is_terminal() && recorded == Some(token)
}

/// Admission decision for a new dispatch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// A slot is free
    Admit,
    /// The ceiling is reached; check again after the backoff
    Defer(Duration),
}

/// Admit while `in_flight` is below `ceiling`. A ceiling of zero disables the limit.
pub fn decide(in_flight: usize, ceiling: usize, backoff: Duration) -> Admission {
    if ceiling == 0 || in_flight < ceiling {
        Admission::Admit
    } else {
        Admission::Defer(backoff)
    }
}

/// Identity of the request asking for admission
#[derive(Clone, Copy, Debug)]
pub struct Requester<'a> {
    /// Backup or restore
    pub kind: RecordKind,
    /// Namespace of the request
    pub namespace: &'a str,
    /// Name of the request
    pub name: &'a str,
}

impl Requester<'_> {
    fn is(&self, kind: RecordKind, namespace: Option<&str>, name: Option<&str>) -> bool {
        self.kind == kind && namespace == Some(self.namespace) && name == Some(self.name)
    }
}

/// Non-terminal and holding an execution Job. Pending records that were only
/// throttled or are waiting on a dependency have no Job and are not counted.
fn in_flight_on(
    phase: OperationPhase,
    job_name: Option<&str>,
    target: Option<&str>,
    cluster_key: &str,
) -> bool {
    !phase.is_terminal()
        && (phase == OperationPhase::Running || job_name.is_some())
        && target == Some(cluster_key)
}

/// Count in-flight backups and restores against `cluster_key`, other than `requester`
pub async fn in_flight(
    kube: &dyn KubeClient,
    cluster_key: &str,
    requester: Requester<'_>,
) -> Result<usize, Error> {
    let backups = kube.list_all_backups().await?;
    let restores = kube.list_all_restores().await?;

    let backup_count = backups
        .iter()
        .filter(|b: &&DatabaseBackup| {
            let status = b.status.as_ref();
            let target = status.and_then(|s| s.target_cluster.as_deref());
            let job = status.and_then(|s| s.job_name.as_deref());
            in_flight_on(b.phase(), job, target, cluster_key)
                && !requester.is(
                    RecordKind::Backup,
                    b.metadata.namespace.as_deref(),
                    b.metadata.name.as_deref(),
                )
        })
        .count();
    let restore_count = restores
        .iter()
        .filter(|r: &&DatabaseRestore| {
            let status = r.status.as_ref();
            let target = status.and_then(|s| s.target_cluster.as_deref());
            let job = status.and_then(|s| s.job_name.as_deref());
            in_flight_on(r.phase(), job, target, cluster_key)
                && !requester.is(
                    RecordKind::Restore,
                    r.metadata.namespace.as_deref(),
                    r.metadata.name.as_deref(),
                )
        })
        .count();

    Ok(backup_count + restore_count)
}

/// Admit or defer `requester` against the ceiling of `cluster_key`
pub async fn admit_or_defer(
    kube: &dyn KubeClient,
    cluster_key: &str,
    requester: Requester<'_>,
    ceiling: usize,
    backoff: Duration,
) -> Result<Admission, Error> {
    let count = in_flight(kube, cluster_key, requester).await?;
    let admission = decide(count, ceiling, backoff);
    debug!(cluster = %cluster_key, in_flight = count, ceiling, ?admission, "concurrency check");
    Ok(admission)
}
