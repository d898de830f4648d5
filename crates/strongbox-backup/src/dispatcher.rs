//! Execution dispatcher
//!
//! Turns a fully resolved backup or restore into exactly one `batch/v1` Job
//! named `{owner}-{runId}`, reads its outcome, and cancels it on owner
//! deletion. Every parameter reaches the runner as an environment variable.
//!
//! The runner reports its result through the container termination message
//! as JSON: `{"path": "...", "sizeBytes": 123}`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, HostPathVolumeSource, PodSpec, PodTemplateSpec,
    SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::Deserialize;
use tracing::{debug, info, warn};

use strongbox_common::crd::{BackupStorageProvider, BackupStore, ConflictPolicy};
use strongbox_common::kube_utils::{digest_hex, label_value, truncate_name};
use strongbox_common::{
    Error, MANAGED_BY, MANAGED_BY_LABEL, OWNER_KIND_LABEL, OWNER_NAME_LABEL, RUN_ID_LABEL,
};

use crate::client::CreateOutcome;
use crate::context::OperatorConfig;
use crate::jobs::{job_duration, job_outcome, JobClient, JobOutcome};
use crate::resolve::ResolvedDatabase;

/// Container name inside execution Jobs
const RUNNER_CONTAINER: &str = "strongbox";

/// Volume name for local-filesystem stores
const LOCAL_STORE_VOLUME: &str = "store";

/// What an execution Job does
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationMode {
    /// Dump a database to the store
    Backup,
    /// Load a dump from the store into a database
    Restore,
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backup => write!(f, "backup"),
            Self::Restore => write!(f, "restore"),
        }
    }
}

/// Fully resolved parameters for one execution Job
#[derive(Clone, Debug)]
pub struct ExecutionSpec {
    /// Kind of the owning request (`DatabaseBackup` / `DatabaseRestore`)
    pub owner_kind: String,
    /// Name of the owning request
    pub owner_name: String,
    /// Namespace of the owning request and the Job
    pub namespace: String,
    /// Controller owner reference to the request
    pub owner_ref: Option<OwnerReference>,
    /// Run identifier
    pub run_id: String,
    /// Backup or restore
    pub mode: OperationMode,
    /// Target database
    pub database: ResolvedDatabase,
    /// Store holding the object
    pub store: BackupStore,
    /// Object key to write (backup) or read (restore)
    pub object_path: String,
    /// Restore conflict policy
    pub conflict_policy: Option<ConflictPolicy>,
}

/// Identity of a dispatched Job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitHandle {
    /// Job namespace
    pub namespace: String,
    /// Job name
    pub name: String,
}

/// Result metadata reported by a successful Job
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    /// Object key written or read
    pub path: Option<String>,
    /// Output size in bytes
    pub size_bytes: Option<u64>,
    /// Job wall-clock duration
    pub duration: Option<Duration>,
}

/// Observed state of a dispatched Job
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitState {
    /// Still running or retrying
    Running,
    /// Finished successfully
    Succeeded(ResultMetadata),
    /// Exhausted its retries
    Failed(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminationReport {
    path: Option<String>,
    size_bytes: Option<u64>,
}

/// Run identifier (8 hex chars) for one set of inputs of one request.
///
/// Derived from the request's uid and fingerprint, so a reconcile working
/// from a stale cache names the same Job and finds it already there.
pub fn run_id_for(uid: &str, fingerprint: &str) -> String {
    digest_hex(&format!("{}\u{1f}{}", uid, fingerprint))[..8].to_string()
}

/// Job name for a run of `owner`, within the 63 character limit
pub fn job_name(owner: &str, run_id: &str) -> String {
    truncate_name(owner, run_id)
}

/// Label selector matching every Job of one owner
pub fn owner_selector(owner_kind: &str, owner_name: &str) -> String {
    format!(
        "{}={},{}={}",
        OWNER_KIND_LABEL,
        owner_kind.to_lowercase(),
        OWNER_NAME_LABEL,
        label_value(owner_name)
    )
}

/// Creates, polls and cancels execution Jobs
pub struct Dispatcher {
    jobs: Arc<dyn JobClient>,
    image: String,
    service_account: Option<String>,
    backoff_limit: i32,
    ttl_after_finished: i32,
}

impl Dispatcher {
    /// Create a dispatcher over a Job client
    pub fn new(jobs: Arc<dyn JobClient>, config: &OperatorConfig) -> Self {
        Self {
            jobs,
            image: config.job_image.clone(),
            service_account: config.job_service_account.clone(),
            backoff_limit: config.job_backoff_limit,
            ttl_after_finished: config.job_ttl_after_finished,
        }
    }

    /// Create the Job for `spec`.
    ///
    /// A Job that already exists under the same name is looked up by its
    /// owner and run labels and returned instead of failing.
    pub async fn dispatch(&self, spec: &ExecutionSpec) -> Result<UnitHandle, Error> {
        let job = self.build_job(spec);
        let name = job.metadata.name.clone().unwrap_or_default();

        match self.jobs.create_job(&spec.namespace, &job).await? {
            CreateOutcome::Created => {
                info!(job = %name, mode = %spec.mode, owner = %spec.owner_name, "dispatched execution job");
                Ok(UnitHandle {
                    namespace: spec.namespace.clone(),
                    name,
                })
            }
            CreateOutcome::AlreadyExists => {
                let selector = format!(
                    "{},{}={}",
                    owner_selector(&spec.owner_kind, &spec.owner_name),
                    RUN_ID_LABEL,
                    spec.run_id
                );
                let existing = self.jobs.list_jobs(&spec.namespace, &selector).await?;
                let found = existing
                    .into_iter()
                    .find_map(|j| j.metadata.name)
                    .ok_or_else(|| {
                        Error::internal_with_context(
                            "dispatcher",
                            format!("job {} exists but is not owned by {}", name, spec.owner_name),
                        )
                    })?;
                debug!(job = %found, "execution job already existed");
                Ok(UnitHandle {
                    namespace: spec.namespace.clone(),
                    name: found,
                })
            }
        }
    }

    /// Read the state of a dispatched Job without blocking
    pub async fn poll(&self, handle: &UnitHandle) -> Result<UnitState, Error> {
        let Some(job) = self.jobs.get_job(&handle.namespace, &handle.name).await? else {
            return Ok(UnitState::Failed(format!(
                "execution job {} no longer exists",
                handle.name
            )));
        };

        match job_outcome(&job) {
            JobOutcome::Running => Ok(UnitState::Running),
            JobOutcome::Failed(reason) => {
                let detail = self
                    .jobs
                    .termination_message(&handle.namespace, &handle.name)
                    .await
                    .ok()
                    .flatten();
                Ok(UnitState::Failed(match detail {
                    Some(detail) => format!("{}: {}", reason, detail),
                    None => reason,
                }))
            }
            JobOutcome::Succeeded => {
                let message = self
                    .jobs
                    .termination_message(&handle.namespace, &handle.name)
                    .await?;
                let mut result = message
                    .as_deref()
                    .map(parse_report)
                    .unwrap_or_default();
                result.duration = job_duration(&job);
                Ok(UnitState::Succeeded(result))
            }
        }
    }

    /// Best-effort deletion of an owner's Jobs.
    ///
    /// Deletes `job_name` when known, otherwise every Job labelled with the
    /// owner. Failures are logged; `ttlSecondsAfterFinished` is the backstop.
    pub async fn cancel(
        &self,
        namespace: &str,
        job_name: Option<&str>,
        owner_kind: &str,
        owner_name: &str,
    ) {
        let names = match job_name {
            Some(name) => vec![name.to_string()],
            None => match self
                .jobs
                .list_jobs(namespace, &owner_selector(owner_kind, owner_name))
                .await
            {
                Ok(jobs) => jobs.into_iter().filter_map(|j| j.metadata.name).collect(),
                Err(e) => {
                    warn!(owner = %owner_name, error = %e, "failed to list jobs for cancellation");
                    return;
                }
            },
        };

        for name in names {
            match self.jobs.delete_job(namespace, &name).await {
                Ok(()) => info!(job = %name, owner = %owner_name, "cancelled execution job"),
                Err(e) => warn!(job = %name, error = %e, "failed to cancel execution job"),
            }
        }
    }

    /// Build the Job for `spec`
    pub fn build_job(&self, spec: &ExecutionSpec) -> Job {
        let name = job_name(&spec.owner_name, &spec.run_id);

        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
        labels.insert(OWNER_KIND_LABEL.to_string(), spec.owner_kind.to_lowercase());
        labels.insert(OWNER_NAME_LABEL.to_string(), label_value(&spec.owner_name));
        labels.insert(RUN_ID_LABEL.to_string(), spec.run_id.clone());

        let (volumes, mounts) = local_store_volume(&spec.store);

        Job {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(spec.namespace.clone()),
                labels: Some(labels.clone()),
                owner_references: spec.owner_ref.clone().map(|r| vec![r]),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(self.backoff_limit),
                ttl_seconds_after_finished: Some(self.ttl_after_finished),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        service_account_name: self.service_account.clone(),
                        containers: vec![Container {
                            name: RUNNER_CONTAINER.to_string(),
                            image: Some(self.image.clone()),
                            env: Some(build_env(spec)),
                            volume_mounts: mounts,
                            termination_message_policy: Some("FallbackToLogsOnError".to_string()),
                            ..Default::default()
                        }],
                        volumes,
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }
}

fn parse_report(message: &str) -> ResultMetadata {
    match serde_json::from_str::<TerminationReport>(message) {
        Ok(report) => ResultMetadata {
            path: report.path.filter(|p| !p.is_empty()),
            size_bytes: report.size_bytes,
            duration: None,
        },
        Err(e) => {
            warn!(error = %e, "runner termination message is not a result report");
            ResultMetadata::default()
        }
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
    }
}

fn build_env(spec: &ExecutionSpec) -> Vec<EnvVar> {
    let db = &spec.database;
    let mut vars = vec![
        env("STRONGBOX_MODE", spec.mode.to_string()),
        env("STRONGBOX_RUN_ID", spec.run_id.clone()),
        env("STRONGBOX_ENGINE", db.engine.to_string()),
        env("STRONGBOX_DB_HOST", db.host.clone()),
        env("STRONGBOX_DB_PORT", db.port.to_string()),
        env("STRONGBOX_DB_NAME", db.database_name.clone()),
        secret_env("STRONGBOX_DB_USER", &db.credentials_secret, "username"),
        secret_env("STRONGBOX_DB_PASSWORD", &db.credentials_secret, "password"),
    ];

    match spec.mode {
        OperationMode::Backup => vars.push(env("STRONGBOX_OUTPUT_PATH", spec.object_path.clone())),
        OperationMode::Restore => {
            vars.push(env("STRONGBOX_SOURCE_PATH", spec.object_path.clone()));
            vars.push(env(
                "STRONGBOX_CONFLICT_POLICY",
                spec.conflict_policy.unwrap_or_default().to_string(),
            ));
        }
    }

    vars.extend(store_env(&spec.store));
    vars
}

fn store_env(store: &BackupStore) -> Vec<EnvVar> {
    let storage = &store.spec.storage;
    let mut vars = vec![env("STRONGBOX_STORE_PROVIDER", storage.provider.to_string())];
    if let Some(bucket) = storage.bucket() {
        vars.push(env("STRONGBOX_STORE_BUCKET", bucket));
    }

    let creds = storage.credentials_secret_ref.as_deref();
    match storage.provider {
        BackupStorageProvider::S3 | BackupStorageProvider::S3Compatible => {
            if let Some(s3) = &storage.s3 {
                if let Some(region) = &s3.region {
                    vars.push(env("STRONGBOX_STORE_REGION", region.clone()));
                }
                if let Some(endpoint) = &s3.endpoint {
                    vars.push(env("STRONGBOX_STORE_ENDPOINT", endpoint.clone()));
                }
                if s3.force_path_style.unwrap_or(false) {
                    vars.push(env("STRONGBOX_STORE_PATH_STYLE", "true"));
                }
            }
            if let Some(secret) = creds {
                vars.push(secret_env("AWS_ACCESS_KEY_ID", secret, "accessKeyId"));
                vars.push(secret_env("AWS_SECRET_ACCESS_KEY", secret, "secretAccessKey"));
            }
        }
        BackupStorageProvider::Gcs => {
            if let Some(secret) = creds {
                vars.push(secret_env("STRONGBOX_STORE_GCS_KEY", secret, "serviceAccountKey"));
            }
        }
        BackupStorageProvider::Azure => {
            if let Some(azure) = &storage.azure {
                vars.push(env("AZURE_STORAGE_ACCOUNT", azure.storage_account.clone()));
            }
            if let Some(secret) = creds {
                vars.push(secret_env("AZURE_STORAGE_KEY", secret, "accountKey"));
            }
        }
        BackupStorageProvider::Local => {}
    }
    vars
}

fn local_store_volume(store: &BackupStore) -> (Option<Vec<Volume>>, Option<Vec<VolumeMount>>) {
    let path = match (&store.spec.storage.provider, &store.spec.storage.local) {
        (BackupStorageProvider::Local, Some(local)) => local.path.clone(),
        _ => return (None, None),
    };
    (
        Some(vec![Volume {
            name: LOCAL_STORE_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: path.clone(),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            ..Default::default()
        }]),
        Some(vec![VolumeMount {
            name: LOCAL_STORE_VOLUME.to_string(),
            mount_path: path,
            ..Default::default()
        }]),
    )
}
