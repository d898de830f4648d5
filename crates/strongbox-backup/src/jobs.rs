//! Execution substrate: `batch/v1` Jobs
//!
//! [`JobClient`] is the narrow create/get/list/delete surface the dispatcher
//! needs. The pure helpers below read a Job's outcome from its conditions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use strongbox_common::kube_utils::{is_already_exists, is_not_found};
use strongbox_common::Error;

use crate::client::CreateOutcome;

/// Label the Job controller puts on every pod it creates
const JOB_NAME_LABEL: &str = "batch.kubernetes.io/job-name";

/// Trait abstracting Job operations for testability
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Create a Job, tolerating a name that already exists
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<CreateOutcome, Error>;

    /// Get a Job
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error>;

    /// List Jobs matching a label selector
    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>, Error>;

    /// Delete a Job and its pods (missing is not an error)
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Termination message of the Job's most recent finished container
    async fn termination_message(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> Result<Option<String>, Error>;
}

/// Real Job client
pub struct KubeJobClient {
    client: Client,
}

impl KubeJobClient {
    /// Create a new job client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobClient for KubeJobClient {
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<CreateOutcome, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), job).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e) if is_already_exists(&e) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<Job>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(job = %name, "job already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn termination_message(
        &self,
        namespace: &str,
        job_name: &str,
    ) -> Result<Option<String>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(&format!("{}={}", JOB_NAME_LABEL, job_name)))
            .await?
            .items;
        Ok(latest_termination_message(&pods))
    }
}

/// Outcome of a Job as read from its status
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Still running or retrying
    Running,
    /// Finished successfully
    Succeeded,
    /// Exhausted its retries; carries the condition message
    Failed(String),
}

/// Read a Job's outcome from its `Complete` / `Failed` conditions
pub fn job_outcome(job: &Job) -> JobOutcome {
    let status = match &job.status {
        Some(s) => s,
        None => return JobOutcome::Running,
    };

    for condition in status.conditions.iter().flatten() {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" | "SuccessCriteriaMet" => return JobOutcome::Succeeded,
            "Failed" => {
                let reason = condition
                    .message
                    .clone()
                    .or_else(|| condition.reason.clone())
                    .unwrap_or_else(|| "job failed".to_string());
                return JobOutcome::Failed(reason);
            }
            _ => {}
        }
    }

    JobOutcome::Running
}

/// Wall-clock time between Job start and completion, when both are known
pub fn job_duration(job: &Job) -> Option<std::time::Duration> {
    let status = job.status.as_ref()?;
    let start: DateTime<Utc> = status.start_time.as_ref()?.0;
    let end: DateTime<Utc> = status.completion_time.as_ref()?.0;
    (end - start).to_std().ok()
}

/// Termination message of the most recently finished container across pods
fn latest_termination_message(pods: &[Pod]) -> Option<String> {
    pods.iter()
        .flat_map(|p| {
            p.status
                .iter()
                .flat_map(|s| s.container_statuses.iter().flatten())
        })
        .filter_map(|cs| cs.state.as_ref()?.terminated.as_ref())
        .filter_map(|t| {
            let message = t.message.as_deref()?.trim();
            (!message.is_empty()).then(|| (t.finished_at.as_ref().map(|f| f.0), message))
        })
        .max_by_key(|(finished, _)| *finished)
        .map(|(_, message)| message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn job_with(conditions: Vec<(&str, &str, Option<&str>)>) -> Job {
        Job {
            status: Some(JobStatus {
                conditions: Some(
                    conditions
                        .into_iter()
                        .map(|(type_, status, message)| JobCondition {
                            type_: type_.to_string(),
                            status: status.to_string(),
                            message: message.map(String::from),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn terminated_pod(message: &str, finished_min: u32) -> Pod {
        Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "strongbox".to_string(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            message: Some(message.to_string()),
                            finished_at: Some(Time(
                                Utc.with_ymd_and_hms(2026, 1, 20, 2, finished_min, 0).unwrap(),
                            )),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_job_without_status_is_running() {
        assert_eq!(job_outcome(&Job::default()), JobOutcome::Running);
    }

    #[test]
    fn test_complete_condition_succeeds() {
        let job = job_with(vec![("Complete", "True", None)]);
        assert_eq!(job_outcome(&job), JobOutcome::Succeeded);
    }

    #[test]
    fn test_failed_condition_carries_message() {
        let job = job_with(vec![
            ("Complete", "False", None),
            ("Failed", "True", Some("Job has reached the specified backoff limit")),
        ]);
        assert_eq!(
            job_outcome(&job),
            JobOutcome::Failed("Job has reached the specified backoff limit".to_string())
        );
    }

    #[test]
    fn test_false_conditions_are_ignored() {
        let job = job_with(vec![("Failed", "False", Some("not yet"))]);
        assert_eq!(job_outcome(&job), JobOutcome::Running);
    }

    #[test]
    fn test_job_duration() {
        let job = Job {
            status: Some(JobStatus {
                start_time: Some(Time(Utc.with_ymd_and_hms(2026, 1, 20, 2, 0, 0).unwrap())),
                completion_time: Some(Time(Utc.with_ymd_and_hms(2026, 1, 20, 2, 3, 30).unwrap())),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(job_duration(&job), Some(std::time::Duration::from_secs(210)));
        assert_eq!(job_duration(&Job::default()), None);
    }

    #[test]
    fn test_latest_termination_message_wins() {
        let pods = vec![
            terminated_pod("pg_dump: connection refused", 1),
            terminated_pod(r#"{"path":"a.dump","sizeBytes":10}"#, 4),
        ];
        assert_eq!(
            latest_termination_message(&pods).as_deref(),
            Some(r#"{"path":"a.dump","sizeBytes":10}"#)
        );
        assert_eq!(latest_termination_message(&[]), None);
    }
}
