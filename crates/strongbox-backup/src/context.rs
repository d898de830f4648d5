//! Shared controller context

use std::sync::Arc;
use std::time::Duration;

use kube::Client;

use strongbox_common::events::{EventPublisher, KubeEventPublisher};
use strongbox_common::template::FilenameRenderer;

use crate::client::{KubeClient, KubeClientImpl};
use crate::dispatcher::Dispatcher;
use crate::jobs::{JobClient, KubeJobClient};
use crate::storage::{ObjectStoreConnector, StorageConnector};

/// Default execution image
pub const DEFAULT_JOB_IMAGE: &str = "ghcr.io/strongbox-dev/strongbox-runner:latest";

/// Operator tunables, filled from the command line
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Image run by execution Jobs
    pub job_image: String,
    /// Service account for execution Jobs
    pub job_service_account: Option<String>,
    /// Retries per execution Job (`backoffLimit`)
    pub job_backoff_limit: i32,
    /// Seconds a finished Job is kept (`ttlSecondsAfterFinished`)
    pub job_ttl_after_finished: i32,
    /// Maximum running operations per DatabaseCluster
    pub max_concurrent_per_cluster: usize,
    /// Requeue delay when throttled
    pub throttle_backoff: Duration,
    /// How long a dependency may stay unready before the request fails
    pub pending_timeout: Duration,
    /// Minimum interval between retention runs of one schedule
    pub retention_interval: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            job_image: DEFAULT_JOB_IMAGE.to_string(),
            job_service_account: None,
            job_backoff_limit: 3,
            job_ttl_after_finished: 3600,
            max_concurrent_per_cluster: 3,
            throttle_backoff: Duration::from_secs(30),
            pending_timeout: Duration::from_secs(600),
            retention_interval: Duration::from_secs(60),
        }
    }
}

/// Controller context shared by every strongbox reconciler
pub struct Context {
    /// Record store access (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Execution Job dispatcher
    pub dispatcher: Dispatcher,
    /// Object storage connector used by retention
    pub storage: Arc<dyn StorageConnector>,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Output file name renderer
    pub renderer: FilenameRenderer,
    /// Operator tunables
    pub config: OperatorConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        jobs: Arc<dyn JobClient>,
        storage: Arc<dyn StorageConnector>,
    ) -> Self {
        let config = OperatorConfig::default();
        Self {
            kube,
            dispatcher: Dispatcher::new(jobs, &config),
            storage,
            events: Arc::new(strongbox_common::events::NoopEventPublisher),
            renderer: FilenameRenderer::new(),
            config,
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(config)
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    jobs: Option<Arc<dyn JobClient>>,
    storage: Option<Arc<dyn StorageConnector>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: OperatorConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            jobs: None,
            storage: None,
            events: None,
            config: OperatorConfig::default(),
        }
    }

    /// Override the record store client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the Job client
    pub fn job_client(mut self, jobs: Arc<dyn JobClient>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Override the storage connector
    pub fn storage_connector(mut self, storage: Arc<dyn StorageConnector>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set operator tunables
    pub fn config(mut self, config: OperatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone())));
        let jobs = self
            .jobs
            .unwrap_or_else(|| Arc::new(KubeJobClient::new(self.client.clone())));
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(ObjectStoreConnector::new(kube.clone())));
        let events = self.events.unwrap_or_else(|| {
            Arc::new(KubeEventPublisher::new(
                self.client.clone(),
                "strongbox-controller",
            ))
        });

        Context {
            kube,
            dispatcher: Dispatcher::new(jobs, &self.config),
            storage,
            events,
            renderer: FilenameRenderer::new(),
            config: self.config,
        }
    }
}
