//! Operator configuration
//!
//! Every flag has a `STRONGBOX_*` environment fallback so the Deployment can
//! configure the operator without arguments. Durations use humantime syntax
//! (`30s`, `10m`, `1h`).

use std::time::Duration;

use clap::{Args, Parser};

use strongbox_backup::context::DEFAULT_JOB_IMAGE;
use strongbox_backup::OperatorConfig;

/// strongbox - declarative database backups, restores and retention
#[derive(Parser, Debug)]
#[command(name = "strongbox", version, about, long_about = None)]
pub struct Cli {
    /// Print every CRD as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Do not install or update CRDs on startup
    #[arg(long, env = "STRONGBOX_SKIP_CRD_INSTALL")]
    pub skip_crd_install: bool,

    /// Plain text logs instead of JSON
    #[arg(long, env = "STRONGBOX_LOG_TEXT")]
    pub log_text: bool,

    /// Controller tunables
    #[command(flatten)]
    pub operator: OperatorArgs,
}

/// Controller tunables
#[derive(Args, Debug, Clone)]
pub struct OperatorArgs {
    /// Image run by execution Jobs
    #[arg(long, env = "STRONGBOX_JOB_IMAGE", default_value = DEFAULT_JOB_IMAGE)]
    pub job_image: String,

    /// Service account for execution Jobs
    #[arg(long, env = "STRONGBOX_JOB_SERVICE_ACCOUNT")]
    pub job_service_account: Option<String>,

    /// Pod retries per execution Job
    #[arg(long, env = "STRONGBOX_JOB_BACKOFF_LIMIT", default_value_t = 3)]
    pub job_backoff_limit: i32,

    /// How long finished Jobs are kept
    #[arg(long, env = "STRONGBOX_JOB_TTL", default_value = "1h", value_parser = humantime::parse_duration)]
    pub job_ttl: Duration,

    /// Maximum running backups and restores per DatabaseCluster (0 = unlimited)
    #[arg(long, env = "STRONGBOX_MAX_CONCURRENT", default_value_t = 3)]
    pub max_concurrent: usize,

    /// Requeue delay for throttled requests
    #[arg(long, env = "STRONGBOX_THROTTLE_BACKOFF", default_value = "30s", value_parser = humantime::parse_duration)]
    pub throttle_backoff: Duration,

    /// How long a request may wait for its Database or BackupStore
    #[arg(long, env = "STRONGBOX_PENDING_TIMEOUT", default_value = "10m", value_parser = humantime::parse_duration)]
    pub pending_timeout: Duration,

    /// Minimum interval between retention runs of one schedule
    #[arg(long, env = "STRONGBOX_RETENTION_INTERVAL", default_value = "1m", value_parser = humantime::parse_duration)]
    pub retention_interval: Duration,
}

impl From<OperatorArgs> for OperatorConfig {
    fn from(args: OperatorArgs) -> Self {
        Self {
            job_image: args.job_image,
            job_service_account: args.job_service_account.filter(|s| !s.is_empty()),
            job_backoff_limit: args.job_backoff_limit,
            job_ttl_after_finished: i32::try_from(args.job_ttl.as_secs()).unwrap_or(i32::MAX),
            max_concurrent_per_cluster: args.max_concurrent,
            throttle_backoff: args.throttle_backoff,
            pending_timeout: args.pending_timeout,
            retention_interval: args.retention_interval,
        }
    }
}
