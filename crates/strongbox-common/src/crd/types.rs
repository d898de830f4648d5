//! Shared types used across strongbox CRDs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a backup or restore operation
///
/// `Pending → Running → {Completed, Failed}`. `Pending` may be re-entered
/// only while throttled or waiting on dependencies, before dispatch.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum OperationPhase {
    /// Waiting for dependencies or a concurrency slot
    #[default]
    Pending,
    /// An execution Job has been dispatched
    Running,
    /// The execution Job succeeded
    Completed,
    /// The operation failed permanently
    Failed,
}

impl OperationPhase {
    /// Whether the phase is a terminal outcome
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Readiness of an externally managed resource (database, cluster, store)
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ReadinessPhase {
    /// Not yet ready
    #[default]
    Pending,
    /// Ready for use
    Ready,
    /// Permanently broken
    Failed,
}

impl std::fmt::Display for ReadinessPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}
