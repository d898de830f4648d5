//! Controller plumbing errors
//!
//! Everything a user can fix is written into the record's status instead.
//! These errors are the ones that cannot be surfaced that way (a failed status
//! write, an unreachable API server) and cause an immediate requeue.

use thiserror::Error;

/// Error returned from a reconcile function
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Kubernetes API error with the operation that failed
    #[error("{context}: {source}")]
    Kube {
        /// What the controller was doing
        context: String,
        /// The underlying kube-rs error
        #[source]
        source: kube::Error,
    },

    /// Error from shared strongbox code
    #[error(transparent)]
    Common(#[from] strongbox_common::Error),

    /// Object without a namespace reached a namespaced controller
    #[error("missing namespace on {0}")]
    MissingNamespace(String),
}

impl ReconcileError {
    /// Wrap a kube error with context
    pub fn kube(context: impl Into<String>, source: kube::Error) -> Self {
        Self::Kube {
            context: context.into(),
            source,
        }
    }
}
