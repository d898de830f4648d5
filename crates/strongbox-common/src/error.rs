//! Error types for the strongbox operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each error variant carries the resource it concerns where one is known,
//! so the message can be surfaced verbatim into a record's status.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for strongbox operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid user input on a record spec
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the record with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.schedule")
        field: Option<String>,
    },


    /// Output name template failed to render
    #[error("template error in '{template}': {message}")]
    Template {
        /// The template source
        template: String,
        /// Description of what failed
        message: String,
    },

    /// Object storage error
    #[error("storage error [{store}]: {message}")]
    Storage {
        /// Name of the BackupStore
        store: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Optimistic-concurrency conflict on a write
    #[error("conflicting write to {resource}")]
    Conflict {
        /// Resource whose resourceVersion was stale
        resource: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "dispatcher", "retention")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a template error
    pub fn template(template: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable storage error (connectivity, throttling)
    pub fn storage(store: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Storage {
            store: store.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable storage error (e.g., missing bucket configuration)
    pub fn storage_permanent(store: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Storage {
            store: store.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a conflict error for a stale write
    pub fn conflict(resource: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation and template errors are not retryable (the
    /// record must be edited). Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 409 is a stale write or a create race, both resolve on retry
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Validation { .. } => false,
            Error::Template { .. } => false,
            Error::Storage { retryable, .. } => *retryable,
            Error::Conflict { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409 && ae.reason == "Conflict",
            _ => false,
        }
    }

    /// Get the resource name if this error concerns a specific record
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            Error::Conflict { resource } => Some(resource),
            Error::Storage { store, .. } => Some(store),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} error", reason),
            reason: reason.to_string(),
            code,
        })
    }

    /// Story: malformed records fail fast with a message the owner can act on
    #[test]
    fn story_validation_errors_are_terminal() {
        let err = Error::validation_for_field("nightly", "spec.schedule", "expected 5 fields");
        assert!(err.to_string().contains("nightly"));
        assert!(err.to_string().contains("expected 5 fields"));
        assert_eq!(err.resource(), Some("nightly"));
        assert!(!err.is_retryable());

        match &err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("spec.schedule")),
            _ => panic!("Expected Validation variant"),
        }

        let err = Error::template("{{ nope", "unexpected end of input");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("{{ nope"));
    }

    /// Story: storage hiccups are retried, misconfiguration is not
    #[test]
    fn story_storage_errors_carry_retryability() {
        let err = Error::storage("s3-prod", "connection reset");
        assert!(err.is_retryable());
        assert_eq!(err.resource(), Some("s3-prod"));

        let err = Error::storage_permanent("s3-prod", "bucket not configured");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("storage error [s3-prod]"));
    }

    #[test]
    fn kube_client_errors_are_not_retryable_except_conflicts() {
        let not_found: Error = api_error(404, "NotFound").into();
        assert!(!not_found.is_retryable());

        let conflict: Error = api_error(409, "Conflict").into();
        assert!(conflict.is_retryable());
        assert!(conflict.is_conflict());

        let exists: Error = api_error(409, "AlreadyExists").into();
        assert!(!exists.is_conflict());

        let unavailable: Error = api_error(503, "ServiceUnavailable").into();
        assert!(unavailable.is_retryable());
    }

    #[test]
    fn conflict_and_internal_errors_are_retryable() {
        assert!(Error::conflict("nightly").is_retryable());
        assert!(Error::conflict("nightly").is_conflict());
        assert!(Error::internal("boom").is_retryable());

        let err = Error::internal_with_context("dispatcher", "job vanished");
        assert!(err.to_string().contains("dispatcher"));
    }
}
