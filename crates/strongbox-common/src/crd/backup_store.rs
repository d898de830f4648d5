//! BackupStore Custom Resource Definition
//!
//! The BackupStore CRD defines where backup output objects are written
//! (S3/GCS/Azure or a local path for development). Storage concerns are fully
//! separated from scheduling and retention.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ReadinessPhase;
use crate::Error;

/// Secret key holding an S3 access key id
pub const S3_ACCESS_KEY_ID_KEY: &str = "accessKeyId";
/// Secret key holding an S3 secret access key
pub const S3_SECRET_ACCESS_KEY_KEY: &str = "secretAccessKey";
/// Secret key holding a GCS service account JSON document
pub const GCS_SERVICE_ACCOUNT_KEY: &str = "serviceAccountKey";
/// Secret key holding an Azure storage account key
pub const AZURE_ACCOUNT_KEY_KEY: &str = "accountKey";

/// Storage provider type for backup destinations
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BackupStorageProvider {
    /// Amazon S3
    #[default]
    S3,
    /// Google Cloud Storage
    Gcs,
    /// Azure Blob Storage
    Azure,
    /// S3-compatible storage (e.g., MinIO)
    S3Compatible,
    /// Local filesystem path (development and tests)
    Local,
}

impl std::fmt::Display for BackupStorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::S3 => write!(f, "s3"),
            Self::Gcs => write!(f, "gcs"),
            Self::Azure => write!(f, "azure"),
            Self::S3Compatible => write!(f, "s3Compatible"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// S3 storage configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3StorageConfig {
    /// S3 bucket name
    pub bucket: String,

    /// AWS region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible storage (e.g., MinIO)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Use path-style addressing (required for MinIO)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_path_style: Option<bool>,
}

/// GCS storage configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcsStorageConfig {
    /// GCS bucket name
    pub bucket: String,
}

/// Azure storage configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureStorageConfig {
    /// Azure Blob Storage container name
    pub container: String,

    /// Azure storage account name
    pub storage_account: String,
}

/// Local filesystem configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalStorageConfig {
    /// Absolute directory path, mounted into execution Jobs at the same path
    pub path: String,
}

/// Backup storage configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageSpec {
    /// Storage provider type
    #[serde(default)]
    pub provider: BackupStorageProvider,

    /// S3 configuration (when provider is s3 or s3Compatible)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3StorageConfig>,

    /// GCS configuration (when provider is gcs)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsStorageConfig>,

    /// Azure configuration (when provider is azure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureStorageConfig>,

    /// Local configuration (when provider is local)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalStorageConfig>,

    /// Kubernetes Secret (same namespace) with provider credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret_ref: Option<String>,
}

impl BackupStorageSpec {
    /// Bucket, container or directory name for the configured provider
    pub fn bucket(&self) -> Option<&str> {
        match self.provider {
            BackupStorageProvider::S3 | BackupStorageProvider::S3Compatible => {
                self.s3.as_ref().map(|s| s.bucket.as_str())
            }
            BackupStorageProvider::Gcs => self.gcs.as_ref().map(|g| g.bucket.as_str()),
            BackupStorageProvider::Azure => self.azure.as_ref().map(|a| a.container.as_str()),
            BackupStorageProvider::Local => self.local.as_ref().map(|l| l.path.as_str()),
        }
        .filter(|b| !b.is_empty())
    }

    /// Check that the provider block matching `provider` is present
    pub fn validate(&self, store: &str) -> Result<(), Error> {
        if self.bucket().is_none() {
            return Err(Error::validation_for_field(
                store,
                "spec.storage",
                format!("provider '{}' requires its configuration block", self.provider),
            ));
        }
        if self.provider == BackupStorageProvider::S3Compatible
            && self
                .s3
                .as_ref()
                .and_then(|s| s.endpoint.as_deref())
                .map_or(true, str::is_empty)
        {
            return Err(Error::validation_for_field(
                store,
                "spec.storage.s3.endpoint",
                "s3Compatible storage requires an endpoint",
            ));
        }
        if self.provider != BackupStorageProvider::Local && self.credentials_secret_ref.is_none()
        {
            return Err(Error::validation_for_field(
                store,
                "spec.storage.credentialsSecretRef",
                "cloud storage requires a credentials secret",
            ));
        }
        Ok(())
    }
}

/// Status of a BackupStore
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStoreStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ReadinessPhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Specification for a BackupStore
///
/// Defines a storage destination for backup output objects. One store per
/// namespace may be marked `default` and is used when a backup or schedule
/// omits `storeRef`.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "strongbox.dev",
    version = "v1alpha1",
    kind = "BackupStore",
    plural = "backupstores",
    shortname = "bst",
    namespaced,
    status = "BackupStoreStatus",
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.storage.provider"}"#,
    printcolumn = r#"{"name":"Default","type":"boolean","jsonPath":".spec.default"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupStoreSpec {
    /// Whether this is the namespace's default store
    #[serde(default)]
    pub default: bool,

    /// Storage configuration
    pub storage: BackupStorageSpec,

    /// Key prefix applied to every object written through this store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl BackupStore {
    /// Whether this store reports `Ready`
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.phase == ReadinessPhase::Ready)
    }

    /// Join `key` under the store prefix, without leading or doubled slashes
    pub fn object_key(&self, key: &str) -> String {
        let key = key.trim_matches('/');
        match self.spec.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, key),
            _ => key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_spec(yaml: &str) -> BackupStoreSpec {
        serde_yaml::from_str(yaml).expect("parse spec")
    }

    #[test]
    fn test_backup_store_roundtrip() {
        let spec = parse_spec(
            r#"
default: true
prefix: prod
storage:
  provider: s3
  s3:
    bucket: db-backups
    region: us-east-1
  credentialsSecretRef: s3-creds
"#,
        );

        assert!(spec.default);
        assert_eq!(spec.storage.provider, BackupStorageProvider::S3);
        assert_eq!(spec.storage.bucket(), Some("db-backups"));
        assert!(spec.storage.validate("prod-s3").is_ok());
    }

    #[test]
    fn test_missing_provider_block_is_rejected() {
        let spec = parse_spec(
            r#"
storage:
  provider: gcs
  credentialsSecretRef: gcs-creds
"#,
        );

        let err = spec.storage.validate("gcs-store").unwrap_err();
        assert!(err.to_string().contains("gcs"));
    }

    #[test]
    fn test_s3_compatible_requires_endpoint() {
        let spec = parse_spec(
            r#"
storage:
  provider: s3Compatible
  s3:
    bucket: backups
  credentialsSecretRef: minio-creds
"#,
        );

        let err = spec.storage.validate("minio").unwrap_err();
        assert!(err.to_string().contains("endpoint"));
    }

    #[test]
    fn test_local_store_needs_no_credentials() {
        let spec = parse_spec(
            r#"
storage:
  provider: local
  local:
    path: /var/backups
"#,
        );

        assert!(spec.storage.validate("local").is_ok());
    }

    #[test]
    fn test_object_key_joins_prefix() {
        let mut store = BackupStore::new(
            "s3",
            parse_spec(
                r#"
prefix: /prod/
storage:
  provider: local
  local:
    path: /tmp
"#,
            ),
        );
        assert_eq!(store.object_key("/schedules/a.dump"), "prod/schedules/a.dump");

        store.spec.prefix = None;
        assert_eq!(store.object_key("schedules/a.dump"), "schedules/a.dump");
    }
}
