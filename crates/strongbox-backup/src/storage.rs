//! Object storage access for retention
//!
//! The operator never reads or writes backup payloads; it only lists and
//! deletes output objects. [`ObjectStorage`] is that narrow surface, and
//! [`StorageConnector`] builds one from a BackupStore and its credentials.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use strongbox_common::crd::{
    BackupStorageProvider, BackupStore, AZURE_ACCOUNT_KEY_KEY, GCS_SERVICE_ACCOUNT_KEY,
    S3_ACCESS_KEY_ID_KEY, S3_SECRET_ACCESS_KEY_KEY,
};
use strongbox_common::kube_utils::secret_value;
use strongbox_common::Error;

use crate::client::KubeClient;

/// One listed output object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    /// Full object key
    pub key: String,
    /// Size in bytes
    pub size: u64,
    /// Creation (last modified) time
    pub created_at: DateTime<Utc>,
}

/// Outcome of deleting one key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteResult {
    /// Object key
    pub key: String,
    /// Error message when the delete failed
    pub error: Option<String>,
}

/// List and delete access to one bucket
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// List every object under `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, Error>;

    /// Delete `keys`, reporting each key's outcome independently
    async fn delete(&self, keys: &[String]) -> Vec<DeleteResult>;
}

/// Builds [`ObjectStorage`] handles for BackupStores
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StorageConnector: Send + Sync {
    /// Connect to the bucket a BackupStore points at
    async fn connect(&self, store: &BackupStore) -> Result<Arc<dyn ObjectStorage>, Error>;
}

/// [`ObjectStorage`] over any `object_store` backend
pub struct ObjectStoreStorage {
    store_name: String,
    inner: Arc<dyn ObjectStore>,
}

impl ObjectStoreStorage {
    /// Wrap an `object_store` backend
    pub fn new(store_name: impl Into<String>, inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            store_name: store_name.into(),
            inner,
        }
    }
}

#[async_trait]
impl ObjectStorage for ObjectStoreStorage {
    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, Error> {
        let prefix = ObjectPath::parse(prefix.trim_matches('/'))
            .map_err(|e| Error::storage_permanent(&self.store_name, e.to_string()))?;

        let mut objects = Vec::new();
        let mut stream = self.inner.list(Some(&prefix));
        while let Some(result) = stream.next().await {
            let meta = result.map_err(|e| Error::storage(&self.store_name, e.to_string()))?;
            objects.push(StoredObject {
                key: meta.location.to_string(),
                size: meta.size as u64,
                created_at: meta.last_modified,
            });
        }

        debug!(store = %self.store_name, prefix = %prefix, count = objects.len(), "listed objects");
        Ok(objects)
    }

    async fn delete(&self, keys: &[String]) -> Vec<DeleteResult> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let error = match ObjectPath::parse(key) {
                Ok(path) => match self.inner.delete(&path).await {
                    Ok(()) | Err(object_store::Error::NotFound { .. }) => None,
                    Err(e) => Some(e.to_string()),
                },
                Err(e) => Some(e.to_string()),
            };
            results.push(DeleteResult {
                key: key.clone(),
                error,
            });
        }
        results
    }
}

/// Production connector reading credentials from the store's Secret
pub struct ObjectStoreConnector {
    kube: Arc<dyn KubeClient>,
}

impl ObjectStoreConnector {
    /// Create a connector that reads credentials through `kube`
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }

    async fn credential(
        &self,
        namespace: &str,
        store: &BackupStore,
        key: &str,
    ) -> Result<Option<String>, Error> {
        let Some(secret_name) = store.spec.storage.credentials_secret_ref.as_deref() else {
            return Ok(None);
        };
        let secret = self
            .kube
            .get_secret(namespace, secret_name)
            .await?
            .ok_or_else(|| {
                Error::storage(
                    store_name(store),
                    format!("credentials secret '{}' not found", secret_name),
                )
            })?;
        secret_value(&secret, key)
            .map(|v| {
                String::from_utf8(v).map_err(|_| {
                    Error::storage_permanent(
                        store_name(store),
                        format!("secret '{}' key '{}' is not UTF-8", secret_name, key),
                    )
                })
            })
            .transpose()
    }
}

fn store_name(store: &BackupStore) -> String {
    store.metadata.name.clone().unwrap_or_default()
}

fn storage_err(store: &BackupStore) -> impl Fn(object_store::Error) -> Error + '_ {
    move |e| Error::storage_permanent(store_name(store), e.to_string())
}

#[async_trait]
impl StorageConnector for ObjectStoreConnector {
    async fn connect(&self, store: &BackupStore) -> Result<Arc<dyn ObjectStorage>, Error> {
        let name = store_name(store);
        let namespace = store.metadata.namespace.clone().unwrap_or_default();
        let storage = &store.spec.storage;
        let bucket = storage.bucket().ok_or_else(|| {
            Error::storage_permanent(&name, format!("no {} bucket configured", storage.provider))
        })?;

        let inner: Arc<dyn ObjectStore> = match storage.provider {
            BackupStorageProvider::S3 | BackupStorageProvider::S3Compatible => {
                let mut builder = AmazonS3Builder::new().with_bucket_name(bucket);
                if let Some(s3) = &storage.s3 {
                    if let Some(region) = &s3.region {
                        builder = builder.with_region(region);
                    }
                    if let Some(endpoint) = &s3.endpoint {
                        builder = builder
                            .with_endpoint(endpoint)
                            .with_allow_http(endpoint.starts_with("http://"));
                    }
                    if s3.force_path_style.unwrap_or(false) {
                        builder = builder.with_virtual_hosted_style_request(false);
                    }
                }
                if let Some(key_id) = self
                    .credential(&namespace, store, S3_ACCESS_KEY_ID_KEY)
                    .await?
                {
                    builder = builder.with_access_key_id(key_id);
                }
                if let Some(secret) = self
                    .credential(&namespace, store, S3_SECRET_ACCESS_KEY_KEY)
                    .await?
                {
                    builder = builder.with_secret_access_key(secret);
                }
                Arc::new(builder.build().map_err(storage_err(store))?)
            }
            BackupStorageProvider::Gcs => {
                let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(bucket);
                if let Some(key) = self
                    .credential(&namespace, store, GCS_SERVICE_ACCOUNT_KEY)
                    .await?
                {
                    builder = builder.with_service_account_key(key);
                }
                Arc::new(builder.build().map_err(storage_err(store))?)
            }
            BackupStorageProvider::Azure => {
                let mut builder = MicrosoftAzureBuilder::new().with_container_name(bucket);
                if let Some(azure) = &storage.azure {
                    builder = builder.with_account(&azure.storage_account);
                }
                if let Some(key) = self
                    .credential(&namespace, store, AZURE_ACCOUNT_KEY_KEY)
                    .await?
                {
                    builder = builder.with_access_key(key);
                }
                Arc::new(builder.build().map_err(storage_err(store))?)
            }
            BackupStorageProvider::Local => {
                tokio::fs::create_dir_all(bucket)
                    .await
                    .map_err(|e| Error::storage(&name, e.to_string()))?;
                Arc::new(LocalFileSystem::new_with_prefix(bucket).map_err(storage_err(store))?)
            }
        };

        Ok(Arc::new(ObjectStoreStorage::new(name, inner)))
    }
}
