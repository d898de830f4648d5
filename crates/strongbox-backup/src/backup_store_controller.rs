//! BackupStore controller
//!
//! Validates the provider block and the credentials Secret, then reports the
//! store `Ready` or `Failed`. Backups and restores only dispatch against
//! `Ready` stores.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use strongbox_common::crd::{
    BackupStorageProvider, BackupStore, BackupStoreStatus, ReadinessPhase, AZURE_ACCOUNT_KEY_KEY,
    GCS_SERVICE_ACCOUNT_KEY, S3_ACCESS_KEY_ID_KEY, S3_SECRET_ACCESS_KEY_KEY,
};
use strongbox_common::kube_utils::secret_value;

use crate::client::KubeClient;
use crate::context::Context;
use crate::error::ReconcileError;
use crate::{REQUEUE_DEPENDENCY_SECS, REQUEUE_ERROR_SECS};

/// Secret keys a provider needs
pub fn required_secret_keys(provider: BackupStorageProvider) -> &'static [&'static str] {
    match provider {
        BackupStorageProvider::S3 | BackupStorageProvider::S3Compatible => {
            &[S3_ACCESS_KEY_ID_KEY, S3_SECRET_ACCESS_KEY_KEY]
        }
        BackupStorageProvider::Gcs => &[GCS_SERVICE_ACCOUNT_KEY],
        BackupStorageProvider::Azure => &[AZURE_ACCOUNT_KEY_KEY],
        BackupStorageProvider::Local => &[],
    }
}

/// Problem with the credentials Secret, if any
async fn check_credentials(
    kube: &dyn KubeClient,
    namespace: &str,
    store: &BackupStore,
) -> Result<Option<String>, ReconcileError> {
    let storage = &store.spec.storage;
    let Some(secret_name) = storage.credentials_secret_ref.as_deref() else {
        return Ok(None);
    };
    let Some(secret) = kube.get_secret(namespace, secret_name).await? else {
        return Ok(Some(format!("credentials secret '{}' not found", secret_name)));
    };

    let missing: Vec<&str> = required_secret_keys(storage.provider)
        .iter()
        .copied()
        .filter(|key| secret_value(&secret, key).is_none())
        .collect();
    if missing.is_empty() {
        Ok(None)
    } else {
        Ok(Some(format!(
            "credentials secret '{}' is missing keys: {}",
            secret_name,
            missing.join(", ")
        )))
    }
}

/// Reconcile a BackupStore
pub async fn reconcile(store: Arc<BackupStore>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let name = store.name_any();
    let namespace = store
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(name.clone()))?;

    info!(store = %name, namespace = %namespace, "reconciling BackupStore");

    if let Err(e) = store.spec.storage.validate(&name) {
        warn!(store = %name, error = %e, "invalid BackupStore");
        let next = failed(&store, e.to_string());
        update_status(&ctx, &store, &namespace, next).await?;
        return Ok(Action::await_change());
    }

    // Secrets are not watched, so a missing one is rechecked periodically
    if let Some(problem) = check_credentials(ctx.kube.as_ref(), &namespace, &store).await? {
        warn!(store = %name, %problem, "BackupStore credentials unusable");
        update_status(&ctx, &store, &namespace, failed(&store, problem)).await?;
        return Ok(Action::requeue(Duration::from_secs(REQUEUE_DEPENDENCY_SECS)));
    }

    let next = BackupStoreStatus {
        phase: ReadinessPhase::Ready,
        message: Some(format!(
            "{} storage '{}' ready",
            store.spec.storage.provider,
            store.spec.storage.bucket().unwrap_or_default()
        )),
        observed_generation: store.metadata.generation,
    };
    if update_status(&ctx, &store, &namespace, next).await? {
        info!(store = %name, "BackupStore ready");
    }
    Ok(Action::await_change())
}

fn failed(store: &BackupStore, message: String) -> BackupStoreStatus {
    BackupStoreStatus {
        phase: ReadinessPhase::Failed,
        message: Some(message),
        observed_generation: store.metadata.generation,
    }
}

async fn update_status(
    ctx: &Context,
    store: &BackupStore,
    namespace: &str,
    next: BackupStoreStatus,
) -> Result<bool, ReconcileError> {
    if store.status.as_ref() == Some(&next) {
        debug!(store = %store.name_any(), "status unchanged, skipping update");
        return Ok(false);
    }
    ctx.kube
        .patch_store_status(namespace, &store.name_any(), &next)
        .await?;
    Ok(true)
}

/// Requeue after a reconcile error
pub fn error_policy(store: Arc<BackupStore>, error: &ReconcileError, _ctx: Arc<Context>) -> Action {
    error!(?error, store = %store.name_any(), "reconciliation failed");
    Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use rstest::rstest;

    use crate::client::MockKubeClient;
    use crate::jobs::MockJobClient;
    use crate::storage::MockStorageConnector;

    fn sample_store(yaml: &str) -> BackupStore {
        BackupStore {
            metadata: ObjectMeta {
                name: Some("s3-prod".to_string()),
                namespace: Some("shop".to_string()),
                generation: Some(2),
                ..Default::default()
            },
            spec: serde_yaml::from_str(yaml).expect("parse spec"),
            status: None,
        }
    }

    fn secret(keys: &[&str]) -> Secret {
        Secret {
            data: Some(
                keys.iter()
                    .map(|k| (k.to_string(), ByteString(b"value".to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    fn context(kube: MockKubeClient) -> Arc<Context> {
        Arc::new(Context::for_testing(
            Arc::new(kube),
            Arc::new(MockJobClient::new()),
            Arc::new(MockStorageConnector::new()),
        ))
    }

    const S3_STORE: &str = r#"
default: true
storage:
  provider: s3
  s3:
    bucket: db-backups
    region: eu-west-1
  credentialsSecretRef: s3-creds
"#;

    #[rstest]
    #[case(BackupStorageProvider::S3, 2)]
    #[case(BackupStorageProvider::S3Compatible, 2)]
    #[case(BackupStorageProvider::Gcs, 1)]
    #[case(BackupStorageProvider::Azure, 1)]
    #[case(BackupStorageProvider::Local, 0)]
    fn test_required_secret_keys(#[case] provider: BackupStorageProvider, #[case] count: usize) {
        assert_eq!(required_secret_keys(provider).len(), count);
    }

    #[tokio::test]
    async fn test_valid_store_becomes_ready() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .withf(|ns, name| ns == "shop" && name == "s3-creds")
            .returning(|_, _| Ok(Some(secret(&[S3_ACCESS_KEY_ID_KEY, S3_SECRET_ACCESS_KEY_KEY]))));
        kube.expect_patch_store_status()
            .withf(|_, name, status| {
                name == "s3-prod"
                    && status.phase == ReadinessPhase::Ready
                    && status.observed_generation == Some(2)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let action = reconcile(Arc::new(sample_store(S3_STORE)), context(kube))
            .await
            .expect("reconcile");
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_missing_secret_key_fails_and_rechecks() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret()
            .returning(|_, _| Ok(Some(secret(&[S3_ACCESS_KEY_ID_KEY]))));
        kube.expect_patch_store_status()
            .withf(|_, _, status| {
                status.phase == ReadinessPhase::Failed
                    && status
                        .message
                        .as_deref()
                        .is_some_and(|m| m.contains(S3_SECRET_ACCESS_KEY_KEY))
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let action = reconcile(Arc::new(sample_store(S3_STORE)), context(kube))
            .await
            .expect("reconcile");
        assert_eq!(
            action,
            Action::requeue(Duration::from_secs(REQUEUE_DEPENDENCY_SECS))
        );
    }

    #[tokio::test]
    async fn test_missing_secret_fails() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_secret().returning(|_, _| Ok(None));
        kube.expect_patch_store_status()
            .withf(|_, _, status| {
                status.message.as_deref() == Some("credentials secret 's3-creds' not found")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        reconcile(Arc::new(sample_store(S3_STORE)), context(kube))
            .await
            .expect("reconcile");
    }

    #[tokio::test]
    async fn test_invalid_provider_block_fails_without_secret_lookup() {
        let mut kube = MockKubeClient::new();
        kube.expect_patch_store_status()
            .withf(|_, _, status| status.phase == ReadinessPhase::Failed)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let store = sample_store("storage:\n  provider: gcs\n  credentialsSecretRef: gcs-creds\n");
        let action = reconcile(Arc::new(store), context(kube))
            .await
            .expect("reconcile");
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn test_ready_store_is_not_repatched() {
        let mut store = sample_store("storage:\n  provider: local\n  local:\n    path: /var/backups\n");
        store.status = Some(BackupStoreStatus {
            phase: ReadinessPhase::Ready,
            message: Some("local storage '/var/backups' ready".to_string()),
            observed_generation: Some(2),
        });

        let action = reconcile(Arc::new(store), context(MockKubeClient::new()))
            .await
            .expect("reconcile");
        assert_eq!(action, Action::await_change());
    }
}
