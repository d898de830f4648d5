//! Dependency resolution
//!
//! Backups and restores depend on three externally managed records: the
//! Database, the DatabaseCluster it lives on, and a BackupStore. Each must
//! report `Ready` before anything is dispatched.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use strongbox_common::crd::{BackupStore, DatabaseEngine};
use strongbox_common::Error;

use crate::client::KubeClient;

/// Outcome of resolving one dependency
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution<T> {
    /// Present and ready
    Ready(T),
    /// Absent or not yet ready; carries the reason
    NotReady(String),
}

/// Connection parameters of a ready Database on a ready DatabaseCluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDatabase {
    /// Database record name
    pub name: String,
    /// Database name on the server
    pub database_name: String,
    /// Engine of the cluster
    pub engine: DatabaseEngine,
    /// Cluster host
    pub host: String,
    /// Cluster port
    pub port: u16,
    /// Secret holding `username` and `password`
    pub credentials_secret: String,
    /// DatabaseCluster name
    pub cluster: String,
    /// Concurrency key of the cluster, `{namespace}/{cluster}`
    pub cluster_key: String,
}

/// Resolve a Database and its DatabaseCluster
pub async fn resolve_database(
    kube: &dyn KubeClient,
    namespace: &str,
    name: &str,
) -> Result<Resolution<ResolvedDatabase>, Error> {
    let Some(database) = kube.get_database(namespace, name).await? else {
        return Ok(Resolution::NotReady(format!(
            "Database {}/{} not found",
            namespace, name
        )));
    };
    if !database.is_ready() {
        return Ok(Resolution::NotReady(format!(
            "Database {}/{} is not ready",
            namespace, name
        )));
    }

    let cluster_name = &database.spec.cluster_ref;
    let Some(cluster) = kube.get_database_cluster(namespace, cluster_name).await? else {
        return Ok(Resolution::NotReady(format!(
            "DatabaseCluster {}/{} not found",
            namespace, cluster_name
        )));
    };
    if !cluster.is_ready() {
        return Ok(Resolution::NotReady(format!(
            "DatabaseCluster {}/{} is not ready",
            namespace, cluster_name
        )));
    }

    let credentials_secret = database
        .spec
        .credentials_secret_ref
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| cluster.spec.credentials_secret_ref.clone());

    Ok(Resolution::Ready(ResolvedDatabase {
        name: name.to_string(),
        database_name: database.spec.database_name.clone(),
        engine: cluster.spec.engine,
        host: cluster.spec.host.clone(),
        port: cluster.spec.port,
        credentials_secret,
        cluster: cluster_name.clone(),
        cluster_key: format!("{}/{}", namespace, cluster_name),
    }))
}

/// Resolve a BackupStore: the named one, or the namespace default
pub async fn resolve_store(
    kube: &dyn KubeClient,
    namespace: &str,
    store_ref: Option<&str>,
) -> Result<Resolution<BackupStore>, Error> {
    let store = match store_ref.filter(|s| !s.is_empty()) {
        Some(name) => match kube.get_store(namespace, name).await? {
            Some(store) => store,
            None => {
                return Ok(Resolution::NotReady(format!(
                    "BackupStore {}/{} not found",
                    namespace, name
                )))
            }
        },
        None => {
            let mut defaults: Vec<BackupStore> = kube
                .list_stores(namespace)
                .await?
                .into_iter()
                .filter(|s| s.spec.default)
                .collect();
            defaults.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
            if defaults.len() > 1 {
                warn!(
                    namespace,
                    count = defaults.len(),
                    "multiple default BackupStores, using the first by name"
                );
            }
            match defaults.into_iter().next() {
                Some(store) => store,
                None => {
                    return Ok(Resolution::NotReady(format!(
                        "no storeRef set and no default BackupStore in namespace {}",
                        namespace
                    )))
                }
            }
        }
    };

    if !store.is_ready() {
        return Ok(Resolution::NotReady(format!(
            "BackupStore {}/{} is not ready",
            namespace,
            store.metadata.name.as_deref().unwrap_or_default()
        )));
    }
    Ok(Resolution::Ready(store))
}

/// Whether a request pending since `since` has waited longer than `timeout`
pub fn pending_expired(
    since: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> bool {
    let Some(since) = since else {
        return false;
    };
    match chrono::Duration::from_std(timeout) {
        Ok(timeout) => now >= since + timeout,
        Err(_) => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::MockKubeClient;
    use strongbox_common::crd::{
        BackupStoreStatus, Database, DatabaseCluster, DatabaseClusterSpec, DatabaseSpec,
        DatabaseStatus, ReadinessPhase,
    };

    fn ready() -> Option<DatabaseStatus> {
        Some(DatabaseStatus {
            phase: ReadinessPhase::Ready,
            message: None,
        })
    }

    pub(crate) fn ready_database() -> Database {
        let mut db = Database::new(
            "orders",
            DatabaseSpec {
                cluster_ref: "pg-main".to_string(),
                database_name: "orders_prod".to_string(),
                credentials_secret_ref: None,
            },
        );
        db.metadata.namespace = Some("shop".to_string());
        db.status = ready();
        db
    }

    pub(crate) fn ready_cluster() -> DatabaseCluster {
        let mut cluster = DatabaseCluster::new(
            "pg-main",
            DatabaseClusterSpec {
                engine: DatabaseEngine::Postgres,
                host: "pg-main.shop.svc".to_string(),
                port: 5432,
                credentials_secret_ref: "pg-main-admin".to_string(),
            },
        );
        cluster.status = ready();
        cluster
    }

    pub(crate) fn store(name: &str, default: bool, phase: ReadinessPhase) -> BackupStore {
        let mut store = crate::dispatcher::tests::sample_store();
        store.metadata.name = Some(name.to_string());
        store.spec.default = default;
        store.status = Some(BackupStoreStatus {
            phase,
            ..Default::default()
        });
        store
    }

    #[tokio::test]
    async fn test_database_resolves_with_cluster_credentials() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_database()
            .returning(|_, _| Ok(Some(ready_database())));
        kube.expect_get_database_cluster()
            .withf(|ns, name| ns == "shop" && name == "pg-main")
            .returning(|_, _| Ok(Some(ready_cluster())));

        let Resolution::Ready(db) = resolve_database(&kube, "shop", "orders").await.expect("resolve")
        else {
            panic!("expected ready database");
        };
        assert_eq!(db.credentials_secret, "pg-main-admin");
        assert_eq!(db.cluster_key, "shop/pg-main");
        assert_eq!(db.database_name, "orders_prod");
    }

    #[tokio::test]
    async fn test_unready_cluster_is_not_ready() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_database()
            .returning(|_, _| Ok(Some(ready_database())));
        kube.expect_get_database_cluster().returning(|_, _| {
            let mut cluster = ready_cluster();
            cluster.status = None;
            Ok(Some(cluster))
        });

        assert_eq!(
            resolve_database(&kube, "shop", "orders").await.expect("resolve"),
            Resolution::NotReady("DatabaseCluster shop/pg-main is not ready".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_database_is_not_ready() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_database().returning(|_, _| Ok(None));

        assert!(matches!(
            resolve_database(&kube, "shop", "orders").await.expect("resolve"),
            Resolution::NotReady(reason) if reason.contains("not found")
        ));
    }

    #[tokio::test]
    async fn test_default_store_is_first_by_name() {
        let mut kube = MockKubeClient::new();
        kube.expect_list_stores().returning(|_| {
            Ok(vec![
                store("zeta", true, ReadinessPhase::Ready),
                store("other", false, ReadinessPhase::Ready),
                store("alpha", true, ReadinessPhase::Ready),
            ])
        });

        let Resolution::Ready(found) = resolve_store(&kube, "shop", None).await.expect("resolve")
        else {
            panic!("expected ready store");
        };
        assert_eq!(found.metadata.name.as_deref(), Some("alpha"));
    }

    #[tokio::test]
    async fn test_store_must_be_ready() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_store()
            .returning(|_, name| Ok(Some(store(name, false, ReadinessPhase::Pending))));
        kube.expect_list_stores().returning(|_| Ok(vec![]));

        assert!(matches!(
            resolve_store(&kube, "shop", Some("s3-prod")).await.expect("resolve"),
            Resolution::NotReady(reason) if reason.contains("not ready")
        ));
        assert!(matches!(
            resolve_store(&kube, "shop", None).await.expect("resolve"),
            Resolution::NotReady(reason) if reason.contains("no default BackupStore")
        ));
    }

    #[test]
    fn test_pending_timeout() {
        let since = Utc::now();
        let timeout = Duration::from_secs(600);

        assert!(!pending_expired(None, since, timeout));
        assert!(!pending_expired(
            Some(since),
            since + chrono::Duration::seconds(599),
            timeout
        ));
        assert!(pending_expired(
            Some(since),
            since + chrono::Duration::seconds(600),
            timeout
        ));
    }
}
