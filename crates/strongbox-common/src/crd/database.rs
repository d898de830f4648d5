//! DatabaseCluster and Database Custom Resource Definitions
//!
//! These records are owned by the connection-management side of the platform.
//! strongbox only reads them: a backup or restore may be dispatched once both
//! the Database and the DatabaseCluster it lives on report `Ready`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ReadinessPhase;

/// Database engine running on a cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DatabaseEngine {
    /// PostgreSQL
    #[default]
    Postgres,
    /// MySQL / MariaDB
    Mysql,
}

impl std::fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Mysql => write!(f, "mysql"),
        }
    }
}

/// Status shared by DatabaseCluster and Database
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ReadinessPhase,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Specification for a DatabaseCluster
///
/// A database server endpoint. Concurrency limits for backups and restores
/// are enforced per cluster.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "strongbox.dev",
    version = "v1alpha1",
    kind = "DatabaseCluster",
    plural = "databaseclusters",
    shortname = "dbc",
    namespaced,
    status = "DatabaseStatus",
    printcolumn = r#"{"name":"Engine","type":"string","jsonPath":".spec.engine"}"#,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".spec.host"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseClusterSpec {
    /// Engine running on this cluster
    #[serde(default)]
    pub engine: DatabaseEngine,

    /// Hostname of the primary endpoint
    pub host: String,

    /// Port of the primary endpoint
    pub port: u16,

    /// Secret with `username` and `password` keys for an administrative user
    pub credentials_secret_ref: String,
}

/// Specification for a Database
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "strongbox.dev",
    version = "v1alpha1",
    kind = "Database",
    plural = "databases",
    shortname = "db",
    namespaced,
    status = "DatabaseStatus",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterRef"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Name of the DatabaseCluster (same namespace) hosting this database
    pub cluster_ref: String,

    /// Name of the database on the server
    pub database_name: String,

    /// Secret with `username` and `password` keys scoped to this database.
    /// Falls back to the cluster credentials when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret_ref: Option<String>,
}

impl Database {
    /// Whether this database reports `Ready`
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.phase == ReadinessPhase::Ready)
    }
}

impl DatabaseCluster {
    /// Whether this cluster reports `Ready`
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.phase == ReadinessPhase::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_spec_from_yaml() {
        let spec: DatabaseSpec = serde_yaml::from_str(
            r#"
clusterRef: pg-main
databaseName: orders
"#,
        )
        .expect("parse spec");

        assert_eq!(spec.cluster_ref, "pg-main");
        assert_eq!(spec.database_name, "orders");
        assert!(spec.credentials_secret_ref.is_none());
    }

    #[test]
    fn test_cluster_spec_defaults_to_postgres() {
        let spec: DatabaseClusterSpec = serde_yaml::from_str(
            r#"
host: pg-main.db.svc
port: 5432
credentialsSecretRef: pg-main-admin
"#,
        )
        .expect("parse spec");

        assert_eq!(spec.engine, DatabaseEngine::Postgres);
        assert_eq!(spec.engine.to_string(), "postgres");
    }

    #[test]
    fn test_readiness_requires_ready_status() {
        let mut db = Database::new(
            "orders",
            DatabaseSpec {
                cluster_ref: "pg-main".to_string(),
                database_name: "orders".to_string(),
                credentials_secret_ref: None,
            },
        );
        assert!(!db.is_ready());

        db.status = Some(DatabaseStatus {
            phase: ReadinessPhase::Ready,
            message: None,
        });
        assert!(db.is_ready());
    }
}
