//! CRD generation and installation
//!
//! The operator installs its own CRDs on startup with server-side apply so
//! their schema always matches the running version.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use strongbox_backup::FIELD_MANAGER;
use strongbox_common::crd::{
    BackupSchedule, BackupStore, Database, DatabaseBackup, DatabaseCluster, DatabaseRestore,
};

/// Every CRD the operator serves or reads
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        DatabaseBackup::crd(),
        DatabaseRestore::crd(),
        BackupSchedule::crd(),
        BackupStore::crd(),
        Database::crd(),
        DatabaseCluster::crd(),
    ]
}

/// Multi-document YAML of [`all_crds`]
pub fn render_all() -> anyhow::Result<String> {
    let mut out = String::new();
    for crd in all_crds() {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd)?);
    }
    Ok(out)
}

/// Install or update every CRD
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "installing CRD");
        api.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("all strongbox CRDs installed/updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_crd_names_are_unique_and_grouped() {
        let names: BTreeSet<String> = all_crds()
            .into_iter()
            .filter_map(|c| c.metadata.name)
            .collect();

        assert_eq!(names.len(), 6);
        assert!(names.iter().all(|n| n.ends_with(".strongbox.dev")));
        assert!(names.contains("databasebackups.strongbox.dev"));
        assert!(names.contains("backupschedules.strongbox.dev"));
    }

    #[test]
    fn test_render_all_is_multi_document_yaml() {
        let yaml = render_all().expect("render");
        assert_eq!(yaml.matches("---\n").count(), 6);
        assert_eq!(yaml.matches("kind: CustomResourceDefinition").count(), 6);
    }
}
