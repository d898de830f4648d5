//! Record store access for the strongbox controllers
//!
//! Every read and write the reconcilers make against the API server goes
//! through [`KubeClient`], so reconcile logic can be tested against mocks.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

#[cfg(test)]
use mockall::automock;

use strongbox_common::crd::{
    BackupSchedule, BackupScheduleStatus, BackupStore, BackupStoreStatus, Database,
    DatabaseBackup, DatabaseBackupStatus, DatabaseCluster, DatabaseRestore, DatabaseRestoreStatus,
};
use strongbox_common::kube_utils::{
    is_already_exists, is_conflict, is_not_found, label_value, patch_resource_status,
};
use strongbox_common::{Error, SCHEDULE_LABEL};

use crate::FIELD_MANAGER;

/// Records the operator adds finalizers to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    /// DatabaseBackup
    Backup,
    /// DatabaseRestore
    Restore,
    /// BackupSchedule
    Schedule,
}

/// Result of a create that may race with another writer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    /// This call created the object
    Created,
    /// An object with the same name already existed
    AlreadyExists,
}

/// Trait abstracting the record store for testability
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a DatabaseBackup
    async fn get_backup(&self, namespace: &str, name: &str)
        -> Result<Option<DatabaseBackup>, Error>;

    /// List DatabaseBackups in a namespace
    async fn list_backups(&self, namespace: &str) -> Result<Vec<DatabaseBackup>, Error>;

    /// List DatabaseBackups in every namespace
    async fn list_all_backups(&self) -> Result<Vec<DatabaseBackup>, Error>;

    /// List DatabaseBackups created by a BackupSchedule
    async fn list_schedule_backups(
        &self,
        namespace: &str,
        schedule: &str,
    ) -> Result<Vec<DatabaseBackup>, Error>;

    /// Create a DatabaseBackup, tolerating a name that already exists
    async fn create_backup(&self, backup: &DatabaseBackup) -> Result<CreateOutcome, Error>;

    /// Delete a DatabaseBackup (missing is not an error)
    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Merge-patch DatabaseBackup status
    async fn patch_backup_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DatabaseBackupStatus,
    ) -> Result<(), Error>;

    /// List DatabaseRestores in every namespace
    async fn list_all_restores(&self) -> Result<Vec<DatabaseRestore>, Error>;

    /// Merge-patch DatabaseRestore status
    async fn patch_restore_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DatabaseRestoreStatus,
    ) -> Result<(), Error>;

    /// Get a BackupSchedule
    async fn get_schedule(&self, namespace: &str, name: &str)
        -> Result<Option<BackupSchedule>, Error>;

    /// Merge-patch BackupSchedule status
    async fn patch_schedule_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BackupScheduleStatus,
    ) -> Result<(), Error>;

    /// Set one annotation on a BackupSchedule, only if it is still at
    /// `resource_version`. A stale version yields [`Error::Conflict`].
    async fn annotate_schedule(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error>;

    /// Get a Database
    async fn get_database(&self, namespace: &str, name: &str) -> Result<Option<Database>, Error>;

    /// Get a DatabaseCluster
    async fn get_database_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DatabaseCluster>, Error>;

    /// Get a BackupStore
    async fn get_store(&self, namespace: &str, name: &str) -> Result<Option<BackupStore>, Error>;

    /// List BackupStores in a namespace
    async fn list_stores(&self, namespace: &str) -> Result<Vec<BackupStore>, Error>;

    /// Merge-patch BackupStore status
    async fn patch_store_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BackupStoreStatus,
    ) -> Result<(), Error>;

    /// Get a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Add a finalizer (no-op when present)
    async fn add_finalizer(
        &self,
        kind: RecordKind,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Remove a finalizer (no-op when absent or when the record is gone)
    async fn remove_finalizer(
        &self,
        kind: RecordKind,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping a kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>, Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    Ok(api.get_opt(name).await?)
}

async fn patch_status<K>(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &(impl Serialize + Sync),
) -> Result<(), Error>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug,
{
    patch_resource_status::<K>(client, name, namespace, status, FIELD_MANAGER).await?;
    Ok(())
}

async fn add_finalizer_on<K>(api: Api<K>, name: &str, finalizer: &str) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let obj = api.get(name).await?;
    let mut finalizers = obj.meta().finalizers.clone().unwrap_or_default();

    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());

    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn remove_finalizer_on<K>(api: Api<K>, name: &str, finalizer: &str) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let Some(obj) = api.get_opt(name).await? else {
        return Ok(());
    };
    let finalizers = obj.meta().finalizers.clone().unwrap_or_default();
    if !finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }

    let remaining: Vec<String> = finalizers.into_iter().filter(|f| f != finalizer).collect();
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": remaining
        }
    });
    match api
        .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_backup(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DatabaseBackup>, Error> {
        get_opt(&self.api::<DatabaseBackup>(namespace), name).await
    }

    async fn list_backups(&self, namespace: &str) -> Result<Vec<DatabaseBackup>, Error> {
        let list = self
            .api::<DatabaseBackup>(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn list_all_backups(&self) -> Result<Vec<DatabaseBackup>, Error> {
        let api: Api<DatabaseBackup> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_schedule_backups(
        &self,
        namespace: &str,
        schedule: &str,
    ) -> Result<Vec<DatabaseBackup>, Error> {
        let params = ListParams::default().labels(&format!(
            "{}={}",
            SCHEDULE_LABEL,
            label_value(schedule)
        ));
        Ok(self.api::<DatabaseBackup>(namespace).list(&params).await?.items)
    }

    async fn create_backup(&self, backup: &DatabaseBackup) -> Result<CreateOutcome, Error> {
        let namespace = backup
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::validation("DatabaseBackup has no namespace"))?;
        match self
            .api::<DatabaseBackup>(namespace)
            .create(&PostParams::default(), backup)
            .await
        {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e) if is_already_exists(&e) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<(), Error> {
        match self
            .api::<DatabaseBackup>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_backup_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DatabaseBackupStatus,
    ) -> Result<(), Error> {
        patch_status::<DatabaseBackup>(&self.client, namespace, name, status).await
    }

    async fn list_all_restores(&self) -> Result<Vec<DatabaseRestore>, Error> {
        let api: Api<DatabaseRestore> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_restore_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DatabaseRestoreStatus,
    ) -> Result<(), Error> {
        patch_status::<DatabaseRestore>(&self.client, namespace, name, status).await
    }

    async fn get_schedule(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BackupSchedule>, Error> {
        get_opt(&self.api::<BackupSchedule>(namespace), name).await
    }

    async fn patch_schedule_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BackupScheduleStatus,
    ) -> Result<(), Error> {
        patch_status::<BackupSchedule>(&self.client, namespace, name, status).await
    }

    async fn annotate_schedule(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        // resourceVersion in a merge patch acts as a precondition
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": resource_version,
                "annotations": { key: value }
            }
        });
        match self
            .api::<BackupSchedule>(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Err(Error::conflict(format!("{}/{}", namespace, name))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_database(&self, namespace: &str, name: &str) -> Result<Option<Database>, Error> {
        get_opt(&self.api::<Database>(namespace), name).await
    }

    async fn get_database_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DatabaseCluster>, Error> {
        get_opt(&self.api::<DatabaseCluster>(namespace), name).await
    }

    async fn get_store(&self, namespace: &str, name: &str) -> Result<Option<BackupStore>, Error> {
        get_opt(&self.api::<BackupStore>(namespace), name).await
    }

    async fn list_stores(&self, namespace: &str) -> Result<Vec<BackupStore>, Error> {
        Ok(self
            .api::<BackupStore>(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn patch_store_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BackupStoreStatus,
    ) -> Result<(), Error> {
        patch_status::<BackupStore>(&self.client, namespace, name, status).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        get_opt(&self.api::<Secret>(namespace), name).await
    }

    async fn add_finalizer(
        &self,
        kind: RecordKind,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        match kind {
            RecordKind::Backup => {
                add_finalizer_on(self.api::<DatabaseBackup>(namespace), name, finalizer).await
            }
            RecordKind::Restore => {
                add_finalizer_on(self.api::<DatabaseRestore>(namespace), name, finalizer).await
            }
            RecordKind::Schedule => {
                add_finalizer_on(self.api::<BackupSchedule>(namespace), name, finalizer).await
            }
        }
    }

    async fn remove_finalizer(
        &self,
        kind: RecordKind,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        match kind {
            RecordKind::Backup => {
                remove_finalizer_on(self.api::<DatabaseBackup>(namespace), name, finalizer).await
            }
            RecordKind::Restore => {
                remove_finalizer_on(self.api::<DatabaseRestore>(namespace), name, finalizer)
                    .await
            }
            RecordKind::Schedule => {
                remove_finalizer_on(self.api::<BackupSchedule>(namespace), name, finalizer).await
            }
        }
    }
}
