//! Backup manager handle.
//!
//! Snapshots are taken by an external backup sidecar; the controller only
//! provisions and tears down the backup location and asks for the latest
//! snapshot during disaster recovery.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::crd::{BackupPolicy, BackupStorage};
use crate::error::{OperatorError, Result};
use crate::resources;

/// Metadata about one stored snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default)]
    pub revision: i64,
}

/// Lookup seam over the snapshot storage backend.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// The most recent snapshot, or `None` when nothing has been taken yet.
    async fn latest_snapshot(&self) -> Result<Option<SnapshotInfo>>;

    /// Drop all stored snapshots for the cluster.
    async fn purge(&self) -> Result<()>;
}

/// Produces the store for a given cluster. Injected through the controller
/// config so tests can substitute an in-memory store.
pub trait BackupStoreProvider: Send + Sync {
    fn store_for(
        &self,
        cluster_name: &str,
        namespace: &str,
        policy: &BackupPolicy,
    ) -> Arc<dyn BackupStore>;
}

/// HTTP store talking to the cluster's backup sidecar service.
pub struct HttpBackupStore {
    base: String,
    http: reqwest::Client,
}

impl HttpBackupStore {
    pub fn new(base: String) -> Self {
        Self {
            base,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl BackupStore for HttpBackupStore {
    async fn latest_snapshot(&self) -> Result<Option<SnapshotInfo>> {
        let url = format!("{}/v1/snapshots/latest", self.base);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| OperatorError::Backup(format!("{}: {}", url, e)))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(OperatorError::Backup(format!(
                "{}: status {}",
                url,
                resp.status()
            )));
        }
        Ok(Some(resp.json().await?))
    }

    async fn purge(&self) -> Result<()> {
        let url = format!("{}/v1/snapshots", self.base);
        let resp = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|e| OperatorError::Backup(format!("{}: {}", url, e)))?;
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(OperatorError::Backup(format!(
                "{}: status {}",
                url,
                resp.status()
            )))
        }
    }
}

/// Default provider addressing the conventional backup sidecar service.
pub struct HttpBackupStoreProvider;

impl BackupStoreProvider for HttpBackupStoreProvider {
    fn store_for(
        &self,
        cluster_name: &str,
        namespace: &str,
        _policy: &BackupPolicy,
    ) -> Arc<dyn BackupStore> {
        Arc::new(HttpBackupStore::new(resources::backup_service_addr(
            cluster_name,
            namespace,
        )))
    }
}

/// Per-cluster backup manager. Only instantiated when the policy keeps at
/// least one snapshot.
pub struct BackupManager {
    policy: BackupPolicy,
    cluster_name: String,
    store: Arc<dyn BackupStore>,
}

impl BackupManager {
    pub fn new(
        policy: BackupPolicy,
        cluster_name: &str,
        namespace: &str,
        provider: &dyn BackupStoreProvider,
    ) -> Result<Self> {
        if policy.max_backups <= 0 {
            return Err(OperatorError::Backup(
                "backup manager requires maxBackups > 0".into(),
            ));
        }
        let store = provider.store_for(cluster_name, namespace, &policy);
        Ok(Self {
            policy,
            cluster_name: cluster_name.to_string(),
            store,
        })
    }

    /// Provision the backup location. For object stores this validates the
    /// configuration; the persistent-volume backend is claimed by the backup
    /// sidecar itself when it starts.
    pub async fn setup(&self) -> Result<()> {
        match &self.policy.storage {
            BackupStorage::PersistentVolume { volume_size_gib } => {
                info!(
                    cluster = %self.cluster_name,
                    size_gib = volume_size_gib,
                    "backup manager using persistent volume storage"
                );
            }
            BackupStorage::ObjectStore { bucket, prefix } => {
                if bucket.is_empty() {
                    return Err(OperatorError::Backup("object store bucket is empty".into()));
                }
                info!(
                    cluster = %self.cluster_name,
                    bucket = %bucket,
                    prefix = %prefix,
                    "backup manager using object store"
                );
            }
        }
        Ok(())
    }

    /// Tear down the backup location on cluster deletion.
    pub async fn cleanup(&self) -> Result<()> {
        debug!(cluster = %self.cluster_name, "purging stored snapshots");
        self.store.purge().await
    }

    pub async fn latest_snapshot(&self) -> Result<Option<SnapshotInfo>> {
        self.store.latest_snapshot().await
    }
}
