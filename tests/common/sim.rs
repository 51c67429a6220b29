// In-memory simulated orchestrator.
//
// Implements the operator's orchestrator, replica-admin, and backup-store
// seams over shared state so controller behavior can be driven and observed
// without a live cluster. Pods are created in phase Pending; tests flip them
// to Running to let reconciliation proceed.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodStatus, Service};
use tokio::sync::RwLock;

use keva_operator::backup::{BackupStore, BackupStoreProvider, SnapshotInfo};
use keva_operator::cluster;
use keva_operator::crd::{BackupPolicy, KevaCluster, KevaClusterStatus};
use keva_operator::error::{OperatorError, Result};
use keva_operator::k8s::KubeApi;
use keva_operator::replica::{ReplicaAdmin, ReplicaMember};

#[derive(Default)]
struct SimState {
    uid_counter: u64,
    resource_version: u64,
    pods: BTreeMap<String, Pod>,
    services: BTreeMap<String, Service>,
    cluster: Option<KevaCluster>,
    replica_members: BTreeMap<String, String>,
    snapshot: Option<SnapshotInfo>,
}

#[derive(Clone, Default)]
pub struct SimOrchestrator {
    state: Arc<RwLock<SimState>>,
}

impl SimOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller config wired entirely to this simulation.
    pub fn config(&self) -> cluster::Config {
        let sim = Arc::new(self.clone());
        cluster::Config {
            kube: sim.clone(),
            replica: sim.clone(),
            backup_stores: sim,
        }
    }

    /// Store the cluster object, assigning a UID and resource version.
    pub async fn seed_cluster(&self, mut cluster: KevaCluster) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        state.uid_counter += 1;
        if cluster.metadata.uid.is_none() {
            cluster.metadata.uid = Some(format!("cluster-uid-{}", state.uid_counter));
        }
        if cluster.metadata.namespace.is_none() {
            cluster.metadata.namespace = Some("default".to_string());
        }
        state.resource_version += 1;
        cluster.metadata.resource_version = Some(state.resource_version.to_string());
        state.cluster = Some(cluster);
    }

    /// Mutate the stored cluster object the way an external client would,
    /// bumping its resource version. Returns the updated object.
    pub async fn edit_cluster<F: FnOnce(&mut KevaCluster)>(&self, edit: F) -> KevaCluster {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let cluster = state.cluster.as_mut().expect("cluster object seeded");
        edit(cluster);
        state.resource_version += 1;
        cluster.metadata.resource_version = Some(state.resource_version.to_string());
        cluster.clone()
    }

    pub async fn cluster(&self) -> Option<KevaCluster> {
        self.state.read().await.cluster.clone()
    }

    pub async fn cluster_status(&self) -> Option<KevaClusterStatus> {
        self.state.read().await.cluster.as_ref()?.status.clone()
    }

    pub async fn pod_names(&self) -> Vec<String> {
        self.state.read().await.pods.keys().cloned().collect()
    }

    pub async fn pod(&self, name: &str) -> Option<Pod> {
        self.state.read().await.pods.get(name).cloned()
    }

    pub async fn pod_command(&self, name: &str) -> Vec<String> {
        self.pod(name)
            .await
            .and_then(|p| p.spec?.containers.into_iter().next()?.command)
            .unwrap_or_default()
    }

    pub async fn pod_has_restore_init(&self, name: &str) -> bool {
        self.pod(name)
            .await
            .and_then(|p| p.spec?.init_containers)
            .map(|init| init.iter().any(|c| c.name == "restore-datadir"))
            .unwrap_or(false)
    }

    pub async fn service_names(&self) -> Vec<String> {
        self.state.read().await.services.keys().cloned().collect()
    }

    pub async fn mark_pod_running(&self, name: &str) {
        let mut state = self.state.write().await;
        if let Some(pod) = state.pods.get_mut(name) {
            pod.status = Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            });
        }
    }

    pub async fn mark_all_pods_running(&self) {
        let names = self.pod_names().await;
        for name in names {
            self.mark_pod_running(&name).await;
        }
    }

    /// Remove a pod out-of-band, cascading to services it owns.
    pub async fn kill_pod(&self, name: &str) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if let Some(pod) = state.pods.remove(name) {
            cascade_services(&mut state.services, &pod);
        }
    }

    pub async fn kill_all_pods(&self) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let pods: Vec<Pod> = state.pods.values().cloned().collect();
        state.pods.clear();
        for pod in &pods {
            cascade_services(&mut state.services, pod);
        }
    }

    pub async fn set_snapshot(&self, snapshot: Option<SnapshotInfo>) {
        self.state.write().await.snapshot = snapshot;
    }

    pub async fn replica_member_names(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .replica_members
            .keys()
            .cloned()
            .collect()
    }

    pub async fn insert_replica_member(&self, name: &str, peer_url: &str) {
        self.state
            .write()
            .await
            .replica_members
            .insert(name.to_string(), peer_url.to_string());
    }
}

/// Emulate the orchestrator garbage-collecting services owned by a pod.
fn cascade_services(services: &mut BTreeMap<String, Service>, pod: &Pod) {
    let pod_uid = pod.metadata.uid.as_deref().unwrap_or_default();
    services.retain(|_, svc| {
        svc.metadata
            .owner_references
            .as_ref()
            .and_then(|refs| refs.first())
            .map(|r| r.uid.as_str())
            != Some(pod_uid)
    });
}

fn matches_selector(labels: Option<&BTreeMap<String, String>>, selector: &str) -> bool {
    let Some(labels) = labels else {
        return selector.is_empty();
    };
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => false,
        })
}

#[async_trait]
impl KubeApi for SimOrchestrator {
    async fn list_pods(&self, _namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let state = self.state.read().await;
        Ok(state
            .pods
            .values()
            .filter(|p| matches_selector(p.metadata.labels.as_ref(), label_selector))
            .cloned()
            .collect())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| OperatorError::InvalidSpec("pod without a name".into()))?;
        if state.pods.contains_key(&name) {
            return Err(OperatorError::AlreadyExists(name));
        }
        let mut pod = pod.clone();
        state.uid_counter += 1;
        pod.metadata.uid = Some(format!("pod-uid-{}", state.uid_counter));
        pod.metadata.namespace = Some(namespace.to_string());
        pod.status = Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        });
        state.pods.insert(name, pod.clone());
        Ok(pod)
    }

    async fn delete_pod(&self, _namespace: &str, name: &str, _grace: u32) -> Result<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(pod) = state.pods.remove(name) else {
            return Err(OperatorError::NotFound(name.to_string()));
        };
        cascade_services(&mut state.services, &pod);
        Ok(())
    }

    async fn list_services(&self, _namespace: &str, label_selector: &str) -> Result<Vec<Service>> {
        let state = self.state.read().await;
        Ok(state
            .services
            .values()
            .filter(|s| matches_selector(s.metadata.labels.as_ref(), label_selector))
            .cloned()
            .collect())
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let name = service
            .metadata
            .name
            .clone()
            .ok_or_else(|| OperatorError::InvalidSpec("service without a name".into()))?;
        if state.services.contains_key(&name) {
            return Err(OperatorError::AlreadyExists(name));
        }
        let mut service = service.clone();
        state.uid_counter += 1;
        service.metadata.uid = Some(format!("svc-uid-{}", state.uid_counter));
        service.metadata.namespace = Some(namespace.to_string());
        state.services.insert(name, service.clone());
        Ok(service)
    }

    async fn delete_service(&self, _namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.services.remove(name).is_none() {
            return Err(OperatorError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn get_cluster(&self, _namespace: &str, name: &str) -> Result<KevaCluster> {
        self.state
            .read()
            .await
            .cluster
            .clone()
            .ok_or_else(|| OperatorError::NotFound(name.to_string()))
    }

    async fn update_cluster_status(&self, cluster: &KevaCluster) -> Result<KevaCluster> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(stored) = state.cluster.as_mut() else {
            return Err(OperatorError::NotFound("cluster".to_string()));
        };
        if cluster.metadata.resource_version != stored.metadata.resource_version {
            return Err(OperatorError::Conflict(format!(
                "resource version mismatch: {:?} != {:?}",
                cluster.metadata.resource_version, stored.metadata.resource_version
            )));
        }
        stored.status = cluster.status.clone();
        state.resource_version += 1;
        stored.metadata.resource_version = Some(state.resource_version.to_string());
        Ok(stored.clone())
    }
}

fn member_name_from_peer_url(url: &str) -> String {
    url.strip_prefix("http://")
        .unwrap_or(url)
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl ReplicaAdmin for SimOrchestrator {
    async fn list_members(&self, _endpoints: &[String]) -> Result<Vec<ReplicaMember>> {
        let state = self.state.read().await;
        Ok(state
            .replica_members
            .iter()
            .map(|(name, peer_url)| ReplicaMember {
                name: name.clone(),
                peer_url: peer_url.clone(),
            })
            .collect())
    }

    async fn add_member(&self, _endpoints: &[String], peer_url: &str) -> Result<()> {
        let name = member_name_from_peer_url(peer_url);
        self.state
            .write()
            .await
            .replica_members
            .insert(name, peer_url.to_string());
        Ok(())
    }

    async fn remove_member(&self, _endpoints: &[String], name: &str) -> Result<()> {
        self.state.write().await.replica_members.remove(name);
        Ok(())
    }
}

#[async_trait]
impl BackupStore for SimOrchestrator {
    async fn latest_snapshot(&self) -> Result<Option<SnapshotInfo>> {
        Ok(self.state.read().await.snapshot.clone())
    }

    async fn purge(&self) -> Result<()> {
        self.state.write().await.snapshot = None;
        Ok(())
    }
}

impl BackupStoreProvider for SimOrchestrator {
    fn store_for(
        &self,
        _cluster_name: &str,
        _namespace: &str,
        _policy: &BackupPolicy,
    ) -> Arc<dyn BackupStore> {
        Arc::new(self.clone())
    }
}
