//! Orchestrator API seam.
//!
//! All Kubernetes calls the per-cluster controller makes go through the
//! [`KubeApi`] trait so the reconcile logic can be driven against a simulated
//! orchestrator in tests while production uses [`KubeClient`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;

use crate::crd::KevaCluster;
use crate::error::Result;

#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    async fn delete_pod(&self, namespace: &str, name: &str, grace_period_secs: u32) -> Result<()>;

    async fn list_services(&self, namespace: &str, label_selector: &str) -> Result<Vec<Service>>;

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<KevaCluster>;

    /// Replace the status subresource. The write carries the object's
    /// resource version; a stale version surfaces as a conflict error.
    async fn update_cluster_status(&self, cluster: &KevaCluster) -> Result<KevaCluster>;
}

/// Production [`KubeApi`] backed by a kube-rs client.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn clusters(&self, namespace: &str) -> Api<KevaCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeApi for KubeClient {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(label_selector);
        let pods = self.pods(namespace).list(&lp).await?;
        Ok(pods.items)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        Ok(self.pods(namespace).create(&PostParams::default(), pod).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str, grace_period_secs: u32) -> Result<()> {
        let dp = DeleteParams {
            grace_period_seconds: Some(grace_period_secs),
            ..DeleteParams::default()
        };
        self.pods(namespace).delete(name, &dp).await?;
        Ok(())
    }

    async fn list_services(&self, namespace: &str, label_selector: &str) -> Result<Vec<Service>> {
        let lp = ListParams::default().labels(label_selector);
        let services = self.services(namespace).list(&lp).await?;
        Ok(services.items)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        Ok(self
            .services(namespace)
            .create(&PostParams::default(), service)
            .await?)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        self.services(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<KevaCluster> {
        Ok(self.clusters(namespace).get(name).await?)
    }

    async fn update_cluster_status(&self, cluster: &KevaCluster) -> Result<KevaCluster> {
        let name = cluster
            .metadata
            .name
            .as_deref()
            .unwrap_or_default()
            .to_string();
        let namespace = cluster.metadata.namespace.as_deref().unwrap_or("default");
        let data = serde_json::to_vec(cluster).map_err(kube::Error::SerdeError)?;
        Ok(self
            .clusters(namespace)
            .replace_status(&name, &PostParams::default(), data)
            .await?)
    }
}
