//! Garbage collection of owned resources.
//!
//! Every pod and service the operator creates is labeled for its cluster and
//! carries an owner reference. The collector removes labeled resources whose
//! first owner does not match the expected cluster identifier, which cleans
//! up leftovers from a previous incarnation of the same cluster name. Passing
//! [`NULL_UID`] collects everything the cluster owns, used during teardown.

use std::sync::Arc;

use kube::ResourceExt;
use tracing::{info, warn};

use crate::k8s::KubeApi;
use crate::resources;

/// Matches no real owner UID; collecting with it removes all owned resources.
pub const NULL_UID: &str = "";

pub struct Gc {
    kube: Arc<dyn KubeApi>,
    namespace: String,
}

impl Gc {
    pub fn new(kube: Arc<dyn KubeApi>, namespace: String) -> Self {
        Self { kube, namespace }
    }

    /// Best-effort sweep; individual delete failures are logged and skipped
    /// so one stuck resource cannot wedge teardown.
    pub async fn collect_cluster(&self, cluster_name: &str, owner_uid: &str) {
        let selector = resources::cluster_selector(cluster_name);

        match self.kube.list_pods(&self.namespace, &selector).await {
            Ok(pods) => {
                for pod in pods {
                    if resources::first_owner_uid(&pod) == Some(owner_uid) {
                        continue;
                    }
                    let name = pod.name_any();
                    match self.kube.delete_pod(&self.namespace, &name, 0).await {
                        Ok(()) => info!(pod = %name, "garbage collected pod"),
                        Err(err) if err.is_not_found() => {}
                        Err(err) => warn!(pod = %name, error = %err, "failed to collect pod"),
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to list pods for collection"),
        }

        match self.kube.list_services(&self.namespace, &selector).await {
            Ok(services) => {
                for svc in services {
                    let owner = svc
                        .metadata
                        .owner_references
                        .as_ref()
                        .and_then(|refs| refs.first())
                        .map(|r| r.uid.as_str());
                    if owner == Some(owner_uid) {
                        continue;
                    }
                    let name = svc.name_any();
                    match self.kube.delete_service(&self.namespace, &name).await {
                        Ok(()) => info!(service = %name, "garbage collected service"),
                        Err(err) if err.is_not_found() => {}
                        Err(err) => {
                            warn!(service = %name, error = %err, "failed to collect service")
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to list services for collection"),
        }
    }
}
