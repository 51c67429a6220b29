//! Outer watcher.
//!
//! Discovers KevaCluster objects and maintains one per-cluster controller
//! task per object: spawning on add, forwarding Modify events on change, and
//! signaling Delete on removal. All interaction with the per-cluster loops
//! goes through their mailboxes.

use std::collections::HashMap;

use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::cluster;
use crate::crd::KevaCluster;
use crate::error::{OperatorError, Result};
use crate::metrics;

pub struct Controller {
    client: Client,
    namespace: String,
    config: cluster::Config,
}

impl Controller {
    pub fn new(client: Client, namespace: String, config: cluster::Config) -> Self {
        Self {
            client,
            namespace,
            config,
        }
    }

    /// Run until the stop signal flips, then wait for every per-cluster
    /// controller task to drain.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let clusters: Api<KevaCluster> = if self.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.namespace)
        };

        // Verify the CRD is installed before watching.
        let lp = ListParams::default().limit(1);
        if let Err(err) = clusters.list(&lp).await {
            error!(error = %err, "failed to list KevaClusters. Is the CRD installed?");
            return Err(OperatorError::CrdNotInstalled);
        }
        info!("CRD verification successful");

        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let mut controllers: HashMap<String, cluster::Cluster> = HashMap::new();
        let mut stream = watcher(clusters, watcher::Config::default()).boxed();

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                event = stream.next() => match event {
                    Some(Ok(watcher::Event::Apply(obj) | watcher::Event::InitApply(obj))) => {
                        self.apply(&mut controllers, obj, &stop, &done_tx);
                    }
                    Some(Ok(watcher::Event::Delete(obj))) => {
                        let key = object_key(&obj);
                        if let Some(controller) = controllers.remove(&key) {
                            info!(cluster = %key, "cluster object removed, tearing down");
                            controller.delete();
                        }
                        metrics::set_cluster_count(&self.namespace, controllers.len() as f64);
                    }
                    Some(Ok(watcher::Event::Init | watcher::Event::InitDone)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "cluster watch error, stream will resume");
                    }
                    None => break,
                },
            }
        }

        info!("waiting for cluster controllers to drain");
        drop(done_tx);
        while done_rx.recv().await.is_some() {}
        Ok(())
    }

    fn apply(
        &self,
        controllers: &mut HashMap<String, cluster::Cluster>,
        obj: KevaCluster,
        stop: &watch::Receiver<bool>,
        done: &mpsc::Sender<()>,
    ) {
        let key = object_key(&obj);
        match controllers.get(&key) {
            Some(controller) => {
                debug!(cluster = %key, "forwarding cluster update");
                controller.update(obj);
            }
            None => {
                info!(cluster = %key, "spawning controller for cluster");
                let controller =
                    cluster::Cluster::new(self.config.clone(), obj, stop.clone(), done.clone());
                controllers.insert(key, controller);
                metrics::set_cluster_count(&self.namespace, controllers.len() as f64);
            }
        }
    }
}

fn object_key(obj: &KevaCluster) -> String {
    format!(
        "{}/{}",
        obj.namespace().unwrap_or_else(|| "default".to_string()),
        obj.name_any()
    )
}
