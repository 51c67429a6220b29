// Shared helpers for operator integration tests.

pub mod sim;

use std::time::Duration;

use tokio::sync::{mpsc, watch};

use keva_operator::cluster;
use keva_operator::crd::{BackupPolicy, BackupStorage, KevaCluster, KevaClusterSpec};

use self::sim::SimOrchestrator;

/// Build a minimal cluster object in the default namespace.
pub fn test_cluster(name: &str, size: i32, version: &str) -> KevaCluster {
    let spec = KevaClusterSpec {
        size,
        version: version.to_string(),
        paused: false,
        backup: None,
        restore: None,
        self_hosted: None,
    };
    let mut cluster = KevaCluster::new(name, spec);
    cluster.metadata.namespace = Some("default".to_string());
    cluster
}

pub fn backup_policy(max_backups: i32) -> BackupPolicy {
    BackupPolicy {
        max_backups,
        interval_secs: 1800,
        storage: BackupStorage::default(),
    }
}

/// Poll a condition once per simulated second until it holds.
pub async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("condition not met within deadline");
}

/// A spawned cluster controller plus the channels the watcher would hold.
pub struct Harness {
    pub handle: cluster::Cluster,
    stop: watch::Sender<bool>,
    done: mpsc::Receiver<()>,
}

impl Harness {
    /// Seed the cluster object into the simulated orchestrator and spawn a
    /// controller for it.
    pub async fn spawn(sim: &SimOrchestrator, cluster: KevaCluster) -> Harness {
        sim.seed_cluster(cluster).await;
        Self::adopt(sim).await
    }

    /// Spawn a controller against whatever cluster object the orchestrator
    /// already holds, as after a controller restart.
    pub async fn adopt(sim: &SimOrchestrator) -> Harness {
        let object = sim.cluster().await.expect("cluster object seeded");
        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = mpsc::channel(1);
        let handle = cluster::Cluster::new(sim.config(), object, stop_rx, done_tx);
        Harness {
            handle,
            stop: stop_tx,
            done: done_rx,
        }
    }

    /// Signal the process-level stop and wait for the task to drain.
    pub async fn shutdown(mut self) {
        let _ = self.stop.send(true);
        tokio::time::timeout(Duration::from_secs(600), async {
            while self.done.recv().await.is_some() {}
        })
        .await
        .expect("controller did not stop in time");
    }

    /// Wait for the controller to exit on its own, after a Delete event or a
    /// fatal error.
    pub async fn wait_exit(&mut self) {
        tokio::time::timeout(Duration::from_secs(600), async {
            while self.done.recv().await.is_some() {}
        })
        .await
        .expect("controller did not exit in time");
    }
}
