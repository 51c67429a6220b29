//! Per-cluster controller.
//!
//! One long-lived task per declared cluster drives the observed pod
//! population toward the spec: it multiplexes external events, a periodic
//! reconciliation tick, and the process stop signal, and owns the in-memory
//! status, member set, and member counter. Because everything happens on one
//! task, none of that state needs a lock.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backup::{BackupManager, BackupStoreProvider};
use crate::crd::{spec_equal, ClusterPhase, KevaCluster};
use crate::error::{OperatorError, Result};
use crate::gc::Gc;
use crate::k8s::KubeApi;
use crate::member::{member_name, parse_member_ordinal, Member, MemberSet};
use crate::metrics;
use crate::replica::ReplicaAdmin;
use crate::resources;

mod reconcile;
mod recovery;

/// Interval between reconciliation ticks.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(8);
/// Grace period when deleting member pods.
pub const POD_TERMINATION_GRACE_SECS: u32 = 5;
/// Backoff between attempts to persist a terminal `Failed` status.
const FAILED_STATUS_RETRY: Duration = Duration::from_secs(5);
/// Mailbox capacity.
const EVENT_QUEUE_CAPACITY: usize = 100;
/// Occupancy above which producers log a warning.
const EVENT_QUEUE_WARN_THRESHOLD: usize = 80;
/// Poll attempts while waiting for a self-hosted seed pod to come up.
const SELF_HOSTED_BOOT_ATTEMPTS: u32 = 30;

enum ClusterEvent {
    Modify(Box<KevaCluster>),
    Delete,
}

/// Collaborators shared by every controller instance.
#[derive(Clone)]
pub struct Config {
    pub kube: Arc<dyn KubeApi>,
    pub replica: Arc<dyn ReplicaAdmin>,
    pub backup_stores: Arc<dyn BackupStoreProvider>,
}

/// Handle to a running cluster controller.
///
/// The watcher interacts with the controller exclusively through this handle;
/// events cross the task boundary over the bounded mailbox and nothing else
/// is shared.
pub struct Cluster {
    name: String,
    events: mpsc::Sender<ClusterEvent>,
}

impl Cluster {
    /// Spawn the controller task for a cluster object.
    ///
    /// `stop` is the process-level stop signal; flipping it makes the task
    /// exit promptly without a status write. The task holds `done` until it
    /// exits so the caller can await full drain of all controllers.
    pub fn new(
        config: Config,
        cluster: KevaCluster,
        stop: watch::Receiver<bool>,
        done: mpsc::Sender<()>,
    ) -> Cluster {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let status = cluster.status.clone().unwrap_or_default();
        let gc = Gc::new(config.kube.clone(), namespace.clone());

        let inner = ClusterInner {
            config,
            name: name.clone(),
            namespace,
            cluster,
            status,
            member_counter: 0,
            members: MemberSet::new(),
            bm: None,
            gc,
        };

        let span = info_span!("cluster", cluster = %name);
        tokio::spawn(
            async move {
                let _done = done;
                inner.entry(events_rx, stop).await;
            }
            .instrument(span),
        );

        Cluster {
            name,
            events: events_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a Modify event with the new cluster object.
    pub fn update(&self, cluster: KevaCluster) {
        self.send(ClusterEvent::Modify(Box::new(cluster)));
    }

    /// Enqueue a Delete event. Idempotent: calling it again after the
    /// controller has torn down is harmless.
    pub fn delete(&self) {
        self.send(ClusterEvent::Delete);
    }

    /// Non-blocking send. The watcher must never be blocked by a slow
    /// cluster, so overflow drops the event instead of applying backpressure.
    fn send(&self, event: ClusterEvent) {
        match self.events.try_send(event) {
            Ok(()) => {
                let used = EVENT_QUEUE_CAPACITY - self.events.capacity();
                if used > EVENT_QUEUE_WARN_THRESHOLD {
                    warn!(
                        cluster = %self.name,
                        used,
                        capacity = EVENT_QUEUE_CAPACITY,
                        "event queue is almost full"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(cluster = %self.name, "event queue full, dropping event");
                metrics::record_dropped_event(&self.name, "full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(cluster = %self.name, "controller stopped, dropping event");
                metrics::record_dropped_event(&self.name, "stopped");
            }
        }
    }
}

struct ClusterInner {
    config: Config,
    name: String,
    namespace: String,

    /// Last observed cluster object. Its spec is what reconciliation targets.
    cluster: KevaCluster,
    /// In-memory status, the source of truth once the controller is running.
    status: crate::crd::KevaClusterStatus,
    /// Never decreases; guarantees fresh names for recycled member slots.
    member_counter: u64,
    members: MemberSet,

    bm: Option<BackupManager>,
    gc: Gc,
}

impl ClusterInner {
    async fn entry(mut self, events: mpsc::Receiver<ClusterEvent>, stop: watch::Receiver<bool>) {
        if *stop.borrow() {
            return;
        }
        if let Err(err) = self.setup().await {
            error!(error = %err, "cluster failed to setup");
            if self.status.phase != ClusterPhase::Failed {
                self.status.set_reason(err.to_string());
                self.status.set_phase(ClusterPhase::Failed);
                if let Err(status_err) = self.update_status().await {
                    error!(error = %status_err, "failed to persist failed phase");
                }
            }
            return;
        }
        self.run(events, stop).await;
    }

    async fn setup(&mut self) -> Result<()> {
        self.cluster.spec.validate()?;

        let should_create = match self.status.phase {
            ClusterPhase::None => true,
            // A previous attempt crashed mid-bootstrap; the half-created
            // cluster cannot be trusted.
            ClusterPhase::Creating => return Err(OperatorError::CreateInterrupted),
            ClusterPhase::Running => false,
            other => return Err(OperatorError::UnexpectedPhase(other.to_string())),
        };

        if let Some(policy) = self.cluster.spec.backup.clone() {
            if policy.max_backups > 0 {
                self.bm = Some(BackupManager::new(
                    policy,
                    &self.name,
                    &self.namespace,
                    self.config.backup_stores.as_ref(),
                )?);
            }
        }

        if should_create {
            self.create().await?;
        }
        Ok(())
    }

    async fn create(&mut self) -> Result<()> {
        self.status.set_phase(ClusterPhase::Creating);
        self.update_status().await?;
        info!(
            size = self.cluster.spec.size,
            version = %self.cluster.spec.version,
            "creating cluster"
        );

        // Sweep leftovers from a previous incarnation of this cluster name.
        let uid = self.cluster.uid().unwrap_or_default();
        self.gc.collect_cluster(&self.name, &uid).await;

        if let Some(bm) = &self.bm {
            bm.setup().await?;
        }

        if self.cluster.spec.restore.is_none() {
            // Restore clusters bootstrap through disaster recovery instead of
            // a seed member.
            self.prepare_seed_member().await?;
        }

        self.create_client_service_lb().await?;
        Ok(())
    }

    async fn prepare_seed_member(&mut self) -> Result<()> {
        self.status.append_scaling_up_condition(0, self.cluster.spec.size);

        match self.cluster.spec.self_hosted.clone() {
            Some(sh) => match sh.boot_member_client_endpoint {
                Some(endpoint) => self.migrate_boot_member(&endpoint).await?,
                None => self.new_self_hosted_seed_member().await?,
            },
            None => self.new_seed_member().await?,
        }

        self.status.size = 1;
        Ok(())
    }

    async fn run(mut self, mut events: mpsc::Receiver<ClusterEvent>, mut stop: watch::Receiver<bool>) {
        let mut cluster_failed = false;

        self.status.set_phase(ClusterPhase::Running);
        if let Err(err) = self.update_status().await {
            warn!(error = %err, "failed to update cluster status");
        }
        info!("start running");

        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + RECONCILE_INTERVAL,
            RECONCILE_INTERVAL,
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_err: Option<OperatorError> = None;

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                event = events.recv() => match event {
                    Some(ClusterEvent::Modify(new_cluster)) => {
                        if spec_equal(&new_cluster.spec, &self.cluster.spec) {
                            debug!("ignoring modify event with equal spec");
                        } else {
                            // A later spec wins, including over an upgrade
                            // still in flight.
                            info!(
                                size = new_cluster.spec.size,
                                version = %new_cluster.spec.version,
                                paused = new_cluster.spec.paused,
                                "spec updated"
                            );
                            self.cluster = *new_cluster;
                        }
                    }
                    Some(ClusterEvent::Delete) => {
                        info!("cluster is deleted by the user");
                        cluster_failed = true;
                        break;
                    }
                    // Every handle is gone; nothing can reach us anymore.
                    None => break,
                },
                _ = tick.tick() => {
                    let started = std::time::Instant::now();
                    let result = self.tick(last_err.is_some()).await;
                    metrics::record_reconcile(
                        &self.name,
                        result.is_ok(),
                        started.elapsed().as_secs_f64(),
                    );
                    metrics::set_member_count(&self.name, self.members.size() as f64);
                    if let Err(err) = &result {
                        error!(error = %err, "reconciliation tick failed");
                    }
                    last_err = result.err();
                }
            }

            if let Some(err) = last_err.as_ref().filter(|e| e.is_fatal()) {
                self.status.set_reason(err.to_string());
                error!(error = %err, "cluster failed");
                cluster_failed = true;
                break;
            }
        }

        if cluster_failed {
            self.report_failed_status().await;
            info!("deleting the failed cluster");
            self.teardown().await;
        }
        // Dropping the receiver closes the mailbox, which is how producers
        // observe that the controller has stopped.
    }

    async fn tick(&mut self, had_error: bool) -> Result<()> {
        if self.cluster.spec.paused {
            self.status.pause_control();
            info!("control is paused, skipping reconciliation");
            return Ok(());
        }
        self.status.control();

        let pods = match self.poll_pods().await {
            Ok(pods) => pods,
            Err(err) => {
                error!(error = %err, "failed to poll pods");
                return Ok(());
            }
        };
        let (running, pending) = resources::partition_pods(pods);

        if !pending.is_empty() {
            // Half-visible state; acting on it risks double membership changes.
            info!(
                running = ?resources::pod_names(&running),
                pending = ?resources::pod_names(&pending),
                "skipping reconciliation, pods pending"
            );
            return Ok(());
        }

        if running.is_empty() {
            warn!("all keva pods are dead, trying to recover from the latest backup");
            let result = self.disaster_recovery().await;
            metrics::record_recovery(&self.name, result.is_ok());
            return result;
        }

        // After a controller restart or an errored tick the member set may be
        // stale; rebuild it from what actually runs.
        if had_error || self.members.is_empty() {
            self.update_members(&running)?;
        }

        self.reconcile(&running).await?;

        if let Err(err) = self.update_status().await {
            warn!(error = %err, "failed to update cluster status");
        }
        Ok(())
    }

    /// List this cluster's pods, dropping any whose first owner reference does
    /// not match the cluster object (defense against cluster-name reuse).
    async fn poll_pods(&self) -> Result<Vec<Pod>> {
        let selector = resources::cluster_selector(&self.name);
        let pods = self
            .config
            .kube
            .list_pods(&self.namespace, &selector)
            .await?;
        let uid = self.cluster.uid().unwrap_or_default();

        Ok(pods
            .into_iter()
            .filter(|pod| match resources::first_owner_uid(pod) {
                None => {
                    warn!(pod = %pod.name_any(), "ignoring pod with no owner reference");
                    false
                }
                Some(owner) if owner != uid => {
                    warn!(
                        pod = %pod.name_any(),
                        owner = %owner,
                        "ignoring pod owned by another cluster incarnation"
                    );
                    false
                }
                Some(_) => true,
            })
            .collect())
    }

    /// Rebuild the member set from running pods and keep the counter ahead of
    /// every observed ordinal so restarts never hand out stale names.
    fn update_members(&mut self, running: &[Pod]) -> Result<()> {
        let mut set = MemberSet::new();
        let mut highest = 0u64;
        for pod in running {
            let name = pod.name_any();
            let Some(ordinal) = parse_member_ordinal(&self.name, &name) else {
                return Err(OperatorError::InvalidMemberName(name));
            };
            highest = highest.max(ordinal + 1);
            set.add(Member::new(
                name,
                self.namespace.clone(),
                self.cluster.spec.self_hosted.is_some(),
            ));
        }
        self.member_counter = self.member_counter.max(highest);
        debug!(
            members = ?set.names().collect::<Vec<_>>(),
            counter = self.member_counter,
            "rebuilt member set from running pods"
        );
        self.members = set;
        Ok(())
    }

    /// Persist the in-memory status when it differs from the stored object.
    ///
    /// Not-found means the object was deleted out from under us and counts as
    /// success. A version conflict refetches the object (observing external
    /// edits such as a Paused toggle) so the next attempt can succeed.
    async fn update_status(&mut self) -> Result<()> {
        if self.cluster.status.as_ref() == Some(&self.status) {
            return Ok(());
        }

        let mut updated = self.cluster.clone();
        updated.status = Some(self.status.clone());

        match self.config.kube.update_cluster_status(&updated).await {
            Ok(persisted) => {
                self.cluster = persisted;
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) if err.is_conflict() => {
                match self
                    .config
                    .kube
                    .get_cluster(&self.namespace, &self.name)
                    .await
                {
                    Ok(latest) => {
                        self.cluster = latest;
                        Err(err)
                    }
                    Err(get_err) if get_err.is_not_found() => Ok(()),
                    Err(get_err) => {
                        warn!(error = %get_err, "failed to refetch cluster after conflict");
                        Err(err)
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Terminal status visibility matters to operators: retry until the write
    /// lands or the object is gone.
    async fn report_failed_status(&mut self) {
        info!("reporting terminal failed status");
        loop {
            self.status.set_phase(ClusterPhase::Failed);
            match self.update_status().await {
                Ok(()) => return,
                Err(err) => {
                    warn!(error = %err, "failed to report failed status, will retry");
                }
            }
            tokio::time::sleep(FAILED_STATUS_RETRY).await;
        }
    }

    async fn teardown(&mut self) {
        self.gc.collect_cluster(&self.name, crate::gc::NULL_UID).await;
        if let Some(bm) = &self.bm {
            if let Err(err) = bm.cleanup().await {
                error!(error = %err, "backup manager failed to cleanup");
            }
        }
    }

    fn make_seed_member(&self) -> Member {
        Member::new(
            member_name(&self.name, self.member_counter),
            self.namespace.clone(),
            self.cluster.spec.self_hosted.is_some(),
        )
    }

    async fn start_seed_member(&mut self, recover_from_backup: bool) -> Result<()> {
        let member = self.make_seed_member();
        let members = MemberSet::with(member.clone());
        self.create_pod_and_service(
            &members.peer_url_pairs(),
            &member,
            "new",
            recover_from_backup,
        )
        .await?;
        self.member_counter += 1;
        self.members = members;
        info!(member = %member.name, "cluster created with seed member");
        Ok(())
    }

    async fn new_seed_member(&mut self) -> Result<()> {
        self.start_seed_member(false).await
    }

    pub(crate) async fn restore_seed_member(&mut self) -> Result<()> {
        self.start_seed_member(true).await
    }

    /// Self-hosted seed: the pod must actually come up before bootstrap can
    /// continue, since the cluster it joins is backed by itself.
    async fn new_self_hosted_seed_member(&mut self) -> Result<()> {
        self.start_seed_member(false).await?;
        let seed = self
            .members
            .names()
            .next()
            .expect("seed member was just added")
            .to_string();
        self.wait_seed_running(&seed).await
    }

    async fn wait_seed_running(&self, member: &str) -> Result<()> {
        for _ in 0..SELF_HOSTED_BOOT_ATTEMPTS {
            let pods = self.poll_pods().await?;
            if let Some(pod) = pods.iter().find(|p| p.name_any() == member) {
                match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
                    Some("Running") => return Ok(()),
                    Some("Pending") | None => {}
                    _ => {
                        return Err(OperatorError::UnexpectedUnreadyMember(member.to_string()));
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Err(OperatorError::UnexpectedUnreadyMember(member.to_string()))
    }

    /// Move an existing external boot member into the managed pool: register
    /// a managed member with the external cluster, start its pod against the
    /// reported membership, then evict the external members.
    async fn migrate_boot_member(&mut self, endpoint: &str) -> Result<()> {
        info!(endpoint = %endpoint, "migrating boot member into the managed pool");
        let member = self.make_seed_member();
        let endpoints = vec![endpoint.to_string()];

        self.config
            .replica
            .add_member(&endpoints, &member.peer_url())
            .await?;

        let reported = self.config.replica.list_members(&endpoints).await?;
        let mut pairs: Vec<String> = reported
            .iter()
            .map(|m| format!("{}={}", m.name, m.peer_url))
            .collect();
        if !reported.iter().any(|m| m.name == member.name) {
            pairs.push(format!("{}={}", member.name, member.peer_url()));
        }

        self.create_pod_and_service(&pairs, &member, "existing", false)
            .await?;

        for external in reported.iter().filter(|m| m.name != member.name) {
            self.config
                .replica
                .remove_member(&endpoints, &external.name)
                .await?;
        }

        self.member_counter += 1;
        self.members = MemberSet::with(member.clone());
        info!(member = %member.name, "boot member migrated");
        Ok(())
    }

    async fn create_client_service_lb(&self) -> Result<()> {
        let service = resources::client_lb_service(
            &self.name,
            resources::cluster_owner_reference(&self.cluster),
        );
        match self.config.kube.create_service(&self.namespace, &service).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_already_exists() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Create a member pod and its sibling service.
    ///
    /// The service is owned by the pod, not the cluster, so pod deletion
    /// garbage-collects the service with it. Two partial-failure cases are
    /// tolerated: (1) pod created but service not, where the liveness probe
    /// will eventually fail the pod and reconciliation recreates both; (2) a
    /// service owned by a prior pod still waiting for GC, which converges to
    /// case 1 once the collector runs.
    pub(crate) async fn create_pod_and_service(
        &self,
        initial_cluster: &[String],
        member: &Member,
        state: &str,
        need_recovery: bool,
    ) -> Result<()> {
        let token = if state == "new" {
            Some(Uuid::new_v4().to_string())
        } else {
            None
        };

        let mut pod = resources::member_pod(
            member,
            initial_cluster,
            &self.name,
            state,
            token.as_deref(),
            &self.cluster.spec.version,
            resources::cluster_owner_reference(&self.cluster),
        );
        if need_recovery {
            resources::add_recovery_to_pod(
                &mut pod,
                &resources::backup_service_addr(&self.name, &self.namespace),
                member,
                &self.cluster.spec.version,
            );
        }

        let created = self.config.kube.create_pod(&self.namespace, &pod).await?;

        let service = resources::member_service(
            &member.name,
            &self.name,
            resources::pod_owner_reference(&created),
        );
        match self.config.kube.create_service(&self.namespace, &service).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_already_exists() => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub(crate) async fn remove_pod_and_service(&self, name: &str) -> Result<()> {
        match self.config.kube.delete_service(&self.namespace, name).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        match self
            .config
            .kube
            .delete_pod(&self.namespace, name, POD_TERMINATION_GRACE_SECS)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}
