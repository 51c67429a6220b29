//! Member reconciliation.
//!
//! Each tick diffs the declared size and version against the live member set
//! and applies at most one membership mutation, so the worst-case disruption
//! per tick is bounded and the next poll observes the effect before the next
//! decision.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::ClusterInner;
use crate::crd::KevaClusterSpec;
use crate::error::Result;
use crate::member::{member_name, Member, MemberSet};
use crate::resources;

/// The single change a tick is allowed to make, first applicable wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum ReconcileAction {
    /// A member's pod disappeared; evict the membership before anything else
    /// so quorum math stays honest.
    RemoveDeadMember(String),
    AddMember,
    RemoveMember(String),
    UpgradeMember(String),
    Noop,
}

pub(super) fn plan(
    cluster_name: &str,
    members: &MemberSet,
    running: &[Pod],
    spec: &KevaClusterSpec,
) -> ReconcileAction {
    let running_names: BTreeSet<String> = running.iter().map(|p| p.name_any()).collect();

    if let Some(dead) = members.names().find(|name| !running_names.contains(*name)) {
        return ReconcileAction::RemoveDeadMember(dead.to_string());
    }

    let size = members.size() as i32;
    if size < spec.size {
        return ReconcileAction::AddMember;
    }
    if size > spec.size {
        if let Some(victim) = members.highest_ordinal_member(cluster_name) {
            return ReconcileAction::RemoveMember(victim.name.clone());
        }
    }

    // Scale operations precede upgrades. Ties among outdated members are
    // broken by name order.
    let mut sorted: Vec<&Pod> = running.iter().collect();
    sorted.sort_by_key(|p| p.name_any());
    for pod in sorted {
        let name = pod.name_any();
        if !members.contains(&name) {
            continue;
        }
        if resources::pod_version(pod).is_some_and(|v| v != spec.version) {
            return ReconcileAction::UpgradeMember(name);
        }
    }

    ReconcileAction::Noop
}

impl ClusterInner {
    pub(super) async fn reconcile(&mut self, running: &[Pod]) -> Result<()> {
        debug!("start reconciling");

        let action = plan(&self.name, &self.members, running, &self.cluster.spec);
        match action {
            ReconcileAction::RemoveDeadMember(name) => {
                warn!(member = %name, "member pod is gone, evicting membership");
                self.remove_member(&name).await?;
            }
            ReconcileAction::AddMember => self.add_one_member().await?,
            ReconcileAction::RemoveMember(name) => {
                self.status.append_scaling_down_condition(
                    self.members.size() as i32,
                    self.cluster.spec.size,
                );
                self.remove_member(&name).await?;
                info!(member = %name, "removed one member");
            }
            ReconcileAction::UpgradeMember(name) => self.upgrade_one_member(&name).await?,
            ReconcileAction::Noop => {
                self.status.set_version(&self.cluster.spec.version);
            }
        }

        self.refresh_member_status(running);
        debug!("finish reconciling");
        Ok(())
    }

    fn refresh_member_status(&mut self, running: &[Pod]) {
        let running_names: BTreeSet<String> = running.iter().map(|p| p.name_any()).collect();
        let mut ready = Vec::new();
        let mut unready = Vec::new();
        for name in self.members.names() {
            if running_names.contains(name) {
                ready.push(name.to_string());
            } else {
                unready.push(name.to_string());
            }
        }
        self.status.set_members(ready, unready);
        self.status.size = self.members.size() as i32;
    }

    async fn add_one_member(&mut self) -> Result<()> {
        let member = Member::new(
            member_name(&self.name, self.member_counter),
            self.namespace.clone(),
            self.cluster.spec.self_hosted.is_some(),
        );
        self.status
            .append_scaling_up_condition(self.members.size() as i32, self.cluster.spec.size);

        self.config
            .replica
            .add_member(&self.members.client_urls(), &member.peer_url())
            .await?;

        // Registered before the pod exists: if the pod create below fails,
        // the next tick sees a member without a pod and evicts it.
        self.members.add(member.clone());

        self.create_pod_and_service(&self.members.peer_url_pairs(), &member, "existing", false)
            .await?;
        self.member_counter += 1;
        info!(member = %member.name, "added one member");
        Ok(())
    }

    async fn remove_member(&mut self, name: &str) -> Result<()> {
        // Membership first: a member gone from the replica cluster stops
        // counting toward quorum even if its pod lingers.
        let endpoints = self.members.client_urls_except(name);
        if endpoints.is_empty() {
            warn!(member = %name, "no remaining endpoints to evict member through");
        } else {
            self.config.replica.remove_member(&endpoints, name).await?;
        }
        self.members.remove(name);
        self.remove_pod_and_service(name).await?;
        Ok(())
    }

    async fn upgrade_one_member(&mut self, name: &str) -> Result<()> {
        let version = self.cluster.spec.version.clone();
        let Some(member) = self.members.get(name).cloned() else {
            return Ok(());
        };
        self.status.upgrade_version_to(&version);
        self.status.append_upgrading_condition(&version, name);
        info!(member = %name, version = %version, "upgrading member");

        self.remove_pod_and_service(name).await?;
        self.create_pod_and_service(&self.members.peer_url_pairs(), &member, "existing", false)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(size: i32, version: &str) -> KevaClusterSpec {
        KevaClusterSpec {
            size,
            version: version.to_string(),
            paused: false,
            backup: None,
            restore: None,
            self_hosted: None,
        }
    }

    fn running_pod(name: &str, version: &str) -> Pod {
        let member = Member::new(name.to_string(), "default".to_string(), false);
        resources::member_pod(
            &member,
            &[],
            "demo",
            "existing",
            None,
            version,
            Default::default(),
        )
    }

    fn members(names: &[&str]) -> MemberSet {
        let mut set = MemberSet::new();
        for name in names {
            set.add(Member::new(name.to_string(), "default".to_string(), false));
        }
        set
    }

    #[test]
    fn dead_member_takes_priority_over_scaling() {
        // Three members, one pod missing, and the spec asks for five: the
        // partitioned member must be evicted before any scale-up.
        let set = members(&["demo-0000", "demo-0001", "demo-0002"]);
        let running = vec![
            running_pod("demo-0000", "3.1.0"),
            running_pod("demo-0002", "3.1.0"),
        ];
        assert_eq!(
            plan("demo", &set, &running, &spec(5, "3.1.0")),
            ReconcileAction::RemoveDeadMember("demo-0001".to_string())
        );
    }

    #[test]
    fn scale_up_when_below_spec() {
        let set = members(&["demo-0000"]);
        let running = vec![running_pod("demo-0000", "3.1.0")];
        assert_eq!(
            plan("demo", &set, &running, &spec(3, "3.1.0")),
            ReconcileAction::AddMember
        );
    }

    #[test]
    fn scale_down_removes_highest_ordinal() {
        let set = members(&["demo-0000", "demo-0001", "demo-0004"]);
        let running = vec![
            running_pod("demo-0000", "3.1.0"),
            running_pod("demo-0001", "3.1.0"),
            running_pod("demo-0004", "3.1.0"),
        ];
        assert_eq!(
            plan("demo", &set, &running, &spec(2, "3.1.0")),
            ReconcileAction::RemoveMember("demo-0004".to_string())
        );
    }

    #[test]
    fn scaling_precedes_upgrade() {
        // One member is outdated but the cluster is also undersized; the
        // scale-up wins the tick.
        let set = members(&["demo-0000", "demo-0001"]);
        let running = vec![
            running_pod("demo-0000", "3.0.0"),
            running_pod("demo-0001", "3.1.0"),
        ];
        assert_eq!(
            plan("demo", &set, &running, &spec(3, "3.1.0")),
            ReconcileAction::AddMember
        );
    }

    #[test]
    fn upgrade_picks_first_outdated_by_name() {
        let set = members(&["demo-0000", "demo-0001", "demo-0002"]);
        let running = vec![
            running_pod("demo-0002", "3.0.0"),
            running_pod("demo-0000", "3.1.0"),
            running_pod("demo-0001", "3.0.0"),
        ];
        assert_eq!(
            plan("demo", &set, &running, &spec(3, "3.1.0")),
            ReconcileAction::UpgradeMember("demo-0001".to_string())
        );
    }

    #[test]
    fn steady_state_is_noop() {
        let set = members(&["demo-0000", "demo-0001", "demo-0002"]);
        let running = vec![
            running_pod("demo-0000", "3.1.0"),
            running_pod("demo-0001", "3.1.0"),
            running_pod("demo-0002", "3.1.0"),
        ];
        assert_eq!(
            plan("demo", &set, &running, &spec(3, "3.1.0")),
            ReconcileAction::Noop
        );
    }

    #[test]
    fn size_one_cluster_never_scales() {
        let set = members(&["demo-0000"]);
        let running = vec![running_pod("demo-0000", "3.1.0")];
        assert_eq!(
            plan("demo", &set, &running, &spec(1, "3.1.0")),
            ReconcileAction::Noop
        );
    }
}
