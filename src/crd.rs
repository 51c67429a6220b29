//! Custom Resource Definition for keva clusters.

use chrono::Utc;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, Result};

/// Conditions older than this are dropped from the status timeline.
const MAX_CONDITION_HISTORY: usize = 10;

/// KevaCluster represents a replicated keva key-value cluster.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "keva.io",
    version = "v1alpha1",
    kind = "KevaCluster",
    plural = "kevaclusters",
    shortname = "kc",
    status = "KevaClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Size","type":"integer","jsonPath":".status.size"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KevaClusterSpec {
    /// Desired number of members.
    pub size: i32,

    /// keva version to run.
    #[serde(default = "default_version")]
    pub version: String,

    /// Suspend reconciliation while keeping the cluster running.
    #[serde(default)]
    pub paused: bool,

    /// Periodic backup policy.
    #[serde(default)]
    pub backup: Option<BackupPolicy>,

    /// Bootstrap this cluster from an existing backup instead of a seed member.
    #[serde(default)]
    pub restore: Option<RestorePolicy>,

    /// Self-hosted deployment mode.
    #[serde(default)]
    pub self_hosted: Option<SelfHostedPolicy>,
}

fn default_version() -> String {
    "3.1.0".to_string()
}

impl KevaClusterSpec {
    /// Validate the declared spec. An invalid spec is fatal at setup.
    pub fn validate(&self) -> Result<()> {
        if self.size < 1 {
            return Err(OperatorError::InvalidSpec(format!(
                "size must be at least 1, got {}",
                self.size
            )));
        }
        if self.version.is_empty() {
            return Err(OperatorError::InvalidSpec("version must not be empty".into()));
        }
        if self.restore.is_some() && self.backup.is_none() {
            return Err(OperatorError::InvalidSpec(
                "restore requires a backup policy".into(),
            ));
        }
        if let Some(backup) = &self.backup {
            if backup.max_backups < 0 {
                return Err(OperatorError::InvalidSpec(format!(
                    "maxBackups must not be negative, got {}",
                    backup.max_backups
                )));
            }
            if let BackupStorage::ObjectStore { bucket, .. } = &backup.storage {
                if bucket.is_empty() {
                    return Err(OperatorError::InvalidSpec(
                        "object store backup requires a bucket".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Whether two specs are equal in the dimensions the reconcile loop reacts to.
///
/// Backup, restore, and self-hosted settings are fixed at setup and take
/// effect on the next controller restart; a Modify event that only touches
/// them is ignored.
pub fn spec_equal(a: &KevaClusterSpec, b: &KevaClusterSpec) -> bool {
    a.size == b.size && a.paused == b.paused && a.version == b.version
}

/// Backup policy for a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicy {
    /// Maximum number of snapshots to keep. Zero disables the backup manager.
    #[serde(default)]
    pub max_backups: i32,

    /// Seconds between snapshots taken by the backup sidecar.
    #[serde(default = "default_backup_interval")]
    pub interval_secs: i64,

    /// Where snapshots are stored.
    #[serde(default)]
    pub storage: BackupStorage,
}

fn default_backup_interval() -> i64 {
    1800
}

/// Snapshot storage backend.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum BackupStorage {
    /// Snapshots on a persistent volume attached to the backup sidecar.
    PersistentVolume {
        #[serde(default = "default_volume_size")]
        volume_size_gib: i32,
    },
    /// Snapshots in an S3-compatible object store.
    ObjectStore {
        bucket: String,
        #[serde(default)]
        prefix: String,
    },
}

fn default_volume_size() -> i32 {
    1
}

impl Default for BackupStorage {
    fn default() -> Self {
        BackupStorage::PersistentVolume {
            volume_size_gib: default_volume_size(),
        }
    }
}

/// Restore source for a cluster bootstrapped through disaster recovery.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestorePolicy {
    /// Name of the cluster whose backups to restore from.
    pub backup_cluster_name: String,
}

/// Self-hosted deployment mode configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelfHostedPolicy {
    /// Client endpoint of an existing external boot member to migrate into
    /// the managed pool. When unset, a fresh self-hosted seed is created.
    #[serde(default)]
    pub boot_member_client_endpoint: Option<String>,
}

/// Lifecycle phase of a cluster. Transitions are monotone along
/// `None -> Creating -> Running -> Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterPhase {
    #[default]
    None,
    Creating,
    Running,
    Failed,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClusterPhase::None => "None",
            ClusterPhase::Creating => "Creating",
            ClusterPhase::Running => "Running",
            ClusterPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// One entry in the cluster's condition timeline.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub reason: String,
    pub transition_time: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    ScalingUp,
    ScalingDown,
    Upgrading,
    Recovering,
}

/// Ready and unready member names as observed on the last tick.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MembersStatus {
    #[serde(default)]
    pub ready: Vec<String>,
    #[serde(default)]
    pub unready: Vec<String>,
}

/// Observed status of a KevaCluster. Once the controller is materialized its
/// in-memory copy is the source of truth and is written back on change.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KevaClusterStatus {
    /// Current phase.
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Human-readable reason for the current phase, set on failure.
    #[serde(default)]
    pub reason: String,

    /// Whether reconciliation is currently paused.
    #[serde(default)]
    pub control_paused: bool,

    /// Observed member count.
    #[serde(default)]
    pub size: i32,

    /// Version the members currently run.
    #[serde(default)]
    pub current_version: String,

    /// Version an in-flight upgrade is moving to.
    #[serde(default)]
    pub target_version: Option<String>,

    #[serde(default)]
    pub members: MembersStatus,

    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
}

impl KevaClusterStatus {
    pub fn set_phase(&mut self, phase: ClusterPhase) {
        self.phase = phase;
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = reason.into();
    }

    pub fn control(&mut self) {
        self.control_paused = false;
    }

    pub fn pause_control(&mut self) {
        self.control_paused = true;
    }

    pub fn set_version(&mut self, version: &str) {
        self.current_version = version.to_string();
        self.target_version = None;
    }

    pub fn upgrade_version_to(&mut self, version: &str) {
        self.target_version = Some(version.to_string());
    }

    pub fn set_members(&mut self, ready: Vec<String>, unready: Vec<String>) {
        self.members = MembersStatus { ready, unready };
    }

    pub fn append_scaling_up_condition(&mut self, from: i32, to: i32) {
        self.append_condition(
            ConditionType::ScalingUp,
            format!("scaling cluster from {} to {} members", from, to),
        );
    }

    pub fn append_scaling_down_condition(&mut self, from: i32, to: i32) {
        self.append_condition(
            ConditionType::ScalingDown,
            format!("scaling cluster from {} to {} members", from, to),
        );
    }

    pub fn append_upgrading_condition(&mut self, version: &str, member: &str) {
        self.append_condition(
            ConditionType::Upgrading,
            format!("upgrading member {} to version {}", member, version),
        );
    }

    pub fn append_recovering_condition(&mut self) {
        self.append_condition(
            ConditionType::Recovering,
            "recovering cluster from existing backup".to_string(),
        );
    }

    fn append_condition(&mut self, condition_type: ConditionType, reason: String) {
        self.conditions.push(ClusterCondition {
            condition_type,
            reason,
            transition_time: Utc::now().to_rfc3339(),
        });
        if self.conditions.len() > MAX_CONDITION_HISTORY {
            let drop = self.conditions.len() - MAX_CONDITION_HISTORY;
            self.conditions.drain(..drop);
        }
    }
}
