//! Pod and service manifests plus pod polling helpers.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, Pod, PodSpec, Probe, Service, ServicePort,
    ServiceSpec, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::crd::KevaCluster;
use crate::member::{Member, CLIENT_PORT, PEER_PORT};

const APP_LABEL: &str = "app";
const APP_NAME: &str = "keva";
const CLUSTER_LABEL: &str = "keva_cluster";
const MEMBER_LABEL: &str = "keva_member";

const DATA_VOLUME: &str = "keva-data";
const DATA_DIR: &str = "/var/keva/data";

/// Port the backup sidecar service listens on.
pub const BACKUP_SIDECAR_PORT: i32 = 19999;

pub fn keva_image(version: &str) -> String {
    format!("quay.io/keva/keva:v{}", version)
}

/// Version encoded in the keva container image of a member pod.
pub fn pod_version(pod: &Pod) -> Option<&str> {
    let image = pod
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .as_deref()?;
    image.rsplit_once(":v").map(|(_, v)| v)
}

/// Label selector matching all resources owned by a cluster.
pub fn cluster_selector(cluster_name: &str) -> String {
    format!("{}={},{}={}", APP_LABEL, APP_NAME, CLUSTER_LABEL, cluster_name)
}

fn member_labels(cluster_name: &str, member_name: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster_name);
    labels.insert(MEMBER_LABEL.to_string(), member_name.to_string());
    labels
}

fn cluster_labels(cluster_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), APP_NAME.to_string());
    labels.insert(CLUSTER_LABEL.to_string(), cluster_name.to_string());
    labels
}

/// Owner reference pointing at the cluster object.
pub fn cluster_owner_reference(cluster: &KevaCluster) -> OwnerReference {
    OwnerReference {
        api_version: KevaCluster::api_version(&()).to_string(),
        kind: KevaCluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Owner reference pointing at a member pod. Member services are owned by
/// their pod so deleting the pod garbage-collects the service with it.
pub fn pod_owner_reference(pod: &Pod) -> OwnerReference {
    OwnerReference {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        name: pod.name_any(),
        uid: pod.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: None,
    }
}

/// UID of the pod's first owner reference, if any.
pub fn first_owner_uid(pod: &Pod) -> Option<&str> {
    pod.metadata
        .owner_references
        .as_ref()?
        .first()
        .map(|r| r.uid.as_str())
}

/// Split pods into running and pending by phase; other phases are dropped.
pub fn partition_pods(pods: Vec<Pod>) -> (Vec<Pod>, Vec<Pod>) {
    let mut running = Vec::new();
    let mut pending = Vec::new();
    for pod in pods {
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Running") => running.push(pod),
            Some("Pending") => pending.push(pod),
            _ => {}
        }
    }
    (running, pending)
}

pub fn pod_names(pods: &[Pod]) -> Vec<String> {
    pods.iter().map(|p| p.name_any()).collect()
}

/// Manifest for one member pod.
///
/// The cluster token is only set for `state="new"` members (seed and disaster
/// recovery); members joining an existing cluster inherit its identity.
pub fn member_pod(
    member: &Member,
    initial_cluster: &[String],
    cluster_name: &str,
    state: &str,
    token: Option<&str>,
    version: &str,
    owner: OwnerReference,
) -> Pod {
    let mut command = vec![
        "/usr/local/bin/keva".to_string(),
        format!("--name={}", member.name),
        format!("--data-dir={}", DATA_DIR),
        format!("--listen-peer-urls=http://0.0.0.0:{}", PEER_PORT),
        format!("--listen-client-urls=http://0.0.0.0:{}", CLIENT_PORT),
        format!("--initial-advertise-peer-urls={}", member.peer_url()),
        format!("--advertise-client-urls={}", member.client_url()),
        format!("--initial-cluster={}", initial_cluster.join(",")),
        format!("--initial-cluster-state={}", state),
    ];
    if let Some(token) = token {
        command.push(format!("--initial-cluster-token={}", token));
    }

    let container = Container {
        name: APP_NAME.to_string(),
        image: Some(keva_image(version)),
        command: Some(command),
        ports: Some(vec![
            ContainerPort {
                name: Some("client".to_string()),
                container_port: CLIENT_PORT,
                ..Default::default()
            },
            ContainerPort {
                name: Some("peer".to_string()),
                container_port: PEER_PORT,
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: DATA_DIR.to_string(),
            ..Default::default()
        }]),
        liveness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(CLIENT_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(10),
            period_seconds: Some(10),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(member.name.clone()),
            namespace: Some(member.namespace.clone()),
            labels: Some(member_labels(cluster_name, &member.name)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            // The controller owns member lifecycle; a dead member is replaced
            // through reconciliation, not restarted in place.
            restart_policy: Some("Never".to_string()),
            // Self-hosted members run on the node network so the cluster they
            // back stays reachable while the managed pool bootstraps.
            host_network: if member.self_hosted { Some(true) } else { None },
            volumes: Some(vec![Volume {
                name: DATA_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Inject the restore init container that seeds the data directory from the
/// latest snapshot before the member process starts.
pub fn add_recovery_to_pod(pod: &mut Pod, backup_addr: &str, member: &Member, version: &str) {
    let restore = Container {
        name: "restore-datadir".to_string(),
        image: Some(keva_image(version)),
        command: Some(vec![
            "/usr/local/bin/keva-restore".to_string(),
            format!("--backup-addr={}", backup_addr),
            format!("--member={}", member.name),
            format!("--data-dir={}", DATA_DIR),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: DATA_DIR.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    if let Some(spec) = pod.spec.as_mut() {
        spec.init_containers.get_or_insert_with(Vec::new).push(restore);
    }
}

/// Manifest for a member's sibling service, owned by the member pod.
pub fn member_service(member_name: &str, cluster_name: &str, owner: OwnerReference) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(member_name.to_string()),
            labels: Some(member_labels(cluster_name, member_name)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some({
                let mut sel = BTreeMap::new();
                sel.insert(MEMBER_LABEL.to_string(), member_name.to_string());
                sel
            }),
            ports: Some(vec![
                ServicePort {
                    name: Some("client".to_string()),
                    port: CLIENT_PORT,
                    ..Default::default()
                },
                ServicePort {
                    name: Some("peer".to_string()),
                    port: PEER_PORT,
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Manifest for the cluster-wide client load-balancer service.
pub fn client_lb_service(cluster_name: &str, owner: OwnerReference) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(format!("{}-client", cluster_name)),
            labels: Some(cluster_labels(cluster_name)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(cluster_labels(cluster_name)),
            ports: Some(vec![ServicePort {
                name: Some("client".to_string()),
                port: CLIENT_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Address of the backup sidecar service for a cluster.
pub fn backup_service_addr(cluster_name: &str, namespace: &str) -> String {
    format!(
        "http://{}-backup.{}.svc:{}",
        cluster_name, namespace, BACKUP_SIDECAR_PORT
    )
}
