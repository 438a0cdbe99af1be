//! Desired shapes of the resources managed for a cluster.

use std::collections::BTreeMap;

use raycon_id::{
    head_pod_name, head_service_name, node_identifier, role_binding_name, worker_pod_name,
    NodeType, HEAD_GROUP, LABEL_CLUSTER, LABEL_GROUP, LABEL_IDENTIFIER, LABEL_NODE_TYPE,
};

use crate::model::{
    Cluster, ObjectMeta, Pod, PodStatus, PodTemplate, RoleBinding, RoleRef, Service, ServicePort,
    ServiceSpec, Subject, WorkerGroupSpec,
};
use crate::store::LabelSelector;

/// Annotation carrying the rendered start command.
pub const ANNOTATION_START_COMMAND: &str = "ray.io/start-command";

pub const DEFAULT_GCS_PORT: u16 = 6379;
pub const DEFAULT_DASHBOARD_PORT: u16 = 8265;
pub const DEFAULT_CLIENT_PORT: u16 = 10001;

const PARAM_PORT: &str = "port";
const PARAM_DASHBOARD_PORT: &str = "dashboard-port";
const PARAM_CLIENT_PORT: &str = "ray-client-server-port";
const PARAM_ADDRESS: &str = "address";

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

// =============================================================================
// Labels and selectors
// =============================================================================

pub fn pod_labels(cluster: &str, group: &str, node_type: NodeType) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster.to_string()),
        (LABEL_GROUP.to_string(), group.to_string()),
        (LABEL_NODE_TYPE.to_string(), node_type.to_string()),
        (
            LABEL_IDENTIFIER.to_string(),
            node_identifier(cluster, node_type),
        ),
    ])
}

/// Selects every pod of a cluster.
pub fn cluster_selector(cluster: &str) -> LabelSelector {
    LabelSelector::new().with(LABEL_CLUSTER, cluster)
}

// =============================================================================
// Pods
// =============================================================================

/// A new head pod with a fresh name.
pub fn head_pod(cluster: &Cluster) -> Pod {
    let head = &cluster.spec.head_group_spec;
    let command = start_command(NodeType::Head, &head.ray_start_params, None);
    build_pod(
        cluster,
        head_pod_name(cluster.name()),
        HEAD_GROUP,
        NodeType::Head,
        &head.template,
        command,
    )
}

/// A new worker pod for `group` with a fresh name.
pub fn worker_pod(cluster: &Cluster, group: &WorkerGroupSpec) -> Pod {
    let address = format!(
        "{}.{}.svc.cluster.local:{}",
        head_service_name(cluster.name()),
        cluster.namespace(),
        gcs_port(cluster)
    );
    let command = start_command(NodeType::Worker, &group.ray_start_params, Some(&address));
    build_pod(
        cluster,
        worker_pod_name(cluster.name(), &group.group_name),
        &group.group_name,
        NodeType::Worker,
        &group.template,
        command,
    )
}

fn build_pod(
    cluster: &Cluster,
    name: String,
    group: &str,
    node_type: NodeType,
    template: &PodTemplate,
    command: String,
) -> Pod {
    let mut metadata = ObjectMeta::new(cluster.namespace(), name);

    // Controller labels win over template labels.
    metadata.labels = template.metadata.labels.clone();
    metadata
        .labels
        .extend(pod_labels(cluster.name(), group, node_type));

    metadata.annotations = template.metadata.annotations.clone();
    metadata
        .annotations
        .insert(ANNOTATION_START_COMMAND.to_string(), command);

    metadata.owner_references.push(cluster.owner_reference());

    Pod {
        metadata,
        spec: template.spec.clone(),
        status: PodStatus::default(),
    }
}

/// Renders `ray start` with params in key order.
fn start_command(
    node_type: NodeType,
    params: &BTreeMap<String, String>,
    head_address: Option<&str>,
) -> String {
    let mut args = vec!["ray".to_string(), "start".to_string()];
    match (node_type, head_address) {
        (NodeType::Head, _) => args.push("--head".to_string()),
        (NodeType::Worker, Some(address)) => args.push(format!("--{PARAM_ADDRESS}={address}")),
        (NodeType::Worker, None) => {}
    }

    for (key, value) in params {
        if node_type == NodeType::Worker && (key == PARAM_PORT || key == PARAM_ADDRESS) {
            continue;
        }
        args.push(format!("--{key}={value}"));
    }

    args.push("--block".to_string());
    args.join(" ")
}

// =============================================================================
// Head service
// =============================================================================

pub fn head_service(cluster: &Cluster) -> Service {
    let params = &cluster.spec.head_group_spec.ray_start_params;
    let mut metadata = ObjectMeta::new(cluster.namespace(), head_service_name(cluster.name()));
    metadata
        .labels
        .insert(LABEL_CLUSTER.to_string(), cluster.name().to_string());
    metadata.owner_references.push(cluster.owner_reference());

    Service {
        metadata,
        spec: ServiceSpec {
            selector: BTreeMap::from([(
                LABEL_IDENTIFIER.to_string(),
                node_identifier(cluster.name(), NodeType::Head),
            )]),
            ports: vec![
                ServicePort {
                    name: "gcs".to_string(),
                    port: gcs_port(cluster),
                },
                ServicePort {
                    name: "dashboard".to_string(),
                    port: port_param(params, PARAM_DASHBOARD_PORT, DEFAULT_DASHBOARD_PORT),
                },
                ServicePort {
                    name: "client".to_string(),
                    port: port_param(params, PARAM_CLIENT_PORT, DEFAULT_CLIENT_PORT),
                },
            ],
        },
    }
}

fn gcs_port(cluster: &Cluster) -> u16 {
    port_param(
        &cluster.spec.head_group_spec.ray_start_params,
        PARAM_PORT,
        DEFAULT_GCS_PORT,
    )
}

fn port_param(params: &BTreeMap<String, String>, key: &str, default: u16) -> u16 {
    params
        .get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

// =============================================================================
// Autoscaler role binding
// =============================================================================

pub fn role_binding(cluster: &Cluster) -> RoleBinding {
    let name = role_binding_name(cluster.name());
    let mut metadata = ObjectMeta::new(cluster.namespace(), name.clone());
    metadata
        .labels
        .insert(LABEL_CLUSTER.to_string(), cluster.name().to_string());
    metadata.owner_references.push(cluster.owner_reference());

    RoleBinding {
        metadata,
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: cluster.namespace().to_string(),
        }],
    }
}
