use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use raycon_id::ClusterKey;
use raycon_reconcile::{ReconcileError, ReplicaBounds};
use serde::{Deserialize, Serialize};

use super::{ObjectMeta, OwnerReference, PodTemplate};

pub const API_VERSION: &str = "ray.io/v1";
pub const CLUSTER_KIND: &str = "RayCluster";

/// The cluster object: desired state plus controller-owned status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub metadata: ObjectMeta,
    pub spec: ClusterSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ClusterStatus>,
}

impl Cluster {
    pub fn new(namespace: &str, name: &str, spec: ClusterSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: None,
        }
    }

    pub fn key(&self) -> ClusterKey {
        ClusterKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// Controller owner reference stamped on every managed resource.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: CLUSTER_KIND.to_string(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.clone(),
            controller: true,
        }
    }

    pub fn worker_group(&self, name: &str) -> Option<&WorkerGroupSpec> {
        self.spec
            .worker_group_specs
            .iter()
            .find(|g| g.group_name == name)
    }
}

/// Desired state. Externally written; read-only to the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// When true every head and worker pod is removed.
    #[serde(default)]
    pub suspend: bool,

    /// Provision the role binding the in-cluster autoscaler runs under.
    #[serde(default)]
    pub enable_in_tree_autoscaling: bool,

    pub head_group_spec: HeadGroupSpec,

    #[serde(default)]
    pub worker_group_specs: Vec<WorkerGroupSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadGroupSpec {
    #[serde(default)]
    pub ray_start_params: BTreeMap<String, String>,

    #[serde(default)]
    pub template: PodTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerGroupSpec {
    /// Unique within the cluster.
    pub group_name: String,

    /// Requested count. Absent means `minReplicas`.
    #[serde(default)]
    pub replicas: Option<i32>,

    /// Absent means 0.
    #[serde(default)]
    pub min_replicas: Option<i32>,

    /// Absent means unbounded.
    #[serde(default)]
    pub max_replicas: Option<i32>,

    #[serde(default)]
    pub ray_start_params: BTreeMap<String, String>,

    #[serde(default)]
    pub template: PodTemplate,

    #[serde(default)]
    pub scale_strategy: ScaleStrategy,
}

impl WorkerGroupSpec {
    pub fn bounds(&self) -> Result<ReplicaBounds, ReconcileError> {
        ReplicaBounds::new(self.min_replicas, self.max_replicas)
    }

    /// The clamped replica target.
    pub fn target(&self) -> Result<u32, ReconcileError> {
        Ok(self.bounds()?.clamp(self.replicas))
    }
}

/// Scale directives written by the external autoscaler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleStrategy {
    /// Pods to remove first when scaling down, in order. Advisory: never
    /// honored below the target count, and cleared by the autoscaler.
    #[serde(default)]
    pub workers_to_delete: Vec<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Externally visible cluster state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    Ready,
    Suspended,
    Failed,
    #[default]
    Unknown,
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClusterState::Ready => "ready",
            ClusterState::Suspended => "suspended",
            ClusterState::Failed => "failed",
            ClusterState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Derived status, written only by the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub state: ClusterState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default)]
    pub desired_worker_replicas: u32,

    #[serde(default)]
    pub available_worker_replicas: u32,

    #[serde(default)]
    pub worker_groups: Vec<GroupStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<HeadInfo>,

    /// Set once the autoscaler role binding has been created; the binding
    /// is not recreated after that.
    #[serde(default)]
    pub autoscaler_role_binding_provisioned: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

impl ClusterStatus {
    /// Equal in everything but `last_update_time`.
    pub fn same_as(&self, other: &ClusterStatus) -> bool {
        let mut a = self.clone();
        a.last_update_time = other.last_update_time;
        a == *other
    }

    pub fn group(&self, name: &str) -> Option<&GroupStatus> {
        self.worker_groups.iter().find(|g| g.name == name)
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStatus {
    pub name: String,
    pub desired_replicas: u32,
    pub live_replicas: u32,
    pub ready_replicas: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    pub service_name: String,
}

pub const CONDITION_HEAD_READY: &str = "HeadPodReady";
pub const CONDITION_SPEC_VALID: &str = "SpecValid";
pub const CONDITION_SUSPENDING: &str = "Suspending";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}
