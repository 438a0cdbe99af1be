use std::collections::BTreeMap;

use raycon_id::{NodeType, LABEL_GROUP, LABEL_NODE_TYPE};
use serde::{Deserialize, Serialize};

use super::ObjectMeta;

// =============================================================================
// Pods
// =============================================================================

/// Pod template. The spec body is opaque to the controller and copied onto
/// each pod verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodTemplate {
    #[serde(default)]
    pub metadata: TemplateMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMeta {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// Reported by the platform; the controller never inspects more than this.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
    /// The pod's Ready condition.
    #[serde(default)]
    pub ready: bool,
}

impl Pod {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn group(&self) -> Option<&str> {
        self.metadata.labels.get(LABEL_GROUP).map(String::as_str)
    }

    pub fn node_type(&self) -> Option<NodeType> {
        match self.metadata.labels.get(LABEL_NODE_TYPE).map(String::as_str) {
            Some("head") => Some(NodeType::Head),
            Some("worker") => Some(NodeType::Worker),
            _ => None,
        }
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.is_terminating()
    }

    /// Finished running and will never become ready again.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.phase, PodPhase::Succeeded | PodPhase::Failed)
    }

    /// Counts toward a group's replicas: not terminating and not terminal.
    pub fn is_live(&self) -> bool {
        !self.is_terminating() && !self.is_terminal()
    }

    pub fn is_ready(&self) -> bool {
        self.is_live() && self.status.phase == PodPhase::Running && self.status.ready
    }
}

// =============================================================================
// Services
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
}

// =============================================================================
// Role bindings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleBinding {
    pub metadata: ObjectMeta,
    pub role_ref: RoleRef,
    #[serde(default)]
    pub subjects: Vec<Subject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRef {
    pub api_group: String,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}
