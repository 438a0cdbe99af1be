//! Cluster reconciliation.
//!
//! A pass reads the cluster and its pods, asks the suspend manager or the
//! scaler for a list of [`Mutation`]s, applies them, and writes back the
//! derived status. Passes keep no state between runs; each one re-derives
//! the diff from what the store reports.

pub mod builder;
mod error;
mod queue;
mod reconciler;
pub mod scaler;
mod status;
pub mod suspend;
mod worker;

pub use error::{ControllerError, ControllerResult};
pub use queue::{PassToken, WorkQueue};
pub use reconciler::{ClusterReconciler, PassStats, ReconcileOutcome, ReconcilerConfig};
pub use status::{compute_status, StatusInputs};
pub use worker::{ControllerWorker, WorkerConfig};

use crate::model::{Pod, RoleBinding, Service};

/// Why a pod is being deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    /// Named in the group's `workersToDelete`.
    Preferred,
    /// Group has more live pods than its target.
    ScaleDown,
    /// Pod reached Succeeded or Failed.
    Terminal,
    /// More than one live head pod.
    DuplicateHead,
    /// Pod belongs to a group no longer in the spec.
    UnknownGroup,
    /// Cluster is suspending.
    Suspend,
}

impl std::fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeleteReason::Preferred => "preferred",
            DeleteReason::ScaleDown => "scale_down",
            DeleteReason::Terminal => "terminal",
            DeleteReason::DuplicateHead => "duplicate_head",
            DeleteReason::UnknownGroup => "unknown_group",
            DeleteReason::Suspend => "suspend",
        };
        f.write_str(s)
    }
}

/// A single store write a pass wants to make.
#[derive(Debug, Clone)]
pub enum Mutation {
    CreatePod(Box<Pod>),
    DeletePod { name: String, reason: DeleteReason },
    CreateService(Box<Service>),
    CreateRoleBinding(Box<RoleBinding>),
}

impl Mutation {
    pub fn delete_pod(pod: &Pod, reason: DeleteReason) -> Self {
        Mutation::DeletePod {
            name: pod.name().to_string(),
            reason,
        }
    }

    pub fn is_create(&self) -> bool {
        !matches!(self, Mutation::DeletePod { .. })
    }

    /// Name of the deleted pod, if this is a pod deletion.
    pub fn deleted_pod(&self) -> Option<&str> {
        match self {
            Mutation::DeletePod { name, .. } => Some(name),
            _ => None,
        }
    }
}
