//! Suspend/resume manager.
//!
//! Suspension is enforced by existence: every pod of the cluster is deleted
//! whatever its phase or readiness, so a pod created by a resume that has
//! not started yet goes away exactly like a running one. The head service
//! and role binding are left in place. Resume needs no code here; once
//! `suspend` is false the scaler recreates everything from the spec.

use super::{DeleteReason, Mutation};
use crate::model::{Cluster, Pod};

/// Where a cluster stands with respect to its `suspend` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendPhase {
    /// Not suspended; the scaler is in charge.
    Active,
    /// Suspended but pods still exist.
    Draining,
    /// Suspended with zero pods.
    Suspended,
}

/// `pods` is every pod of the cluster, terminating ones included.
pub fn phase(cluster: &Cluster, pods: &[Pod]) -> SuspendPhase {
    if !cluster.spec.suspend {
        SuspendPhase::Active
    } else if pods.is_empty() {
        SuspendPhase::Suspended
    } else {
        SuspendPhase::Draining
    }
}

/// Delete every pod that is not already terminating.
pub fn plan_drain(pods: &[Pod]) -> Vec<Mutation> {
    pods.iter()
        .filter(|p| !p.is_terminating())
        .map(|p| Mutation::delete_pod(p, DeleteReason::Suspend))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClusterSpec, ObjectMeta, PodPhase, PodStatus};
    use chrono::Utc;

    fn pod(name: &str, phase: PodPhase) -> Pod {
        Pod {
            metadata: ObjectMeta::new("default", name),
            spec: serde_json::Value::Null,
            status: PodStatus {
                phase,
                ready: false,
            },
        }
    }

    fn cluster(suspend: bool) -> Cluster {
        Cluster::new(
            "default",
            "c",
            ClusterSpec {
                suspend,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_phase() {
        let pods = vec![pod("p", PodPhase::Running)];
        assert_eq!(phase(&cluster(false), &pods), SuspendPhase::Active);
        assert_eq!(phase(&cluster(true), &pods), SuspendPhase::Draining);
        assert_eq!(phase(&cluster(true), &[]), SuspendPhase::Suspended);
    }

    #[test]
    fn test_drain_ignores_phase_and_readiness() {
        let pods = vec![
            pod("pending", PodPhase::Pending),
            pod("running", PodPhase::Running),
            pod("failed", PodPhase::Failed),
        ];
        let names: Vec<_> = plan_drain(&pods)
            .iter()
            .filter_map(|m| m.deleted_pod().map(str::to_string))
            .collect();
        assert_eq!(names, vec!["pending", "running", "failed"]);
    }

    #[test]
    fn test_drain_skips_terminating() {
        let mut leaving = pod("leaving", PodPhase::Running);
        leaving.metadata.deletion_timestamp = Some(Utc::now());
        assert!(plan_drain(&[leaving]).is_empty());
    }
}
