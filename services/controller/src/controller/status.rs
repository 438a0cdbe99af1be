//! Status calculator.

use chrono::Utc;
use raycon_id::{head_service_name, NodeType};
use raycon_reconcile::ReconcileError;

use crate::model::{
    Cluster, ClusterState, ClusterStatus, Condition, GroupStatus, HeadInfo, Pod,
    CONDITION_HEAD_READY, CONDITION_SPEC_VALID, CONDITION_SUSPENDING,
};

/// Facts about the pass that are not visible in the pod list.
#[derive(Debug, Default)]
pub struct StatusInputs<'a> {
    pub role_binding_provisioned: bool,
    pub invalid_groups: &'a [(String, ReconcileError)],
}

/// Derive the cluster status from the spec and the pods that exist.
///
/// `pods` must include terminating pods; they still count as existing while
/// a suspended cluster drains.
pub fn compute_status(cluster: &Cluster, pods: &[Pod], inputs: &StatusInputs<'_>) -> ClusterStatus {
    let suspend = cluster.spec.suspend;

    let mut heads: Vec<&Pod> = pods
        .iter()
        .filter(|p| p.node_type() == Some(NodeType::Head) && p.is_live())
        .collect();
    heads.sort_by(|a, b| {
        (a.metadata.creation_timestamp, a.name()).cmp(&(b.metadata.creation_timestamp, b.name()))
    });
    let head_ready = heads.iter().any(|p| p.is_ready());

    let worker_groups: Vec<GroupStatus> = cluster
        .spec
        .worker_group_specs
        .iter()
        .map(|group| {
            let members = pods.iter().filter(|p| {
                p.node_type() == Some(NodeType::Worker)
                    && p.group() == Some(group.group_name.as_str())
            });
            let (live, ready) = members.fold((0u32, 0u32), |(live, ready), p| {
                (live + u32::from(p.is_live()), ready + u32::from(p.is_ready()))
            });
            let desired = if suspend { 0 } else { group.target().unwrap_or(0) };
            GroupStatus {
                name: group.group_name.clone(),
                desired_replicas: desired,
                live_replicas: live,
                ready_replicas: ready,
            }
        })
        .collect();

    let workers_ready = worker_groups
        .iter()
        .all(|g| g.ready_replicas == g.desired_replicas);

    let (state, reason) = if suspend {
        if pods.is_empty() {
            (ClusterState::Suspended, None)
        } else {
            (ClusterState::Unknown, Some("Suspending"))
        }
    } else if !inputs.invalid_groups.is_empty() {
        (ClusterState::Unknown, Some("InvalidSpec"))
    } else if !head_ready {
        (ClusterState::Unknown, Some("HeadPodNotReady"))
    } else if !workers_ready {
        (ClusterState::Unknown, Some("WorkersNotReady"))
    } else {
        (ClusterState::Ready, None)
    };

    let mut conditions = vec![
        if head_ready {
            Condition::new(CONDITION_HEAD_READY, true, "HeadPodRunning", "")
        } else {
            Condition::new(CONDITION_HEAD_READY, false, "HeadPodNotReady", "")
        },
        spec_valid_condition(inputs.invalid_groups),
    ];
    if suspend && !pods.is_empty() {
        conditions.push(Condition::new(
            CONDITION_SUSPENDING,
            true,
            "Draining",
            format!("{} pods remaining", pods.len()),
        ));
    }

    ClusterStatus {
        state,
        reason: reason.map(str::to_string),
        observed_generation: cluster.metadata.generation,
        desired_worker_replicas: worker_groups.iter().map(|g| g.desired_replicas).sum(),
        available_worker_replicas: worker_groups.iter().map(|g| g.ready_replicas).sum(),
        worker_groups,
        head: Some(HeadInfo {
            pod_name: heads.first().map(|p| p.name().to_string()),
            service_name: head_service_name(cluster.name()),
        }),
        autoscaler_role_binding_provisioned: inputs.role_binding_provisioned,
        conditions,
        last_update_time: Some(Utc::now()),
    }
}

fn spec_valid_condition(invalid: &[(String, ReconcileError)]) -> Condition {
    if invalid.is_empty() {
        return Condition::new(CONDITION_SPEC_VALID, true, "Valid", "");
    }
    let message = invalid
        .iter()
        .map(|(group, e)| format!("group {group}: {e}"))
        .collect::<Vec<_>>()
        .join("; ");
    Condition::new(CONDITION_SPEC_VALID, false, "InvalidReplicaBounds", message)
}
