//! Worker group scaler.
//!
//! Pure planning: given a group's spec and the pods that currently carry its
//! labels, decide which pods to create and which to delete. Pods the
//! platform is already terminating are invisible here.

use std::collections::BTreeSet;

use raycon_id::{NodeType, HEAD_GROUP};
use raycon_reconcile::{select_for_drain, ReconcileError};
use tracing::{debug, warn};

use super::builder;
use super::{DeleteReason, Mutation};
use crate::model::{Cluster, Pod, WorkerGroupSpec};

/// Planned mutations for one worker group.
#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub target: u32,
    /// Live pods before the plan is applied.
    pub live: u32,
    pub mutations: Vec<Mutation>,
}

/// Planned mutations for an active cluster.
#[derive(Debug, Default)]
pub struct ClusterPlan {
    pub mutations: Vec<Mutation>,
    /// Groups skipped because their bounds cannot be satisfied.
    pub invalid_groups: Vec<(String, ReconcileError)>,
}

/// Plan the head pod and every worker group of an active cluster.
pub fn plan_cluster(cluster: &Cluster, pods: &[Pod]) -> ClusterPlan {
    let mut plan = ClusterPlan::default();

    let heads: Vec<&Pod> = pods
        .iter()
        .filter(|p| p.node_type() == Some(NodeType::Head))
        .collect();
    plan.mutations.extend(plan_head(cluster, &heads));

    let mut seen = BTreeSet::new();
    for group in &cluster.spec.worker_group_specs {
        if !seen.insert(group.group_name.as_str()) {
            warn!(group = %group.group_name, "Duplicate worker group name, skipping");
            continue;
        }

        let group_pods = worker_pods(pods, &group.group_name);
        match plan_group(cluster, group, &group_pods) {
            Ok(group_plan) => {
                if !group_plan.mutations.is_empty() {
                    debug!(
                        group = %group.group_name,
                        target = group_plan.target,
                        live = group_plan.live,
                        mutations = group_plan.mutations.len(),
                        "Planned group scaling"
                    );
                }
                plan.mutations.extend(group_plan.mutations);
            }
            Err(e) => {
                warn!(group = %group.group_name, error = %e, "Invalid group bounds, not scaling");
                plan.invalid_groups.push((group.group_name.clone(), e));
            }
        }
    }

    plan.mutations.extend(plan_orphans(cluster, pods));
    plan
}

/// Plan one worker group.
pub fn plan_group(
    cluster: &Cluster,
    group: &WorkerGroupSpec,
    pods: &[&Pod],
) -> Result<GroupPlan, ReconcileError> {
    let target = group.target()?;
    let (mut mutations, live) = reap_terminal(pods);
    let current = live.len() as u32;

    if current > target {
        let excess = (current - target) as usize;
        mutations.extend(select_deletions(
            live,
            excess,
            &group.scale_strategy.workers_to_delete,
        ));
    } else if current < target {
        for _ in current..target {
            mutations.push(Mutation::CreatePod(Box::new(builder::worker_pod(
                cluster, group,
            ))));
        }
    }

    Ok(GroupPlan {
        target,
        live: current,
        mutations,
    })
}

/// Plan the head pod: exactly one live head, the oldest one kept.
pub fn plan_head(cluster: &Cluster, pods: &[&Pod]) -> Vec<Mutation> {
    let (mut mutations, live) = reap_terminal(pods);

    if live.is_empty() {
        mutations.push(Mutation::CreatePod(Box::new(builder::head_pod(cluster))));
        return mutations;
    }

    let count = live.len();
    mutations.extend(
        select_for_drain(live, count, pod_age_key)
            .into_iter()
            .skip(1)
            .map(|p| Mutation::delete_pod(p, DeleteReason::DuplicateHead)),
    );
    mutations
}

/// Delete worker pods whose group no longer exists in the spec.
pub fn plan_orphans(cluster: &Cluster, pods: &[Pod]) -> Vec<Mutation> {
    pods.iter()
        .filter(|p| p.node_type() == Some(NodeType::Worker) && !p.is_terminating())
        .filter(|p| match p.group() {
            Some(group) => group != HEAD_GROUP && cluster.worker_group(group).is_none(),
            None => true,
        })
        .map(|p| Mutation::delete_pod(p, DeleteReason::UnknownGroup))
        .collect()
}

fn worker_pods<'a>(pods: &'a [Pod], group: &str) -> Vec<&'a Pod> {
    pods.iter()
        .filter(|p| p.node_type() == Some(NodeType::Worker) && p.group() == Some(group))
        .collect()
}

/// Split non-terminating pods into terminal ones (deleted) and live ones.
fn reap_terminal<'a>(pods: &[&'a Pod]) -> (Vec<Mutation>, Vec<&'a Pod>) {
    let mut mutations = Vec::new();
    let mut live = Vec::new();
    for pod in pods.iter().copied().filter(|p| !p.is_terminating()) {
        if pod.is_terminal() {
            mutations.push(Mutation::delete_pod(pod, DeleteReason::Terminal));
        } else {
            live.push(pod);
        }
    }
    (mutations, live)
}

/// Preferred pods first, in list order; then oldest first.
fn select_deletions(live: Vec<&Pod>, count: usize, preferred: &[String]) -> Vec<Mutation> {
    let mut chosen = Vec::with_capacity(count);
    let mut rest = live;

    for name in preferred {
        if chosen.len() == count {
            break;
        }
        // Names that no longer match a live pod are skipped.
        if let Some(idx) = rest.iter().position(|p| p.name() == name) {
            chosen.push(Mutation::delete_pod(
                rest.remove(idx),
                DeleteReason::Preferred,
            ));
        }
    }

    let remaining = count - chosen.len();
    chosen.extend(
        select_for_drain(rest, remaining, pod_age_key)
            .into_iter()
            .map(|p| Mutation::delete_pod(p, DeleteReason::ScaleDown)),
    );
    chosen
}

fn pod_age_key(pod: &&Pod) -> (Option<chrono::DateTime<chrono::Utc>>, String) {
    (pod.metadata.creation_timestamp, pod.name().to_string())
}
