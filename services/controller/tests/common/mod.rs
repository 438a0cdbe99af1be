//! Shared fixtures for controller integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use raycon_controller::controller::builder::cluster_selector;
use raycon_controller::controller::{
    ClusterReconciler, PassToken, ReconcileOutcome, ReconcilerConfig,
};
use raycon_controller::model::{
    Cluster, ClusterSpec, ClusterStatus, HeadGroupSpec, Pod, PodPhase, PodStatus, WorkerGroupSpec,
};
use raycon_controller::store::{MemoryStore, ResourceAccessor};
use raycon_id::{ClusterKey, NodeType};
use raycon_reconcile::RetryPolicy;

pub const NS: &str = "default";
pub const GROUP: &str = "small-group";

/// The sample cluster: head plus one worker group.
pub fn sample_cluster(
    name: &str,
    replicas: Option<i32>,
    min: Option<i32>,
    max: Option<i32>,
) -> Cluster {
    Cluster::new(
        NS,
        name,
        ClusterSpec {
            head_group_spec: HeadGroupSpec {
                ray_start_params: BTreeMap::from([
                    ("port".to_string(), "6379".to_string()),
                    ("num-cpus".to_string(), "1".to_string()),
                ]),
                ..Default::default()
            },
            worker_group_specs: vec![WorkerGroupSpec {
                group_name: GROUP.to_string(),
                replicas,
                min_replicas: min,
                max_replicas: max,
                ..Default::default()
            }],
            ..Default::default()
        },
    )
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

pub fn fast_config() -> ReconcilerConfig {
    ReconcilerConfig {
        call_timeout: Duration::from_secs(1),
        conflict_retry: fast_retry(),
    }
}

pub fn running(ready: bool) -> PodStatus {
    PodStatus {
        phase: PodPhase::Running,
        ready,
    }
}

/// A store holding one cluster plus a reconciler over it.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub reconciler: ClusterReconciler<MemoryStore>,
    pub key: ClusterKey,
}

impl Harness {
    pub async fn new(cluster: Cluster) -> Self {
        Self::with_store(MemoryStore::new(), cluster).await
    }

    pub async fn with_store(store: MemoryStore, cluster: Cluster) -> Self {
        let store = Arc::new(store);
        let created = store.create(&cluster).await.unwrap();
        let reconciler = ClusterReconciler::new(Arc::clone(&store), fast_config());
        Self {
            store,
            reconciler,
            key: created.key(),
        }
    }

    pub async fn reconcile(&self) -> ReconcileOutcome {
        self.reconciler
            .reconcile(&self.key, &PassToken::new())
            .await
            .unwrap()
    }

    /// Reconcile until a pass makes no pod or resource mutations.
    pub async fn converge(&self) {
        for _ in 0..10 {
            if let ReconcileOutcome::Reconciled { stats, .. } = self.reconcile().await {
                if stats.total() == 0 {
                    return;
                }
            } else {
                return;
            }
        }
        panic!("cluster {} did not converge", self.key);
    }

    pub async fn cluster(&self) -> Cluster {
        self.store
            .get(self.key.namespace(), self.key.name())
            .await
            .unwrap()
    }

    pub async fn status(&self) -> ClusterStatus {
        self.cluster().await.status.unwrap_or_default()
    }

    /// Apply a spec edit the way an external actor would.
    pub async fn edit_spec(&self, edit: impl FnOnce(&mut ClusterSpec)) {
        let mut cluster = self.cluster().await;
        edit(&mut cluster.spec);
        self.store.update(&cluster).await.unwrap();
    }

    pub async fn set_replicas(&self, replicas: i32) {
        self.edit_spec(|spec| spec.worker_group_specs[0].replicas = Some(replicas))
            .await;
    }

    pub async fn set_suspend(&self, suspend: bool) {
        self.edit_spec(|spec| spec.suspend = suspend).await;
    }

    /// Every pod of the cluster, terminating ones included.
    pub async fn pods(&self) -> Vec<Pod> {
        self.store
            .list(Some(NS), &cluster_selector(self.key.name()))
            .await
            .unwrap()
    }

    pub async fn live_workers(&self) -> Vec<Pod> {
        self.pods()
            .await
            .into_iter()
            .filter(|p| p.node_type() == Some(NodeType::Worker) && !p.is_terminating())
            .collect()
    }

    pub async fn live_heads(&self) -> Vec<Pod> {
        self.pods()
            .await
            .into_iter()
            .filter(|p| p.node_type() == Some(NodeType::Head) && !p.is_terminating())
            .collect()
    }

    pub async fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .live_workers()
            .await
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Report every pod of the cluster as running and ready.
    pub fn mark_all_ready(&self) {
        mark_ready(&self.store, self.key.name());
    }
}

pub fn mark_ready(store: &MemoryStore, cluster: &str) {
    store
        .set_pods_status(NS, &cluster_selector(cluster), running(true))
        .unwrap();
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
