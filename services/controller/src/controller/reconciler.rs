//! Cluster reconciler.
//!
//! One call to [`ClusterReconciler::reconcile`] is one pass for one cluster:
//! - Read the cluster and the pods it owns
//! - Drain pods if the cluster is suspended, otherwise ensure the head
//!   service, role binding, head pod and worker groups
//! - Recompute status and write it back if it changed
//!
//! The whole pass is retried on conflicts and transient store errors, each
//! attempt starting again from fresh reads.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use raycon_id::{head_service_name, role_binding_name, ClusterKey};
use raycon_reconcile::{retry_with_backoff, RetryPolicy};
use tracing::{debug, info, instrument, warn};

use super::builder;
use super::error::{ControllerError, ControllerResult};
use super::queue::PassToken;
use super::scaler;
use super::status::{compute_status, StatusInputs};
use super::suspend::{self, SuspendPhase};
use super::Mutation;
use crate::model::{Cluster, ClusterState, ClusterStatus, Pod, Resource, RoleBinding, Service};
use crate::store::{LabelSelector, ResourceAccessor, StoreError, StoreResult};

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Deadline for each individual store call.
    pub call_timeout: Duration,

    /// Budget for re-running a pass after conflicts or transient errors.
    pub conflict_retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            conflict_retry: RetryPolicy::default(),
        }
    }
}

/// Counts of mutations applied during a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub pods_created: usize,
    pub pods_deleted: usize,
    pub resources_created: usize,
}

impl PassStats {
    pub fn total(&self) -> usize {
        self.pods_created + self.pods_deleted + self.resources_created
    }
}

/// Result of a successful pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The cluster no longer exists; nothing to do.
    Deleted,
    Reconciled {
        state: ClusterState,
        stats: PassStats,
        status_written: bool,
    },
}

/// Drives one cluster toward its spec.
pub struct ClusterReconciler<S> {
    store: Arc<S>,
    config: ReconcilerConfig,
}

impl<S: ResourceAccessor> ClusterReconciler<S> {
    pub fn new(store: Arc<S>, config: ReconcilerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Every cluster in the store, under the per-call deadline.
    pub async fn list_clusters(&self) -> StoreResult<Vec<Cluster>> {
        self.call(self.store.list(None, &LabelSelector::new())).await
    }

    /// Run one pass for `key`, retrying the whole read-modify-write sequence
    /// on conflicts and transient failures.
    #[instrument(skip(self, token), fields(cluster = %key))]
    pub async fn reconcile(
        &self,
        key: &ClusterKey,
        token: &PassToken,
    ) -> ControllerResult<ReconcileOutcome> {
        retry_with_backoff(&self.config.conflict_retry, "reconcile_cluster", || {
            self.reconcile_once(key, token)
        })
        .await
    }

    async fn reconcile_once(
        &self,
        key: &ClusterKey,
        token: &PassToken,
    ) -> ControllerResult<ReconcileOutcome> {
        let cluster = match self
            .call(self.store.get::<Cluster>(key.namespace(), key.name()))
            .await
        {
            Ok(cluster) => cluster,
            Err(e) if e.is_not_found() => {
                debug!("Cluster not found, treating as deleted");
                return Ok(ReconcileOutcome::Deleted);
            }
            Err(e) => return Err(e.into()),
        };

        let pods = self.list_pods(&cluster).await?;
        let mut stats = PassStats::default();
        let mut provisioned = cluster
            .status
            .as_ref()
            .is_some_and(|s| s.autoscaler_role_binding_provisioned);
        let mut invalid_groups = Vec::new();

        let phase = suspend::phase(&cluster, &pods);
        match phase {
            SuspendPhase::Active => {
                self.ensure_head_service(&cluster, key, token, &mut stats)
                    .await?;

                if cluster.spec.enable_in_tree_autoscaling && !provisioned {
                    self.ensure_role_binding(&cluster, key, token, &mut stats)
                        .await?;
                    provisioned = true;
                }

                let plan = scaler::plan_cluster(&cluster, &pods);
                invalid_groups = plan.invalid_groups;
                self.apply(&cluster, key, token, plan.mutations, &mut stats)
                    .await?;
            }
            SuspendPhase::Draining => {
                let mutations = suspend::plan_drain(&pods);
                if !mutations.is_empty() {
                    info!(pods = mutations.len(), "Suspending cluster, deleting pods");
                }
                self.apply(&cluster, key, token, mutations, &mut stats)
                    .await?;
            }
            SuspendPhase::Suspended => {}
        }

        // Status reflects the pods as they are after this pass's writes.
        let pods = if stats.pods_created + stats.pods_deleted > 0 {
            self.list_pods(&cluster).await?
        } else {
            pods
        };

        let status = compute_status(
            &cluster,
            &pods,
            &StatusInputs {
                role_binding_provisioned: provisioned,
                invalid_groups: &invalid_groups,
            },
        );
        let state = status.state;

        check_cancelled(key, token)?;
        let status_written = self.write_status(&cluster, status).await?;

        if stats.total() > 0 || status_written {
            info!(
                state = %state,
                pods_created = stats.pods_created,
                pods_deleted = stats.pods_deleted,
                resources_created = stats.resources_created,
                status_written,
                "Reconciled cluster"
            );
        }

        Ok(ReconcileOutcome::Reconciled {
            state,
            stats,
            status_written,
        })
    }

    /// Record a persistent failure in the cluster's status.
    #[instrument(skip(self), fields(cluster = %key))]
    pub async fn mark_failed(&self, key: &ClusterKey, message: &str) -> ControllerResult<()> {
        retry_with_backoff(&self.config.conflict_retry, "mark_cluster_failed", || async move {
            let cluster = match self
                .call(self.store.get::<Cluster>(key.namespace(), key.name()))
                .await
            {
                Ok(cluster) => cluster,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(ControllerError::from(e)),
            };

            let mut status = cluster.status.clone().unwrap_or_default();
            status.state = ClusterState::Failed;
            status.reason = Some(message.to_string());
            status.observed_generation = cluster.metadata.generation;
            status.last_update_time = Some(chrono::Utc::now());

            if self.write_status(&cluster, status).await? {
                warn!(reason = %message, "Cluster marked failed");
            }
            Ok(())
        })
        .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Pods carrying the cluster label and owned by this incarnation of the
    /// cluster, terminating ones included.
    async fn list_pods(&self, cluster: &Cluster) -> ControllerResult<Vec<Pod>> {
        let selector = builder::cluster_selector(cluster.name());
        let pods: Vec<Pod> = self
            .call(self.store.list(Some(cluster.namespace()), &selector))
            .await?;
        Ok(pods
            .into_iter()
            .filter(|p| p.metadata.is_owned_by(&cluster.metadata.uid))
            .collect())
    }

    async fn exists<R: Resource>(&self, namespace: &str, name: &str) -> ControllerResult<bool> {
        match self.call(self.store.get::<R>(namespace, name)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    async fn ensure_head_service(
        &self,
        cluster: &Cluster,
        key: &ClusterKey,
        token: &PassToken,
        stats: &mut PassStats,
    ) -> ControllerResult<()> {
        let name = head_service_name(cluster.name());
        if self.exists::<Service>(cluster.namespace(), &name).await? {
            return Ok(());
        }
        let service = builder::head_service(cluster);
        self.apply(
            cluster,
            key,
            token,
            vec![Mutation::CreateService(Box::new(service))],
            stats,
        )
        .await
    }

    /// Provision the autoscaler role binding once. A binding that already
    /// exists counts as provisioned.
    async fn ensure_role_binding(
        &self,
        cluster: &Cluster,
        key: &ClusterKey,
        token: &PassToken,
        stats: &mut PassStats,
    ) -> ControllerResult<()> {
        let name = role_binding_name(cluster.name());
        if self.exists::<RoleBinding>(cluster.namespace(), &name).await? {
            return Ok(());
        }
        let binding = builder::role_binding(cluster);
        self.apply(
            cluster,
            key,
            token,
            vec![Mutation::CreateRoleBinding(Box::new(binding))],
            stats,
        )
        .await
    }

    /// Apply mutations in order, stopping early if the pass is cancelled.
    async fn apply(
        &self,
        cluster: &Cluster,
        key: &ClusterKey,
        token: &PassToken,
        mutations: Vec<Mutation>,
        stats: &mut PassStats,
    ) -> ControllerResult<()> {
        for mutation in mutations {
            check_cancelled(key, token)?;

            match mutation {
                Mutation::CreatePod(pod) => {
                    if self.create(pod.as_ref()).await? {
                        info!(
                            pod = %pod.name(),
                            group = pod.group().unwrap_or_default(),
                            "Created pod"
                        );
                        stats.pods_created += 1;
                    }
                }
                Mutation::DeletePod { name, reason } => {
                    match self
                        .call(self.store.delete::<Pod>(cluster.namespace(), &name))
                        .await
                    {
                        Ok(()) => {
                            info!(pod = %name, reason = %reason, "Deleted pod");
                            stats.pods_deleted += 1;
                        }
                        Err(e) if e.is_not_found() => {
                            debug!(pod = %name, "Pod already gone");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Mutation::CreateService(service) => {
                    if self.create(service.as_ref()).await? {
                        info!(service = %service.metadata.name, "Created head service");
                        stats.resources_created += 1;
                    }
                }
                Mutation::CreateRoleBinding(binding) => {
                    if self.create(binding.as_ref()).await? {
                        info!(
                            role_binding = %binding.metadata.name,
                            "Created autoscaler role binding"
                        );
                        stats.resources_created += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Create `resource`. Returns false if it already existed.
    async fn create<R: Resource>(&self, resource: &R) -> ControllerResult<bool> {
        match self.call(self.store.create(resource)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_already_exists() => {
                debug!(kind = %R::KIND, name = %resource.meta().name, "Already exists");
                Ok(false)
            }
            Err(source) => {
                warn!(
                    kind = %R::KIND,
                    name = %resource.meta().name,
                    error = %source,
                    "Failed to create resource"
                );
                Err(ControllerError::CreateFailed {
                    kind: R::KIND,
                    name: resource.meta().name.clone(),
                    source,
                })
            }
        }
    }

    /// Write `status` unless only its timestamp differs from the stored one.
    async fn write_status(
        &self,
        cluster: &Cluster,
        status: ClusterStatus,
    ) -> ControllerResult<bool> {
        if cluster
            .status
            .as_ref()
            .is_some_and(|current| current.same_as(&status))
        {
            return Ok(false);
        }

        let mut updated = cluster.clone();
        updated.status = Some(status);
        self.call(self.store.update_status(&updated)).await?;
        Ok(true)
    }

    /// Run one store call under the per-call deadline.
    async fn call<T>(&self, fut: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Transient(format!(
                "store call timed out after {}ms",
                self.config.call_timeout.as_millis()
            ))),
        }
    }
}

fn check_cancelled(key: &ClusterKey, token: &PassToken) -> ControllerResult<()> {
    if token.is_cancelled() {
        debug!("Pass superseded, abandoning remaining work");
        return Err(ControllerError::Superseded(key.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClusterSpec, ResourceKind, WorkerGroupSpec};
    use crate::store::{Fault, MemoryStore, Op};

    fn fast_config() -> ReconcilerConfig {
        ReconcilerConfig {
            call_timeout: Duration::from_millis(200),
            conflict_retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..Default::default()
            },
        }
    }

    async fn setup(
        replicas: i32,
    ) -> (Arc<MemoryStore>, ClusterReconciler<MemoryStore>, ClusterKey) {
        let store = Arc::new(MemoryStore::new());
        let cluster = Cluster::new(
            "default",
            "c",
            ClusterSpec {
                worker_group_specs: vec![WorkerGroupSpec {
                    group_name: "g".to_string(),
                    replicas: Some(replicas),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        let created = store.create(&cluster).await.unwrap();
        let reconciler = ClusterReconciler::new(Arc::clone(&store), fast_config());
        (store, reconciler, created.key())
    }

    async fn pod_count(store: &MemoryStore) -> usize {
        store
            .list::<Pod>(None, &LabelSelector::new())
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_missing_cluster_is_deleted_outcome() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = ClusterReconciler::new(store, fast_config());
        let outcome = reconciler
            .reconcile(&ClusterKey::new("default", "gone"), &PassToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_first_pass_creates_everything() {
        let (store, reconciler, key) = setup(2).await;
        let outcome = reconciler.reconcile(&key, &PassToken::new()).await.unwrap();

        let ReconcileOutcome::Reconciled { stats, status_written, .. } = outcome else {
            panic!("expected a reconciled outcome");
        };
        assert_eq!(stats.pods_created, 3);
        assert_eq!(stats.resources_created, 1);
        assert!(status_written);
        assert_eq!(pod_count(&store).await, 3);
        assert!(store
            .get::<Service>("default", "c-head-svc")
            .await
            .is_ok());
        // Autoscaling disabled: no binding.
        assert!(store.get::<RoleBinding>("default", "c").await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_pass_stops_before_mutating() {
        let (store, reconciler, key) = setup(2).await;
        let token = PassToken::new();
        token.cancel();

        let err = reconciler.reconcile(&key, &token).await.unwrap_err();
        assert!(matches!(err, ControllerError::Superseded(_)));
        assert_eq!(pod_count(&store).await, 0);
    }

    #[tokio::test]
    async fn test_transient_create_failure_is_retried() {
        let (store, reconciler, key) = setup(1).await;
        store.inject(Fault::once(
            Op::Create,
            ResourceKind::Pod,
            StoreError::Transient("flaky".into()),
        ));

        reconciler.reconcile(&key, &PassToken::new()).await.unwrap();
        assert_eq!(pod_count(&store).await, 2);
    }

    #[tokio::test]
    async fn test_slow_store_call_times_out() {
        let (store, reconciler, key) = setup(1).await;
        store.set_latency(Duration::from_secs(1));

        let err = reconciler.reconcile(&key, &PassToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Store(StoreError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_failed_sets_state() {
        let (store, reconciler, key) = setup(1).await;
        reconciler.mark_failed(&key, "pods cannot be created").await.unwrap();

        let cluster: Cluster = store.get("default", "c").await.unwrap();
        let status = cluster.status.unwrap();
        assert_eq!(status.state, ClusterState::Failed);
        assert_eq!(status.reason.as_deref(), Some("pods cannot be created"));
    }
}
