//! Controller worker pool.
//!
//! A dispatcher task turns watch events into work-queue keys and runs the
//! periodic resync; a fixed number of worker tasks drain the queue. The
//! queue guarantees at most one pass per cluster at a time, so clusters
//! reconcile in parallel while each cluster's passes are serialized.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use raycon_id::ClusterKey;
use raycon_reconcile::{
    FailureTracker, RetryPolicy, DEFAULT_FAILURE_WINDOW, DEFAULT_MAX_FAILURES,
    DEFAULT_RESYNC_INTERVAL,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::error::ControllerError;
use super::queue::WorkQueue;
use super::reconciler::{ClusterReconciler, ReconcileOutcome};
use crate::model::{Cluster, ResourceKind, CLUSTER_KIND};
use crate::store::{ChangeKind, ResourceAccessor, StoreResult, WatchEvent};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent reconciliation workers.
    pub workers: usize,

    /// Full resync interval.
    pub resync_interval: Duration,

    /// Failed passes tolerated inside `failure_window` before a cluster whose
    /// resources cannot be created is marked failed.
    pub failure_threshold: u32,

    pub failure_window: Duration,

    /// Delay before a failed key is retried, growing with repeated failures.
    pub requeue_backoff: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            failure_threshold: DEFAULT_MAX_FAILURES,
            failure_window: DEFAULT_FAILURE_WINDOW,
            requeue_backoff: RetryPolicy {
                max_attempts: u32::MAX,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: 0.2,
            },
        }
    }
}

type Failures = Arc<Mutex<FailureTracker<ClusterKey>>>;

/// Runs the reconciler for every cluster in the store.
pub struct ControllerWorker<S> {
    reconciler: Arc<ClusterReconciler<S>>,
    queue: Arc<WorkQueue<ClusterKey>>,
    failures: Failures,
    config: WorkerConfig,
}

impl<S: ResourceAccessor> ControllerWorker<S> {
    pub fn new(reconciler: ClusterReconciler<S>, config: WorkerConfig) -> Self {
        let failures = FailureTracker::new(config.failure_threshold, config.failure_window);
        Self {
            reconciler: Arc::new(reconciler),
            queue: Arc::new(WorkQueue::new()),
            failures: Arc::new(Mutex::new(failures)),
            config,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ClusterKey>> {
        &self.queue
    }

    /// Run until shutdown is signaled, then drain the worker tasks.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let workers = self.config.workers.max(1);
        info!(
            workers,
            resync_secs = self.config.resync_interval.as_secs(),
            "Starting controller"
        );

        // Subscribe before listing so nothing between the two is missed.
        let mut events = self.reconciler.store().watch();
        let mut generations = BTreeMap::new();
        let mut listing = JoinSet::new();
        self.start_resync(&mut listing);

        let mut tasks = JoinSet::new();
        for id in 0..workers {
            tasks.spawn(worker_loop(
                id,
                Arc::clone(&self.reconciler),
                Arc::clone(&self.queue),
                Arc::clone(&self.failures),
                self.config.requeue_backoff.clone(),
            ));
        }

        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.dispatch(event, &mut generations),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Watch stream lagged, resyncing");
                        self.start_resync(&mut listing);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("Watch stream closed");
                        break;
                    }
                },
                Some(listed) = listing.join_next() => match listed {
                    Ok(Ok(clusters)) => self.finish_resync(clusters, &mut generations),
                    Ok(Err(e)) => warn!(error = %e, "Resync list failed"),
                    Err(e) => error!(error = %e, "Resync task failed"),
                },
                _ = resync.tick() => {
                    self.start_resync(&mut listing);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Controller shutting down");
                        break;
                    }
                }
            }
        }

        listing.abort_all();
        self.queue.shutdown();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Controller stopped");
    }

    /// List every cluster in the background. At most one listing runs at a
    /// time; the dispatcher keeps delivering events meanwhile.
    fn start_resync(&self, listing: &mut JoinSet<StoreResult<Vec<Cluster>>>) {
        if !listing.is_empty() {
            debug!("Resync already in progress");
            return;
        }
        let reconciler = Arc::clone(&self.reconciler);
        listing.spawn(async move { reconciler.list_clusters().await });
    }

    /// Queue every listed cluster.
    fn finish_resync(&self, clusters: Vec<Cluster>, generations: &mut BTreeMap<ClusterKey, i64>) {
        debug!(clusters = clusters.len(), "Resyncing");

        // Events delivered while the list was in flight may be newer.
        let mut listed = BTreeMap::new();
        for cluster in &clusters {
            let key = cluster.key();
            let generation = generations
                .get(&key)
                .map_or(cluster.metadata.generation, |&seen| {
                    seen.max(cluster.metadata.generation)
                });
            listed.insert(key.clone(), generation);
            self.queue.add(key);
        }
        *generations = listed;

        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .prune();
    }

    /// Map a watch event to the cluster it concerns.
    fn dispatch(&self, event: WatchEvent, generations: &mut BTreeMap<ClusterKey, i64>) {
        let meta = &event.metadata;
        let key = match event.kind {
            ResourceKind::Cluster => {
                let key = ClusterKey::new(&meta.namespace, &meta.name);
                if event.change == ChangeKind::Deleted {
                    generations.remove(&key);
                } else {
                    match generations.insert(key.clone(), meta.generation) {
                        // Status writes leave the generation alone. Requeueing
                        // on them would cut a failed key's backoff short.
                        Some(seen)
                            if seen == meta.generation && event.change == ChangeKind::Modified =>
                        {
                            return;
                        }
                        // A spec edit makes any in-flight pass stale.
                        Some(seen) if seen < meta.generation && self.queue.cancel(&key) => {
                            debug!(
                                cluster = %key,
                                generation = meta.generation,
                                "Cancelling superseded pass"
                            );
                        }
                        _ => {}
                    }
                }
                key
            }
            _ => match meta.controller_owner(CLUSTER_KIND) {
                Some(owner) => ClusterKey::new(&meta.namespace, &owner.name),
                None => return,
            },
        };
        self.queue.add(key);
    }
}

async fn worker_loop<S: ResourceAccessor>(
    id: usize,
    reconciler: Arc<ClusterReconciler<S>>,
    queue: Arc<WorkQueue<ClusterKey>>,
    failures: Failures,
    backoff: RetryPolicy,
) {
    debug!(worker = id, "Worker started");

    while let Some((key, token)) = queue.get().await {
        match reconciler.reconcile(&key, &token).await {
            Ok(outcome) => {
                if outcome == ReconcileOutcome::Deleted {
                    debug!(cluster = %key, "Cluster gone");
                }
                failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear(&key);
            }
            Err(ControllerError::Superseded(_)) => {
                queue.add(key.clone());
            }
            Err(e) => {
                let (count, exhausted) = {
                    let mut failures = failures.lock().unwrap_or_else(PoisonError::into_inner);
                    let count = failures.record_failure(&key);
                    (count, failures.is_exhausted(&key))
                };
                let delay = backoff.delay(count.saturating_sub(1));
                warn!(
                    cluster = %key,
                    error = %e,
                    failures = count,
                    retry_in_ms = delay.as_millis() as u64,
                    "Reconciliation failed, requeueing"
                );

                if exhausted && e.is_creation_failure() {
                    if let Err(mark_err) = reconciler.mark_failed(&key, &e.to_string()).await {
                        warn!(cluster = %key, error = %mark_err, "Failed to record failed state");
                    }
                }
                queue.add_after(key.clone(), delay);
            }
        }
        queue.done(&key);
    }

    debug!(worker = id, "Worker stopped");
}
