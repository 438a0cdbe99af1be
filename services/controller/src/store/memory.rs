//! In-process resource accessor.
//!
//! Objects are held as JSON keyed by `(kind, namespace, name)`, the way an
//! API server stores them, and decoded into typed resources on read. Every
//! write bumps a store-wide version counter that doubles as each object's
//! `resourceVersion`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::{ChangeKind, LabelSelector, ResourceAccessor, StoreError, StoreResult, WatchEvent};
use crate::model::{Cluster, ObjectMeta, Pod, PodStatus, Resource, ResourceKind};

type ObjectKey = (ResourceKind, String, String);

const WATCH_CAPACITY: usize = 1024;

/// Store operation, for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

/// An injected failure: the next matching calls fail with `error`.
#[derive(Debug, Clone)]
pub struct Fault {
    pub op: Op,
    pub kind: ResourceKind,
    pub error: StoreError,
    /// Remaining failures; `None` fails forever.
    pub times: Option<u32>,
}

impl Fault {
    pub fn once(op: Op, kind: ResourceKind, error: StoreError) -> Self {
        Self::times(op, kind, error, 1)
    }

    pub fn times(op: Op, kind: ResourceKind, error: StoreError, times: u32) -> Self {
        Self {
            op,
            kind,
            error,
            times: Some(times.max(1)),
        }
    }

    pub fn always(op: Op, kind: ResourceKind, error: StoreError) -> Self {
        Self {
            op,
            kind,
            error,
            times: None,
        }
    }
}

/// Successful writes made through the accessor interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationCounts {
    pub creates: u64,
    pub updates: u64,
    pub status_updates: u64,
    pub deletes: u64,
}

impl MutationCounts {
    pub fn total(&self) -> u64 {
        self.creates + self.updates + self.status_updates + self.deletes
    }
}

struct State {
    objects: BTreeMap<ObjectKey, Value>,
    next_version: u64,
    counts: MutationCounts,
}

impl State {
    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

/// JSON-backed object store with versioning, owner-reference garbage
/// collection, and a broadcast watch stream.
pub struct MemoryStore {
    state: Mutex<State>,
    faults: Mutex<Vec<Fault>>,
    injected: AtomicU64,
    latency: Mutex<Duration>,
    graceful_pod_deletion: bool,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store whose deletes take effect immediately.
    pub fn new() -> Self {
        Self::with_options(false)
    }

    /// Store where deleting a pod only sets its deletion timestamp; the pod
    /// stays listed until [`MemoryStore::complete_terminations`].
    pub fn with_graceful_pod_deletion() -> Self {
        Self::with_options(true)
    }

    fn with_options(graceful_pod_deletion: bool) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                next_version: 0,
                counts: MutationCounts::default(),
            }),
            faults: Mutex::new(Vec::new()),
            injected: AtomicU64::new(0),
            latency: Mutex::new(Duration::ZERO),
            graceful_pod_deletion,
            events,
        }
    }

    pub fn inject(&self, fault: Fault) {
        lock(&self.faults).push(fault);
    }

    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    /// Delay applied to every accessor call.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    pub fn mutation_counts(&self) -> MutationCounts {
        lock(&self.state).counts
    }

    /// Calls failed by an injected fault so far.
    pub fn injected_failures(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    /// Finish terminating every pod that carries a deletion timestamp.
    pub fn complete_terminations(&self) -> usize {
        let mut state = lock(&self.state);
        let mut removed = Vec::new();

        state.objects.retain(|(kind, _, _), value| {
            if *kind != ResourceKind::Pod {
                return true;
            }
            match meta_of(value) {
                Ok(meta) if meta.is_terminating() => {
                    removed.push(meta);
                    false
                }
                _ => true,
            }
        });
        drop(state);

        let count = removed.len();
        for meta in removed {
            self.emit(ResourceKind::Pod, ChangeKind::Deleted, meta);
        }
        count
    }

    /// Platform-side pod status write (what a node agent would report).
    pub fn set_pod_status(
        &self,
        namespace: &str,
        name: &str,
        status: PodStatus,
    ) -> StoreResult<Pod> {
        let mut state = lock(&self.state);
        let key = object_key(ResourceKind::Pod, namespace, name);
        let Some(existing) = state.objects.get(&key) else {
            return Err(not_found(ResourceKind::Pod, namespace, name));
        };

        let mut pod: Pod = decode(existing)?;
        pod.status = status;
        pod.metadata.resource_version = state.bump_version();
        state.objects.insert(key, encode(&pod)?);
        drop(state);

        self.emit(ResourceKind::Pod, ChangeKind::Modified, pod.metadata.clone());
        Ok(pod)
    }

    /// Apply `status` to every non-terminating pod matching `selector`.
    pub fn set_pods_status(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        status: PodStatus,
    ) -> StoreResult<usize> {
        let names: Vec<String> = {
            let state = lock(&self.state);
            state
                .objects
                .iter()
                .filter(|((kind, ns, _), _)| *kind == ResourceKind::Pod && ns == namespace)
                .filter_map(|(_, value)| meta_of(value).ok())
                .filter(|meta| !meta.is_terminating() && selector.matches(&meta.labels))
                .map(|meta| meta.name)
                .collect()
        };

        for name in &names {
            self.set_pod_status(namespace, name, status)?;
        }
        Ok(names.len())
    }

    fn check_fault(&self, op: Op, kind: ResourceKind) -> StoreResult<()> {
        let mut faults = lock(&self.faults);
        let Some(idx) = faults.iter().position(|f| f.op == op && f.kind == kind) else {
            return Ok(());
        };

        let error = faults[idx].error.clone();
        if let Some(remaining) = faults[idx].times.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                faults.remove(idx);
            }
        }

        self.injected.fetch_add(1, Ordering::SeqCst);
        debug!(?op, %kind, error = %error, "Injected store fault");
        Err(error)
    }

    async fn simulate_latency(&self) {
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn emit(&self, kind: ResourceKind, change: ChangeKind, metadata: ObjectMeta) {
        // No receivers is fine; the controller may not be running.
        let _ = self.events.send(WatchEvent {
            kind,
            change,
            metadata,
        });
    }
}

#[async_trait]
impl ResourceAccessor for MemoryStore {
    async fn get<R: Resource>(&self, namespace: &str, name: &str) -> StoreResult<R> {
        self.simulate_latency().await;
        self.check_fault(Op::Get, R::KIND)?;

        let state = lock(&self.state);
        match state.objects.get(&object_key(R::KIND, namespace, name)) {
            Some(value) => decode(value),
            None => Err(not_found(R::KIND, namespace, name)),
        }
    }

    async fn list<R: Resource>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<R>> {
        self.simulate_latency().await;
        self.check_fault(Op::List, R::KIND)?;

        let state = lock(&self.state);
        let mut out = Vec::new();
        for ((kind, ns, _), value) in &state.objects {
            if *kind != R::KIND || namespace.is_some_and(|n| n != ns.as_str()) {
                continue;
            }
            let resource: R = decode(value)?;
            if selector.matches(&resource.meta().labels) {
                out.push(resource);
            }
        }
        Ok(out)
    }

    async fn create<R: Resource>(&self, resource: &R) -> StoreResult<R> {
        self.simulate_latency().await;
        self.check_fault(Op::Create, R::KIND)?;

        let meta = resource.meta();
        raycon_id::validate_name(&meta.namespace)
            .and_then(|_| raycon_id::validate_name(&meta.name))
            .map_err(|e| StoreError::Invalid(e.to_string()))?;

        let mut state = lock(&self.state);
        let key = object_key(R::KIND, &meta.namespace, &meta.name);
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: R::KIND,
                namespace: meta.namespace.clone(),
                name: meta.name.clone(),
            });
        }

        let mut created = resource.clone();
        let version = state.bump_version();
        {
            let meta = created.meta_mut();
            if meta.uid.is_empty() {
                meta.uid = Uuid::new_v4().to_string();
            }
            meta.resource_version = version;
            meta.generation = 1;
            meta.creation_timestamp = Some(Utc::now());
            meta.deletion_timestamp = None;
        }

        state.objects.insert(key, encode(&created)?);
        state.counts.creates += 1;
        drop(state);

        self.emit(R::KIND, ChangeKind::Added, created.meta().clone());
        Ok(created)
    }

    async fn update<R: Resource>(&self, resource: &R) -> StoreResult<R> {
        self.simulate_latency().await;
        self.check_fault(Op::Update, R::KIND)?;

        let meta = resource.meta();
        let mut state = lock(&self.state);
        let key = object_key(R::KIND, &meta.namespace, &meta.name);
        let Some(existing) = state.objects.get(&key).cloned() else {
            return Err(not_found(R::KIND, &meta.namespace, &meta.name));
        };
        let current = meta_of(&existing)?;
        check_version(R::KIND, &current, meta.resource_version)?;

        let spec_changed = encode(resource)?.get("spec") != existing.get("spec");
        let mut updated = resource.clone();
        let version = state.bump_version();
        {
            let meta = updated.meta_mut();
            meta.uid = current.uid.clone();
            meta.creation_timestamp = current.creation_timestamp;
            meta.deletion_timestamp = current.deletion_timestamp;
            meta.resource_version = version;
            meta.generation = current.generation + i64::from(spec_changed);
        }

        let mut value = encode(&updated)?;
        if R::KIND == ResourceKind::Cluster {
            // Status is a subresource; only update_status writes it.
            if let Some(obj) = value.as_object_mut() {
                match existing.get("status") {
                    Some(status) => obj.insert("status".to_string(), status.clone()),
                    None => obj.remove("status"),
                };
            }
        }

        let updated: R = decode(&value)?;
        state.objects.insert(key, value);
        state.counts.updates += 1;
        drop(state);

        self.emit(R::KIND, ChangeKind::Modified, updated.meta().clone());
        Ok(updated)
    }

    async fn update_status(&self, cluster: &Cluster) -> StoreResult<Cluster> {
        self.simulate_latency().await;
        self.check_fault(Op::UpdateStatus, ResourceKind::Cluster)?;

        let meta = &cluster.metadata;
        let mut state = lock(&self.state);
        let key = object_key(ResourceKind::Cluster, &meta.namespace, &meta.name);
        let Some(existing) = state.objects.get(&key) else {
            return Err(not_found(ResourceKind::Cluster, &meta.namespace, &meta.name));
        };

        let mut current: Cluster = decode(existing)?;
        check_version(
            ResourceKind::Cluster,
            &current.metadata,
            meta.resource_version,
        )?;

        current.status = cluster.status.clone();
        current.metadata.resource_version = state.bump_version();
        state.objects.insert(key, encode(&current)?);
        state.counts.status_updates += 1;
        drop(state);

        self.emit(
            ResourceKind::Cluster,
            ChangeKind::Modified,
            current.metadata.clone(),
        );
        Ok(current)
    }

    async fn delete<R: Resource>(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.simulate_latency().await;
        self.check_fault(Op::Delete, R::KIND)?;

        let mut state = lock(&self.state);
        let key = object_key(R::KIND, namespace, name);
        let Some(existing) = state.objects.get(&key).cloned() else {
            return Err(not_found(R::KIND, namespace, name));
        };
        let meta = meta_of(&existing)?;

        if R::KIND == ResourceKind::Pod && self.graceful_pod_deletion {
            if meta.is_terminating() {
                return Ok(());
            }
            let mut pod: Pod = decode(&existing)?;
            pod.metadata.deletion_timestamp = Some(Utc::now());
            pod.metadata.resource_version = state.bump_version();
            state.objects.insert(key, encode(&pod)?);
            state.counts.deletes += 1;
            drop(state);

            self.emit(ResourceKind::Pod, ChangeKind::Modified, pod.metadata);
            return Ok(());
        }

        state.objects.remove(&key);
        state.counts.deletes += 1;
        let mut removed = vec![(R::KIND, meta.clone())];

        if R::KIND == ResourceKind::Cluster {
            // Owner-reference garbage collection.
            let dependents: Vec<ObjectKey> = state
                .objects
                .iter()
                .filter(|(_, value)| meta_of(value).is_ok_and(|m| m.is_owned_by(&meta.uid)))
                .map(|(key, _)| key.clone())
                .collect();
            for key in dependents {
                if let Some(value) = state.objects.remove(&key) {
                    if let Ok(dep) = meta_of(&value) {
                        removed.push((key.0, dep));
                    }
                }
            }
        }
        drop(state);

        for (kind, meta) in removed {
            self.emit(kind, ChangeKind::Deleted, meta);
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn object_key(kind: ResourceKind, namespace: &str, name: &str) -> ObjectKey {
    (kind, namespace.to_string(), name.to_string())
}

fn not_found(kind: ResourceKind, namespace: &str, name: &str) -> StoreError {
    StoreError::NotFound {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

fn check_version(kind: ResourceKind, current: &ObjectMeta, expected: u64) -> StoreResult<()> {
    if current.resource_version != expected {
        return Err(StoreError::Conflict {
            kind,
            namespace: current.namespace.clone(),
            name: current.name.clone(),
            expected,
            actual: current.resource_version,
        });
    }
    Ok(())
}

fn encode<R: serde::Serialize>(resource: &R) -> StoreResult<Value> {
    serde_json::to_value(resource).map_err(|e| StoreError::Invalid(e.to_string()))
}

fn decode<R: serde::de::DeserializeOwned>(value: &Value) -> StoreResult<R> {
    R::deserialize(value).map_err(|e| StoreError::Invalid(e.to_string()))
}

fn meta_of(value: &Value) -> StoreResult<ObjectMeta> {
    match value.get("metadata") {
        Some(meta) => decode(meta),
        None => Err(StoreError::Invalid("object has no metadata".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClusterSpec, ClusterState, ClusterStatus, PodPhase};

    fn cluster(name: &str) -> Cluster {
        Cluster::new("default", name, ClusterSpec::default())
    }

    fn owned_pod(owner: &Cluster, name: &str) -> Pod {
        let mut metadata = ObjectMeta::new("default", name);
        metadata.owner_references.push(owner.owner_reference());
        Pod {
            metadata,
            spec: Value::Null,
            status: PodStatus::default(),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let store = MemoryStore::new();
        let created = store.create(&cluster("c1")).await.unwrap();

        assert!(!created.metadata.uid.is_empty());
        assert_eq!(created.metadata.generation, 1);
        assert!(created.metadata.resource_version > 0);
        assert!(created.metadata.creation_timestamp.is_some());

        let fetched: Cluster = store.get("default", "c1").await.unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_create_existing_is_already_exists() {
        let store = MemoryStore::new();
        store.create(&cluster("c1")).await.unwrap();
        let err = store.create(&cluster("c1")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_name() {
        let store = MemoryStore::new();
        let err = store.create(&cluster("Bad_Name")).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get::<Pod>("default", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(&cluster("c1")).await.unwrap();

        let mut first = created.clone();
        first.spec.suspend = true;
        store.update(&first).await.unwrap();

        let mut stale = created;
        stale.spec.enable_in_tree_autoscaling = true;
        let err = store.update(&stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_generation_tracks_spec_changes_only() {
        let store = MemoryStore::new();
        let created = store.create(&cluster("c1")).await.unwrap();

        let mut labelled = created.clone();
        labelled.metadata.labels.insert("team".into(), "ml".into());
        let labelled = store.update(&labelled).await.unwrap();
        assert_eq!(labelled.metadata.generation, 1);

        let mut suspended = labelled;
        suspended.spec.suspend = true;
        let suspended = store.update(&suspended).await.unwrap();
        assert_eq!(suspended.metadata.generation, 2);

        let mut with_status = suspended;
        with_status.status = Some(ClusterStatus::default());
        let written = store.update_status(&with_status).await.unwrap();
        assert_eq!(written.metadata.generation, 2);
    }

    #[tokio::test]
    async fn test_update_does_not_touch_status() {
        let store = MemoryStore::new();
        let mut c = store.create(&cluster("c1")).await.unwrap();
        c.status = Some(ClusterStatus {
            state: ClusterState::Ready,
            ..Default::default()
        });
        let c = store.update_status(&c).await.unwrap();

        let mut edit = c.clone();
        edit.status = None;
        edit.spec.suspend = true;
        let updated = store.update(&edit).await.unwrap();
        assert_eq!(updated.status.unwrap().state, ClusterState::Ready);
    }

    #[tokio::test]
    async fn test_update_status_conflicts_on_stale_version() {
        let store = MemoryStore::new();
        let c = store.create(&cluster("c1")).await.unwrap();

        let mut edit = c.clone();
        edit.spec.suspend = true;
        store.update(&edit).await.unwrap();

        let mut stale = c;
        stale.status = Some(ClusterStatus::default());
        assert!(store.update_status(&stale).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_cluster_delete_collects_dependents() {
        let store = MemoryStore::new();
        let c = store.create(&cluster("c1")).await.unwrap();
        let other = store.create(&cluster("c2")).await.unwrap();
        store.create(&owned_pod(&c, "p1")).await.unwrap();
        store.create(&owned_pod(&c, "p2")).await.unwrap();
        store.create(&owned_pod(&other, "p3")).await.unwrap();

        store.delete::<Cluster>("default", "c1").await.unwrap();

        let pods: Vec<Pod> = store.list(None, &LabelSelector::new()).await.unwrap();
        let names: Vec<_> = pods.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["p3"]);
    }

    #[tokio::test]
    async fn test_graceful_pod_deletion() {
        let store = MemoryStore::with_graceful_pod_deletion();
        let c = store.create(&cluster("c1")).await.unwrap();
        store.create(&owned_pod(&c, "p1")).await.unwrap();

        store.delete::<Pod>("default", "p1").await.unwrap();
        let pod: Pod = store.get("default", "p1").await.unwrap();
        assert!(pod.is_terminating());

        // Deleting again while terminating is a no-op.
        store.delete::<Pod>("default", "p1").await.unwrap();
        assert_eq!(store.mutation_counts().deletes, 1);

        assert_eq!(store.complete_terminations(), 1);
        assert!(store.get::<Pod>("default", "p1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_watch_reports_changes() {
        let store = MemoryStore::new();
        let mut rx = store.watch();

        let c = store.create(&cluster("c1")).await.unwrap();
        store.create(&owned_pod(&c, "p1")).await.unwrap();
        store
            .set_pod_status(
                "default",
                "p1",
                PodStatus {
                    phase: PodPhase::Running,
                    ready: true,
                },
            )
            .unwrap();
        store.delete::<Pod>("default", "p1").await.unwrap();

        let changes: Vec<_> = (0..4)
            .map(|_| {
                let e = rx.try_recv().unwrap();
                (e.kind, e.change)
            })
            .collect();
        assert_eq!(
            changes,
            vec![
                (ResourceKind::Cluster, ChangeKind::Added),
                (ResourceKind::Pod, ChangeKind::Added),
                (ResourceKind::Pod, ChangeKind::Modified),
                (ResourceKind::Pod, ChangeKind::Deleted),
            ]
        );
    }

    #[tokio::test]
    async fn test_list_filters_by_selector() {
        let store = MemoryStore::new();
        let c = store.create(&cluster("c1")).await.unwrap();
        let mut labelled = owned_pod(&c, "p1");
        labelled.metadata.labels.insert("app".into(), "ray".into());
        store.create(&labelled).await.unwrap();
        store.create(&owned_pod(&c, "p2")).await.unwrap();

        let selector = LabelSelector::new().with("app", "ray");
        let pods: Vec<Pod> = store.list(Some("default"), &selector).await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].name(), "p1");

        let none: Vec<Pod> = store.list(Some("other"), &LabelSelector::new()).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_injected_fault_is_consumed() {
        let store = MemoryStore::new();
        store.inject(Fault::once(
            Op::Create,
            ResourceKind::Cluster,
            StoreError::Transient("boom".into()),
        ));

        assert!(matches!(
            store.create(&cluster("c1")).await,
            Err(StoreError::Transient(_))
        ));
        store.create(&cluster("c1")).await.unwrap();
        assert_eq!(store.mutation_counts().creates, 1);
    }
}
