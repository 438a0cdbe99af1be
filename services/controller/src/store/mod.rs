//! Resource accessor contract.
//!
//! The controller talks to the platform's object store only through
//! [`ResourceAccessor`]: eventually consistent reads, conditional writes
//! keyed on `resourceVersion`, and an at-least-once watch stream.
//! [`MemoryStore`] is the in-process adapter.

mod memory;

pub use memory::{Fault, MemoryStore, MutationCounts, Op};

use std::collections::BTreeMap;

use async_trait::async_trait;
use raycon_reconcile::Retryable;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{Cluster, ObjectMeta, Resource, ResourceKind};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Store failures, as seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Object absent. Usually benign: "needs creation" or "already gone".
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },

    /// Create of an existing identity. Benign on create.
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },

    /// Conditional write against a stale version.
    #[error("conflict on {kind} {namespace}/{name}: expected version {expected}, found {actual}")]
    Conflict {
        kind: ResourceKind,
        namespace: String,
        name: String,
        expected: u64,
        actual: u64,
    },

    /// Network failure or timeout.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Malformed object.
    #[error("invalid object: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Transient(_))
    }
}

/// Equality-based label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// A change notification. Delivery is at-least-once with no ordering
/// guarantee across objects.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: ResourceKind,
    pub change: ChangeKind,
    pub metadata: ObjectMeta,
}

/// Typed CRUD, list, and watch over the platform's objects.
#[async_trait]
pub trait ResourceAccessor: Send + Sync + 'static {
    async fn get<R: Resource>(&self, namespace: &str, name: &str) -> StoreResult<R>;

    /// List objects of `R`, optionally restricted to a namespace.
    async fn list<R: Resource>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<R>>;

    /// Create; fails with `AlreadyExists` if the identity is taken.
    async fn create<R: Resource>(&self, resource: &R) -> StoreResult<R>;

    /// Conditional update keyed on `resource.meta().resource_version`.
    /// The status of a cluster is not changed by this call.
    async fn update<R: Resource>(&self, resource: &R) -> StoreResult<R>;

    /// Conditional write of the cluster status subresource only.
    async fn update_status(&self, cluster: &Cluster) -> StoreResult<Cluster>;

    async fn delete<R: Resource>(&self, namespace: &str, name: &str) -> StoreResult<()>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
