use raycon_id::ClusterKey;
use raycon_reconcile::Retryable;

use crate::model::ResourceKind;
use crate::store::StoreError;

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors surfaced by a reconciliation pass.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A managed resource could not be created.
    #[error("failed to create {kind} {name}: {source}")]
    CreateFailed {
        kind: ResourceKind,
        name: String,
        #[source]
        source: StoreError,
    },

    /// A newer spec generation arrived while the pass was running.
    #[error("reconciliation of {0} superseded by a newer spec")]
    Superseded(ClusterKey),
}

impl ControllerError {
    /// True when the failure came from creating a managed resource.
    pub fn is_creation_failure(&self) -> bool {
        matches!(self, ControllerError::CreateFailed { .. })
    }
}

impl Retryable for ControllerError {
    fn is_retryable(&self) -> bool {
        match self {
            ControllerError::Store(e) => e.is_retryable(),
            ControllerError::CreateFailed { source, .. } => source.is_retryable(),
            ControllerError::Superseded(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_follows_store_error() {
        let conflict = ControllerError::from(StoreError::Conflict {
            kind: ResourceKind::Cluster,
            namespace: "default".into(),
            name: "c".into(),
            expected: 1,
            actual: 2,
        });
        assert!(conflict.is_retryable());

        let invalid = ControllerError::CreateFailed {
            kind: ResourceKind::Pod,
            name: "p".into(),
            source: StoreError::Invalid("bad".into()),
        };
        assert!(!invalid.is_retryable());
        assert!(invalid.is_creation_failure());

        let superseded = ControllerError::Superseded(ClusterKey::new("default", "c"));
        assert!(!superseded.is_retryable());
    }
}
