//! Object model shared by the store and the controller.
//!
//! Field names serialize in camelCase to match the platform's wire shape.

mod cluster;
mod meta;
mod resources;

pub use cluster::*;
pub use meta::*;
pub use resources::*;

use serde::{de::DeserializeOwned, Serialize};

/// Kinds of objects the store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, serde::Deserialize)]
pub enum ResourceKind {
    Cluster,
    Pod,
    Service,
    RoleBinding,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Cluster => CLUSTER_KIND,
            ResourceKind::Pod => "Pod",
            ResourceKind::Service => "Service",
            ResourceKind::RoleBinding => "RoleBinding",
        };
        f.write_str(s)
    }
}

/// A typed object the store can persist.
pub trait Resource: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const KIND: ResourceKind;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

macro_rules! impl_resource {
    ($ty:ty, $kind:expr) => {
        impl Resource for $ty {
            const KIND: ResourceKind = $kind;

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

impl_resource!(Cluster, ResourceKind::Cluster);
impl_resource!(Pod, ResourceKind::Pod);
impl_resource!(Service, ResourceKind::Service);
impl_resource!(RoleBinding, ResourceKind::RoleBinding);
