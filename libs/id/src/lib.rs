//! # raycon-id
//!
//! Identity and naming conventions for clusters and the resources the
//! controller manages on their behalf.
//!
//! ## Design Principles
//!
//! - A cluster is addressed by `namespace/name`; that key is the unit of
//!   work-queue deduplication
//! - Names of singleton resources (head service, role binding) are derived
//!   deterministically from the cluster name
//! - Pod names are generated with a fresh ULID suffix and are never reused
//! - Every generated name is a valid DNS-1123 label
//!
//! ## Pod Name Format
//!
//! - `{cluster}-head-{suffix}`
//! - `{cluster}-{group}-worker-{suffix}`
//!
//! The suffix is a lowercase ULID, so names sort by creation time.

mod error;
mod key;
mod names;

pub use error::IdError;
pub use key::ClusterKey;
pub use names::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
