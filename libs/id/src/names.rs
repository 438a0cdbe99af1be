//! Resource names and label conventions.

use crate::IdError;
use ulid::Ulid;

// =============================================================================
// Labels
// =============================================================================

/// Label carrying the owning cluster name.
pub const LABEL_CLUSTER: &str = "ray.io/cluster";

/// Label carrying the group name (`headgroup` for the head pod).
pub const LABEL_GROUP: &str = "ray.io/group";

/// Label carrying the node type (`head` or `worker`).
pub const LABEL_NODE_TYPE: &str = "ray.io/node-type";

/// Label carrying `{cluster}-{node-type}`; the head service selects on it.
pub const LABEL_IDENTIFIER: &str = "ray.io/identifier";

/// Group label value for the head pod.
pub const HEAD_GROUP: &str = "headgroup";

/// Maximum length of a DNS-1123 label.
pub const MAX_NAME_LEN: usize = 63;

/// Node type of a managed pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Head,
    Worker,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Head => "head",
            NodeType::Worker => "worker",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Derived names
// =============================================================================

/// Value of [`LABEL_IDENTIFIER`] for a cluster's pods of one node type.
pub fn node_identifier(cluster: &str, node_type: NodeType) -> String {
    format!("{cluster}-{node_type}")
}

/// Name of the head service.
pub fn head_service_name(cluster: &str) -> String {
    truncate(&format!("{cluster}-head-svc"), MAX_NAME_LEN)
}

/// Name of the autoscaler role binding (and the role and service account it
/// binds).
pub fn role_binding_name(cluster: &str) -> String {
    cluster.to_string()
}

/// Generates a fresh head pod name.
pub fn head_pod_name(cluster: &str) -> String {
    generated_name(&format!("{cluster}-head"))
}

/// Generates a fresh worker pod name for `group`.
pub fn worker_pod_name(cluster: &str, group: &str) -> String {
    generated_name(&format!("{cluster}-{group}-worker"))
}

/// Appends a fresh lowercase ULID to `prefix`, truncating the prefix so the
/// result fits in [`MAX_NAME_LEN`].
fn generated_name(prefix: &str) -> String {
    let suffix = Ulid::new().to_string().to_ascii_lowercase();
    let budget = MAX_NAME_LEN - suffix.len() - 1;
    let prefix = truncate(prefix, budget);
    format!("{prefix}-{suffix}")
}

/// Truncates to `max` bytes and strips trailing dashes so the result is
/// still a valid label.
fn truncate(name: &str, max: usize) -> String {
    let mut end = name.len().min(max);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].trim_end_matches('-').to_string()
}

// =============================================================================
// Validation
// =============================================================================

/// Validates a DNS-1123 label: `[a-z0-9]([-a-z0-9]*[a-z0-9])?`, at most 63
/// characters.
pub fn validate_name(name: &str) -> Result<(), IdError> {
    if name.is_empty() {
        return Err(IdError::Empty);
    }

    if name.len() > MAX_NAME_LEN {
        return Err(IdError::TooLong {
            name: name.to_string(),
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }

    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(IdError::InvalidName {
            name: name.to_string(),
            reason: "only lowercase alphanumerics and '-' are allowed",
        });
    }

    if name.starts_with('-') || name.ends_with('-') {
        return Err(IdError::InvalidName {
            name: name.to_string(),
            reason: "must start and end with an alphanumeric character",
        });
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_head_service_name() {
        assert_eq!(
            head_service_name("raycluster-sample"),
            "raycluster-sample-head-svc"
        );
    }

    #[test]
    fn test_node_identifier() {
        assert_eq!(
            node_identifier("raycluster-sample", NodeType::Head),
            "raycluster-sample-head"
        );
        assert_eq!(node_identifier("c", NodeType::Worker), "c-worker");
    }

    #[test]
    fn test_worker_pod_name_prefix() {
        let name = worker_pod_name("raycluster-sample", "small-group");
        assert!(name.starts_with("raycluster-sample-small-group-worker-"));
        validate_name(&name).unwrap();
    }

    #[test]
    fn test_pod_names_never_repeat() {
        let names: std::collections::HashSet<_> =
            (0..500).map(|_| worker_pod_name("c", "g")).collect();
        assert_eq!(names.len(), 500);
    }

    #[test]
    fn test_generated_names_sort_by_creation() {
        let first = head_pod_name("c");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = head_pod_name("c");
        assert!(first < second);
    }

    #[test]
    fn test_validate_name_errors() {
        assert!(validate_name("").unwrap_err().is_empty());
        assert!(matches!(
            validate_name("Upper"),
            Err(IdError::InvalidName { .. })
        ));
        assert!(matches!(
            validate_name("-lead"),
            Err(IdError::InvalidName { .. })
        ));
        assert!(matches!(
            validate_name(&"a".repeat(64)),
            Err(IdError::TooLong { len: 64, .. })
        ));
    }

    proptest! {
        #[test]
        fn generated_names_are_valid_labels(
            cluster in "[a-z][a-z0-9-]{0,61}[a-z0-9]",
            group in "[a-z][a-z0-9-]{0,61}[a-z0-9]",
        ) {
            let name = worker_pod_name(&cluster, &group);
            prop_assert!(validate_name(&name).is_ok(), "invalid name {}", name);
            let head = head_pod_name(&cluster);
            prop_assert!(validate_name(&head).is_ok(), "invalid name {}", head);
            prop_assert!(validate_name(&head_service_name(&cluster)).is_ok());
        }
    }
}
