//! Startup manifest: clusters to load into the store before the controller
//! starts.
//!
//! The file holds either one cluster object or a JSON array of them, in the
//! same shape the store keeps (`metadata`, `spec`).

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::model::Cluster;
use crate::store::ResourceAccessor;

#[derive(Deserialize)]
#[serde(untagged)]
enum Manifest {
    Many(Vec<Cluster>),
    One(Box<Cluster>),
}

/// Parse a manifest document.
pub fn parse(json: &str) -> Result<Vec<Cluster>> {
    let manifest: Manifest = serde_json::from_str(json).context("invalid cluster manifest")?;
    Ok(match manifest {
        Manifest::Many(clusters) => clusters,
        Manifest::One(cluster) => vec![*cluster],
    })
}

pub async fn load(path: &Path) -> Result<Vec<Cluster>> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    parse(&json)
}

/// Create every cluster in the store. Clusters that already exist are left
/// alone.
pub async fn seed<S: ResourceAccessor>(store: &S, clusters: Vec<Cluster>) -> Result<usize> {
    let mut created = 0;
    for mut cluster in clusters {
        // Store-assigned fields from an exported manifest are not reused.
        cluster.metadata.uid.clear();
        cluster.metadata.resource_version = 0;
        cluster.status = None;

        match store.create(&cluster).await {
            Ok(c) => {
                info!(cluster = %c.key(), "Seeded cluster");
                created += 1;
            }
            Err(e) if e.is_already_exists() => {
                warn!(cluster = %cluster.key(), "Cluster already exists, skipping");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to seed cluster {}", cluster.key()))
            }
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LabelSelector, MemoryStore};

    const SAMPLE: &str = r#"{
        "metadata": { "name": "raycluster-sample", "namespace": "default" },
        "spec": {
            "headGroupSpec": { "rayStartParams": { "port": "6379" } },
            "workerGroupSpecs": [
                { "groupName": "small-group", "replicas": 3, "minReplicas": 0, "maxReplicas": 4 }
            ]
        }
    }"#;

    #[test]
    fn test_parse_single_and_list() {
        assert_eq!(parse(SAMPLE).unwrap().len(), 1);
        assert_eq!(parse(&format!("[{SAMPLE}, {SAMPLE}]")).unwrap().len(), 2);
        assert!(parse("{\"spec\": 1}").is_err());
    }

    #[tokio::test]
    async fn test_seed_skips_existing() {
        let store = MemoryStore::new();
        let clusters = parse(&format!("[{SAMPLE}, {SAMPLE}]")).unwrap();

        assert_eq!(seed(&store, clusters).await.unwrap(), 1);
        let stored: Vec<Cluster> = store.list(None, &LabelSelector::new()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].spec.worker_group_specs[0].replicas, Some(3));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = load(Path::new("/nonexistent/raycon.json")).await.unwrap_err();
        assert!(err.to_string().contains("failed to read manifest"));
    }
}
