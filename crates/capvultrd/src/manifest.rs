//! Seeding the store from YAML manifests
//!
//! A manifest file holds one or more YAML documents separated by `---`. Each
//! document names its `kind`; unknown kinds are rejected.

use anyhow::{Context, bail};
use capvultr_api::{Cluster, Machine, Resource, Secret, VultrCluster, VultrMachine};
use capvultr_controller::{Store, StoreError};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone)]
pub enum Manifest {
    Cluster(Cluster),
    Machine(Machine),
    Secret(Secret),
    VultrCluster(VultrCluster),
    VultrMachine(VultrMachine),
}

impl Manifest {
    fn kind(&self) -> &'static str {
        match self {
            Manifest::Cluster(_) => Cluster::KIND,
            Manifest::Machine(_) => Machine::KIND,
            Manifest::Secret(_) => Secret::KIND,
            Manifest::VultrCluster(_) => VultrCluster::KIND,
            Manifest::VultrMachine(_) => VultrMachine::KIND,
        }
    }
}

/// Parses every document in `content`
pub fn parse(content: &str) -> anyhow::Result<Vec<Manifest>> {
    let mut manifests = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
        let value = serde_yaml::Value::deserialize(document)
            .with_context(|| format!("document {} is not valid YAML", index + 1))?;
        if value.is_null() {
            continue;
        }

        let kind = value
            .get("kind")
            .and_then(|k| k.as_str())
            .with_context(|| format!("document {} has no kind", index + 1))?
            .to_string();

        let manifest = match kind.as_str() {
            Cluster::KIND => Manifest::Cluster(decode(value, &kind, index)?),
            Machine::KIND => Manifest::Machine(decode(value, &kind, index)?),
            Secret::KIND => Manifest::Secret(decode(value, &kind, index)?),
            VultrCluster::KIND => Manifest::VultrCluster(decode(value, &kind, index)?),
            VultrMachine::KIND => Manifest::VultrMachine(decode(value, &kind, index)?),
            other => bail!("document {} has unsupported kind '{}'", index + 1, other),
        };
        manifests.push(manifest);
    }
    Ok(manifests)
}

fn decode<K: Resource>(value: serde_yaml::Value, kind: &str, index: usize) -> anyhow::Result<K> {
    serde_yaml::from_value(value).with_context(|| format!("document {} is not a valid {}", index + 1, kind))
}

/// Creates every object in `path` that the store does not hold yet
///
/// Objects that already exist are left as stored so that status written by
/// the controllers survives a restart.
pub async fn apply<S: Store>(store: &S, path: &Path) -> anyhow::Result<usize> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read manifest {}", path.display()))?;
    let manifests =
        parse(&content).with_context(|| format!("Failed to parse manifest {}", path.display()))?;

    let mut created = 0;
    for manifest in manifests {
        let kind = manifest.kind();
        let result = match manifest {
            Manifest::Cluster(obj) => create(store, &obj).await,
            Manifest::Machine(obj) => create(store, &obj).await,
            Manifest::Secret(obj) => create(store, &obj).await,
            Manifest::VultrCluster(obj) => create(store, &obj).await,
            Manifest::VultrMachine(obj) => create(store, &obj).await,
        };
        match result {
            Ok(true) => created += 1,
            Ok(false) => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to store {}", kind)),
        }
    }
    Ok(created)
}

async fn create<S: Store, K: Resource>(store: &S, obj: &K) -> Result<bool, StoreError> {
    match store.create(obj).await {
        Ok(stored) => {
            tracing::info!(kind = K::KIND, key = %stored.key(), "Created object from manifest");
            Ok(true)
        }
        Err(StoreError::AlreadyExists { key, .. }) => {
            tracing::debug!(kind = K::KIND, key = %key, "Object already stored, keeping it");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
