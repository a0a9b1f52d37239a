//! Cross-resource mappers
//!
//! A mapper turns a change of one kind into the keys of the objects that have
//! to be reconciled because of it. Every mapping reads the store at call time;
//! nothing is cached. Lookup errors are logged and map to no keys.

use crate::owners::owner_cluster;
use crate::store::{ListParams, Store};
use async_trait::async_trait;
use capvultr_api::{
    CLUSTER_NAME_LABEL, Cluster, Machine, ObjectKey, ObjectReference, Resource, VultrCluster,
    VultrMachine,
};
use std::sync::Arc;

/// Maps a changed object to the keys it affects
#[async_trait]
pub trait Mapper: Send + Sync {
    async fn map(&self, key: &ObjectKey) -> Vec<ObjectKey>;
}

/// Key named by an infrastructure reference, if it points at `K`
fn referenced<K: Resource>(namespace: &str, reference: &ObjectReference) -> Option<ObjectKey> {
    (reference.kind == K::KIND && !reference.name.is_empty())
        .then(|| ObjectKey::new(namespace, &reference.name))
}

/// VultrMachines of every Machine in the cluster that owns `vultr_cluster`
pub async fn vultr_cluster_to_vultr_machines<S: Store>(
    store: &S,
    vultr_cluster: &VultrCluster,
) -> crate::store::Result<Vec<ObjectKey>> {
    let Some(cluster) = owner_cluster(store, vultr_cluster).await? else {
        tracing::debug!(
            vultr_cluster = %vultr_cluster.key(),
            "VultrCluster has no owner Cluster yet"
        );
        return Ok(Vec::new());
    };

    let params = ListParams::default()
        .namespace(&cluster.metadata.namespace)
        .label(CLUSTER_NAME_LABEL, &cluster.metadata.name);
    let machines: Vec<Machine> = store.list(&params).await?;

    Ok(machines
        .iter()
        .filter_map(|m| referenced::<VultrMachine>(&m.metadata.namespace, &m.spec.infrastructure_ref))
        .collect())
}

/// The VultrCluster a Cluster points at
pub fn cluster_to_vultr_cluster(cluster: &Cluster) -> Option<ObjectKey> {
    cluster
        .spec
        .infrastructure_ref
        .as_ref()
        .and_then(|r| referenced::<VultrCluster>(&cluster.metadata.namespace, r))
}

/// The VultrMachine a Machine points at
pub fn machine_to_vultr_machine(machine: &Machine) -> Option<ObjectKey> {
    referenced::<VultrMachine>(&machine.metadata.namespace, &machine.spec.infrastructure_ref)
}

/// Every VultrMachine labelled with the Cluster's name
pub async fn cluster_to_vultr_machines<S: Store>(
    store: &S,
    cluster: &Cluster,
) -> crate::store::Result<Vec<ObjectKey>> {
    let params = ListParams::default()
        .namespace(&cluster.metadata.namespace)
        .label(CLUSTER_NAME_LABEL, &cluster.metadata.name);
    let machines: Vec<VultrMachine> = store.list(&params).await?;
    Ok(machines.iter().map(|m| m.key()).collect())
}

/// VultrCluster changes -> VultrMachines
pub struct VultrClusterToVultrMachines<S> {
    store: Arc<S>,
}

impl<S> VultrClusterToVultrMachines<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: Store> Mapper for VultrClusterToVultrMachines<S> {
    async fn map(&self, key: &ObjectKey) -> Vec<ObjectKey> {
        let vultr_cluster = match self.store.get::<VultrCluster>(key).await {
            Ok(Some(vc)) => vc,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::error!(vultr_cluster = %key, error = %e, "Failed to get VultrCluster");
                return Vec::new();
            }
        };
        vultr_cluster_to_vultr_machines(self.store.as_ref(), &vultr_cluster)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(vultr_cluster = %key, error = %e, "Failed to list Machines");
                Vec::new()
            })
    }
}

/// Cluster changes -> its VultrCluster
pub struct ClusterToVultrCluster<S> {
    store: Arc<S>,
}

impl<S> ClusterToVultrCluster<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: Store> Mapper for ClusterToVultrCluster<S> {
    async fn map(&self, key: &ObjectKey) -> Vec<ObjectKey> {
        match self.store.get::<Cluster>(key).await {
            Ok(Some(cluster)) => cluster_to_vultr_cluster(&cluster).into_iter().collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::error!(cluster = %key, error = %e, "Failed to get Cluster");
                Vec::new()
            }
        }
    }
}

/// Machine changes -> its VultrMachine
pub struct MachineToVultrMachine<S> {
    store: Arc<S>,
}

impl<S> MachineToVultrMachine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: Store> Mapper for MachineToVultrMachine<S> {
    async fn map(&self, key: &ObjectKey) -> Vec<ObjectKey> {
        match self.store.get::<Machine>(key).await {
            Ok(Some(machine)) => machine_to_vultr_machine(&machine).into_iter().collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::error!(machine = %key, error = %e, "Failed to get Machine");
                Vec::new()
            }
        }
    }
}

/// Cluster changes (e.g. infrastructure ready) -> its VultrMachines
pub struct ClusterToVultrMachines<S> {
    store: Arc<S>,
}

impl<S> ClusterToVultrMachines<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: Store> Mapper for ClusterToVultrMachines<S> {
    async fn map(&self, key: &ObjectKey) -> Vec<ObjectKey> {
        let cluster = match self.store.get::<Cluster>(key).await {
            Ok(Some(cluster)) => cluster,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::error!(cluster = %key, error = %e, "Failed to get Cluster");
                return Vec::new();
            }
        };
        cluster_to_vultr_machines(self.store.as_ref(), &cluster)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(cluster = %key, error = %e, "Failed to list VultrMachines");
                Vec::new()
            })
    }
}
