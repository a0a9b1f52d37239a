//! Owner-chain lookups
//!
//! Each function does one uncached store read. Missing links resolve to
//! `Ok(None)`; the reconcilers treat that as "not ready yet".

use crate::store::{Result, Store};
use capvultr_api::{
    BOOTSTRAP_DATA_KEY, CLUSTER_NAME_LABEL, Cluster, Machine, ObjectKey, Resource, Secret,
    VultrCluster, VultrMachine,
};

/// The Machine that owns a VultrMachine
pub async fn owner_machine<S: Store>(store: &S, vm: &VultrMachine) -> Result<Option<Machine>> {
    let Some(owner) = vm.metadata.owner_of_kind(Machine::KIND) else {
        return Ok(None);
    };
    store
        .get(&ObjectKey::new(&vm.metadata.namespace, &owner.name))
        .await
}

/// The Cluster that owns a VultrCluster
pub async fn owner_cluster<S: Store>(store: &S, vc: &VultrCluster) -> Result<Option<Cluster>> {
    let Some(owner) = vc.metadata.owner_of_kind(Cluster::KIND) else {
        return Ok(None);
    };
    store
        .get(&ObjectKey::new(&vc.metadata.namespace, &owner.name))
        .await
}

/// Name of the cluster an object belongs to, taken from the cluster-name label
pub fn cluster_name_of<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta()
        .labels
        .get(CLUSTER_NAME_LABEL)
        .map(String::as_str)
        .filter(|n| !n.is_empty())
}

/// The Cluster a Machine belongs to
pub async fn machine_cluster<S: Store>(store: &S, machine: &Machine) -> Result<Option<Cluster>> {
    let name = if machine.spec.cluster_name.is_empty() {
        match cluster_name_of(machine) {
            Some(name) => name.to_string(),
            None => return Ok(None),
        }
    } else {
        machine.spec.cluster_name.clone()
    };
    store
        .get(&ObjectKey::new(&machine.metadata.namespace, name))
        .await
}

/// The VultrCluster a Cluster points at through its infrastructure reference
pub async fn infrastructure_cluster<S: Store>(
    store: &S,
    cluster: &Cluster,
) -> Result<Option<VultrCluster>> {
    let Some(reference) = &cluster.spec.infrastructure_ref else {
        return Ok(None);
    };
    if reference.kind != VultrCluster::KIND || reference.name.is_empty() {
        return Ok(None);
    }
    store
        .get(&ObjectKey::new(&cluster.metadata.namespace, &reference.name))
        .await
}

/// State of a Machine's bootstrap data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapData {
    /// The Machine does not name a data secret yet
    Pending,
    Ready(String),
    /// The named secret is missing or has no data key
    Unavailable(String),
}

/// Bootstrap data for a Machine, read from its data secret
pub async fn bootstrap_data<S: Store>(store: &S, machine: &Machine) -> Result<BootstrapData> {
    let Some(secret_name) = machine
        .spec
        .bootstrap
        .data_secret_name
        .as_deref()
        .filter(|n| !n.is_empty())
    else {
        return Ok(BootstrapData::Pending);
    };

    let key = ObjectKey::new(&machine.metadata.namespace, secret_name);
    let Some(secret) = store.get::<Secret>(&key).await? else {
        return Ok(BootstrapData::Unavailable(format!("secret {} not found", key)));
    };

    Ok(match secret.data.get(BOOTSTRAP_DATA_KEY) {
        Some(data) => BootstrapData::Ready(data.clone()),
        None => BootstrapData::Unavailable(format!(
            "secret {} has no '{}' key",
            key, BOOTSTRAP_DATA_KEY
        )),
    })
}
