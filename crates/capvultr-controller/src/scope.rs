//! Per-reconcile scopes
//!
//! A scope holds the working copy of the object being reconciled together
//! with the snapshot that was last persisted. Reconcilers mutate the working
//! copy freely; [`ObjectScope::patch_object`] writes it back mid-call and
//! [`ObjectScope::close`] writes it back on exit. Both skip the store when
//! nothing changed, and a stale version comes back as an error so the
//! scheduler redelivers against a fresh read.

use crate::error::{ReconcileError, Result, Target};
use crate::store::{Store, StoreError};
use capvultr_api::{
    API_SERVER_ROLE, Cluster, Machine, NODE_ROLE, PROVIDER_ID_SCHEME, ProviderId, Resource,
    VultrCluster, VultrMachine,
};

/// Working copy of one stored object
pub struct ObjectScope<'a, S: Store, K: Resource> {
    store: &'a S,
    target: Target,
    object: K,
    persisted: serde_json::Value,
}

impl<'a, S: Store, K: Resource> ObjectScope<'a, S, K> {
    pub fn new(store: &'a S, object: K) -> Result<Self> {
        let target = Target::of(&object);
        let persisted = snapshot(&target, &object)?;
        Ok(Self {
            store,
            target,
            object,
            persisted,
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn object(&self) -> &K {
        &self.object
    }

    pub fn object_mut(&mut self) -> &mut K {
        &mut self.object
    }

    /// Whether the working copy differs from what was last persisted
    pub fn is_dirty(&self) -> Result<bool> {
        Ok(snapshot(&self.target, &self.object)? != self.persisted)
    }

    /// Persist the working copy now
    pub async fn patch_object(&mut self) -> Result<()> {
        if !self.is_dirty()? {
            return Ok(());
        }

        let updated = self
            .store
            .update(&self.object)
            .await
            .map_err(ReconcileError::store(&self.target, "patch object"))?;
        tracing::debug!(
            kind = self.target.kind,
            key = %self.target.key,
            version = updated.meta().resource_version,
            "Persisted object"
        );

        self.persisted = snapshot(&self.target, &updated)?;
        self.object = updated;
        Ok(())
    }

    /// Persist any pending change and release the scope
    pub async fn close(mut self) -> Result<()> {
        self.patch_object().await
    }
}

/// Combines a reconcile result with the result of closing its scope
///
/// The reconcile error wins; a close error is only surfaced when the
/// reconcile itself succeeded.
pub fn finish<T>(result: Result<T>, closed: Result<()>) -> Result<T> {
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            tracing::warn!(error = %close_err, "Failed to persist status after reconcile error");
            Err(e)
        }
    }
}

fn snapshot<K: Resource>(target: &Target, object: &K) -> Result<serde_json::Value> {
    serde_json::to_value(object)
        .map_err(|e| ReconcileError::store(target, "snapshot object")(StoreError::Json(e)))
}

/// Everything a VultrCluster reconcile needs
pub struct ClusterScope<'a, S: Store> {
    pub cluster: Cluster,
    inner: ObjectScope<'a, S, VultrCluster>,
}

impl<'a, S: Store> ClusterScope<'a, S> {
    pub fn new(store: &'a S, cluster: Cluster, vultr_cluster: VultrCluster) -> Result<Self> {
        Ok(Self {
            cluster,
            inner: ObjectScope::new(store, vultr_cluster)?,
        })
    }

    pub fn target(&self) -> &Target {
        self.inner.target()
    }

    pub fn vultr_cluster(&self) -> &VultrCluster {
        self.inner.object()
    }

    pub fn vultr_cluster_mut(&mut self) -> &mut VultrCluster {
        self.inner.object_mut()
    }

    /// Name of the owning Cluster
    pub fn name(&self) -> &str {
        &self.cluster.metadata.name
    }

    /// UID of the owning Cluster
    pub fn uid(&self) -> &str {
        &self.cluster.metadata.uid
    }

    pub fn region(&self) -> &str {
        &self.vultr_cluster().spec.region
    }

    pub async fn patch_object(&mut self) -> Result<()> {
        self.inner.patch_object().await
    }

    pub async fn close(self) -> Result<()> {
        self.inner.close().await
    }
}

/// Everything a VultrMachine reconcile needs
pub struct MachineScope<'a, S: Store> {
    pub cluster: Cluster,
    pub machine: Machine,
    pub vultr_cluster: VultrCluster,
    inner: ObjectScope<'a, S, VultrMachine>,
}

impl<'a, S: Store> MachineScope<'a, S> {
    pub fn new(
        store: &'a S,
        cluster: Cluster,
        machine: Machine,
        vultr_cluster: VultrCluster,
        vultr_machine: VultrMachine,
    ) -> Result<Self> {
        Ok(Self {
            cluster,
            machine,
            vultr_cluster,
            inner: ObjectScope::new(store, vultr_machine)?,
        })
    }

    pub fn target(&self) -> &Target {
        self.inner.target()
    }

    pub fn vultr_machine(&self) -> &VultrMachine {
        self.inner.object()
    }

    pub fn vultr_machine_mut(&mut self) -> &mut VultrMachine {
        self.inner.object_mut()
    }

    pub fn name(&self) -> &str {
        &self.vultr_machine().metadata.name
    }

    pub fn is_control_plane(&self) -> bool {
        self.machine.is_control_plane()
    }

    /// Role used in the instance's ownership tags
    pub fn role(&self) -> &'static str {
        if self.is_control_plane() {
            API_SERVER_ROLE
        } else {
            NODE_ROLE
        }
    }

    /// Instance id recorded in the provider id, if any
    pub fn instance_id(&self) -> Option<String> {
        self.vultr_machine().instance_id()
    }

    /// Records the provider id
    ///
    /// A valid recorded id is never replaced. A malformed one is overwritten,
    /// since `instance_id` already treats it as "no instance yet".
    pub fn set_provider_id(&mut self, instance_id: &str) {
        if self.vultr_machine().parsed_provider_id().is_some() {
            return;
        }
        let spec = &mut self.vultr_machine_mut().spec;
        spec.provider_id = Some(ProviderId::new(PROVIDER_ID_SCHEME, instance_id).to_string());
    }

    pub async fn patch_object(&mut self) -> Result<()> {
        self.inner.patch_object().await
    }

    pub async fn close(self) -> Result<()> {
        self.inner.close().await
    }
}
