//! VultrMachine reconciler
//!
//! Drives one compute instance through its lifecycle:
//!
//! ```text
//!   preconditions ─▶ finalizer ─▶ get or create instance ─▶ (control plane)
//!   join load balancer ─▶ resolve addresses ─▶ pending: requeue
//!                                             active:  ready
//!                                             other:   terminal failure
//! ```
//!
//! A recorded failure reason or message stops all automatic action on the
//! machine until someone clears it. Deletion is unaffected by that guard.

use crate::bootstrap::encode_user_data;
use crate::config::{AddressPolicy, ControllerConfig};
use crate::error::{ReconcileError, Result, Target};
use crate::events::{
    EventRecorder, INSTANCE_ATTACHED, INSTANCE_CREATE_FAILED, INSTANCE_CREATED, INSTANCE_DELETED,
    INSTANCE_FAILED, INSTANCE_READY, TracingRecorder,
};
use crate::owners::{BootstrapData, bootstrap_data, infrastructure_cluster, machine_cluster, owner_machine};
use crate::scheduler::{Action, Reconciler};
use crate::scope::{MachineScope, ObjectScope, finish};
use crate::store::{ListParams, Store};
use async_trait::async_trait;
use capvultr_api::condition::{
    ADDRESSES_RESOLVED_CONDITION, DELETING_REASON, INSTANCE_CREATE_FAILED_REASON,
    INSTANCE_FAILED_REASON, INSTANCE_PENDING_REASON, INSTANCE_READY_CONDITION,
    LOAD_BALANCER_ATTACHED_CONDITION, LOAD_BALANCER_NOT_ACTIVE_REASON,
    LOAD_BALANCER_PROVISIONING_REASON, NO_ADDRESSES_REASON, READY_CONDITION,
};
use capvultr_api::{
    AddressType, MACHINE_FINALIZER, MachineAddress, MachineStatusError, ObjectKey, PowerStatus,
    Resource, ServerState, SubscriptionStatus, TagParams, VultrMachine, build_tags,
};
use capvultr_cloud::{CloudError, CloudProvider, Instance, InstanceCreateRequest, LoadBalancerUpdate};
use std::sync::Arc;

/// Outcome of joining the cluster load balancer
enum Membership {
    Attached,
    /// The load balancer cannot take members yet
    NotReady { reason: &'static str, message: String },
}

pub struct MachineReconciler<S: Store> {
    store: Arc<S>,
    provider: Arc<dyn CloudProvider>,
    recorder: Arc<dyn EventRecorder>,
    config: ControllerConfig,
}

impl<S: Store> MachineReconciler<S> {
    pub fn new(store: Arc<S>, provider: Arc<dyn CloudProvider>, config: ControllerConfig) -> Self {
        Self {
            store,
            provider,
            recorder: Arc::new(TracingRecorder),
            config,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Loads the owner chain, or `None` while any link is not ready
    async fn load_scope(&self, vultr_machine: VultrMachine) -> Result<Option<MachineScope<'_, S>>> {
        let store = self.store.as_ref();
        let target = Target::of(&vultr_machine);
        let key = &target.key;

        let Some(machine) = owner_machine(store, &vultr_machine)
            .await
            .map_err(ReconcileError::store(&target, "get owner Machine"))?
        else {
            tracing::info!(vultr_machine = %key, "Machine controller has not yet set the owner reference");
            return Ok(None);
        };

        let Some(cluster) = machine_cluster(store, &machine)
            .await
            .map_err(ReconcileError::store(&target, "get Cluster"))?
        else {
            tracing::info!(vultr_machine = %key, machine = %machine.key(), "Machine is not associated with a Cluster yet");
            return Ok(None);
        };
        if cluster.is_paused() {
            tracing::info!(vultr_machine = %key, cluster = %cluster.key(), "Cluster is paused, skipping");
            return Ok(None);
        }
        if !cluster.status.infrastructure_ready {
            tracing::info!(vultr_machine = %key, cluster = %cluster.key(), "Cluster infrastructure is not ready yet");
            return Ok(None);
        }

        let Some(vultr_cluster) = infrastructure_cluster(store, &cluster)
            .await
            .map_err(ReconcileError::store(&target, "get VultrCluster"))?
        else {
            tracing::info!(vultr_machine = %key, cluster = %cluster.key(), "VultrCluster is not available yet");
            return Ok(None);
        };
        if vultr_cluster.metadata.is_paused() {
            tracing::info!(vultr_machine = %key, vultr_cluster = %vultr_cluster.key(), "VultrCluster is paused, skipping");
            return Ok(None);
        }

        if machine
            .spec
            .bootstrap
            .data_secret_name
            .as_deref()
            .is_none_or(str::is_empty)
        {
            tracing::info!(vultr_machine = %key, "Bootstrap data secret reference is not yet available");
            return Ok(None);
        }

        Ok(Some(MachineScope::new(
            store,
            cluster,
            machine,
            vultr_cluster,
            vultr_machine,
        )?))
    }

    async fn reconcile_normal(&self, scope: &mut MachineScope<'_, S>) -> Result<Action> {
        let target = scope.target().clone();
        tracing::info!(vultr_machine = %target.key, "Reconciling VultrMachine");

        if scope
            .vultr_machine_mut()
            .metadata
            .add_finalizer(MACHINE_FINALIZER)
        {
            scope.patch_object().await?;
        }

        let instance = match scope.instance_id() {
            Some(id) => {
                let found = self
                    .provider
                    .get_instance(&id)
                    .await
                    .map_err(ReconcileError::cloud(&target, "get instance"))?;
                match found {
                    Some(instance) => instance,
                    None => {
                        self.fail(scope, format!("Instance {} not found", id));
                        return Ok(Action::await_change());
                    }
                }
            }
            None => self.create_instance(scope).await?,
        };

        let status = &mut scope.vultr_machine_mut().status;
        status.subscription_status = Some(SubscriptionStatus::from(instance.status.as_str()));
        status.power_status = instance.power_status.clone().map(PowerStatus::from);
        status.server_state = instance.server_status.clone().map(ServerState::from);

        if scope.is_control_plane()
            && !scope
                .vultr_machine()
                .status
                .conditions
                .is_true(LOAD_BALANCER_ATTACHED_CONDITION)
        {
            match self.join_load_balancer(scope, &instance.id).await? {
                Membership::Attached => {
                    scope
                        .vultr_machine_mut()
                        .status
                        .conditions
                        .mark_true(LOAD_BALANCER_ATTACHED_CONDITION);
                }
                Membership::NotReady { reason, message } => {
                    tracing::info!(
                        vultr_machine = %target.key,
                        instance_id = %instance.id,
                        "{}",
                        message
                    );
                    scope
                        .vultr_machine_mut()
                        .status
                        .conditions
                        .mark_false(LOAD_BALANCER_ATTACHED_CONDITION, reason, message);
                    return Ok(Action::requeue(self.config.instance_poll_interval));
                }
            }
        }

        let subscription = SubscriptionStatus::from(instance.status.as_str());
        self.resolve_addresses(scope, &instance, &subscription)?;

        match subscription {
            SubscriptionStatus::Pending => {
                tracing::info!(vultr_machine = %target.key, instance_id = %instance.id, "Machine instance is pending");
                let conditions = &mut scope.vultr_machine_mut().status.conditions;
                conditions.mark_false(
                    INSTANCE_READY_CONDITION,
                    INSTANCE_PENDING_REASON,
                    "Instance is provisioning",
                );
                conditions.mark_false(
                    READY_CONDITION,
                    INSTANCE_PENDING_REASON,
                    "Instance is provisioning",
                );
                Ok(Action::requeue(self.config.instance_poll_interval))
            }
            SubscriptionStatus::Active => {
                tracing::info!(vultr_machine = %target.key, instance_id = %instance.id, "Machine instance is active");
                let status = &mut scope.vultr_machine_mut().status;
                status.conditions.mark_true(INSTANCE_READY_CONDITION);
                status.conditions.mark_true(READY_CONDITION);
                if !status.ready {
                    status.ready = true;
                    self.recorder.normal(
                        &target,
                        INSTANCE_READY,
                        &format!("Instance {} is active", instance.id),
                    );
                }
                Ok(Action::await_change())
            }
            other => {
                self.fail(scope, format!("Instance status {:?} is unexpected", other.as_str()));
                Ok(Action::await_change())
            }
        }
    }

    /// Records a terminal failure; later reconciles leave the machine alone
    fn fail(&self, scope: &mut MachineScope<'_, S>, message: String) {
        let target = scope.target().clone();
        let status = &mut scope.vultr_machine_mut().status;
        status.ready = false;
        status.failure_reason = Some(MachineStatusError::UpdateError);
        status.failure_message = Some(message.clone());
        status
            .conditions
            .mark_false(INSTANCE_READY_CONDITION, INSTANCE_FAILED_REASON, &message);
        status
            .conditions
            .mark_false(READY_CONDITION, INSTANCE_FAILED_REASON, &message);
        self.recorder.warning(&target, INSTANCE_FAILED, &message);
    }

    async fn create_instance(&self, scope: &mut MachineScope<'_, S>) -> Result<Instance> {
        let target = scope.target().clone();
        let request = self.instance_request(scope).await?;

        let instance = match self.provider.create_instance(&request).await {
            Ok(instance) => instance,
            Err(e) => {
                let message = format!("Failed to create instance {}: {}", request.label, e);
                self.recorder.warning(&target, INSTANCE_CREATE_FAILED, &message);
                scope.vultr_machine_mut().status.conditions.mark_false(
                    INSTANCE_READY_CONDITION,
                    INSTANCE_CREATE_FAILED_REASON,
                    message,
                );
                return Err(ReconcileError::cloud(&target, "create instance")(e));
            }
        };

        scope.set_provider_id(&instance.id);
        scope.vultr_machine_mut().status.subscription_status =
            Some(SubscriptionStatus::from(instance.status.as_str()));
        scope.patch_object().await?;

        self.recorder.normal(
            &target,
            INSTANCE_CREATED,
            &format!("Created instance {} ({})", instance.id, instance.label),
        );
        Ok(instance)
    }

    async fn instance_request(&self, scope: &MachineScope<'_, S>) -> Result<InstanceCreateRequest> {
        let target = scope.target();

        let bootstrap = match bootstrap_data(self.store.as_ref(), &scope.machine)
            .await
            .map_err(ReconcileError::store(target, "get bootstrap data"))?
        {
            BootstrapData::Ready(data) => data,
            BootstrapData::Pending => {
                return Err(ReconcileError::Bootstrap {
                    target: target.clone(),
                    message: "no data secret referenced".to_string(),
                });
            }
            BootstrapData::Unavailable(message) => {
                return Err(ReconcileError::Bootstrap {
                    target: target.clone(),
                    message,
                });
            }
        };

        let spec = &scope.vultr_machine().spec;

        let mut ssh_key_ids = Vec::with_capacity(spec.ssh_key.len());
        for name in &spec.ssh_key {
            let key = self
                .provider
                .get_ssh_key(name)
                .await
                .and_then(|k| k.ok_or_else(|| CloudError::ResourceNotFound(format!("ssh key {}", name))))
                .map_err(ReconcileError::cloud(target, "resolve ssh key"))?;
            ssh_key_ids.push(key.id);
        }

        let (attach_vpc, attach_vpc2) = match (non_empty(&spec.vpc_id), non_empty(&spec.vpc2_id)) {
            (Some(vpc), _) => (vec![vpc], Vec::new()),
            (None, Some(vpc2)) => (Vec::new(), vec![vpc2]),
            (None, None) => (Vec::new(), Vec::new()),
        };

        let name = scope.name().to_string();
        let tags = build_tags(&TagParams {
            cluster_name: &scope.cluster.metadata.name,
            cluster_uid: &scope.cluster.metadata.uid,
            name: &name,
            role: scope.role(),
            additional: &[],
        });

        Ok(InstanceCreateRequest {
            label: name.clone(),
            hostname: name,
            region: spec.region.clone(),
            plan: spec.plan_id.clone(),
            snapshot_id: non_empty(&spec.snapshot_id),
            ssh_key_ids,
            user_data: encode_user_data(&bootstrap),
            enable_ipv6: true,
            firewall_group_id: non_empty(&spec.firewall_group_id),
            attach_vpc,
            attach_vpc2,
            tags,
        })
    }

    /// Adds the instance to the cluster load balancer
    ///
    /// The member list is written conditioned on the list that was read, so a
    /// concurrent writer makes the update fail instead of being overwritten.
    /// Conflicts are retried up to `membership_attempts` times.
    async fn join_load_balancer(
        &self,
        scope: &MachineScope<'_, S>,
        instance_id: &str,
    ) -> Result<Membership> {
        let target = scope.target();
        let Some(lb_id) = scope.vultr_cluster.load_balancer_id() else {
            return Ok(Membership::NotReady {
                reason: LOAD_BALANCER_PROVISIONING_REASON,
                message: "Cluster load balancer is not provisioned yet".to_string(),
            });
        };

        let attempts = self.config.membership_attempts.max(1);
        for attempt in 1..=attempts {
            let Some(lb) = self
                .provider
                .get_load_balancer(&lb_id)
                .await
                .map_err(ReconcileError::cloud(target, "get load balancer"))?
            else {
                return Ok(Membership::NotReady {
                    reason: LOAD_BALANCER_PROVISIONING_REASON,
                    message: format!("Load balancer {} not found", lb_id),
                });
            };

            if SubscriptionStatus::from(lb.status.as_str()) != SubscriptionStatus::Active {
                return Ok(Membership::NotReady {
                    reason: LOAD_BALANCER_NOT_ACTIVE_REASON,
                    message: format!("Load balancer {} is {}", lb_id, lb.status),
                });
            }

            if lb.instances.iter().any(|id| id == instance_id) {
                return Ok(Membership::Attached);
            }

            let update = LoadBalancerUpdate::append_member(&lb.instances, instance_id);
            match self.provider.update_load_balancer(&lb_id, &update).await {
                Ok(()) => {
                    self.recorder.normal(
                        target,
                        INSTANCE_ATTACHED,
                        &format!("Added instance {} to load balancer {}", instance_id, lb_id),
                    );
                    return Ok(Membership::Attached);
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(
                        vultr_machine = %target.key,
                        load_balancer_id = %lb_id,
                        attempt,
                        "Load balancer membership changed, retrying"
                    );
                }
                Err(e) => return Err(ReconcileError::cloud(target, "attach to load balancer")(e)),
            }
        }

        Err(ReconcileError::MembershipContention {
            target: target.clone(),
            load_balancer_id: lb_id,
            attempts,
        })
    }

    fn resolve_addresses(
        &self,
        scope: &mut MachineScope<'_, S>,
        instance: &Instance,
        subscription: &SubscriptionStatus,
    ) -> Result<()> {
        let target = scope.target().clone();

        let mut addresses = Vec::new();
        if let Some(ip) = &instance.internal_ip {
            addresses.push(MachineAddress {
                address_type: AddressType::InternalIP,
                address: ip.clone(),
            });
        }
        if let Some(ip) = &instance.main_ip {
            addresses.push(MachineAddress {
                address_type: AddressType::ExternalIP,
                address: ip.clone(),
            });
        }

        let status = &mut scope.vultr_machine_mut().status;
        if !addresses.is_empty() {
            status.addresses = addresses;
            status.conditions.mark_true(ADDRESSES_RESOLVED_CONDITION);
            return Ok(());
        }

        let message = format!("Instance {} has no address yet", instance.id);
        status
            .conditions
            .mark_false(ADDRESSES_RESOLVED_CONDITION, NO_ADDRESSES_REASON, &message);

        // pending instances get their addresses later
        if *subscription == SubscriptionStatus::Pending {
            return Ok(());
        }

        match self.config.address_policy {
            AddressPolicy::Strict => Err(ReconcileError::NoAddress {
                target,
                instance_id: instance.id.clone(),
            }),
            AddressPolicy::Lenient => {
                tracing::warn!(vultr_machine = %target.key, instance_id = %instance.id, "{}", message);
                Ok(())
            }
        }
    }

    async fn reconcile_delete(&self, scope: &mut ObjectScope<'_, S, VultrMachine>) -> Result<Action> {
        let target = scope.target().clone();
        if !scope.object().metadata.has_finalizer(MACHINE_FINALIZER) {
            return Ok(Action::await_change());
        }
        tracing::info!(vultr_machine = %target.key, "Reconciling VultrMachine deletion");

        let status = &mut scope.object_mut().status;
        status.ready = false;
        status
            .conditions
            .mark_false(READY_CONDITION, DELETING_REASON, "Deleting instance");

        let existing = match scope.object().instance_id() {
            Some(id) => self
                .provider
                .get_instance(&id)
                .await
                .map_err(ReconcileError::cloud(&target, "get instance"))?,
            None => None,
        };

        match existing {
            Some(instance) => {
                self.provider
                    .delete_instance(&instance.id)
                    .await
                    .map_err(ReconcileError::cloud(&target, "delete instance"))?;
                self.recorder.normal(
                    &target,
                    INSTANCE_DELETED,
                    &format!("Deleted instance {}", instance.id),
                );
            }
            None => {
                tracing::info!(vultr_machine = %target.key, "Instance already absent");
            }
        }

        scope.object_mut().metadata.remove_finalizer(MACHINE_FINALIZER);
        Ok(Action::await_change())
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|v| !v.is_empty()).map(str::to_string)
}

#[async_trait]
impl<S: Store> Reconciler for MachineReconciler<S> {
    fn kind(&self) -> &'static str {
        VultrMachine::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let target = Target::new(VultrMachine::KIND, key.clone());
        let Some(vultr_machine) = self
            .store
            .get::<VultrMachine>(key)
            .await
            .map_err(ReconcileError::store(&target, "get VultrMachine"))?
        else {
            tracing::debug!(vultr_machine = %key, "VultrMachine not found or already deleted");
            return Ok(Action::await_change());
        };

        if vultr_machine.metadata.is_paused() {
            tracing::info!(vultr_machine = %key, "VultrMachine is paused, skipping");
            return Ok(Action::await_change());
        }

        if vultr_machine.metadata.is_deleting() {
            let mut scope = ObjectScope::new(self.store.as_ref(), vultr_machine)?;
            let result = self.reconcile_delete(&mut scope).await;
            return finish(result, scope.close().await);
        }

        if vultr_machine.status.has_failed() {
            tracing::info!(vultr_machine = %key, "Error state detected, skipping reconciliation");
            return Ok(Action::await_change());
        }

        let Some(mut scope) = self.load_scope(vultr_machine).await? else {
            return Ok(Action::await_change());
        };
        let result = self.reconcile_normal(&mut scope).await;
        finish(result, scope.close().await)
    }

    async fn keys(&self) -> Result<Vec<ObjectKey>> {
        let target = Target::new(VultrMachine::KIND, ObjectKey::new("", ""));
        let machines: Vec<VultrMachine> = self
            .store
            .list(&ListParams::default())
            .await
            .map_err(ReconcileError::store(&target, "list VultrMachines"))?;
        Ok(machines.iter().map(|m| m.key()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingRecorder;
    use crate::store::MemoryStore;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use capvultr_api::{
        BOOTSTRAP_DATA_KEY, Bootstrap, CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL, Cluster,
        ClusterSpec, ClusterStatus, Machine, MachineSpec, NODE_ROLE, ObjectMeta, ObjectReference,
        PAUSED_ANNOTATION, Secret, VultrCluster, VultrClusterSpec, VultrMachineSpec,
    };
    use capvultr_cloud::testing::{FakeProvider, Op};
    use capvultr_cloud::{LoadBalancer, SshKey};
    use std::collections::BTreeMap;
    use std::time::Duration;

    const BOOTSTRAP: &str = "#cloud-config\nruncmd:\n  - kubeadm join\n";

    struct Fixture {
        store: Arc<MemoryStore>,
        provider: Arc<FakeProvider>,
        recorder: Arc<RecordingRecorder>,
        reconciler: MachineReconciler<MemoryStore>,
    }

    impl Fixture {
        async fn new() -> Self {
            Self::with_config(ControllerConfig::default()).await
        }

        async fn with_config(config: ControllerConfig) -> Self {
            let store = Arc::new(MemoryStore::new());
            let provider = Arc::new(FakeProvider::new());
            let recorder = Arc::new(RecordingRecorder::new());
            let reconciler = MachineReconciler::new(store.clone(), provider.clone(), config)
                .with_recorder(recorder.clone());

            store
                .create(&Cluster {
                    metadata: ObjectMeta::new("default", "demo"),
                    spec: ClusterSpec {
                        paused: false,
                        infrastructure_ref: Some(ObjectReference {
                            kind: VultrCluster::KIND.to_string(),
                            name: "demo-infra".to_string(),
                        }),
                    },
                    status: ClusterStatus {
                        infrastructure_ready: true,
                    },
                })
                .await
                .unwrap();

            let mut vc = VultrCluster::new(
                ObjectMeta::new("default", "demo-infra").with_owner(Cluster::KIND, "demo"),
                VultrClusterSpec {
                    region: "ewr".to_string(),
                    ..Default::default()
                },
            );
            vc.status.network.api_server_load_balancer_ref.resource_id = Some("lb-1".to_string());
            store.create(&vc).await.unwrap();

            store
                .create(&Secret {
                    metadata: ObjectMeta::new("default", "boot"),
                    data: BTreeMap::from([(BOOTSTRAP_DATA_KEY.to_string(), BOOTSTRAP.to_string())]),
                })
                .await
                .unwrap();

            provider.insert_load_balancer(LoadBalancer {
                id: "lb-1".to_string(),
                status: "active".to_string(),
                ipv4: Some("203.0.113.10".to_string()),
                ..Default::default()
            });
            provider.insert_ssh_key(SshKey {
                id: "key-1".to_string(),
                name: "deploy".to_string(),
                ssh_key: "ssh-ed25519 AAAA".to_string(),
            });

            Self {
                store,
                provider,
                recorder,
                reconciler,
            }
        }

        /// Machine + VultrMachine pair; returns the VultrMachine key
        async fn add_machine(
            &self,
            name: &str,
            control_plane: bool,
            edit: impl FnOnce(&mut VultrMachineSpec),
        ) -> ObjectKey {
            let mut meta = ObjectMeta::new("default", name).with_label(CLUSTER_NAME_LABEL, "demo");
            if control_plane {
                meta = meta.with_label(CONTROL_PLANE_LABEL, "");
            }
            let vm_name = format!("{}-vm", name);
            self.store
                .create(&Machine {
                    metadata: meta,
                    spec: MachineSpec {
                        cluster_name: "demo".to_string(),
                        bootstrap: Bootstrap {
                            data_secret_name: Some("boot".to_string()),
                        },
                        infrastructure_ref: ObjectReference {
                            kind: VultrMachine::KIND.to_string(),
                            name: vm_name.clone(),
                        },
                    },
                })
                .await
                .unwrap();

            let mut spec = VultrMachineSpec {
                plan_id: "vc2-2c-4gb".to_string(),
                region: "ewr".to_string(),
                ssh_key: vec!["deploy".to_string()],
                vpc_id: Some("vpc-1".to_string()),
                vpc2_id: Some("vpc2-legacy".to_string()),
                ..Default::default()
            };
            edit(&mut spec);
            self.store
                .create(&VultrMachine::new(
                    ObjectMeta::new("default", &vm_name)
                        .with_label(CLUSTER_NAME_LABEL, "demo")
                        .with_owner(Machine::KIND, name),
                    spec,
                ))
                .await
                .unwrap()
                .key()
        }

        async fn vultr_machine(&self, key: &ObjectKey) -> Option<VultrMachine> {
            self.store.get(key).await.unwrap()
        }

        fn activate(&self, id: &str, main_ip: Option<&str>, internal_ip: Option<&str>) {
            self.provider.update_instance(id, |i| {
                i.status = "active".to_string();
                i.power_status = Some("running".to_string());
                i.server_status = Some("ok".to_string());
                i.main_ip = main_ip.map(str::to_string);
                i.internal_ip = internal_ip.map(str::to_string);
            });
        }
    }

    fn instance(id: &str, status: &str) -> Instance {
        Instance {
            id: id.to_string(),
            label: "worker-0-vm".to_string(),
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_creates_instance_exactly_once() {
        let fx = Fixture::new().await;
        let key = fx.add_machine("worker-0", false, |_| {}).await;

        let action = fx.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));

        let vm = fx.vultr_machine(&key).await.unwrap();
        assert_eq!(vm.spec.provider_id.as_deref(), Some("vultr://inst-1"));
        assert_eq!(vm.status.subscription_status, Some(SubscriptionStatus::Pending));
        assert!(vm.metadata.has_finalizer(MACHINE_FINALIZER));
        assert!(!vm.status.ready);

        fx.reconciler.reconcile(&key).await.unwrap();
        fx.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(fx.provider.count(Op::CreateInstance), 1);
        assert_eq!(fx.recorder.reasons(), vec![INSTANCE_CREATED.to_string()]);
    }

    #[tokio::test]
    async fn test_create_request_contents() {
        let fx = Fixture::new().await;
        let key = fx.add_machine("worker-0", false, |_| {}).await;
        fx.reconciler.reconcile(&key).await.unwrap();

        let requests = fx.provider.instance_requests();
        let request = &requests[0];
        assert_eq!(request.label, "worker-0-vm");
        assert_eq!(request.hostname, "worker-0-vm");
        assert_eq!(request.region, "ewr");
        assert_eq!(request.plan, "vc2-2c-4gb");
        assert_eq!(request.ssh_key_ids, vec!["key-1"]);
        assert_eq!(request.attach_vpc, vec!["vpc-1"]);
        assert!(request.attach_vpc2.is_empty());
        assert!(request.enable_ipv6);

        let cluster: Cluster = fx
            .store
            .get(&ObjectKey::new("default", "demo"))
            .await
            .unwrap()
            .unwrap();
        let expected_tags = build_tags(&TagParams {
            cluster_name: "demo",
            cluster_uid: &cluster.metadata.uid,
            name: "worker-0-vm",
            role: NODE_ROLE,
            additional: &[],
        });
        assert_eq!(request.tags, expected_tags);

        let user_data = String::from_utf8(STANDARD.decode(&request.user_data).unwrap()).unwrap();
        assert_eq!(
            user_data,
            "#cloud-config\nruncmd:\n  - ufw disable\n  - kubeadm join\n"
        );
    }

    #[tokio::test]
    async fn test_legacy_vpc_used_only_without_current_vpc() {
        let fx = Fixture::new().await;
        let key = fx.add_machine("worker-0", false, |s| s.vpc_id = None).await;
        fx.reconciler.reconcile(&key).await.unwrap();

        let request = &fx.provider.instance_requests()[0].clone();
        assert!(request.attach_vpc.is_empty());
        assert_eq!(request.attach_vpc2, vec!["vpc2-legacy"]);
    }

    #[tokio::test]
    async fn test_active_instance_with_addresses_becomes_ready() {
        let fx = Fixture::new().await;
        let key = fx
            .add_machine("worker-0", false, |s| {
                s.provider_id = Some("vultr://abc123".to_string())
            })
            .await;
        fx.provider.insert_instance(Instance {
            main_ip: Some("203.0.113.20".to_string()),
            internal_ip: Some("10.0.0.5".to_string()),
            power_status: Some("running".to_string()),
            ..instance("abc123", "active")
        });

        let action = fx.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::await_change());

        let vm = fx.vultr_machine(&key).await.unwrap();
        assert!(vm.status.ready);
        assert_eq!(
            vm.status.addresses,
            vec![
                MachineAddress {
                    address_type: AddressType::InternalIP,
                    address: "10.0.0.5".to_string(),
                },
                MachineAddress {
                    address_type: AddressType::ExternalIP,
                    address: "203.0.113.20".to_string(),
                },
            ]
        );
        assert_eq!(vm.status.power_status, Some(PowerStatus::Running));
        assert!(vm.status.conditions.is_true(READY_CONDITION));
        assert!(vm.status.conditions.is_true(ADDRESSES_RESOLVED_CONDITION));

        assert_eq!(fx.provider.count(Op::CreateInstance), 0);
        assert_eq!(fx.provider.count(Op::GetInstance), 1);
        assert_eq!(fx.recorder.reasons(), vec![INSTANCE_READY.to_string()]);
    }

    #[tokio::test]
    async fn test_unexpected_status_is_terminal() {
        let fx = Fixture::new().await;
        let key = fx
            .add_machine("worker-0", false, |s| {
                s.provider_id = Some("vultr://abc123".to_string())
            })
            .await;
        fx.provider.insert_instance(instance("abc123", "suspended"));

        let action = fx.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::await_change());

        let vm = fx.vultr_machine(&key).await.unwrap();
        assert_eq!(vm.status.failure_reason, Some(MachineStatusError::UpdateError));
        assert!(vm.status.failure_message.as_deref().unwrap().contains("suspended"));
        assert!(!vm.status.ready);
        assert!(fx.recorder.reasons().contains(&INSTANCE_FAILED.to_string()));

        // a failed machine is left alone
        fx.provider.clear_calls();
        let version = vm.metadata.resource_version;
        fx.reconciler.reconcile(&key).await.unwrap();
        assert!(fx.provider.calls().is_empty());
        assert_eq!(
            fx.vultr_machine(&key).await.unwrap().metadata.resource_version,
            version
        );
    }

    #[tokio::test]
    async fn test_missing_recorded_instance_is_terminal() {
        let fx = Fixture::new().await;
        let key = fx
            .add_machine("worker-0", false, |s| {
                s.provider_id = Some("vultr://gone".to_string())
            })
            .await;

        fx.reconciler.reconcile(&key).await.unwrap();

        let vm = fx.vultr_machine(&key).await.unwrap();
        assert!(vm.status.has_failed());
        assert_eq!(fx.provider.count(Op::CreateInstance), 0);
        assert_eq!(vm.spec.provider_id.as_deref(), Some("vultr://gone"));
    }

    #[tokio::test]
    async fn test_malformed_provider_id_is_replaced_once() {
        let fx = Fixture::new().await;
        let key = fx
            .add_machine("worker-0", false, |s| s.provider_id = Some("garbage".to_string()))
            .await;

        for _ in 0..3 {
            fx.reconciler.reconcile(&key).await.unwrap();
        }

        let vm = fx.vultr_machine(&key).await.unwrap();
        assert_eq!(vm.spec.provider_id.as_deref(), Some("vultr://inst-1"));
        assert_eq!(fx.provider.count(Op::CreateInstance), 1);
        assert!(!vm.status.has_failed());
    }

    #[tokio::test]
    async fn test_lenient_policy_tolerates_missing_addresses() {
        let fx = Fixture::new().await;
        let key = fx.add_machine("worker-0", false, |_| {}).await;
        fx.reconciler.reconcile(&key).await.unwrap();
        fx.activate("inst-1", None, None);

        let action = fx.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::await_change());

        let vm = fx.vultr_machine(&key).await.unwrap();
        assert!(vm.status.ready);
        assert!(vm.status.addresses.is_empty());
        let condition = vm.status.conditions.get(ADDRESSES_RESOLVED_CONDITION).unwrap();
        assert_eq!(condition.reason.as_deref(), Some(NO_ADDRESSES_REASON));
    }

    #[tokio::test]
    async fn test_strict_policy_fails_attempt_without_addresses() {
        let fx = Fixture::with_config(ControllerConfig {
            address_policy: AddressPolicy::Strict,
            ..Default::default()
        })
        .await;
        let key = fx.add_machine("worker-0", false, |_| {}).await;

        // pending instances are expected to have no address
        let action = fx.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));

        fx.activate("inst-1", None, None);
        let err = fx.reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NoAddress { ref instance_id, .. } if instance_id == "inst-1"));

        let vm = fx.vultr_machine(&key).await.unwrap();
        assert!(!vm.status.ready);
        assert!(!vm.status.has_failed());

        fx.activate("inst-1", Some("203.0.113.20"), None);
        fx.reconciler.reconcile(&key).await.unwrap();
        assert!(fx.vultr_machine(&key).await.unwrap().status.ready);
    }

    #[tokio::test]
    async fn test_control_plane_joins_load_balancer() {
        let fx = Fixture::new().await;
        let key = fx.add_machine("cp-0", true, |_| {}).await;

        fx.reconciler.reconcile(&key).await.unwrap();

        let lb = fx.provider.load_balancer("lb-1").unwrap();
        assert_eq!(lb.instances, vec!["inst-1"]);
        let vm = fx.vultr_machine(&key).await.unwrap();
        assert!(vm.status.conditions.is_true(LOAD_BALANCER_ATTACHED_CONDITION));
        assert!(fx.recorder.reasons().contains(&INSTANCE_ATTACHED.to_string()));

        let tags = &fx.provider.instance_requests()[0].tags.clone();
        assert!(tags.iter().any(|t| t.ends_with(":apiserver")));

        fx.activate("inst-1", Some("203.0.113.20"), None);
        fx.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(fx.provider.count(Op::UpdateLoadBalancer), 1);
        assert!(fx.vultr_machine(&key).await.unwrap().status.ready);
    }

    #[tokio::test]
    async fn test_membership_update_retries_on_conflict() {
        let fx = Fixture::new().await;
        let key = fx.add_machine("cp-0", true, |_| {}).await;
        fx.provider.race_next_updates(2);

        fx.reconciler.reconcile(&key).await.unwrap();

        assert_eq!(fx.provider.count(Op::UpdateLoadBalancer), 3);
        let lb = fx.provider.load_balancer("lb-1").unwrap();
        assert_eq!(lb.instances.len(), 3);
        assert!(lb.instances.contains(&"inst-1".to_string()));
    }

    #[tokio::test]
    async fn test_membership_contention_fails_the_attempt() {
        let fx = Fixture::with_config(ControllerConfig {
            membership_attempts: 2,
            ..Default::default()
        })
        .await;
        let key = fx.add_machine("cp-0", true, |_| {}).await;
        fx.provider.race_next_updates(5);

        let err = fx.reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(err, ReconcileError::MembershipContention { attempts: 2, .. }));

        // the instance was still recorded before the attach failed
        let vm = fx.vultr_machine(&key).await.unwrap();
        assert_eq!(vm.spec.provider_id.as_deref(), Some("vultr://inst-1"));
    }

    #[tokio::test]
    async fn test_inactive_load_balancer_requeues() {
        let fx = Fixture::new().await;
        let key = fx.add_machine("cp-0", true, |_| {}).await;
        fx.provider
            .update_stored_load_balancer("lb-1", |lb| lb.status = "pending".to_string());

        let action = fx.reconciler.reconcile(&key).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        assert_eq!(fx.provider.count(Op::UpdateLoadBalancer), 0);

        let vm = fx.vultr_machine(&key).await.unwrap();
        let condition = vm.status.conditions.get(LOAD_BALANCER_ATTACHED_CONDITION).unwrap();
        assert_eq!(condition.reason.as_deref(), Some(LOAD_BALANCER_NOT_ACTIVE_REASON));
    }

    #[tokio::test]
    async fn test_unmet_preconditions_are_silent_no_ops() {
        let fx = Fixture::new().await;

        // no bootstrap data reference yet
        let key = fx.add_machine("worker-0", false, |_| {}).await;
        let mut machine: Machine = fx
            .store
            .get(&ObjectKey::new("default", "worker-0"))
            .await
            .unwrap()
            .unwrap();
        machine.spec.bootstrap.data_secret_name = None;
        fx.store.update(&machine).await.unwrap();
        assert_eq!(fx.reconciler.reconcile(&key).await.unwrap(), Action::await_change());

        // cluster infrastructure not ready
        let key = fx.add_machine("worker-1", false, |_| {}).await;
        let mut cluster: Cluster = fx
            .store
            .get(&ObjectKey::new("default", "demo"))
            .await
            .unwrap()
            .unwrap();
        cluster.status.infrastructure_ready = false;
        fx.store.update(&cluster).await.unwrap();
        assert_eq!(fx.reconciler.reconcile(&key).await.unwrap(), Action::await_change());

        // no owner Machine
        let orphan = fx
            .store
            .create(&VultrMachine::new(
                ObjectMeta::new("default", "orphan-vm"),
                VultrMachineSpec {
                    region: "ewr".to_string(),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        assert_eq!(
            fx.reconciler.reconcile(&orphan.key()).await.unwrap(),
            Action::await_change()
        );

        assert!(fx.provider.calls().is_empty());
        for name in ["worker-0-vm", "worker-1-vm", "orphan-vm"] {
            let vm = fx
                .vultr_machine(&ObjectKey::new("default", name))
                .await
                .unwrap();
            assert!(vm.metadata.finalizers.is_empty(), "{name} got a finalizer");
        }
    }

    #[tokio::test]
    async fn test_paused_vultr_cluster_stops_machine_reconcile() {
        let fx = Fixture::new().await;
        let key = fx.add_machine("worker-0", false, |_| {}).await;
        let mut vc: VultrCluster = fx
            .store
            .get(&ObjectKey::new("default", "demo-infra"))
            .await
            .unwrap()
            .unwrap();
        vc.metadata
            .annotations
            .insert(PAUSED_ANNOTATION.to_string(), String::new());
        fx.store.update(&vc).await.unwrap();

        assert_eq!(fx.reconciler.reconcile(&key).await.unwrap(), Action::await_change());
        assert!(fx.provider.calls().is_empty());
        let vm = fx.vultr_machine(&key).await.unwrap();
        assert!(vm.metadata.finalizers.is_empty());
    }

    #[tokio::test]
    async fn test_missing_ssh_key_fails_before_create() {
        let fx = Fixture::new().await;
        let key = fx
            .add_machine("worker-0", false, |s| s.ssh_key = vec!["nobody".to_string()])
            .await;

        let err = fx.reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Cloud {
                op: "resolve ssh key",
                source: CloudError::ResourceNotFound(_),
                ..
            }
        ));
        assert_eq!(fx.provider.count(Op::CreateInstance), 0);
    }

    #[tokio::test]
    async fn test_missing_bootstrap_secret_is_an_error() {
        let fx = Fixture::new().await;
        let key = fx.add_machine("worker-0", false, |_| {}).await;
        let mut machine: Machine = fx
            .store
            .get(&ObjectKey::new("default", "worker-0"))
            .await
            .unwrap()
            .unwrap();
        machine.spec.bootstrap.data_secret_name = Some("missing".to_string());
        fx.store.update(&machine).await.unwrap();

        let err = fx.reconciler.reconcile(&key).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Bootstrap { .. }));
        assert_eq!(fx.provider.count(Op::CreateInstance), 0);
    }

    #[tokio::test]
    async fn test_create_failure_is_retried_not_terminal() {
        let fx = Fixture::new().await;
        let key = fx.add_machine("worker-0", false, |_| {}).await;
        fx.provider.fail_next(Op::CreateInstance, 1);

        let err = fx.reconciler.reconcile(&key).await.unwrap_err();
        assert!(err.to_string().contains("create instance"));
        let vm = fx.vultr_machine(&key).await.unwrap();
        assert!(!vm.status.has_failed());
        assert!(vm.metadata.has_finalizer(MACHINE_FINALIZER));
        assert!(fx.recorder.reasons().contains(&INSTANCE_CREATE_FAILED.to_string()));

        fx.reconciler.reconcile(&key).await.unwrap();
        assert!(fx.vultr_machine(&key).await.unwrap().spec.provider_id.is_some());
    }

    #[tokio::test]
    async fn test_deletion_removes_instance_then_finalizer() {
        let fx = Fixture::new().await;
        let key = fx.add_machine("worker-0", false, |_| {}).await;
        fx.reconciler.reconcile(&key).await.unwrap();
        assert!(fx.provider.instance("inst-1").is_some());

        fx.store.delete::<VultrMachine>(&key).await.unwrap();
        fx.reconciler.reconcile(&key).await.unwrap();

        assert!(fx.provider.instance("inst-1").is_none());
        assert!(fx.vultr_machine(&key).await.is_none());
        assert!(fx.recorder.reasons().contains(&INSTANCE_DELETED.to_string()));
    }

    #[tokio::test]
    async fn test_deletion_converges_when_instance_is_already_gone() {
        let fx = Fixture::new().await;
        let key = fx.add_machine("worker-0", false, |_| {}).await;
        fx.reconciler.reconcile(&key).await.unwrap();
        assert!(fx.provider.remove_instance("inst-1").is_some());

        fx.store.delete::<VultrMachine>(&key).await.unwrap();
        fx.provider.clear_calls();
        fx.reconciler.reconcile(&key).await.unwrap();

        assert!(fx.vultr_machine(&key).await.is_none());
        assert_eq!(fx.provider.count(Op::DeleteInstance), 0);
        assert!(!fx.recorder.reasons().contains(&INSTANCE_DELETED.to_string()));
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_finalizer() {
        let fx = Fixture::new().await;
        let key = fx.add_machine("worker-0", false, |_| {}).await;
        fx.reconciler.reconcile(&key).await.unwrap();
        fx.store.delete::<VultrMachine>(&key).await.unwrap();

        fx.provider.fail_next(Op::DeleteInstance, 1);
        fx.reconciler.reconcile(&key).await.unwrap_err();
        let vm = fx.vultr_machine(&key).await.unwrap();
        assert!(vm.metadata.has_finalizer(MACHINE_FINALIZER));

        fx.reconciler.reconcile(&key).await.unwrap();
        assert!(fx.vultr_machine(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_machine_can_still_be_deleted() {
        let fx = Fixture::new().await;
        let key = fx
            .add_machine("worker-0", false, |s| {
                s.provider_id = Some("vultr://abc123".to_string())
            })
            .await;
        fx.provider.insert_instance(instance("abc123", "closed"));
        fx.reconciler.reconcile(&key).await.unwrap();
        assert!(fx.vultr_machine(&key).await.unwrap().status.has_failed());

        fx.store.delete::<VultrMachine>(&key).await.unwrap();
        fx.reconciler.reconcile(&key).await.unwrap();
        assert!(fx.provider.instance("abc123").is_none());
        assert!(fx.vultr_machine(&key).await.is_none());
    }
}
