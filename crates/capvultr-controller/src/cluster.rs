//! VultrCluster reconciler
//!
//! Owns the cluster's API server load balancer:
//!
//! 1. ensure the finalizer
//! 2. look up the load balancer by its remembered id (or the id declared in
//!    spec) and create it when absent
//! 3. once it has a public address, publish the control-plane endpoint and
//!    mark the cluster ready
//!
//! Readiness is monotonic: a load balancer that loses its address later does
//! not reset `ready`. Deletion removes the load balancer, then the finalizer.

use crate::config::ControllerConfig;
use crate::error::{ReconcileError, Result, Target};
use crate::events::{
    CLUSTER_READY, EventRecorder, LOAD_BALANCER_CREATED, LOAD_BALANCER_DELETED, TracingRecorder,
};
use crate::owners::owner_cluster;
use crate::scheduler::{Action, Reconciler};
use crate::scope::{ClusterScope, ObjectScope, finish};
use crate::store::{ListParams, Store};
use async_trait::async_trait;
use capvultr_api::condition::{
    DELETING_REASON, LOAD_BALANCER_PROVISIONING_REASON, LOAD_BALANCER_READY_CONDITION,
    READY_CONDITION, WAITING_FOR_ADDRESS_REASON,
};
use capvultr_api::loadbalancer::DEFAULT_LB_PROTOCOL;
use capvultr_api::{
    ApiEndpoint, CLUSTER_FINALIZER, Cluster, ObjectKey, Resource, SubscriptionStatus,
    VultrCluster,
};
use capvultr_cloud::{
    CloudProvider, ForwardingRule, HealthCheck, LoadBalancer, LoadBalancerCreateRequest,
};
use std::sync::Arc;

pub struct ClusterReconciler<S: Store> {
    store: Arc<S>,
    provider: Arc<dyn CloudProvider>,
    recorder: Arc<dyn EventRecorder>,
    config: ControllerConfig,
}

impl<S: Store> ClusterReconciler<S> {
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

    async fn reconcile_normal(&self, scope: &mut ClusterScope<'_, S>) -> Result<Action> {
        tracing::info!(vultr_cluster = %scope.target().key, "Reconciling VultrCluster");

        if scope
            .vultr_cluster_mut()
            .metadata
            .add_finalizer(CLUSTER_FINALIZER)
        {
            scope.patch_object().await?;
        }

        let lb = self.ensure_load_balancer(scope).await?;

        let lb_ref = &mut scope
            .vultr_cluster_mut()
            .status
            .network
            .api_server_load_balancer_ref;
        lb_ref.resource_id = Some(lb.id.clone());
        lb_ref.subscription_status = Some(SubscriptionStatus::from(lb.status.as_str()));
        scope.patch_object().await?;

        let Some(address) = lb.ipv4.clone() else {
            let key = scope.target().key.clone();
            let status = &mut scope.vultr_cluster_mut().status;
            if status.ready {
                tracing::debug!(
                    vultr_cluster = %key,
                    load_balancer_id = %lb.id,
                    "Load balancer lost its address, keeping cluster ready"
                );
            } else {
                let (reason, message) = if SubscriptionStatus::from(lb.status.as_str())
                    == SubscriptionStatus::Pending
                {
                    (LOAD_BALANCER_PROVISIONING_REASON, "Load balancer is provisioning")
                } else {
                    (WAITING_FOR_ADDRESS_REASON, "Waiting for a public address")
                };
                status
                    .conditions
                    .mark_false(LOAD_BALANCER_READY_CONDITION, reason, message);
                status.conditions.mark_false(READY_CONDITION, reason, message);
                tracing::info!(
                    vultr_cluster = %key,
                    load_balancer_id = %lb.id,
                    "Waiting on API server load balancer address"
                );
            }
            return Ok(Action::requeue(self.config.load_balancer_poll_interval));
        };

        let port = scope
            .vultr_cluster()
            .spec
            .network
            .api_server_load_balancer
            .with_defaults()
            .health_check
            .port;
        let target = scope.target().clone();
        let vc = scope.vultr_cluster_mut();
        if !vc.spec.control_plane_endpoint.is_set() {
            vc.spec.control_plane_endpoint = ApiEndpoint {
                host: address.clone(),
                port,
            };
        }
        vc.status.conditions.mark_true(LOAD_BALANCER_READY_CONDITION);
        vc.status.conditions.mark_true(READY_CONDITION);
        if !vc.status.ready {
            vc.status.ready = true;
            self.recorder.normal(
                &target,
                CLUSTER_READY,
                &format!("Load balancer {} is reachable at {}", lb.id, address),
            );
        }

        Ok(Action::await_change())
    }

    /// The cluster's load balancer, created when it does not exist
    async fn ensure_load_balancer(&self, scope: &ClusterScope<'_, S>) -> Result<LoadBalancer> {
        let target = scope.target();

        if let Some(id) = scope.vultr_cluster().load_balancer_id() {
            let found = self
                .provider
                .get_load_balancer(&id)
                .await
                .map_err(ReconcileError::cloud(target, "get load balancer"))?;
            if let Some(lb) = found {
                return Ok(lb);
            }
            tracing::info!(
                vultr_cluster = %target.key,
                load_balancer_id = %id,
                "Load balancer not found, creating a new one"
            );
        }

        let settings = scope
            .vultr_cluster()
            .spec
            .network
            .api_server_load_balancer
            .with_defaults();
        let hc = settings.health_check;
        let request = LoadBalancerCreateRequest {
            label: format!("{}-{}", scope.name(), scope.uid()),
            region: scope.region().to_string(),
            balancing_algorithm: settings.balancing_algorithm,
            forwarding_rules: vec![ForwardingRule::passthrough(DEFAULT_LB_PROTOCOL, hc.port)],
            health_check: HealthCheck {
                protocol: hc.protocol,
                port: hc.port,
                path: hc.path,
                check_interval: hc.check_interval,
                response_timeout: hc.response_timeout,
                unhealthy_threshold: hc.unhealthy_threshold,
                healthy_threshold: hc.healthy_threshold,
            },
            vpc: settings.vpc,
        };

        let lb = self
            .provider
            .create_load_balancer(&request)
            .await
            .map_err(ReconcileError::cloud(target, "create load balancer"))?;
        self.recorder.normal(
            target,
            LOAD_BALANCER_CREATED,
            &format!("Created load balancer {} ({})", lb.id, request.label),
        );
        Ok(lb)
    }

    async fn reconcile_delete(&self, scope: &mut ObjectScope<'_, S, VultrCluster>) -> Result<Action> {
        let target = scope.target().clone();
        if !scope.object().metadata.has_finalizer(CLUSTER_FINALIZER) {
            return Ok(Action::await_change());
        }
        tracing::info!(vultr_cluster = %target.key, "Reconciling VultrCluster deletion");

        let status = &mut scope.object_mut().status;
        status.ready = false;
        status
            .conditions
            .mark_false(READY_CONDITION, DELETING_REASON, "Deleting load balancer");

        let existing = match scope.object().load_balancer_id() {
            Some(id) => self
                .provider
                .get_load_balancer(&id)
                .await
                .map_err(ReconcileError::cloud(&target, "get load balancer"))?,
            None => None,
        };

        match existing {
            Some(lb) => {
                self.provider
                    .delete_load_balancer(&lb.id)
                    .await
                    .map_err(ReconcileError::cloud(&target, "delete load balancer"))?;
                self.recorder.normal(
                    &target,
                    LOAD_BALANCER_DELETED,
                    &format!("Deleted load balancer {}", lb.id),
                );
            }
            None => {
                tracing::info!(vultr_cluster = %target.key, "Load balancer already absent");
            }
        }

        scope.object_mut().metadata.remove_finalizer(CLUSTER_FINALIZER);
        Ok(Action::await_change())
    }

    /// Flags the owning Cluster's infrastructure as ready
    async fn mark_infrastructure_ready(&self, key: &ObjectKey) -> Result<()> {
        let target = Target::new(Cluster::KIND, key.clone());
        let Some(mut cluster) = self
            .store
            .get::<Cluster>(key)
            .await
            .map_err(ReconcileError::store(&target, "get Cluster"))?
        else {
            return Ok(());
        };
        if cluster.status.infrastructure_ready {
            return Ok(());
        }

        cluster.status.infrastructure_ready = true;
        self.store
            .update(&cluster)
            .await
            .map_err(ReconcileError::store(&target, "mark infrastructure ready"))?;
        tracing::info!(cluster = %key, "Cluster infrastructure is ready");
        Ok(())
    }
}

#[async_trait]
impl<S: Store> Reconciler for ClusterReconciler<S> {
    fn kind(&self) -> &'static str {
        VultrCluster::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let target = Target::new(VultrCluster::KIND, key.clone());
        let Some(vultr_cluster) = self
            .store
            .get::<VultrCluster>(key)
            .await
            .map_err(ReconcileError::store(&target, "get VultrCluster"))?
        else {
            tracing::debug!(vultr_cluster = %key, "VultrCluster not found or already deleted");
            return Ok(Action::await_change());
        };

        if vultr_cluster.metadata.is_paused() {
            tracing::info!(vultr_cluster = %key, "VultrCluster is paused, skipping");
            return Ok(Action::await_change());
        }

        if vultr_cluster.metadata.is_deleting() {
            let mut scope = ObjectScope::new(self.store.as_ref(), vultr_cluster)?;
            let result = self.reconcile_delete(&mut scope).await;
            return finish(result, scope.close().await);
        }

        let Some(cluster) = owner_cluster(self.store.as_ref(), &vultr_cluster)
            .await
            .map_err(ReconcileError::store(&target, "get owner Cluster"))?
        else {
            tracing::info!(vultr_cluster = %key, "Cluster controller has not yet set the owner reference");
            return Ok(Action::await_change());
        };
        if cluster.is_paused() {
            tracing::info!(vultr_cluster = %key, cluster = %cluster.key(), "Cluster is paused, skipping");
            return Ok(Action::await_change());
        }

        let cluster_key = cluster.key();
        let mut scope = ClusterScope::new(self.store.as_ref(), cluster, vultr_cluster)?;
        let result = self.reconcile_normal(&mut scope).await;
        let ready = scope.vultr_cluster().status.ready;
        let action = finish(result, scope.close().await)?;

        if ready && self.config.propagate_infrastructure_ready {
            self.mark_infrastructure_ready(&cluster_key).await?;
        }
        Ok(action)
    }

    async fn keys(&self) -> Result<Vec<ObjectKey>> {
        let target = Target::new(VultrCluster::KIND, ObjectKey::new("", ""));
        let clusters: Vec<VultrCluster> = self
            .store
            .list(&ListParams::default())
            .await
            .map_err(ReconcileError::store(&target, "list VultrClusters"))?;
        Ok(clusters.iter().map(|c| c.key()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingRecorder;
    use crate::store::MemoryStore;
    use capvultr_api::{ClusterSpec, ClusterStatus, ObjectMeta, ObjectReference, VultrClusterSpec};
    use capvultr_cloud::testing::{FakeProvider, Op};
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        provider: Arc<FakeProvider>,
        recorder: Arc<RecordingRecorder>,
        reconciler: ClusterReconciler<MemoryStore>,
        key: ObjectKey,
    }

    impl Fixture {
        async fn new() -> Self {
            Self::with_spec(VultrClusterSpec {
                region: "ewr".to_string(),
                ..Default::default()
            })
            .await
        }

        async fn with_spec(spec: VultrClusterSpec) -> Self {
            let store = Arc::new(MemoryStore::new());
            let provider = Arc::new(FakeProvider::new());
            let recorder = Arc::new(RecordingRecorder::new());
            let reconciler =
                ClusterReconciler::new(store.clone(), provider.clone(), ControllerConfig::default())
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
                    status: ClusterStatus::default(),
                })
                .await
                .unwrap();
            let vc = store
                .create(&VultrCluster::new(
                    ObjectMeta::new("default", "demo-infra").with_owner(Cluster::KIND, "demo"),
                    spec,
                ))
                .await
                .unwrap();

            Self {
                store,
                provider,
                recorder,
                reconciler,
                key: vc.key(),
            }
        }

        async fn vultr_cluster(&self) -> Option<VultrCluster> {
            self.store.get(&self.key).await.unwrap()
        }

        async fn cluster(&self) -> Cluster {
            self.store
                .get(&ObjectKey::new("default", "demo"))
                .await
                .unwrap()
                .unwrap()
        }

        fn assign_address(&self, id: &str, ip: Option<&str>) {
            self.provider.update_stored_load_balancer(id, |lb| {
                lb.status = "active".to_string();
                lb.ipv4 = ip.map(str::to_string);
            });
        }
    }

    #[tokio::test]
    async fn test_creates_load_balancer_with_defaults_and_waits_for_address() {
        let fx = Fixture::new().await;

        let action = fx.reconciler.reconcile(&fx.key).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(15)));

        assert_eq!(fx.provider.count(Op::CreateLoadBalancer), 1);
        let requests = fx.provider.load_balancer_requests();
        let request = &requests[0];
        let cluster = fx.cluster().await;
        assert_eq!(request.label, format!("demo-{}", cluster.metadata.uid));
        assert_eq!(request.region, "ewr");
        assert_eq!(request.balancing_algorithm, "roundrobin");
        assert_eq!(request.health_check.port, 6443);
        assert_eq!(request.health_check.protocol, "tcp");
        assert_eq!(request.health_check.check_interval, 15);
        assert_eq!(request.health_check.response_timeout, 5);
        assert_eq!(request.health_check.unhealthy_threshold, 5);
        assert_eq!(request.health_check.healthy_threshold, 5);
        assert_eq!(
            request.forwarding_rules,
            vec![ForwardingRule::passthrough("tcp", 6443)]
        );

        let vc = fx.vultr_cluster().await.unwrap();
        assert!(vc.metadata.has_finalizer(CLUSTER_FINALIZER));
        let lb_ref = &vc.status.network.api_server_load_balancer_ref;
        assert_eq!(lb_ref.resource_id.as_deref(), Some("lb-1"));
        assert_eq!(lb_ref.subscription_status, Some(SubscriptionStatus::Pending));
        assert!(!vc.status.ready);
        assert!(!vc.status.conditions.is_true(READY_CONDITION));
        assert!(!cluster.status.infrastructure_ready);
    }

    #[tokio::test]
    async fn test_publishes_endpoint_once_address_is_assigned() {
        let fx = Fixture::new().await;
        fx.reconciler.reconcile(&fx.key).await.unwrap();
        fx.assign_address("lb-1", Some("203.0.113.10"));

        let action = fx.reconciler.reconcile(&fx.key).await.unwrap();
        assert_eq!(action, Action::await_change());

        let vc = fx.vultr_cluster().await.unwrap();
        assert!(vc.status.ready);
        assert_eq!(
            vc.spec.control_plane_endpoint,
            ApiEndpoint {
                host: "203.0.113.10".to_string(),
                port: 6443
            }
        );
        assert!(vc.status.conditions.is_true(LOAD_BALANCER_READY_CONDITION));
        assert_eq!(
            vc.status.network.api_server_load_balancer_ref.subscription_status,
            Some(SubscriptionStatus::Active)
        );
        assert!(fx.cluster().await.status.infrastructure_ready);
        assert_eq!(
            fx.recorder.reasons(),
            vec![LOAD_BALANCER_CREATED.to_string(), CLUSTER_READY.to_string()]
        );

        // repeated reconciles never create a second load balancer
        fx.reconciler.reconcile(&fx.key).await.unwrap();
        assert_eq!(fx.provider.count(Op::CreateLoadBalancer), 1);
    }

    #[tokio::test]
    async fn test_readiness_survives_address_loss() {
        let fx = Fixture::new().await;
        fx.reconciler.reconcile(&fx.key).await.unwrap();
        fx.assign_address("lb-1", Some("203.0.113.10"));
        fx.reconciler.reconcile(&fx.key).await.unwrap();

        fx.assign_address("lb-1", None);
        let action = fx.reconciler.reconcile(&fx.key).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(15)));

        let vc = fx.vultr_cluster().await.unwrap();
        assert!(vc.status.ready);
        assert!(vc.status.conditions.is_true(READY_CONDITION));
        assert_eq!(vc.spec.control_plane_endpoint.host, "203.0.113.10");
    }

    #[tokio::test]
    async fn test_adopts_load_balancer_declared_in_spec() {
        let mut spec = VultrClusterSpec {
            region: "ewr".to_string(),
            ..Default::default()
        };
        spec.network.api_server_load_balancer.id = Some("lb-existing".to_string());
        let fx = Fixture::with_spec(spec).await;
        fx.provider.insert_load_balancer(LoadBalancer {
            id: "lb-existing".to_string(),
            status: "active".to_string(),
            ipv4: Some("198.51.100.7".to_string()),
            ..Default::default()
        });

        fx.reconciler.reconcile(&fx.key).await.unwrap();

        assert_eq!(fx.provider.count(Op::CreateLoadBalancer), 0);
        let vc = fx.vultr_cluster().await.unwrap();
        assert!(vc.status.ready);
        assert_eq!(
            vc.status.network.api_server_load_balancer_ref.resource_id.as_deref(),
            Some("lb-existing")
        );
    }

    #[tokio::test]
    async fn test_deletion_removes_load_balancer_then_finalizer() {
        let fx = Fixture::new().await;
        fx.reconciler.reconcile(&fx.key).await.unwrap();
        assert!(fx.provider.load_balancer("lb-1").is_some());

        fx.store.delete::<VultrCluster>(&fx.key).await.unwrap();
        assert!(fx.vultr_cluster().await.unwrap().metadata.is_deleting());

        fx.reconciler.reconcile(&fx.key).await.unwrap();
        assert!(fx.provider.load_balancer("lb-1").is_none());
        assert!(fx.vultr_cluster().await.is_none());
        assert!(fx.recorder.reasons().contains(&LOAD_BALANCER_DELETED.to_string()));
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_finalizer() {
        let fx = Fixture::new().await;
        fx.reconciler.reconcile(&fx.key).await.unwrap();
        fx.store.delete::<VultrCluster>(&fx.key).await.unwrap();

        fx.provider.fail_next(Op::DeleteLoadBalancer, 1);
        let err = fx.reconciler.reconcile(&fx.key).await.unwrap_err();
        assert!(err.to_string().contains("delete load balancer"));

        let vc = fx.vultr_cluster().await.unwrap();
        assert!(vc.metadata.has_finalizer(CLUSTER_FINALIZER));
        assert!(!vc.status.conditions.is_true(READY_CONDITION));

        fx.reconciler.reconcile(&fx.key).await.unwrap();
        assert!(fx.vultr_cluster().await.is_none());
    }

    #[tokio::test]
    async fn test_deletion_converges_when_load_balancer_is_already_gone() {
        let fx = Fixture::new().await;
        fx.reconciler.reconcile(&fx.key).await.unwrap();
        assert!(fx.provider.remove_load_balancer("lb-1").is_some());

        fx.store.delete::<VultrCluster>(&fx.key).await.unwrap();
        fx.provider.clear_calls();
        fx.reconciler.reconcile(&fx.key).await.unwrap();

        assert!(fx.vultr_cluster().await.is_none());
        assert_eq!(fx.provider.count(Op::DeleteLoadBalancer), 0);
        assert!(!fx.recorder.reasons().contains(&LOAD_BALANCER_DELETED.to_string()));
    }

    #[tokio::test]
    async fn test_waits_for_owner_reference() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(FakeProvider::new());
        let reconciler =
            ClusterReconciler::new(store.clone(), provider.clone(), ControllerConfig::default());
        let vc = store
            .create(&VultrCluster::new(
                ObjectMeta::new("default", "orphan"),
                VultrClusterSpec {
                    region: "ewr".to_string(),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        let action = reconciler.reconcile(&vc.key()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(provider.calls().is_empty());

        let current: VultrCluster = store.get(&vc.key()).await.unwrap().unwrap();
        assert!(current.metadata.finalizers.is_empty());
        assert_eq!(current.metadata.resource_version, 1);
    }

    #[tokio::test]
    async fn test_paused_cluster_is_skipped() {
        let fx = Fixture::new().await;
        let mut cluster = fx.cluster().await;
        cluster.spec.paused = true;
        fx.store.update(&cluster).await.unwrap();

        fx.reconciler.reconcile(&fx.key).await.unwrap();
        assert!(fx.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_provider_error_is_surfaced_with_context() {
        let fx = Fixture::new().await;
        fx.provider.fail_next(Op::CreateLoadBalancer, 1);

        let err = fx.reconciler.reconcile(&fx.key).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Cloud { op: "create load balancer", .. }));

        // the finalizer added before the failure was kept
        let vc = fx.vultr_cluster().await.unwrap();
        assert!(vc.metadata.has_finalizer(CLUSTER_FINALIZER));
    }

    #[tokio::test]
    async fn test_keys_lists_every_vultr_cluster() {
        let fx = Fixture::new().await;
        assert_eq!(fx.reconciler.keys().await.unwrap(), vec![fx.key.clone()]);
    }
}
