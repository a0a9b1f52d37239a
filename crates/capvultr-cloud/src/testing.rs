//! In-memory provider for tests
//!
//! Records every call so tests can assert on exactly which provider operations
//! a reconcile performed.

use crate::error::{CloudError, Result};
use crate::model::{
    Instance, InstanceCreateRequest, LoadBalancer, LoadBalancerCreateRequest, LoadBalancerUpdate,
    SshKey,
};
use crate::provider::CloudProvider;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetInstance,
    CreateInstance,
    DeleteInstance,
    GetLoadBalancer,
    CreateLoadBalancer,
    UpdateLoadBalancer,
    DeleteLoadBalancer,
    GetSshKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    pub op: Op,
    /// Resource id or name the call targeted (label for creates)
    pub target: String,
}

#[derive(Default)]
struct FakeState {
    instances: BTreeMap<String, Instance>,
    load_balancers: BTreeMap<String, LoadBalancer>,
    ssh_keys: BTreeMap<String, SshKey>,
    calls: Vec<ProviderCall>,
    instance_requests: Vec<InstanceCreateRequest>,
    load_balancer_requests: Vec<LoadBalancerCreateRequest>,
    failures: HashMap<Op, u32>,
    concurrent_members: u32,
    next_id: u32,
}

/// Provider backed by in-memory maps
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_instance(&self, instance: Instance) {
        self.lock().instances.insert(instance.id.clone(), instance);
    }

    pub fn insert_load_balancer(&self, lb: LoadBalancer) {
        self.lock().load_balancers.insert(lb.id.clone(), lb);
    }

    pub fn insert_ssh_key(&self, key: SshKey) {
        self.lock().ssh_keys.insert(key.name.clone(), key);
    }

    /// Drops an instance as if it was destroyed outside the controller
    pub fn remove_instance(&self, id: &str) -> Option<Instance> {
        self.lock().instances.remove(id)
    }

    pub fn remove_load_balancer(&self, id: &str) -> Option<LoadBalancer> {
        self.lock().load_balancers.remove(id)
    }

    pub fn instance(&self, id: &str) -> Option<Instance> {
        self.lock().instances.get(id).cloned()
    }

    pub fn load_balancer(&self, id: &str) -> Option<LoadBalancer> {
        self.lock().load_balancers.get(id).cloned()
    }

    /// Mutates a stored instance in place
    pub fn update_instance(&self, id: &str, f: impl FnOnce(&mut Instance)) {
        if let Some(instance) = self.lock().instances.get_mut(id) {
            f(instance);
        }
    }

    /// Mutates a stored load balancer in place
    pub fn update_stored_load_balancer(&self, id: &str, f: impl FnOnce(&mut LoadBalancer)) {
        if let Some(lb) = self.lock().load_balancers.get_mut(id) {
            f(lb);
        }
    }

    /// Makes the next `times` calls of `op` fail with a server error
    pub fn fail_next(&self, op: Op, times: u32) {
        self.lock().failures.insert(op, times);
    }

    /// Simulates another writer adding a member right before each of the next
    /// `times` load balancer updates
    pub fn race_next_updates(&self, times: u32) {
        self.lock().concurrent_members = times;
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn instance_requests(&self) -> Vec<InstanceCreateRequest> {
        self.lock().instance_requests.clone()
    }

    pub fn load_balancer_requests(&self) -> Vec<LoadBalancerCreateRequest> {
        self.lock().load_balancer_requests.clone()
    }

    /// Records the call and consumes an injected failure, if any
    fn begin(&self, op: Op, target: &str) -> Result<MutexGuard<'_, FakeState>> {
        let mut state = self.lock();
        state.calls.push(ProviderCall {
            op,
            target: target.to_string(),
        });
        if let Some(remaining) = state.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CloudError::ApiError {
                    status: 500,
                    message: format!("injected {:?} failure", op),
                });
            }
        }
        Ok(state)
    }
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

#[async_trait]
impl CloudProvider for FakeProvider {
    fn name(&self) -> &str {
        "vultr"
    }

    async fn get_instance(&self, id: &str) -> Result<Option<Instance>> {
        let state = self.begin(Op::GetInstance, id)?;
        Ok(state.instances.get(id).cloned())
    }

    async fn create_instance(&self, request: &InstanceCreateRequest) -> Result<Instance> {
        let mut state = self.begin(Op::CreateInstance, &request.label)?;
        let id = state.next_id("inst");
        let instance = Instance {
            id: id.clone(),
            label: request.label.clone(),
            region: request.region.clone(),
            plan: request.plan.clone(),
            status: "pending".to_string(),
            power_status: Some("stopped".to_string()),
            server_status: Some("none".to_string()),
            tags: request.tags.clone(),
            ..Default::default()
        };
        state.instance_requests.push(request.clone());
        state.instances.insert(id, instance.clone());
        Ok(instance)
    }

    async fn delete_instance(&self, id: &str) -> Result<()> {
        let mut state = self.begin(Op::DeleteInstance, id)?;
        state.instances.remove(id);
        Ok(())
    }

    async fn get_load_balancer(&self, id: &str) -> Result<Option<LoadBalancer>> {
        let state = self.begin(Op::GetLoadBalancer, id)?;
        Ok(state.load_balancers.get(id).cloned())
    }

    async fn create_load_balancer(
        &self,
        request: &LoadBalancerCreateRequest,
    ) -> Result<LoadBalancer> {
        let mut state = self.begin(Op::CreateLoadBalancer, &request.label)?;
        let id = state.next_id("lb");
        let lb = LoadBalancer {
            id: id.clone(),
            label: request.label.clone(),
            region: request.region.clone(),
            status: "pending".to_string(),
            health_check: request.health_check.clone(),
            balancing_algorithm: request.balancing_algorithm.clone(),
            forwarding_rules: request.forwarding_rules.clone(),
            ..Default::default()
        };
        state.load_balancer_requests.push(request.clone());
        state.load_balancers.insert(id, lb.clone());
        Ok(lb)
    }

    async fn update_load_balancer(&self, id: &str, update: &LoadBalancerUpdate) -> Result<()> {
        let mut state = self.begin(Op::UpdateLoadBalancer, id)?;
        if state.concurrent_members > 0 {
            state.concurrent_members -= 1;
            let foreign = state.next_id("foreign");
            if let Some(lb) = state.load_balancers.get_mut(id) {
                lb.instances.push(foreign);
            }
        }
        let lb = state
            .load_balancers
            .get_mut(id)
            .ok_or_else(|| CloudError::ResourceNotFound(format!("load balancer {}", id)))?;
        if !update.precondition_holds(&lb.instances) {
            return Err(CloudError::Conflict(format!(
                "load balancer {} membership changed",
                id
            )));
        }
        lb.instances = update.instances.clone();
        Ok(())
    }

    async fn delete_load_balancer(&self, id: &str) -> Result<()> {
        let mut state = self.begin(Op::DeleteLoadBalancer, id)?;
        state.load_balancers.remove(id);
        Ok(())
    }

    async fn get_ssh_key(&self, name: &str) -> Result<Option<SshKey>> {
        let state = self.begin(Op::GetSshKey, name)?;
        Ok(state.ssh_keys.get(name).cloned())
    }
}
