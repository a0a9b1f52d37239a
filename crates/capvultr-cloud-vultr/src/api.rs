//! Vultr v2 wire types and their conversion to the provider model

use capvultr_cloud::{
    ForwardingRule, HealthCheck, Instance, InstanceCreateRequest, LoadBalancer,
    LoadBalancerCreateRequest, SshKey,
};
use serde::{Deserialize, Serialize};

/// Vultr reports unassigned addresses as `0.0.0.0` or `""`
pub(crate) fn assigned_address(addr: &str) -> Option<String> {
    match addr.trim() {
        "" | "0.0.0.0" | "::" => None,
        a => Some(a.to_string()),
    }
}

fn is_empty(ids: &&[String]) -> bool {
    ids.is_empty()
}

// ============ Instances ============

#[derive(Debug, Deserialize)]
pub(crate) struct InstanceEnvelope {
    pub instance: ApiInstance,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiInstance {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub power_status: String,
    #[serde(default)]
    pub server_status: String,
    #[serde(default)]
    pub main_ip: String,
    #[serde(default)]
    pub internal_ip: String,
    #[serde(default)]
    pub v6_main_ip: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl From<ApiInstance> for Instance {
    fn from(i: ApiInstance) -> Self {
        Instance {
            main_ip: assigned_address(&i.main_ip),
            internal_ip: assigned_address(&i.internal_ip),
            v6_main_ip: assigned_address(&i.v6_main_ip),
            power_status: Some(i.power_status).filter(|s| !s.is_empty()),
            server_status: Some(i.server_status).filter(|s| !s.is_empty()),
            id: i.id,
            label: i.label,
            region: i.region,
            plan: i.plan,
            status: i.status,
            tags: i.tags,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateInstanceBody<'a> {
    region: &'a str,
    plan: &'a str,
    label: &'a str,
    hostname: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot_id: Option<&'a str>,
    #[serde(skip_serializing_if = "is_empty")]
    sshkey_id: &'a [String],
    user_data: &'a str,
    enable_ipv6: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    firewall_group_id: Option<&'a str>,
    #[serde(skip_serializing_if = "is_empty")]
    attach_vpc: &'a [String],
    #[serde(skip_serializing_if = "is_empty")]
    attach_vpc2: &'a [String],
    tags: &'a [String],
}

impl<'a> From<&'a InstanceCreateRequest> for CreateInstanceBody<'a> {
    fn from(r: &'a InstanceCreateRequest) -> Self {
        Self {
            region: &r.region,
            plan: &r.plan,
            label: &r.label,
            hostname: &r.hostname,
            snapshot_id: r.snapshot_id.as_deref(),
            sshkey_id: &r.ssh_key_ids,
            user_data: &r.user_data,
            enable_ipv6: r.enable_ipv6,
            firewall_group_id: r.firewall_group_id.as_deref(),
            attach_vpc: &r.attach_vpc,
            attach_vpc2: &r.attach_vpc2,
            tags: &r.tags,
        }
    }
}

// ============ Load balancers ============

#[derive(Debug, Deserialize)]
pub(crate) struct LoadBalancerEnvelope {
    pub load_balancer: ApiLoadBalancer,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiLoadBalancer {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: String,
    #[serde(default)]
    pub instances: Vec<String>,
    #[serde(default)]
    pub health_check: ApiHealthCheck,
    #[serde(default)]
    pub generic_info: ApiGenericInfo,
    #[serde(default)]
    pub forwarding_rules: Vec<ApiForwardingRule>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct ApiHealthCheck {
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default)]
    pub check_interval: u32,
    #[serde(default)]
    pub response_timeout: u32,
    #[serde(default)]
    pub unhealthy_threshold: u32,
    #[serde(default)]
    pub healthy_threshold: u32,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApiGenericInfo {
    #[serde(default)]
    pub balancing_algorithm: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ApiForwardingRule {
    pub frontend_protocol: String,
    pub frontend_port: u16,
    pub backend_protocol: String,
    pub backend_port: u16,
}

impl From<ApiHealthCheck> for HealthCheck {
    fn from(h: ApiHealthCheck) -> Self {
        HealthCheck {
            protocol: h.protocol,
            port: h.port,
            path: Some(h.path).filter(|p| !p.is_empty()),
            check_interval: h.check_interval,
            response_timeout: h.response_timeout,
            unhealthy_threshold: h.unhealthy_threshold,
            healthy_threshold: h.healthy_threshold,
        }
    }
}

impl From<&HealthCheck> for ApiHealthCheck {
    fn from(h: &HealthCheck) -> Self {
        ApiHealthCheck {
            protocol: h.protocol.clone(),
            port: h.port,
            path: h.path.clone().unwrap_or_default(),
            check_interval: h.check_interval,
            response_timeout: h.response_timeout,
            unhealthy_threshold: h.unhealthy_threshold,
            healthy_threshold: h.healthy_threshold,
        }
    }
}

impl From<&ForwardingRule> for ApiForwardingRule {
    fn from(r: &ForwardingRule) -> Self {
        ApiForwardingRule {
            frontend_protocol: r.frontend_protocol.clone(),
            frontend_port: r.frontend_port,
            backend_protocol: r.backend_protocol.clone(),
            backend_port: r.backend_port,
        }
    }
}

impl From<ApiLoadBalancer> for LoadBalancer {
    fn from(lb: ApiLoadBalancer) -> Self {
        LoadBalancer {
            ipv4: assigned_address(&lb.ipv4),
            ipv6: assigned_address(&lb.ipv6),
            id: lb.id,
            label: lb.label,
            region: lb.region,
            status: lb.status,
            instances: lb.instances,
            health_check: lb.health_check.into(),
            balancing_algorithm: lb.generic_info.balancing_algorithm,
            forwarding_rules: lb
                .forwarding_rules
                .into_iter()
                .map(|r| ForwardingRule {
                    frontend_protocol: r.frontend_protocol,
                    frontend_port: r.frontend_port,
                    backend_protocol: r.backend_protocol,
                    backend_port: r.backend_port,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateLoadBalancerBody {
    region: String,
    label: String,
    balancing_algorithm: String,
    health_check: ApiHealthCheck,
    forwarding_rules: Vec<ApiForwardingRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vpc: Option<String>,
}

impl From<&LoadBalancerCreateRequest> for CreateLoadBalancerBody {
    fn from(r: &LoadBalancerCreateRequest) -> Self {
        Self {
            region: r.region.clone(),
            label: r.label.clone(),
            balancing_algorithm: r.balancing_algorithm.clone(),
            health_check: (&r.health_check).into(),
            forwarding_rules: r.forwarding_rules.iter().map(Into::into).collect(),
            vpc: r.vpc.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct UpdateLoadBalancerBody<'a> {
    pub instances: &'a [String],
}

// ============ SSH keys ============

#[derive(Debug, Deserialize)]
pub(crate) struct SshKeyList {
    #[serde(default)]
    pub ssh_keys: Vec<ApiSshKey>,
    #[serde(default)]
    pub meta: ListMeta,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiSshKey {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ssh_key: String,
}

impl From<ApiSshKey> for SshKey {
    fn from(k: ApiSshKey) -> Self {
        SshKey {
            id: k.id,
            name: k.name,
            ssh_key: k.ssh_key,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListMeta {
    #[serde(default)]
    pub links: ListLinks,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListLinks {
    #[serde(default)]
    pub next: String,
}
