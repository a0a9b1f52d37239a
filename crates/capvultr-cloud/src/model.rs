//! Mirrors of cloud resources and the requests that create or change them
//!
//! These types are provider-neutral: string statuses are passed through as the
//! cloud reports them and interpreted by the controllers.

use serde::{Deserialize, Serialize};

/// A compute instance as reported by the cloud
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub label: String,
    pub region: String,
    pub plan: String,

    /// Subscription status (pending, active, suspended, closed)
    pub status: String,

    /// Power status (running, stopped, ...)
    pub power_status: Option<String>,

    /// Server state (none, locked, installingbooting, ok, ...)
    pub server_status: Option<String>,

    /// Public IPv4, `None` until assigned
    pub main_ip: Option<String>,

    /// Private (VPC) IPv4, `None` when not attached
    pub internal_ip: Option<String>,

    pub v6_main_ip: Option<String>,

    pub tags: Vec<String>,
}

/// Parameters for creating an instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceCreateRequest {
    pub label: String,
    pub hostname: String,
    pub region: String,
    pub plan: String,
    pub snapshot_id: Option<String>,
    pub ssh_key_ids: Vec<String>,

    /// Base64-encoded user data
    pub user_data: String,

    pub enable_ipv6: bool,
    pub firewall_group_id: Option<String>,
    pub attach_vpc: Vec<String>,
    pub attach_vpc2: Vec<String>,
    pub tags: Vec<String>,
}

/// A load balancer as reported by the cloud
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: String,
    pub label: String,
    pub region: String,
    pub status: String,

    /// Public IPv4, `None` until assigned
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,

    /// Member instance ids
    pub instances: Vec<String>,

    pub health_check: HealthCheck,
    pub balancing_algorithm: String,
    pub forwarding_rules: Vec<ForwardingRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub protocol: String,
    pub port: u16,
    pub path: Option<String>,
    pub check_interval: u32,
    pub response_timeout: u32,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub frontend_protocol: String,
    pub frontend_port: u16,
    pub backend_protocol: String,
    pub backend_port: u16,
}

impl ForwardingRule {
    /// Same protocol and port on both sides
    pub fn passthrough(protocol: &str, port: u16) -> Self {
        Self {
            frontend_protocol: protocol.to_string(),
            frontend_port: port,
            backend_protocol: protocol.to_string(),
            backend_port: port,
        }
    }
}

/// Parameters for creating a load balancer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerCreateRequest {
    pub label: String,
    pub region: String,
    pub balancing_algorithm: String,
    pub health_check: HealthCheck,
    pub forwarding_rules: Vec<ForwardingRule>,
    pub vpc: Option<String>,
}

/// Change to a load balancer's member list
///
/// When `expected_instances` is set the update only applies if the current
/// member list still equals it; otherwise the provider returns
/// [`CloudError::Conflict`](crate::CloudError::Conflict).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerUpdate {
    pub instances: Vec<String>,
    pub expected_instances: Option<Vec<String>>,
}

impl LoadBalancerUpdate {
    /// Member list with `instance_id` appended, conditioned on `current`
    pub fn append_member(current: &[String], instance_id: &str) -> Self {
        let mut instances = current.to_vec();
        instances.push(instance_id.to_string());
        Self {
            instances,
            expected_instances: Some(current.to_vec()),
        }
    }

    /// Whether the precondition holds for the given member list
    pub fn precondition_holds(&self, current: &[String]) -> bool {
        match &self.expected_instances {
            None => true,
            Some(expected) => {
                let mut a = expected.clone();
                let mut b = current.to_vec();
                a.sort();
                b.sort();
                a == b
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKey {
    pub id: String,
    pub name: String,
    pub ssh_key: String,
}
