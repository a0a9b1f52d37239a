//! Declared API server load balancer configuration

use serde::{Deserialize, Serialize};

pub const DEFAULT_LB_PORT: u16 = 6443;
pub const DEFAULT_LB_ALGORITHM: &str = "roundrobin";
pub const DEFAULT_LB_PROTOCOL: &str = "tcp";
pub const DEFAULT_LB_HEALTH_CHECK_INTERVAL: u32 = 15;
pub const DEFAULT_LB_HEALTH_CHECK_TIMEOUT: u32 = 5;
pub const DEFAULT_LB_UNHEALTHY_THRESHOLD: u32 = 5;
pub const DEFAULT_LB_HEALTHY_THRESHOLD: u32 = 5;

/// Load balancer settings from the cluster spec; unset fields take defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerSpec {
    /// Pre-existing load balancer to adopt instead of creating one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic_info: Option<GenericInfoSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_interval: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_timeout: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhealthy_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthy_threshold: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericInfoSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balancing_algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<String>,
}

/// Health check settings with every default filled in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSettings {
    pub protocol: String,
    pub port: u16,
    pub path: Option<String>,
    pub check_interval: u32,
    pub response_timeout: u32,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

/// Load balancer settings with every default filled in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerSettings {
    pub id: Option<String>,
    pub health_check: HealthCheckSettings,
    pub balancing_algorithm: String,
    pub vpc: Option<String>,
}

impl LoadBalancerSpec {
    /// Resolves the declared settings against the defaults
    pub fn with_defaults(&self) -> LoadBalancerSettings {
        let hc = self.health_check.clone().unwrap_or_default();
        let generic = self.generic_info.clone().unwrap_or_default();

        LoadBalancerSettings {
            id: self.id.clone().filter(|id| !id.is_empty()),
            health_check: HealthCheckSettings {
                protocol: hc
                    .protocol
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| DEFAULT_LB_PROTOCOL.to_string()),
                port: hc.port.filter(|p| *p != 0).unwrap_or(DEFAULT_LB_PORT),
                path: hc.path,
                check_interval: hc
                    .check_interval
                    .filter(|v| *v != 0)
                    .unwrap_or(DEFAULT_LB_HEALTH_CHECK_INTERVAL),
                response_timeout: hc
                    .response_timeout
                    .filter(|v| *v != 0)
                    .unwrap_or(DEFAULT_LB_HEALTH_CHECK_TIMEOUT),
                unhealthy_threshold: hc
                    .unhealthy_threshold
                    .filter(|v| *v != 0)
                    .unwrap_or(DEFAULT_LB_UNHEALTHY_THRESHOLD),
                healthy_threshold: hc
                    .healthy_threshold
                    .filter(|v| *v != 0)
                    .unwrap_or(DEFAULT_LB_HEALTHY_THRESHOLD),
            },
            balancing_algorithm: generic
                .balancing_algorithm
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| DEFAULT_LB_ALGORITHM.to_string()),
            vpc: generic.vpc.filter(|v| !v.is_empty()),
        }
    }
}
