//! VultrCluster: infrastructure backing a cluster (API server load balancer)

use crate::condition::Conditions;
use crate::loadbalancer::LoadBalancerSpec;
use crate::meta::{ObjectMeta, Resource};
use crate::status::{ClusterStatusError, SubscriptionStatus};
use serde::{Deserialize, Serialize};

/// Finalizer owned by the cluster controller
pub const CLUSTER_FINALIZER: &str = "vultrcluster.infrastructure.cluster.x-k8s.io";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VultrCluster {
    pub metadata: ObjectMeta,
    pub spec: VultrClusterSpec,
    #[serde(default)]
    pub status: VultrClusterStatus,
}

impl Resource for VultrCluster {
    const KIND: &'static str = "VultrCluster";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VultrClusterSpec {
    pub region: String,

    #[serde(default)]
    pub network: NetworkSpec,

    /// Published by the controller once the load balancer has an address
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    #[serde(default)]
    pub api_server_load_balancer: LoadBalancerSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

impl ApiEndpoint {
    pub fn is_set(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VultrClusterStatus {
    #[serde(default)]
    pub ready: bool,

    #[serde(default)]
    pub network: NetworkStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<ClusterStatusError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    #[serde(default)]
    pub api_server_load_balancer_ref: ResourceReference,
}

/// The controller's memory of an external resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_status: Option<SubscriptionStatus>,
}

impl VultrCluster {
    pub fn new(metadata: ObjectMeta, spec: VultrClusterSpec) -> Self {
        Self {
            metadata,
            spec,
            status: VultrClusterStatus::default(),
        }
    }

    /// Remembered load balancer id, falling back to the one declared in spec
    pub fn load_balancer_id(&self) -> Option<String> {
        self.status
            .network
            .api_server_load_balancer_ref
            .resource_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| {
                self.spec
                    .network
                    .api_server_load_balancer
                    .id
                    .clone()
                    .filter(|id| !id.is_empty())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> VultrCluster {
        VultrCluster::new(
            ObjectMeta::new("default", "demo"),
            VultrClusterSpec {
                region: "ewr".to_string(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_load_balancer_id_prefers_remembered_id() {
        let mut c = cluster();
        c.spec.network.api_server_load_balancer.id = Some("from-spec".to_string());
        assert_eq!(c.load_balancer_id().as_deref(), Some("from-spec"));

        c.status.network.api_server_load_balancer_ref.resource_id = Some("remembered".to_string());
        assert_eq!(c.load_balancer_id().as_deref(), Some("remembered"));
    }

    #[test]
    fn test_load_balancer_id_ignores_empty_strings() {
        let mut c = cluster();
        c.status.network.api_server_load_balancer_ref.resource_id = Some(String::new());
        assert_eq!(c.load_balancer_id(), None);
    }

    #[test]
    fn test_deserialize_minimal_manifest() {
        let yaml = r#"
metadata:
  name: demo
spec:
  region: ewr
"#;
        let c: VultrCluster = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.spec.region, "ewr");
        assert!(!c.status.ready);
        assert!(!c.spec.control_plane_endpoint.is_set());
    }
}
