//! capvultr resource model
//!
//! Types for the objects the controllers read and write:
//!
//! - **VultrCluster**: API server load balancer and control-plane endpoint
//! - **VultrMachine**: one compute instance
//! - **Cluster / Machine / Secret**: owner objects written by the provisioning actor
//!
//! Spec fields are written by the provisioning actor. Status fields are
//! written only by the owning controller.

pub mod cluster;
pub mod condition;
pub mod loadbalancer;
pub mod machine;
pub mod meta;
pub mod owner;
pub mod status;
pub mod tags;

// Re-exports
pub use cluster::{
    ApiEndpoint, CLUSTER_FINALIZER, NetworkSpec, NetworkStatus, ResourceReference, VultrCluster,
    VultrClusterSpec, VultrClusterStatus,
};
pub use condition::{Condition, ConditionStatus, Conditions};
pub use loadbalancer::{
    GenericInfoSpec, HealthCheckSettings, HealthCheckSpec, LoadBalancerSettings, LoadBalancerSpec,
};
pub use machine::{
    AddressType, MACHINE_FINALIZER, MachineAddress, PROVIDER_ID_SCHEME, ProviderId, VultrMachine,
    VultrMachineSpec, VultrMachineStatus,
};
pub use meta::{
    CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL, ObjectKey, ObjectMeta, ObjectReference,
    OwnerReference, PAUSED_ANNOTATION, Resource,
};
pub use owner::{
    BOOTSTRAP_DATA_KEY, Bootstrap, Cluster, ClusterSpec, ClusterStatus, Machine, MachineSpec,
    Secret,
};
pub use status::{
    ClusterStatusError, MachineStatusError, PowerStatus, ServerState, SubscriptionStatus,
};
pub use tags::{API_SERVER_ROLE, NODE_ROLE, TAG_PREFIX, TagParams, build_tags};
