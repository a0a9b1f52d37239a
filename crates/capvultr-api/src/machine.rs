//! VultrMachine: one compute instance backing a Machine

use crate::condition::Conditions;
use crate::meta::{ObjectMeta, Resource};
use crate::status::{MachineStatusError, PowerStatus, ServerState, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Finalizer owned by the machine controller
pub const MACHINE_FINALIZER: &str = "vultrmachine.infrastructure.cluster.x-k8s.io";

/// Scheme used in provider ids written by this controller
pub const PROVIDER_ID_SCHEME: &str = "vultr";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VultrMachine {
    pub metadata: ObjectMeta,
    pub spec: VultrMachineSpec,
    #[serde(default)]
    pub status: VultrMachineStatus,
}

impl Resource for VultrMachine {
    const KIND: &'static str = "VultrMachine";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VultrMachineSpec {
    /// `vultr://<instance-id>`, written once by the controller
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    #[serde(default)]
    pub plan_id: String,

    pub region: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,

    /// SSH key names resolved to ids at creation time
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_key: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,

    /// Legacy VPC 2.0 network, only used when `vpc_id` is unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc2_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall_group_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VultrMachineStatus {
    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_status: Option<SubscriptionStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_status: Option<PowerStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_state: Option<ServerState>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<MachineStatusError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
}

impl VultrMachineStatus {
    /// A recorded failure stops all automatic action until cleared externally
    pub fn has_failed(&self) -> bool {
        self.failure_reason.is_some() || self.failure_message.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    InternalIP,
    ExternalIP,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub address_type: AddressType,
    pub address: String,
}

impl VultrMachine {
    pub fn new(metadata: ObjectMeta, spec: VultrMachineSpec) -> Self {
        Self {
            metadata,
            spec,
            status: VultrMachineStatus::default(),
        }
    }

    pub fn parsed_provider_id(&self) -> Option<ProviderId> {
        self.spec.provider_id.as_deref().and_then(ProviderId::parse)
    }

    /// External instance id, or `None` when no instance was recorded yet
    pub fn instance_id(&self) -> Option<String> {
        self.parsed_provider_id().map(|p| p.instance_id)
    }
}

/// Parsed `<provider>://<instance-id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderId {
    pub provider: String,
    pub instance_id: String,
}

impl ProviderId {
    pub fn new(provider: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Returns `None` for empty or malformed ids; the instance id is the
    /// last path segment
    pub fn parse(raw: &str) -> Option<Self> {
        let (provider, rest) = raw.split_once("://")?;
        if provider.is_empty() || provider.contains(':') || rest.is_empty() || rest.ends_with('/')
        {
            return None;
        }
        let instance_id = rest.rsplit('/').next()?;
        if instance_id.is_empty() {
            return None;
        }
        Some(Self::new(provider, instance_id))
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.provider, self.instance_id)
    }
}
