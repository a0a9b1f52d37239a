//! Status conditions
//!
//! Conditions are the externally observable progress signal of a resource.
//! `last_transition_time` only moves when a condition's status flips.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Summary condition, true once the resource is fully reconciled
pub const READY_CONDITION: &str = "Ready";
/// The cluster load balancer exists and has a public address
pub const LOAD_BALANCER_READY_CONDITION: &str = "LoadBalancerReady";
/// The machine's instance exists and is active
pub const INSTANCE_READY_CONDITION: &str = "InstanceReady";
/// A control-plane instance is a member of the cluster load balancer
pub const LOAD_BALANCER_ATTACHED_CONDITION: &str = "LoadBalancerAttached";
/// At least one usable instance address was found
pub const ADDRESSES_RESOLVED_CONDITION: &str = "AddressesResolved";

pub const WAITING_FOR_ADDRESS_REASON: &str = "WaitingForAddress";
pub const LOAD_BALANCER_PROVISIONING_REASON: &str = "LoadBalancerProvisioning";
pub const LOAD_BALANCER_NOT_ACTIVE_REASON: &str = "LoadBalancerNotActive";
pub const INSTANCE_PENDING_REASON: &str = "InstancePending";
pub const INSTANCE_CREATE_FAILED_REASON: &str = "InstanceCreateFailed";
pub const INSTANCE_FAILED_REASON: &str = "InstanceFailed";
pub const NO_ADDRESSES_REASON: &str = "NoAddresses";
pub const DELETING_REASON: &str = "Deleting";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

/// Ordered set of conditions keyed by type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn mark_true(&mut self, type_: &str) {
        self.set(type_, ConditionStatus::True, None, None);
    }

    pub fn mark_false(&mut self, type_: &str, reason: &str, message: impl Into<String>) {
        self.set(
            type_,
            ConditionStatus::False,
            Some(reason.to_string()),
            Some(message.into()),
        );
    }

    fn set(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: Option<String>,
        message: Option<String>,
    ) {
        match self.0.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = Utc::now();
                }
                existing.status = status;
                existing.reason = reason;
                existing.message = message;
            }
            None => self.0.push(Condition {
                type_: type_.to_string(),
                status,
                reason,
                message,
                last_transition_time: Utc::now(),
            }),
        }
    }
}
