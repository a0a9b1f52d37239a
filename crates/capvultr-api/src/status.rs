//! Lifecycle phases reported by the cloud and failure reasons recorded by the controllers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of a cloud subscription (instance or load balancer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Suspended,
    Closed,
    /// Any value the cloud reports that is not listed above
    Other(String),
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Suspended => "suspended",
            SubscriptionStatus::Closed => "closed",
            SubscriptionStatus::Other(s) => s,
        }
    }
}

impl From<&str> for SubscriptionStatus {
    fn from(value: &str) -> Self {
        match value {
            "pending" => SubscriptionStatus::Pending,
            "active" => SubscriptionStatus::Active,
            "suspended" => SubscriptionStatus::Suspended,
            "closed" => SubscriptionStatus::Closed,
            other => SubscriptionStatus::Other(other.to_string()),
        }
    }
}

impl From<String> for SubscriptionStatus {
    fn from(value: String) -> Self {
        SubscriptionStatus::from(value.as_str())
    }
}

impl From<SubscriptionStatus> for String {
    fn from(value: SubscriptionStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the instance is powered on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PowerStatus {
    Starting,
    Stopped,
    Running,
    Other(String),
}

impl From<String> for PowerStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "starting" => PowerStatus::Starting,
            "stopped" => PowerStatus::Stopped,
            "running" => PowerStatus::Running,
            _ => PowerStatus::Other(value),
        }
    }
}

impl From<PowerStatus> for String {
    fn from(value: PowerStatus) -> Self {
        match value {
            PowerStatus::Starting => "starting".to_string(),
            PowerStatus::Stopped => "stopped".to_string(),
            PowerStatus::Running => "running".to_string(),
            PowerStatus::Other(s) => s,
        }
    }
}

/// Detailed server state of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ServerState {
    None,
    Locked,
    InstallingBooting,
    IsoMounting,
    Ok,
    Error,
    Other(String),
}

impl From<String> for ServerState {
    fn from(value: String) -> Self {
        match value.as_str() {
            "none" => ServerState::None,
            "locked" => ServerState::Locked,
            "installingbooting" => ServerState::InstallingBooting,
            "isomounting" => ServerState::IsoMounting,
            "ok" => ServerState::Ok,
            "error" => ServerState::Error,
            _ => ServerState::Other(value),
        }
    }
}

impl From<ServerState> for String {
    fn from(value: ServerState) -> Self {
        match value {
            ServerState::None => "none".to_string(),
            ServerState::Locked => "locked".to_string(),
            ServerState::InstallingBooting => "installingbooting".to_string(),
            ServerState::IsoMounting => "isomounting".to_string(),
            ServerState::Ok => "ok".to_string(),
            ServerState::Error => "error".to_string(),
            ServerState::Other(s) => s,
        }
    }
}

/// Terminal machine failure reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineStatusError {
    InvalidConfiguration,
    CreateError,
    UpdateError,
    DeleteError,
}

impl fmt::Display for MachineStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineStatusError::InvalidConfiguration => write!(f, "InvalidConfiguration"),
            MachineStatusError::CreateError => write!(f, "CreateError"),
            MachineStatusError::UpdateError => write!(f, "UpdateError"),
            MachineStatusError::DeleteError => write!(f, "DeleteError"),
        }
    }
}

/// Terminal cluster failure reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStatusError {
    InvalidConfiguration,
    CreateClusterError,
    UpdateClusterError,
    DeleteClusterError,
}

impl fmt::Display for ClusterStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterStatusError::InvalidConfiguration => write!(f, "InvalidConfiguration"),
            ClusterStatusError::CreateClusterError => write!(f, "CreateError"),
            ClusterStatusError::UpdateClusterError => write!(f, "UpdateError"),
            ClusterStatusError::DeleteClusterError => write!(f, "DeleteError"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_status_keeps_unknown_values() {
        let status: SubscriptionStatus = serde_json::from_str("\"migrating\"").unwrap();
        assert_eq!(status, SubscriptionStatus::Other("migrating".to_string()));
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"migrating\"");
    }

    #[test]
    fn test_subscription_status_known_values() {
        assert_eq!(SubscriptionStatus::from("active"), SubscriptionStatus::Active);
        assert_eq!(SubscriptionStatus::Suspended.to_string(), "suspended");
    }

    #[test]
    fn test_server_state_parses_booting() {
        let state = ServerState::from("installingbooting".to_string());
        assert_eq!(state, ServerState::InstallingBooting);
    }
}
