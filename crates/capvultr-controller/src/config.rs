//! Controller configuration

use capvultr_cloud::RetryConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound for a single reconcile call
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(90 * 60);

/// Requeue interval while the load balancer has no public address
pub const LOAD_BALANCER_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Requeue interval while an instance is pending
pub const INSTANCE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Attempts for the load balancer membership update before giving up
pub const DEFAULT_MEMBERSHIP_ATTEMPTS: u32 = 5;

/// What to do when an instance reports no usable address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressPolicy {
    /// Fail the attempt so it is retried with backoff
    Strict,
    /// Log, record the `AddressesResolved` condition and carry on
    #[default]
    Lenient,
}

impl FromStr for AddressPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(AddressPolicy::Strict),
            "lenient" => Ok(AddressPolicy::Lenient),
            other => Err(format!(
                "unknown address policy '{}', expected 'strict' or 'lenient'",
                other
            )),
        }
    }
}

impl fmt::Display for AddressPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressPolicy::Strict => write!(f, "strict"),
            AddressPolicy::Lenient => write!(f, "lenient"),
        }
    }
}

/// Settings shared by both reconcilers and the work scheduler
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub reconcile_timeout: Duration,
    pub address_policy: AddressPolicy,
    pub load_balancer_poll_interval: Duration,
    pub instance_poll_interval: Duration,
    pub membership_attempts: u32,
    /// Backoff between failed reconciles of the same key
    pub backoff: RetryConfig,
    /// Mark the owning Cluster infrastructure-ready once its VultrCluster is ready
    pub propagate_infrastructure_ready: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            address_policy: AddressPolicy::default(),
            load_balancer_poll_interval: LOAD_BALANCER_POLL_INTERVAL,
            instance_poll_interval: INSTANCE_POLL_INTERVAL,
            membership_attempts: DEFAULT_MEMBERSHIP_ATTEMPTS,
            backoff: RetryConfig {
                max_attempts: u32::MAX,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(300),
                backoff_multiplier: 2.0,
            },
            propagate_infrastructure_ready: true,
        }
    }
}
