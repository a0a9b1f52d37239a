//! Cloud provider trait definition

use crate::error::Result;
use crate::model::{
    Instance, InstanceCreateRequest, LoadBalancer, LoadBalancerCreateRequest, LoadBalancerUpdate,
    SshKey,
};
use async_trait::async_trait;
use std::time::Duration;

/// Cloud provider abstraction trait
///
/// Lookups return `Ok(None)` when the resource does not exist; a missing
/// resource is never an error. This is what makes creation idempotent for the
/// controllers: they look up by the remembered id first and create only on
/// `None`.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Returns the provider name, also used as the provider id scheme
    fn name(&self) -> &str;

    async fn get_instance(&self, id: &str) -> Result<Option<Instance>>;

    async fn create_instance(&self, request: &InstanceCreateRequest) -> Result<Instance>;

    /// Deleting an instance that no longer exists succeeds
    async fn delete_instance(&self, id: &str) -> Result<()>;

    async fn get_load_balancer(&self, id: &str) -> Result<Option<LoadBalancer>>;

    async fn create_load_balancer(&self, request: &LoadBalancerCreateRequest)
    -> Result<LoadBalancer>;

    /// Returns `CloudError::Conflict` when the update's precondition fails
    async fn update_load_balancer(&self, id: &str, update: &LoadBalancerUpdate) -> Result<()>;

    /// Deleting a load balancer that no longer exists succeeds
    async fn delete_load_balancer(&self, id: &str) -> Result<()>;

    /// Looks up an SSH key by name
    async fn get_ssh_key(&self, name: &str) -> Result<Option<SshKey>>;
}

/// Retry configuration for provider operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the next attempt after `failures` consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}
