//! capvultr cloud provider abstraction
//!
//! The controllers talk to the cloud only through [`CloudProvider`], so the
//! reconcile logic can be exercised against an in-memory provider.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │               capvultr-controller                │
//! │      (VultrCluster / VultrMachine reconcile)     │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                 capvultr-cloud                   │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  trait CloudProvider { ... }              │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────┐            │
//! │  │    Model     │  │ FakeProvider │            │
//! │  └──────────────┘  └──────────────┘            │
//! └───────┬─────────────────────────────────────────┘
//!         │
//! ┌───────▼───────────┐
//! │ capvultr-cloud-   │
//! │ vultr (REST API)  │
//! └───────────────────┘
//! ```

pub mod error;
pub mod model;
pub mod provider;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-exports
pub use error::{CloudError, Result};
pub use model::{
    ForwardingRule, HealthCheck, Instance, InstanceCreateRequest, LoadBalancer,
    LoadBalancerCreateRequest, LoadBalancerUpdate, SshKey,
};
pub use provider::{CloudProvider, RetryConfig};
