//! capvultr controllers
//!
//! Two reconcilers keep Vultr resources in line with the declared cluster:
//!
//! - [`ClusterReconciler`]: one load balancer per VultrCluster and the
//!   control-plane endpoint derived from it
//! - [`MachineReconciler`]: one instance per VultrMachine, load balancer
//!   membership for control-plane machines, addresses and readiness
//!
//! Both read and write objects through a [`Store`] and reach the cloud through
//! a [`capvultr_cloud::CloudProvider`]. A [`Controller`] drives a reconciler
//! from store watches and [`Mapper`]s, one reconcile per key at a time.

pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod machine;
pub mod mapper;
pub mod owners;
pub mod scheduler;
pub mod scope;
pub mod store;

// Re-exports
pub use cluster::ClusterReconciler;
pub use config::{AddressPolicy, ControllerConfig};
pub use error::{ReconcileError, Result, Target};
pub use events::{EventRecorder, EventType, TracingRecorder};
pub use machine::MachineReconciler;
pub use mapper::{
    ClusterToVultrCluster, ClusterToVultrMachines, Mapper, MachineToVultrMachine,
    VultrClusterToVultrMachines,
};
pub use scheduler::{Action, Controller, Reconciler};
pub use store::{FileStore, ListParams, MemoryStore, Snapshot, Store, StoreError};
