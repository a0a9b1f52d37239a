//! Reconcile error types

use crate::store::StoreError;
use capvultr_api::{ObjectKey, Resource};
use capvultr_cloud::CloudError;
use std::fmt;
use thiserror::Error;

/// The object a reconcile was working on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub kind: &'static str,
    pub key: ObjectKey,
}

impl Target {
    pub fn new(kind: &'static str, key: ObjectKey) -> Self {
        Self { kind, key }
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        Self::new(K::KIND, obj.key())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("{target}: {op} failed: {source}")]
    Cloud {
        target: Target,
        op: &'static str,
        #[source]
        source: CloudError,
    },

    #[error("{target}: {op} failed: {source}")]
    Store {
        target: Target,
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("{target}: bootstrap data unavailable: {message}")]
    Bootstrap { target: Target, message: String },

    #[error("{target}: instance {instance_id} has no usable address")]
    NoAddress { target: Target, instance_id: String },

    #[error("{target}: load balancer {load_balancer_id} membership kept changing after {attempts} attempts")]
    MembershipContention {
        target: Target,
        load_balancer_id: String,
        attempts: u32,
    },
}

impl ReconcileError {
    /// `map_err` adapter for provider calls
    pub fn cloud(target: &Target, op: &'static str) -> impl FnOnce(CloudError) -> Self {
        let target = target.clone();
        move |source| ReconcileError::Cloud { target, op, source }
    }

    /// `map_err` adapter for store calls
    pub fn store(target: &Target, op: &'static str) -> impl FnOnce(StoreError) -> Self {
        let target = target.clone();
        move |source| ReconcileError::Store { target, op, source }
    }

    /// Whether a store write lost against a concurrent writer
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::Store { source, .. } if source.is_conflict())
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
