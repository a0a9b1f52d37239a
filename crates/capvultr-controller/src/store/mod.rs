//! Desired-state store contract
//!
//! The reconcilers only need get/update/list/watch. `create` and `delete`
//! (a deletion request, honoring finalizers) exist for provisioning actors,
//! the daemon's manifest seeding and tests.

mod file;
mod memory;

pub use file::{FileStore, Snapshot, StoredObject};
pub use memory::MemoryStore;

use async_trait::async_trait;
use capvultr_api::{ObjectKey, ObjectMeta, Resource};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: ObjectKey },

    /// The write was based on a stale copy of the object
    #[error("{kind} {key} was modified concurrently (expected version {expected}, found {actual})")]
    VersionConflict {
        kind: String,
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },

    #[error("State error: {0}")]
    State(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Filter for [`Store::list`]
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ListParams {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Require the label to be present with exactly this value
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        if let Some(ns) = &self.namespace {
            if &meta.namespace != ns {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| meta.labels.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

/// Notification that a stored object changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: String,
    pub key: ObjectKey,
    pub change: ChangeType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Changed(ChangeEvent),
    /// Events were dropped; the watcher should relist
    Resync,
}

/// Change notifications for a single kind
pub struct WatchStream {
    kind: String,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl WatchStream {
    pub fn new(kind: impl Into<String>, rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            kind: kind.into(),
            rx,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Next event for this kind, `None` once the store is gone
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.kind == self.kind => return Some(WatchEvent::Changed(event)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(kind = %self.kind, missed, "Watch lagged, resyncing");
                    return Some(WatchEvent::Resync);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Generic versioned object store
///
/// Writes carry the `resource_version` they were based on; a mismatch is
/// rejected with [`StoreError::VersionConflict`].
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get<K: Resource>(&self, key: &ObjectKey) -> Result<Option<K>>;

    /// Stores a new object, assigning its uid and first version
    async fn create<K: Resource>(&self, obj: &K) -> Result<K>;

    /// Replaces an object, returning it with its new version
    ///
    /// An object that is being deleted and has no finalizers left is removed.
    async fn update<K: Resource>(&self, obj: &K) -> Result<K>;

    /// Requests deletion
    ///
    /// Objects without finalizers are removed immediately; otherwise the
    /// deletion timestamp is set and removal waits for the finalizers to be
    /// cleared through [`Store::update`]. Deleting an absent object succeeds.
    async fn delete<K: Resource>(&self, key: &ObjectKey) -> Result<()>;

    async fn list<K: Resource>(&self, params: &ListParams) -> Result<Vec<K>>;

    fn watch(&self, kind: &str) -> WatchStream;
}
