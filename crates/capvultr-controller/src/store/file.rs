//! File-backed store
//!
//! Keeps a [`MemoryStore`] as the working copy and rewrites
//! `<state-dir>/state.json` after every accepted mutation. A new snapshot is
//! written to `state.json.tmp` and renamed into place, so `state.json` is
//! always complete. The previous snapshot is kept as `state.json.backup` and
//! is loaded when `state.json` is missing.

use super::{ListParams, MemoryStore, Result, Store, StoreError, WatchStream};
use async_trait::async_trait;
use capvultr_api::{ObjectKey, Resource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

const STATE_VERSION: u32 = 1;
const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";
const STATE_TEMP: &str = "state.json.tmp";

/// One stored object as written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredObject {
    pub kind: String,
    pub object: serde_json::Value,
}

/// On-disk state file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// State file version
    pub version: u32,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    pub objects: Vec<StoredObject>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            objects: Vec::new(),
        }
    }
}

impl Snapshot {
    /// Objects of one kind, decoded
    pub fn objects_of<K: Resource>(&self) -> Result<Vec<K>> {
        self.objects
            .iter()
            .filter(|o| o.kind == K::KIND)
            .map(|o| Ok(serde_json::from_value(o.object.clone())?))
            .collect()
    }

    /// Load the snapshot in `state_dir`, falling back to the backup, or an
    /// empty one if none was written yet
    pub async fn load(state_dir: impl AsRef<Path>) -> Result<Self> {
        let state_dir = state_dir.as_ref();
        let path = state_dir.join(STATE_FILE);
        if fs::try_exists(&path).await? {
            return Self::read(&path).await;
        }

        let backup = state_dir.join(STATE_BACKUP);
        if fs::try_exists(&backup).await? {
            tracing::warn!(path = %backup.display(), "State file not found, loading backup");
            return Self::read(&backup).await;
        }

        tracing::debug!("State file not found, starting empty");
        Ok(Self::default())
    }

    async fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;

        if snapshot.version > STATE_VERSION {
            return Err(StoreError::State(format!(
                "State file version {} is newer than supported version {}",
                snapshot.version, STATE_VERSION
            )));
        }

        tracing::debug!("Loaded state with {} objects", snapshot.objects.len());
        Ok(snapshot)
    }
}

/// Store persisted to a state directory
pub struct FileStore {
    inner: MemoryStore,
    state_dir: PathBuf,
    /// Serializes mutate-then-save so snapshots land in order
    write_lock: Mutex<()>,
}

impl FileStore {
    pub async fn open(state_dir: impl AsRef<Path>) -> Result<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        let snapshot = Snapshot::load(&state_dir).await?;
        Ok(Self {
            inner: MemoryStore::from_objects(snapshot.objects)?,
            state_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    fn backup_path(&self) -> PathBuf {
        self.state_dir.join(STATE_BACKUP)
    }

    async fn save(&self) -> Result<()> {
        if !fs::try_exists(&self.state_dir).await? {
            fs::create_dir_all(&self.state_dir).await?;
            tracing::debug!("Created state directory: {}", self.state_dir.display());
        }

        let path = self.state_path();
        if fs::try_exists(&path).await? {
            fs::copy(&path, self.backup_path()).await?;
        }

        let snapshot = Snapshot {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            objects: self.inner.export().await,
        };
        let content = serde_json::to_string_pretty(&snapshot)?;
        let temp = self.state_dir.join(STATE_TEMP);
        fs::write(&temp, content).await?;
        fs::rename(&temp, &path).await?;

        tracing::debug!("Saved state with {} objects", snapshot.objects.len());
        Ok(())
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get<K: Resource>(&self, key: &ObjectKey) -> Result<Option<K>> {
        self.inner.get(key).await
    }

    async fn create<K: Resource>(&self, obj: &K) -> Result<K> {
        let _guard = self.write_lock.lock().await;
        let created = self.inner.create(obj).await?;
        self.save().await?;
        Ok(created)
    }

    async fn update<K: Resource>(&self, obj: &K) -> Result<K> {
        let _guard = self.write_lock.lock().await;
        let updated = self.inner.update(obj).await?;
        self.save().await?;
        Ok(updated)
    }

    async fn delete<K: Resource>(&self, key: &ObjectKey) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.inner.delete::<K>(key).await?;
        self.save().await
    }

    async fn list<K: Resource>(&self, params: &ListParams) -> Result<Vec<K>> {
        self.inner.list(params).await
    }

    fn watch(&self, kind: &str) -> WatchStream {
        self.inner.watch(kind)
    }
}
