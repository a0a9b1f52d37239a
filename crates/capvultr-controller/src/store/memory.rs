use super::{
    ChangeEvent, ChangeType, ListParams, Result, Store, StoreError, StoredObject, WatchStream,
};
use async_trait::async_trait;
use capvultr_api::{ObjectKey, ObjectMeta, Resource};
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

const WATCH_BUFFER: usize = 1024;

type StorageKey = (String, ObjectKey);

/// Store keeping every object as a JSON document in memory
pub struct MemoryStore {
    objects: RwLock<BTreeMap<StorageKey, serde_json::Value>>,
    events: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// Rebuild a store from previously exported objects
    pub(crate) fn from_objects(stored: Vec<StoredObject>) -> Result<Self> {
        let mut objects = BTreeMap::new();
        for entry in stored {
            let metadata = entry
                .object
                .get("metadata")
                .cloned()
                .ok_or_else(|| StoreError::State(format!("{} without metadata", entry.kind)))?;
            let meta: ObjectMeta = serde_json::from_value(metadata)?;
            objects.insert((entry.kind, meta.key()), entry.object);
        }

        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Ok(Self {
            objects: RwLock::new(objects),
            events,
        })
    }

    pub(crate) async fn export(&self) -> Vec<StoredObject> {
        self.objects
            .read()
            .await
            .iter()
            .map(|((kind, _), object)| StoredObject {
                kind: kind.clone(),
                object: object.clone(),
            })
            .collect()
    }

    fn emit(&self, kind: &str, key: ObjectKey, change: ChangeType) {
        // Sending only fails when nobody is watching
        let _ = self.events.send(ChangeEvent {
            kind: kind.to_string(),
            key,
            change,
        });
    }
}

fn storage_key<K: Resource>(key: &ObjectKey) -> StorageKey {
    (K::KIND.to_string(), key.clone())
}

#[async_trait]
impl Store for MemoryStore {
    async fn get<K: Resource>(&self, key: &ObjectKey) -> Result<Option<K>> {
        let objects = self.objects.read().await;
        match objects.get(&storage_key::<K>(key)) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn create<K: Resource>(&self, obj: &K) -> Result<K> {
        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        if meta.name.is_empty() {
            return Err(StoreError::State(format!("{} without a name", K::KIND)));
        }
        if meta.namespace.is_empty() {
            meta.namespace = "default".to_string();
        }
        let key = meta.key();

        let mut objects = self.objects.write().await;
        let sk = storage_key::<K>(&key);
        if objects.contains_key(&sk) {
            return Err(StoreError::AlreadyExists {
                kind: K::KIND.to_string(),
                key,
            });
        }

        if meta.uid.is_empty() {
            meta.uid = Uuid::new_v4().to_string();
        }
        meta.resource_version = 1;
        meta.deletion_timestamp = None;

        objects.insert(sk, serde_json::to_value(&obj)?);
        drop(objects);

        tracing::debug!(kind = K::KIND, key = %key, "Created object");
        self.emit(K::KIND, key, ChangeType::Created);
        Ok(obj)
    }

    async fn update<K: Resource>(&self, obj: &K) -> Result<K> {
        let key = obj.key();
        let sk = storage_key::<K>(&key);

        let mut objects = self.objects.write().await;
        let stored: K = match objects.get(&sk) {
            Some(value) => serde_json::from_value(value.clone())?,
            None => {
                return Err(StoreError::NotFound {
                    kind: K::KIND.to_string(),
                    key,
                });
            }
        };

        let actual = stored.meta().resource_version;
        let expected = obj.meta().resource_version;
        if expected != actual {
            return Err(StoreError::VersionConflict {
                kind: K::KIND.to_string(),
                key,
                expected,
                actual,
            });
        }

        let mut next = obj.clone();
        let meta = next.meta_mut();
        meta.resource_version = actual + 1;
        meta.uid = stored.meta().uid.clone();
        meta.deletion_timestamp = stored.meta().deletion_timestamp;

        if meta.is_deleting() && meta.finalizers.is_empty() {
            objects.remove(&sk);
            drop(objects);
            tracing::debug!(kind = K::KIND, key = %key, "Last finalizer removed, object deleted");
            self.emit(K::KIND, key, ChangeType::Deleted);
            return Ok(next);
        }

        objects.insert(sk, serde_json::to_value(&next)?);
        drop(objects);

        self.emit(K::KIND, key, ChangeType::Updated);
        Ok(next)
    }

    async fn delete<K: Resource>(&self, key: &ObjectKey) -> Result<()> {
        let sk = storage_key::<K>(key);

        let mut objects = self.objects.write().await;
        let mut stored: K = match objects.get(&sk) {
            Some(value) => serde_json::from_value(value.clone())?,
            None => return Ok(()),
        };

        if stored.meta().finalizers.is_empty() {
            objects.remove(&sk);
            drop(objects);
            tracing::debug!(kind = K::KIND, key = %key, "Deleted object");
            self.emit(K::KIND, key.clone(), ChangeType::Deleted);
            return Ok(());
        }

        if stored.meta().is_deleting() {
            return Ok(());
        }

        let meta = stored.meta_mut();
        meta.deletion_timestamp = Some(Utc::now());
        meta.resource_version += 1;
        objects.insert(sk, serde_json::to_value(&stored)?);
        drop(objects);

        tracing::debug!(
            kind = K::KIND,
            key = %key,
            finalizers = ?stored.meta().finalizers,
            "Deletion requested, waiting for finalizers"
        );
        self.emit(K::KIND, key.clone(), ChangeType::Updated);
        Ok(())
    }

    async fn list<K: Resource>(&self, params: &ListParams) -> Result<Vec<K>> {
        let objects = self.objects.read().await;
        let mut out = Vec::new();
        for ((kind, _), value) in objects.iter() {
            if kind != K::KIND {
                continue;
            }
            let obj: K = serde_json::from_value(value.clone())?;
            if params.matches(obj.meta()) {
                out.push(obj);
            }
        }
        Ok(out)
    }

    fn watch(&self, kind: &str) -> WatchStream {
        WatchStream::new(kind, self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WatchEvent;
    use capvultr_api::Secret;

    fn secret(name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta::new("default", name),
            data: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_uid_and_version() {
        let store = MemoryStore::new();

        let created = store.create(&secret("boot")).await.unwrap();
        assert!(!created.metadata.uid.is_empty());
        assert_eq!(created.metadata.resource_version, 1);

        let err = store.create(&secret("boot")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_update_rejects_stale_version() {
        let store = MemoryStore::new();
        let created = store.create(&secret("boot")).await.unwrap();

        let mut first = created.clone();
        first.data.insert("value".to_string(), "a".to_string());
        let updated = store.update(&first).await.unwrap();
        assert_eq!(updated.metadata.resource_version, 2);

        let mut stale = created;
        stale.data.insert("value".to_string(), "b".to_string());
        let err = store.update(&stale).await.unwrap_err();
        assert!(err.is_conflict());

        let current: Secret = store.get(&updated.key()).await.unwrap().unwrap();
        assert_eq!(current.data["value"], "a");
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let store = MemoryStore::new();
        let mut obj = secret("guarded");
        obj.metadata.add_finalizer("example.com/cleanup");
        let created = store.create(&obj).await.unwrap();
        let key = created.key();

        store.delete::<Secret>(&key).await.unwrap();
        let mut pending: Secret = store.get(&key).await.unwrap().unwrap();
        assert!(pending.metadata.is_deleting());

        pending.metadata.remove_finalizer("example.com/cleanup");
        store.update(&pending).await.unwrap();
        assert!(store.get::<Secret>(&key).await.unwrap().is_none());

        // absent objects delete cleanly
        store.delete::<Secret>(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_cannot_clear_deletion_timestamp() {
        let store = MemoryStore::new();
        let mut obj = secret("guarded");
        obj.metadata.add_finalizer("example.com/cleanup");
        let key = store.create(&obj).await.unwrap().key();
        store.delete::<Secret>(&key).await.unwrap();

        let mut current: Secret = store.get(&key).await.unwrap().unwrap();
        current.metadata.deletion_timestamp = None;
        let updated = store.update(&current).await.unwrap();
        assert!(updated.metadata.is_deleting());
    }

    #[tokio::test]
    async fn test_list_and_watch() {
        let store = MemoryStore::new();
        let mut watch = store.watch(Secret::KIND);

        let mut labelled = secret("a");
        labelled.metadata.labels.insert("tier".to_string(), "boot".to_string());
        store.create(&labelled).await.unwrap();
        store.create(&secret("b")).await.unwrap();

        let all: Vec<Secret> = store.list(&ListParams::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        let filtered: Vec<Secret> = store
            .list(&ListParams::default().label("tier", "boot"))
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);

        let first = watch.next().await.unwrap();
        assert_eq!(
            first,
            WatchEvent::Changed(ChangeEvent {
                kind: "Secret".to_string(),
                key: ObjectKey::new("default", "a"),
                change: ChangeType::Created,
            })
        );
    }
}
