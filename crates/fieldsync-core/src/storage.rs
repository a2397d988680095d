//! Versioned local store over synchronous key/value storage.
//!
//! Implementations of [`KeyValueStorage`]:
//! - `InMemoryStorage` - For testing; can be shared between simulated tabs
//! - `FileStorage` (in fieldsync-daemon) - One file per key in a directory
//! - `JsStorage` (in fieldsync-wasm) - Browser `localStorage` via JS callbacks
//!
//! Keys follow `{prefix}:{ownerId}:{projectHash}:{collection}`.

use crate::clock::Timestamp;
use crate::envelope::{EnvelopeError, Migrations, VersionedEnvelope};
use crate::events::{EventBus, Shared};
use crate::identity::ProjectRef;
use crate::model::Collection;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage quota exceeded writing {0}")]
    QuotaExceeded(String),

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A key in the storage medium changed, possibly written by another tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
}

/// Synchronous key/value storage (the shape of `localStorage`).
///
/// On native platforms, implementations must be `Send + Sync` for use across threads.
/// On WASM (wasm32), these bounds are relaxed since WASM is single-threaded.
#[cfg(not(target_arch = "wasm32"))]
pub trait KeyValueStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;
}

/// Synchronous key/value storage (WASM version without Send + Sync).
#[cfg(target_arch = "wasm32")]
pub trait KeyValueStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;
}

/// In-memory storage for testing.
///
/// Every write and removal is announced on [`changes`](Self::changes), which
/// stands in for the browser `storage` event when several engines share one
/// instance.
pub struct InMemoryStorage {
    items: RwLock<BTreeMap<String, String>>,
    changes: Shared<EventBus<StorageChange>>,
    /// Byte budget for values; `None` means unlimited.
    quota: Option<usize>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            changes: Shared::new(EventBus::new()),
            quota: None,
        }
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that rejects writes once the total value size would exceed `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            quota: Some(bytes),
            ..Self::default()
        }
    }

    pub fn changes(&self) -> &Shared<EventBus<StorageChange>> {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStorage for InMemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        {
            let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
            if let Some(quota) = self.quota {
                let used: usize = items
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .map(|(_, v)| v.len())
                    .sum();
                if used + value.len() > quota {
                    return Err(StorageError::QuotaExceeded(key.to_string()));
                }
            }
            items.insert(key.to_string(), value.to_string());
        }
        self.changes.emit(StorageChange {
            key: key.to_string(),
        });
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let removed = self
            .items
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some();
        if removed {
            self.changes.emit(StorageChange {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        Ok(items.keys().cloned().collect())
    }
}

/// Envelope-aware view of one project's keys.
pub struct LocalStore<S: KeyValueStorage + ?Sized> {
    storage: Shared<S>,
    prefix: String,
    owner_id: String,
    project_id: String,
    migrations: Migrations,
}

impl<S: KeyValueStorage + ?Sized> LocalStore<S> {
    pub fn new(storage: Shared<S>, key_prefix: &str, project: &ProjectRef) -> Self {
        Self {
            storage,
            prefix: format!("{}:{}:{}:", key_prefix, project.owner, project.hash()),
            owner_id: project.owner.to_string(),
            project_id: project.id.clone(),
            migrations: Migrations::default(),
        }
    }

    pub fn with_migrations(mut self, migrations: Migrations) -> Self {
        self.migrations = migrations;
        self
    }

    pub fn storage(&self) -> &Shared<S> {
        &self.storage
    }

    pub fn key(&self, collection: Collection) -> String {
        format!("{}{}", self.prefix, collection.as_str())
    }

    /// The collection a storage key refers to, if it belongs to this project.
    pub fn collection_for_key(&self, key: &str) -> Option<Collection> {
        key.strip_prefix(&self.prefix).and_then(Collection::parse)
    }

    /// Wrap `data` in an envelope and write it.
    pub fn save<T: Serialize>(
        &self,
        collection: Collection,
        timestamp: Timestamp,
        data: &T,
    ) -> Result<()> {
        let envelope = VersionedEnvelope::new(timestamp, &self.owner_id, &self.project_id, data);
        let raw = serde_json::to_string(&envelope)?;
        self.storage.set_item(&self.key(collection), &raw)?;
        debug!("Saved {} ({} bytes) at {}", collection, raw.len(), timestamp);
        Ok(())
    }

    /// Load and migrate an envelope. Unreadable or unmigratable envelopes are
    /// discarded with a warning.
    pub fn load_envelope<T: DeserializeOwned>(
        &self,
        collection: Collection,
    ) -> Option<VersionedEnvelope<T>> {
        let key = self.key(collection);
        let raw = match self.storage.get_item(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read {}: {}", key, e);
                return None;
            }
        };

        match self.migrations.decode::<T>(&raw) {
            Ok(envelope) if envelope.project_id == self.project_id => Some(envelope),
            Ok(envelope) => {
                warn!(
                    "Discarding {}: belongs to project {}",
                    key, envelope.project_id
                );
                None
            }
            Err(e) => {
                warn!("Discarding {}: {}", key, e);
                None
            }
        }
    }

    pub fn load<T: DeserializeOwned>(&self, collection: Collection) -> Option<T> {
        self.load_envelope(collection).map(|env| env.data)
    }

    pub fn remove(&self, collection: Collection) -> Result<()> {
        self.storage.remove_item(&self.key(collection))
    }

    /// Remove every key belonging to this project. Returns how many were removed.
    pub fn clear_project(&self) -> Result<usize> {
        let keys: Vec<String> = self
            .storage
            .keys()?
            .into_iter()
            .filter(|k| k.starts_with(&self.prefix))
            .collect();
        for key in &keys {
            self.storage.remove_item(key)?;
        }
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::OwnerId;
    use crate::model::SelectionRecord;
    use crate::writer_id::WriterId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn project() -> ProjectRef {
        ProjectRef::new(OwnerId::new("Eng@Example.com"), "current")
    }

    fn store() -> LocalStore<InMemoryStorage> {
        LocalStore::new(Shared::new(InMemoryStorage::new()), "fieldsync", &project())
    }

    fn ts(time: u64) -> Timestamp {
        Timestamp::new(time, WriterId::from(1))
    }

    #[test]
    fn test_key_layout() {
        let store = store();
        let key = store.key(Collection::InstanceMetadata);
        assert_eq!(
            key,
            format!("fieldsync:eng@example.com:{}:instanceMetadata", project().hash())
        );
        assert_eq!(store.collection_for_key(&key), Some(Collection::InstanceMetadata));
        assert_eq!(store.collection_for_key("fieldsync:other:abc:images"), None);
    }

    #[test]
    fn test_save_then_load() {
        let store = store();
        let rows = vec![SelectionRecord {
            image_id: "img_1".into(),
            instance_id: "inst_1".into(),
            file_name: "a.jpg".into(),
        }];
        store.save(Collection::Selections, ts(7), &rows).unwrap();

        let env = store
            .load_envelope::<Vec<SelectionRecord>>(Collection::Selections)
            .unwrap();
        assert_eq!(env.timestamp, ts(7));
        assert_eq!(env.data, rows);
        assert_eq!(env.project_id, project().id);
    }

    #[test]
    fn test_load_missing_is_none() {
        assert!(store().load::<Vec<String>>(Collection::Images).is_none());
    }

    #[test]
    fn test_corrupt_envelope_is_discarded() {
        let store = store();
        store
            .storage()
            .set_item(&store.key(Collection::Images), "{not json")
            .unwrap();
        assert!(store.load::<Vec<String>>(Collection::Images).is_none());
    }

    #[test]
    fn test_future_version_is_discarded() {
        let store = store();
        let raw = serde_json::json!({
            "version": 99,
            "timestamp": {"time": 1, "writer": "0000000000000001"},
            "ownerId": "eng@example.com",
            "projectId": project().id,
            "data": []
        });
        store
            .storage()
            .set_item(&store.key(Collection::Images), &raw.to_string())
            .unwrap();
        assert!(store.load::<Vec<String>>(Collection::Images).is_none());
    }

    #[test]
    fn test_quota_exceeded_is_an_error() {
        let store = LocalStore::new(
            Shared::new(InMemoryStorage::with_quota(16)),
            "fieldsync",
            &project(),
        );
        let err = store
            .save(Collection::Images, ts(1), &vec!["x".repeat(64)])
            .unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded(_)));
    }

    #[test]
    fn test_clear_project_leaves_other_projects() {
        let storage = Shared::new(InMemoryStorage::new());
        let ours = LocalStore::new(storage.clone(), "fieldsync", &project());
        let theirs = LocalStore::new(
            storage.clone(),
            "fieldsync",
            &ProjectRef::new(OwnerId::new("eng@example.com"), "other"),
        );
        ours.save(Collection::Images, ts(1), &Vec::<String>::new()).unwrap();
        ours.save(Collection::FormData, ts(1), &"x").unwrap();
        theirs.save(Collection::Images, ts(1), &Vec::<String>::new()).unwrap();

        assert_eq!(ours.clear_project().unwrap(), 2);
        assert_eq!(storage.len(), 1);
        assert!(theirs.load::<Vec<String>>(Collection::Images).is_some());
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_change_notifications() {
        let storage = Shared::new(InMemoryStorage::new());
        let count = Shared::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let _sub = storage.changes().subscribe(move |_change| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        storage.set_item("a", "1").unwrap();
        storage.remove_item("a").unwrap();
        storage.remove_item("a").unwrap();
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }
}
