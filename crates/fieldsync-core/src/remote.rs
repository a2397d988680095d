//! Remote replica and object store abstractions.
//!
//! Implementations:
//! - `InMemoryReplica` / `InMemoryObjectStore` - For testing, with failure injection
//! - `FileReplica` / `FileObjectStore` (in fieldsync-daemon) - JSON files in a directory
//! - `JsRemote` / `JsObjectStore` (in fieldsync-wasm) - Promise-returning JS callbacks
//!
//! Uses `target_arch = "wasm32"` for conditional compilation instead of feature flags
//! to avoid Cargo's feature unification issues when building the workspace.

use crate::envelope::VersionedEnvelope;
use crate::model::{CollectionKind, ProjectPatch, ProjectRecord};
use crate::resolver;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Not authorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Remote service error: {0}")]
    Service(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// A stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub name: String,
    pub url: String,
}

/// Durable multi-device store for project state.
///
/// Project writes are patches: the receiver merges each present part
/// field-wise. Collection writes replace the stored envelope.
///
/// On native platforms, implementations must be `Send + Sync` for use across threads.
/// On WASM (wasm32), these bounds are relaxed since WASM is single-threaded.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg(not(target_arch = "wasm32"))]
pub trait RemoteReplica: Send + Sync {
    async fn get_project(
        &self,
        owner: &str,
        project: &str,
    ) -> Result<Option<VersionedEnvelope<ProjectRecord>>>;

    async fn put_project(
        &self,
        owner: &str,
        project: &str,
        patch: VersionedEnvelope<ProjectPatch>,
    ) -> Result<()>;

    async fn get_collection(
        &self,
        owner: &str,
        project: &str,
        kind: CollectionKind,
    ) -> Result<Option<VersionedEnvelope<Value>>>;

    async fn put_collection(
        &self,
        owner: &str,
        project: &str,
        kind: CollectionKind,
        envelope: VersionedEnvelope<Value>,
    ) -> Result<()>;

    /// Remove the project record and all of its collections.
    async fn delete_project(&self, owner: &str, project: &str) -> Result<()>;
}

/// Durable multi-device store for project state (WASM version without Send + Sync).
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg(target_arch = "wasm32")]
pub trait RemoteReplica {
    async fn get_project(
        &self,
        owner: &str,
        project: &str,
    ) -> Result<Option<VersionedEnvelope<ProjectRecord>>>;

    async fn put_project(
        &self,
        owner: &str,
        project: &str,
        patch: VersionedEnvelope<ProjectPatch>,
    ) -> Result<()>;

    async fn get_collection(
        &self,
        owner: &str,
        project: &str,
        kind: CollectionKind,
    ) -> Result<Option<VersionedEnvelope<Value>>>;

    async fn put_collection(
        &self,
        owner: &str,
        project: &str,
        kind: CollectionKind,
        envelope: VersionedEnvelope<Value>,
    ) -> Result<()>;

    async fn delete_project(&self, owner: &str, project: &str) -> Result<()>;
}

/// Blob storage for image bytes.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg(not(target_arch = "wasm32"))]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `path`, returning its durable reference.
    async fn upload(&self, bytes: &[u8], path: &str) -> Result<StoredObject>;

    /// Objects whose path starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>>;

    /// Remove every object under `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;
}

/// Blob storage for image bytes (WASM version without Send + Sync).
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg(target_arch = "wasm32")]
pub trait ObjectStore {
    async fn upload(&self, bytes: &[u8], path: &str) -> Result<StoredObject>;
    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>>;
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;
}

type ProjectKey = (String, String);

/// In-memory replica for testing.
///
/// `fail_next(n)` makes the next `n` calls fail with a network error.
#[derive(Default)]
pub struct InMemoryReplica {
    projects: RwLock<HashMap<ProjectKey, VersionedEnvelope<ProjectRecord>>>,
    collections: RwLock<HashMap<(ProjectKey, CollectionKind), VersionedEnvelope<Value>>>,
    failures: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemoryReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, calls: usize) {
        self.failures.store(calls, Ordering::SeqCst);
    }

    /// Number of successful put calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Overwrite a stored collection directly, bypassing the engine.
    pub fn seed_collection(
        &self,
        owner: &str,
        project: &str,
        kind: CollectionKind,
        envelope: VersionedEnvelope<Value>,
    ) {
        self.collections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(((owner.to_string(), project.to_string()), kind), envelope);
    }

    fn check_failure(&self) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(RemoteError::Network("injected failure".into())),
            Err(_) => Ok(()),
        }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl RemoteReplica for InMemoryReplica {
    async fn get_project(
        &self,
        owner: &str,
        project: &str,
    ) -> Result<Option<VersionedEnvelope<ProjectRecord>>> {
        self.check_failure()?;
        let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
        Ok(projects
            .get(&(owner.to_string(), project.to_string()))
            .cloned())
    }

    async fn put_project(
        &self,
        owner: &str,
        project: &str,
        patch: VersionedEnvelope<ProjectPatch>,
    ) -> Result<()> {
        self.check_failure()?;
        let mut projects = self.projects.write().unwrap_or_else(|e| e.into_inner());
        let key = (owner.to_string(), project.to_string());
        let timestamp = patch.timestamp;
        match projects.get_mut(&key) {
            Some(stored) => {
                resolver::merge_project_patch(&mut stored.data, &patch.data);
                stored.timestamp = stored.timestamp.max(timestamp);
            }
            None => {
                let mut record = ProjectRecord::default();
                resolver::merge_project_patch(&mut record, &patch.data);
                projects.insert(key, patch.map(|_| record));
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_collection(
        &self,
        owner: &str,
        project: &str,
        kind: CollectionKind,
    ) -> Result<Option<VersionedEnvelope<Value>>> {
        self.check_failure()?;
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        Ok(collections
            .get(&((owner.to_string(), project.to_string()), kind))
            .cloned())
    }

    async fn put_collection(
        &self,
        owner: &str,
        project: &str,
        kind: CollectionKind,
        envelope: VersionedEnvelope<Value>,
    ) -> Result<()> {
        self.check_failure()?;
        self.seed_collection(owner, project, kind, envelope);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_project(&self, owner: &str, project: &str) -> Result<()> {
        self.check_failure()?;
        let key = (owner.to_string(), project.to_string());
        self.projects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
        self.collections
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(k, _), _| *k != key);
        Ok(())
    }
}

/// In-memory object store for testing. URLs are `mem://{path}`.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
    failures: AtomicUsize,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, calls: usize) {
        self.failures.store(calls, Ordering::SeqCst);
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    fn check_failure(&self) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(RemoteError::Network("injected failure".into())),
            Err(_) => Ok(()),
        }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl ObjectStore for InMemoryObjectStore {
    async fn upload(&self, bytes: &[u8], path: &str) -> Result<StoredObject> {
        self.check_failure()?;
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), bytes.to_vec());
        Ok(StoredObject {
            name: path.to_string(),
            url: format!("mem://{}", path),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>> {
        self.check_failure()?;
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        Ok(objects
            .keys()
            .filter(|name| name.starts_with(prefix))
            .map(|name| StoredObject {
                name: name.clone(),
                url: format!("mem://{}", name),
            })
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.check_failure()?;
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|name, _| !name.starts_with(prefix));
        Ok(())
    }
}
