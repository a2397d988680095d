//! Wires a sync engine to the native collaborators.

use crate::file_remote::{FileObjectStore, FileReplica};
use crate::file_storage::FileStorage;
use crate::watcher::StorageWatcher;
use anyhow::{Context, Result};
use fieldsync_core::{
    BroadcastHub, Collaborators, OwnerId, Shared, StorageChange, Subscription, SyncConfig,
    SyncEngine, SystemTimeSource, TimeSource, connect_storage,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub type NativeEngine = SyncEngine<FileStorage, FileReplica, FileObjectStore, BroadcastHub>;

/// File holding the generated owner id when none is given.
const OWNER_FILE: &str = "owner";

#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Local storage directory (one file per key)
    pub data_dir: PathBuf,
    /// Shared replica directory
    pub remote_dir: PathBuf,
    /// Owner account; generated and remembered in `data_dir` when absent
    pub owner: Option<String>,
    pub config: SyncConfig,
    /// Watch `data_dir` for writes by other processes
    pub watch: bool,
}

/// A running engine plus the watcher feeding it storage changes.
pub struct NativeHost {
    engine: NativeEngine,
    _watcher: Option<StorageWatcher>,
    _storage_link: Subscription<StorageChange>,
}

impl NativeHost {
    pub fn open(options: HostOptions) -> Result<Self> {
        Self::open_with_time(options, Arc::new(SystemTimeSource))
    }

    pub fn open_with_time(options: HostOptions, time: Arc<dyn TimeSource>) -> Result<Self> {
        let storage = Shared::new(
            FileStorage::open(&options.data_dir)
                .with_context(|| format!("failed to open {}", options.data_dir.display()))?,
        );
        let owner = match &options.owner {
            Some(owner) => OwnerId::new(owner),
            None => remembered_owner(&options.data_dir)?,
        };

        let deps = Collaborators {
            storage: Shared::clone(&storage),
            remote: Shared::new(FileReplica::new(&options.remote_dir)),
            objects: Shared::new(FileObjectStore::new(&options.remote_dir)),
            broadcast: Shared::new(BroadcastHub::new()),
            time,
        };
        let engine = SyncEngine::new(options.config, owner, deps);

        let storage_link = connect_storage(storage.changes(), engine.inbox());
        let watcher = if options.watch {
            Some(StorageWatcher::new(
                options.data_dir.clone(),
                Shared::clone(storage.changes()),
            )?)
        } else {
            None
        };

        Ok(Self {
            engine,
            _watcher: watcher,
            _storage_link: storage_link,
        })
    }

    pub fn engine(&self) -> &NativeEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut NativeEngine {
        &mut self.engine
    }
}

/// Read the owner id stored in `data_dir`, generating an anonymous one on
/// first use.
fn remembered_owner(data_dir: &Path) -> Result<OwnerId> {
    let path = data_dir.join(OWNER_FILE);
    match std::fs::read_to_string(&path) {
        Ok(owner) if !owner.trim().is_empty() => Ok(OwnerId::new(&owner)),
        _ => {
            let owner = OwnerId::anonymous();
            std::fs::write(&path, owner.as_str())
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("Generated owner id: {}", owner);
            Ok(owner)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_owner_is_remembered() {
        let dir = TempDir::new().unwrap();
        let first = remembered_owner(dir.path()).unwrap();
        assert!(first.is_anonymous());
        let second = remembered_owner(dir.path()).unwrap();
        assert_eq!(first, second);
    }
}
