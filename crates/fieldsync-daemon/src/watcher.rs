//! Storage directory watcher.
//!
//! Turns on-disk changes to key files into [`StorageChange`] notifications,
//! the native counterpart of the browser `storage` event. Uses
//! notify-debouncer-mini so a burst of writes to one key yields one event.

use crate::file_storage::key_from_file_name;
use anyhow::Result;
use fieldsync_core::{EventBus, Shared, StorageChange};
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, error};

/// Debounce period for file events.
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(200);

/// Last seen mtime per key, to filter spurious events (Docker volume bug workaround)
type MtimeCache = Arc<Mutex<HashMap<String, SystemTime>>>;

/// Watches a [`FileStorage`](crate::file_storage::FileStorage) directory.
///
/// Events stop when this value is dropped.
pub struct StorageWatcher {
    dir: PathBuf,
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
}

impl StorageWatcher {
    /// Start watching `dir`, emitting each changed key on `changes`.
    pub fn new(dir: PathBuf, changes: Shared<EventBus<StorageChange>>) -> Result<Self> {
        // On macOS, /var/folders/... is really /private/var/folders/... and
        // FSEvents reports the canonical path.
        let dir = dir.canonicalize().unwrap_or(dir);
        let watched = dir.clone();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            WATCH_DEBOUNCE,
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(change) = Self::process_event(&event, &watched, &mtime_cache) {
                            changes.emit(change);
                        }
                    }
                }
                Err(e) => {
                    error!("Storage watcher error: {}", e);
                }
            },
        )?;

        debouncer.watcher().watch(&dir, RecursiveMode::NonRecursive)?;

        Ok(Self {
            dir,
            _debouncer: debouncer,
        })
    }

    /// Map a debounced event to the storage key it touched, if any.
    fn process_event(
        event: &DebouncedEvent,
        dir: &Path,
        mtime_cache: &MtimeCache,
    ) -> Option<StorageChange> {
        let path = &event.path;
        let relative = path.strip_prefix(dir).ok()?;
        let name = relative.to_str()?;
        let key = key_from_file_name(name)?;

        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
        match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) => {
                if cache.get(&key) == Some(&mtime) {
                    return None;
                }
                cache.insert(key.clone(), mtime);
            }
            Err(_) => {
                // Removed
                cache.remove(&key);
            }
        }

        debug!("Storage key changed on disk: {}", key);
        Some(StorageChange { key })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
