//! Key/value storage over one file per key.
//!
//! Keys contain `:` separators, which are escaped so every key maps to a
//! single portable file name. Writes go through a hidden temp file and a
//! rename, so readers (and the watcher) never see half-written envelopes.

use fieldsync_core::storage::{KeyValueStorage, Result, StorageError};
use fieldsync_core::{EventBus, Shared, StorageChange};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Extension of every key file.
pub const KEY_FILE_EXTENSION: &str = "json";

/// Local storage for the native host.
///
/// Writes made by this process are announced on [`changes`](Self::changes)
/// only through the [`StorageWatcher`](crate::watcher::StorageWatcher), the
/// same way writes from other processes are.
pub struct FileStorage {
    dir: PathBuf,
    changes: Shared<EventBus<StorageChange>>,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self {
            dir,
            changes: Shared::new(EventBus::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn changes(&self) -> &Shared<EventBus<StorageChange>> {
        &self.changes
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", encode_key(key), KEY_FILE_EXTENSION))
    }
}

impl KeyValueStorage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Backend(e.to_string())),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let path = self.key_path(key);
        let temp = self.dir.join(format!(".{}.tmp", encode_key(key)));
        fs::write(&temp, value).map_err(|e| map_write_error(key, e))?;
        fs::rename(&temp, &path).map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Backend(e.to_string())),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| StorageError::Backend(e.to_string()))?;
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::Backend(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(key) = key_from_file_name(&name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn map_write_error(key: &str, e: std::io::Error) -> StorageError {
    if e.kind() == ErrorKind::StorageFull {
        StorageError::QuotaExceeded(key.to_string())
    } else {
        StorageError::Backend(e.to_string())
    }
}

/// Escape a storage key into a file name stem.
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for ch in key.chars() {
        match ch {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            _ => out.push(ch),
        }
    }
    out
}

/// Reverse of [`encode_key`]. Returns `None` for malformed escapes.
pub fn decode_key(stem: &str) -> Option<String> {
    let mut out = String::with_capacity(stem.len());
    let mut rest = stem;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let escape = rest.get(pos + 1..pos + 3)?;
        let ch = match escape {
            "25" => '%',
            "3A" => ':',
            "2F" => '/',
            "5C" => '\\',
            _ => return None,
        };
        out.push(ch);
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(out)
}

/// The storage key a directory entry holds, skipping hidden and temp files.
pub fn key_from_file_name(name: &str) -> Option<String> {
    if name.starts_with('.') {
        return None;
    }
    let stem = name.strip_suffix(&format!(".{}", KEY_FILE_EXTENSION))?;
    decode_key(stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_encoding_roundtrip() {
        let key = "fieldsync:owner-1:ab12cd34:instanceMetadata";
        let encoded = encode_key(key);
        assert!(!encoded.contains(':'));
        assert_eq!(decode_key(&encoded).as_deref(), Some(key));

        let odd = "a%b/c\\d";
        assert_eq!(decode_key(&encode_key(odd)).as_deref(), Some(odd));
    }

    #[test]
    fn test_malformed_escape_is_rejected() {
        assert_eq!(decode_key("abc%zz"), None);
        assert_eq!(decode_key("abc%3"), None);
    }

    #[test]
    fn test_set_get_remove() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();

        assert_eq!(storage.get_item("p:o:h:images").unwrap(), None);
        storage.set_item("p:o:h:images", "{\"v\":1}").unwrap();
        assert_eq!(
            storage.get_item("p:o:h:images").unwrap().as_deref(),
            Some("{\"v\":1}")
        );

        storage.set_item("p:o:h:images", "{\"v\":2}").unwrap();
        assert_eq!(
            storage.get_item("p:o:h:images").unwrap().as_deref(),
            Some("{\"v\":2}")
        );

        storage.remove_item("p:o:h:images").unwrap();
        assert_eq!(storage.get_item("p:o:h:images").unwrap(), None);
        // Removing a missing key is not an error
        storage.remove_item("p:o:h:images").unwrap();
    }

    #[test]
    fn test_keys_skip_foreign_files() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        storage.set_item("p:o:h:selections", "[]").unwrap();
        storage.set_item("p:o:h:images", "[]").unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join(".p%3Ao.tmp"), "x").unwrap();

        assert_eq!(
            storage.keys().unwrap(),
            vec!["p:o:h:images".to_string(), "p:o:h:selections".to_string()]
        );
    }
}
