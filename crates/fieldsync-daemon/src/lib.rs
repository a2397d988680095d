//! fieldsync-daemon library: native collaborators for the sync engine.
//!
//! Local storage is a directory with one file per key, watched for changes
//! made by other processes. The remote replica and object store are a shared
//! directory, so several hosts on one machine (or a network mount) sync the
//! same way browser tabs and devices do.

pub mod config;
pub mod file_remote;
pub mod file_storage;
pub mod host;
pub mod watcher;

pub use config::{load_config, parse_config};
pub use file_remote::{FileObjectStore, FileReplica};
pub use file_storage::FileStorage;
pub use host::{HostOptions, NativeEngine, NativeHost};
pub use watcher::StorageWatcher;
