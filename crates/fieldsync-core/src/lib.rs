//! fieldsync-core: local-first metadata sync engine for field inspection photos.
//!
//! This crate provides the core functionality for:
//! - Deterministic ids for projects, images and selection instances
//! - Versioned envelopes in synchronous local storage, with schema migrations
//! - Debounced replication to a remote replica, plus a periodic poll
//! - Cross-tab broadcast and storage-change merges with last-writer-wins
//! - Reconciling selections against the current image list
//!
//! Storage, remote, object store and broadcast are traits so the same engine
//! runs natively (fieldsync-daemon) and in the browser (fieldsync-wasm).

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod events;
pub mod identity;
pub mod inbound;
pub mod model;
mod mutations;
pub mod poll;
pub mod remote;
mod replication;
pub mod resolver;
pub mod scheduler;
pub mod sort;
pub mod storage;
pub mod validation;
pub mod writer_id;

pub use broadcast::{BroadcastBus, BroadcastChannel, BroadcastError, BroadcastHub, BroadcastMessage};
pub use clock::{Clock, ManualTimeSource, SystemTimeSource, TimeSource, Timestamp};
pub use config::{ConfigError, SyncConfig};
pub use engine::{Collaborators, InboxSender, ProjectSnapshot, SyncEngine, SyncError};
pub use envelope::{EnvelopeError, Migrations, SCHEMA_VERSION, VersionedEnvelope};
pub use events::{EngineEvent, EventBus, Shared, Subscription};
pub use identity::{EntityKind, OwnerId, ProjectRef, derive_id};
pub use inbound::{Inbound, PROJECT_CLEARED_TOPIC, connect_hub, connect_storage};
pub use model::{Collection, CollectionKind, DebounceClass};
pub use poll::{PollReport, Tombstones};
pub use remote::{
    InMemoryObjectStore, InMemoryReplica, ObjectStore, RemoteError, RemoteReplica, StoredObject,
};
pub use replication::{LoadReport, TickReport};
pub use resolver::{Unreconciled, UnreconciledReason};
pub use storage::{InMemoryStorage, KeyValueStorage, LocalStore, StorageChange, StorageError};
pub use validation::ValidationError;
pub use writer_id::{WriterId, WriterIdError};
