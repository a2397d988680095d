//! SyncEngine: one tab's view of a project.
//!
//! The engine owns the in-memory project state and the collaborators it syncs
//! through. There is no global instance; each tab (or native host process)
//! constructs its own and passes it to the UI bindings.
//!
//! Methods are spread over several files by concern:
//! - `engine.rs` - construction, accessors and the local commit path
//! - `mutations.rs` - the UI-facing write API
//! - `replication.rs` - debounced flushing, load, save and clear
//! - `inbound.rs` - broadcast, storage-change and poll merges

use crate::broadcast::{BroadcastBus, BroadcastChannel};
use crate::clock::{Clock, TimeSource, Timestamp};
use crate::config::SyncConfig;
use crate::envelope::{EnvelopeError, VersionedEnvelope};
use crate::events::{EngineEvent, EventBus, Shared};
use crate::identity::{OwnerId, ProjectRef};
use crate::inbound::Inbound;
use crate::model::{
    BulkDefectRecord, Collection, DeletedDefect, ImageRecord, InstanceMetadata, ProjectPatch,
    SelectionRecord, SessionState, SortPreferences, StampedForm, StampedSort,
};
use crate::poll::Tombstones;
use crate::remote::{ObjectStore, RemoteError, RemoteReplica};
use crate::resolver;
use crate::scheduler::DebounceScheduler;
use crate::sort::SortMachine;
use crate::storage::{KeyValueStorage, LocalStore, StorageError};
use crate::validation::ValidationError;
use crate::writer_id::WriterId;

use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Unknown image: {0}")]
    UnknownImage(String),

    #[error("Unknown selection instance: {0}")]
    UnknownInstance(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Sender half of the engine inbox. Hosts clone this into broadcast and
/// storage-change callbacks.
pub type InboxSender = UnboundedSender<Inbound>;

/// A pending remote write.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Collection {
        kind: crate::model::CollectionKind,
        envelope: VersionedEnvelope<Value>,
    },
    Project(VersionedEnvelope<ProjectPatch>),
}

/// Injected collaborators.
pub struct Collaborators<S: ?Sized, R: ?Sized, O: ?Sized, B: ?Sized> {
    pub storage: Shared<S>,
    pub remote: Shared<R>,
    pub objects: Shared<O>,
    pub broadcast: Shared<B>,
    pub time: Arc<dyn TimeSource>,
}

/// The in-memory project state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSnapshot {
    pub form: StampedForm,
    pub images: Vec<ImageRecord>,
    pub selections: Vec<SelectionRecord>,
    pub instance_metadata: InstanceMetadata,
    pub bulk_defects: Vec<BulkDefectRecord>,
    pub session: SessionState,
    pub sort: StampedSort,
}

pub(crate) struct BackgroundSync {
    pub(crate) next_poll_at: u64,
}

pub struct SyncEngine<S, R, O, B>
where
    S: KeyValueStorage + ?Sized,
    R: RemoteReplica + ?Sized,
    O: ObjectStore + ?Sized,
    B: BroadcastChannel + ?Sized,
{
    pub(crate) config: SyncConfig,
    pub(crate) project: ProjectRef,
    pub(crate) clock: Clock,
    pub(crate) store: LocalStore<S>,
    pub(crate) remote: Shared<R>,
    pub(crate) objects: Shared<O>,
    pub(crate) broadcast: BroadcastBus<B>,
    pub(crate) events: Shared<EventBus<EngineEvent>>,
    pub(crate) scheduler: DebounceScheduler<Collection, Outbound>,
    pub(crate) inbox_tx: InboxSender,
    pub(crate) inbox_rx: UnboundedReceiver<Inbound>,
    pub(crate) state: ProjectSnapshot,
    /// Timestamp of the most recently applied snapshot, per collection.
    pub(crate) applied: BTreeMap<Collection, Timestamp>,
    pub(crate) undo: VecDeque<DeletedDefect>,
    pub(crate) tombstones: Tombstones,
    pub(crate) sort_fsm: SortMachine,
    pub(crate) background: Option<BackgroundSync>,
}

impl<S, R, O, B> SyncEngine<S, R, O, B>
where
    S: KeyValueStorage + ?Sized,
    R: RemoteReplica + ?Sized,
    O: ObjectStore + ?Sized,
    B: BroadcastChannel + ?Sized,
{
    /// Create an engine with a freshly generated writer id.
    pub fn new(config: SyncConfig, owner: OwnerId, deps: Collaborators<S, R, O, B>) -> Self {
        Self::with_writer(config, owner, WriterId::generate(), deps)
    }

    pub fn with_writer(
        config: SyncConfig,
        owner: OwnerId,
        writer: WriterId,
        deps: Collaborators<S, R, O, B>,
    ) -> Self {
        let project = ProjectRef::new(owner, &config.project_name);
        let store = LocalStore::new(deps.storage, &config.key_prefix, &project);
        let broadcast = BroadcastBus::new(deps.broadcast, writer, &project.id);
        let (inbox_tx, inbox_rx) = unbounded();

        info!(
            "SyncEngine for {} ({}) as writer {}",
            project.name, project.id, writer
        );

        Self {
            config,
            project,
            clock: Clock::new(writer, deps.time),
            store,
            remote: deps.remote,
            objects: deps.objects,
            broadcast,
            events: Shared::new(EventBus::new()),
            scheduler: DebounceScheduler::new(),
            inbox_tx,
            inbox_rx,
            state: ProjectSnapshot::default(),
            applied: BTreeMap::new(),
            undo: VecDeque::new(),
            tombstones: Tombstones::new(),
            sort_fsm: SortMachine::new(),
            background: None,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn project(&self) -> &ProjectRef {
        &self.project
    }

    pub fn writer(&self) -> WriterId {
        self.clock.writer()
    }

    pub fn events(&self) -> &Shared<EventBus<EngineEvent>> {
        &self.events
    }

    /// A sender for the engine inbox.
    pub fn inbox(&self) -> InboxSender {
        self.inbox_tx.clone()
    }

    pub fn snapshot(&self) -> &ProjectSnapshot {
        &self.state
    }

    pub fn form(&self) -> &StampedForm {
        &self.state.form
    }

    pub fn images(&self) -> &[ImageRecord] {
        &self.state.images
    }

    pub fn selections(&self) -> &[SelectionRecord] {
        &self.state.selections
    }

    pub fn instance_metadata(&self) -> &InstanceMetadata {
        &self.state.instance_metadata
    }

    pub fn bulk_defects(&self) -> &[BulkDefectRecord] {
        &self.state.bulk_defects
    }

    pub fn session(&self) -> &SessionState {
        &self.state.session
    }

    pub fn sort_preferences(&self) -> SortPreferences {
        self.state.sort.prefs
    }

    pub fn undo_depth(&self) -> usize {
        self.undo.len()
    }

    pub fn is_pending(&self, collection: Collection) -> bool {
        self.scheduler.is_pending(collection)
    }

    pub fn applied_at(&self, collection: Collection) -> Timestamp {
        self.applied
            .get(&collection)
            .copied()
            .unwrap_or(Timestamp::ZERO)
    }

    pub fn is_background_sync_running(&self) -> bool {
        self.background.is_some()
    }

    // ------------------------------------------------------------------
    // Local commit path
    // ------------------------------------------------------------------

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn collection_value(&self, collection: Collection) -> serde_json::Result<Value> {
        match collection {
            Collection::FormData => serde_json::to_value(&self.state.form),
            Collection::Images => serde_json::to_value(&self.state.images),
            Collection::Selections => serde_json::to_value(&self.state.selections),
            Collection::BulkData => serde_json::to_value(&self.state.bulk_defects),
            Collection::SessionState => serde_json::to_value(&self.state.session),
            Collection::SortPreferences => serde_json::to_value(self.state.sort),
            Collection::InstanceMetadata => serde_json::to_value(&self.state.instance_metadata),
        }
    }

    /// Build the remote write for a collection's current state.
    pub(crate) fn outbound(&self, collection: Collection, ts: Timestamp) -> Result<Outbound> {
        let owner = self.project.owner.as_str();
        let project = self.project.id.as_str();
        let outbound = match collection.remote_kind() {
            Some(kind) => Outbound::Collection {
                kind,
                envelope: VersionedEnvelope::new(
                    ts,
                    owner,
                    project,
                    self.collection_value(collection)?,
                ),
            },
            None => {
                let mut patch = ProjectPatch::default();
                match collection {
                    Collection::FormData => patch.form = Some(self.state.form.clone()),
                    Collection::SessionState => patch.session = Some(self.state.session.clone()),
                    _ => patch.sort = Some(self.state.sort),
                }
                Outbound::Project(VersionedEnvelope::new(ts, owner, project, patch))
            }
        };
        Ok(outbound)
    }

    /// Mirror the current collection orders into the session state.
    pub(crate) fn refresh_session_orders(&mut self) {
        let session = &mut self.state.session;
        session.image_order = self.state.images.iter().map(|i| i.id.clone()).collect();
        session.selected_image_order = self
            .state
            .selections
            .iter()
            .map(|s| s.instance_id.clone())
            .collect();
        session.bulk_defect_order = self
            .state
            .bulk_defects
            .iter()
            .map(|d| d.id.clone())
            .collect();
        session.form_data = self.state.form.data.clone();
    }

    /// Persist, broadcast and schedule a local mutation stamped `ts`.
    ///
    /// Local persistence and broadcast failures are logged; the in-memory
    /// state stays authoritative and the next mutation retries both.
    pub(crate) fn commit(&mut self, collection: Collection, ts: Timestamp) {
        match collection {
            Collection::SessionState => self.state.session.last_active_time = ts,
            Collection::SortPreferences => self.state.sort.updated_at = ts,
            _ => {}
        }
        self.applied.insert(collection, ts);

        let value = match self.collection_value(collection) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to serialize {}: {}", collection, e);
                return;
            }
        };

        if let Err(e) = self.store.save(collection, ts, &value) {
            warn!("Local save of {} skipped: {}", collection, e);
            self.events.emit(EngineEvent::StorageFailed {
                collection,
                error: e.to_string(),
            });
        }

        if let Err(e) = self.broadcast.publish(collection.as_str(), value, ts) {
            warn!("Broadcast of {} failed: {}", collection, e);
        }

        match self.outbound(collection, ts) {
            Ok(outbound) => {
                let window = self.config.debounce_ms(collection.debounce_class());
                let now = self.now_ms();
                if self
                    .scheduler
                    .schedule(collection, outbound, now, window)
                    .is_some()
                {
                    debug!("Rescheduled {} (window {}ms)", collection, window);
                }
            }
            Err(e) => warn!("Failed to prepare remote write of {}: {}", collection, e),
        }

        self.events.emit(EngineEvent::CollectionChanged {
            collection,
            origin: "local".into(),
        });
    }

    /// Commit structural changes together with the session orders they affect.
    pub(crate) fn commit_structural(&mut self, collections: &[Collection]) {
        self.refresh_session_orders();
        for &collection in collections {
            let ts = self.clock.tick();
            self.commit(collection, ts);
        }
        let ts = self.clock.tick();
        self.commit(Collection::SessionState, ts);
    }

    /// Save remotely adopted state locally so other tabs see it, without
    /// broadcasting or scheduling a remote write.
    pub(crate) fn persist_adopted(&mut self, collection: Collection, ts: Timestamp) {
        let applied = self.applied_at(collection).max(ts);
        self.applied.insert(collection, applied);
        self.clock.observe(ts);

        match self.collection_value(collection) {
            Ok(value) => {
                if let Err(e) = self.store.save(collection, applied, &value) {
                    warn!("Local save of adopted {} skipped: {}", collection, e);
                    self.events.emit(EngineEvent::StorageFailed {
                        collection,
                        error: e.to_string(),
                    });
                }
            }
            Err(e) => warn!("Failed to serialize {}: {}", collection, e),
        }
    }

    /// Bind selections to the current images, reporting anything dropped.
    pub(crate) fn reconcile_selection_list(&mut self, records: Vec<SelectionRecord>) -> bool {
        let before = self.state.selections.clone();
        let result = resolver::reconcile_selections(records, &self.state.images);

        for (instance_id, old, new) in &result.rebound {
            info!("Rebound selection {} from {} to {}", instance_id, old, new);
        }
        self.report_dropped(&result.dropped);

        self.state.selections = result.kept;
        self.state.selections != before
    }

    pub(crate) fn report_dropped(&self, dropped: &[resolver::Unreconciled]) {
        for entry in dropped {
            warn!("{}", entry);
            self.events.emit(EngineEvent::SelectionDropped {
                instance_id: entry.record.instance_id.clone(),
                file_name: entry.record.file_name.clone(),
                reason: entry.reason.to_string(),
            });
        }
    }

    /// Reorder every collection by the session's order lists.
    pub(crate) fn apply_session_orders(&mut self) {
        let session = &self.state.session;

        let image_order = resolver::reconcile_order(
            &session.image_order,
            self.state.images.iter().map(|i| i.id.as_str()),
        );
        let selection_order = resolver::reconcile_order(
            &session.selected_image_order,
            self.state.selections.iter().map(|s| s.instance_id.as_str()),
        );
        let bulk_order = resolver::reconcile_order(
            &session.bulk_defect_order,
            self.state.bulk_defects.iter().map(|d| d.id.as_str()),
        );

        self.state.images = resolver::apply_order(
            std::mem::take(&mut self.state.images),
            &image_order,
            |i| i.id.as_str(),
        );
        self.state.selections = resolver::apply_order(
            std::mem::take(&mut self.state.selections),
            &selection_order,
            |s| s.instance_id.as_str(),
        );
        self.state.bulk_defects = resolver::apply_order(
            std::mem::take(&mut self.state.bulk_defects),
            &bulk_order,
            |d| d.id.as_str(),
        );

        self.state.session.image_order = image_order;
        self.state.session.selected_image_order = selection_order;
        self.state.session.bulk_defect_order = bulk_order;
    }

    pub(crate) fn emit_changed(&self, collection: Collection, origin: &str) {
        self.events.emit(EngineEvent::CollectionChanged {
            collection,
            origin: origin.to_string(),
        });
    }

    /// Object store prefix for this project's image blobs.
    pub(crate) fn object_prefix(&self) -> String {
        format!("{}/{}/", self.project.owner, self.project.id)
    }
}

/// Simulated tabs over shared in-memory collaborators.
#[cfg(all(test, not(target_arch = "wasm32")))]
pub(crate) mod testing {
    use super::*;
    use crate::broadcast::{BroadcastHub, BroadcastMessage};
    use crate::clock::ManualTimeSource;
    use crate::events::Subscription;
    use crate::inbound::{connect_hub, connect_storage};
    use crate::model::NewImage;
    use crate::remote::{InMemoryObjectStore, InMemoryReplica};
    use crate::storage::{InMemoryStorage, StorageChange};
    use std::ops::{Deref, DerefMut};
    use std::sync::Mutex;

    pub(crate) type TestEngine =
        SyncEngine<InMemoryStorage, InMemoryReplica, InMemoryObjectStore, BroadcastHub>;

    pub(crate) const OWNER: &str = "eng@example.com";

    /// One browser: local storage and broadcast channel shared by its tabs,
    /// remote replica and object store shared with other devices.
    pub(crate) struct World {
        pub storage: Arc<InMemoryStorage>,
        pub remote: Arc<InMemoryReplica>,
        pub objects: Arc<InMemoryObjectStore>,
        pub hub: Arc<BroadcastHub>,
        pub time: Arc<ManualTimeSource>,
    }

    impl World {
        pub fn new() -> Self {
            Self {
                storage: Arc::new(InMemoryStorage::new()),
                remote: Arc::new(InMemoryReplica::new()),
                objects: Arc::new(InMemoryObjectStore::new()),
                hub: Arc::new(BroadcastHub::new()),
                time: ManualTimeSource::new(1_000),
            }
        }

        /// Another browser signed in to the same account.
        pub fn other_device(&self) -> Self {
            Self {
                storage: Arc::new(InMemoryStorage::new()),
                remote: Arc::clone(&self.remote),
                objects: Arc::clone(&self.objects),
                hub: Arc::new(BroadcastHub::new()),
                time: Arc::clone(&self.time),
            }
        }

        pub fn tab(&self, writer: u64) -> Tab {
            self.tab_with_config(writer, SyncConfig::default())
        }

        pub fn tab_with_config(&self, writer: u64, config: SyncConfig) -> Tab {
            let deps = Collaborators {
                storage: Arc::clone(&self.storage),
                remote: Arc::clone(&self.remote),
                objects: Arc::clone(&self.objects),
                broadcast: Arc::clone(&self.hub),
                time: self.time.clone(),
            };
            let engine =
                SyncEngine::with_writer(config, OwnerId::new(OWNER), WriterId::from(writer), deps);
            let broadcasts = connect_hub(&self.hub, engine.inbox());
            let storage_changes = connect_storage(self.storage.changes(), engine.inbox());
            Tab {
                engine,
                _subscriptions: (broadcasts, storage_changes),
            }
        }
    }

    pub(crate) struct Tab {
        pub engine: TestEngine,
        _subscriptions: (Subscription<BroadcastMessage>, Subscription<StorageChange>),
    }

    impl Deref for Tab {
        type Target = TestEngine;

        fn deref(&self) -> &TestEngine {
            &self.engine
        }
    }

    impl DerefMut for Tab {
        fn deref_mut(&mut self) -> &mut TestEngine {
            &mut self.engine
        }
    }

    /// Drain every tab's inbox until no more deliveries arrive.
    pub(crate) fn settle(tabs: &mut [&mut Tab]) {
        for _ in 0..20 {
            let processed: usize = tabs.iter_mut().map(|tab| tab.process_inbound()).sum();
            if processed == 0 {
                return;
            }
        }
        panic!("tabs kept exchanging updates");
    }

    pub(crate) fn new_image(file_name: &str) -> NewImage {
        NewImage {
            file_name: file_name.to_string(),
            bytes: file_name.as_bytes().to_vec(),
            preview_ref: format!("blob:{}", file_name),
            is_sketch: false,
        }
    }

    /// Record every event the engine emits.
    pub(crate) fn record_events(
        engine: &TestEngine,
    ) -> (Arc<Mutex<Vec<EngineEvent>>>, Subscription<EngineEvent>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = engine.events().subscribe(move |event| {
            sink.lock().unwrap().push(event);
        });
        (seen, subscription)
    }
}
