//! Inbound merges: broadcast messages, storage change notifications and the
//! poll loop.
//!
//! Hosts push broadcast messages and storage keys into the engine inbox from
//! their callbacks; `process_inbound` drains it serially so every merge sees
//! the result of the one before. Nothing received here is broadcast again or
//! scheduled for a remote write.

use crate::broadcast::{BroadcastChannel, BroadcastHub, BroadcastMessage};
use crate::clock::Timestamp;
use crate::engine::{InboxSender, Result, SyncEngine};
use crate::events::{EventBus, Shared, Subscription};
use crate::model::{
    BulkDefectRecord, Collection, CollectionKind, ImageRecord, InstanceMetadata, SelectionRecord,
    SessionState, StampedForm, StampedSort,
};
use crate::poll::{PollReport, merge_selections_additive};
use crate::remote::{ObjectStore, RemoteReplica};
use crate::resolver;
use crate::storage::{KeyValueStorage, StorageChange};
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Broadcast topic telling other tabs the project was deleted.
pub const PROJECT_CLEARED_TOPIC: &str = "projectCleared";

/// A delivery waiting in the engine inbox.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Broadcast(BroadcastMessage),
    /// A storage key changed, possibly written by another tab.
    StorageChanged(String),
}

/// Forward every message posted to `hub` into an engine inbox.
pub fn connect_hub(hub: &BroadcastHub, inbox: InboxSender) -> Subscription<BroadcastMessage> {
    hub.subscribe_all(move |message| {
        if inbox.unbounded_send(Inbound::Broadcast(message)).is_err() {
            debug!("Engine inbox closed; dropping broadcast");
        }
    })
}

/// Forward storage change notifications into an engine inbox.
pub fn connect_storage(
    changes: &Shared<EventBus<StorageChange>>,
    inbox: InboxSender,
) -> Subscription<StorageChange> {
    changes.subscribe(move |change: StorageChange| {
        if inbox
            .unbounded_send(Inbound::StorageChanged(change.key))
            .is_err()
        {
            debug!("Engine inbox closed; dropping storage change");
        }
    })
}

impl<S, R, O, B> SyncEngine<S, R, O, B>
where
    S: KeyValueStorage + ?Sized,
    R: RemoteReplica + ?Sized,
    O: ObjectStore + ?Sized,
    B: BroadcastChannel + ?Sized,
{
    /// Apply everything waiting in the inbox. Returns how many deliveries
    /// were processed.
    pub fn process_inbound(&mut self) -> usize {
        let mut processed = 0;
        // The engine holds a sender, so the stream never ends; an empty inbox
        // shows up as a pending `next()`.
        while let Some(Some(inbound)) = self.inbox_rx.next().now_or_never() {
            processed += 1;
            match inbound {
                Inbound::Broadcast(message) => self.handle_broadcast(message),
                Inbound::StorageChanged(key) => self.handle_storage_change(&key),
            }
        }
        processed
    }

    fn handle_broadcast(&mut self, message: BroadcastMessage) {
        if !self.broadcast.accepts(&message) {
            return;
        }
        self.clock.observe(message.timestamp);

        if message.topic == PROJECT_CLEARED_TOPIC {
            info!("Project {} cleared by writer {}", self.project.id, message.origin);
            self.reset_local_state();
            for collection in Collection::ALL {
                self.emit_changed(collection, "broadcast");
            }
            return;
        }

        let Some(collection) = Collection::parse(&message.topic) else {
            debug!("Ignoring broadcast topic {}", message.topic);
            return;
        };
        if let Err(e) = self.apply_incoming(collection, message.timestamp, message.payload, "broadcast")
        {
            warn!("Broadcast of {} from {} rejected: {}", collection, message.origin, e);
        }
    }

    fn handle_storage_change(&mut self, key: &str) {
        let Some(collection) = self.store.collection_for_key(key) else {
            return;
        };
        // A removed key is a clear, which arrives on the broadcast channel.
        let Some(envelope) = self.store.load_envelope::<Value>(collection) else {
            return;
        };
        if envelope.timestamp.writer == self.writer() {
            return;
        }
        if let Err(e) = self.apply_incoming(collection, envelope.timestamp, envelope.data, "storage") {
            warn!("Stored {} rejected: {}", collection, e);
        }
    }

    /// Merge another writer's snapshot of one collection. Returns whether the
    /// local state changed.
    ///
    /// Form data and instance metadata merge at their finest timestamped
    /// grain. Whenever local state holds something the incoming snapshot
    /// lacks, the merged result is saved back so the shared storage key never
    /// loses a field that only this tab had. Every other collection is adopted
    /// whole iff strictly newer than what was last applied.
    pub(crate) fn apply_incoming(
        &mut self,
        collection: Collection,
        ts: Timestamp,
        payload: Value,
        origin: &str,
    ) -> Result<bool> {
        match collection {
            Collection::FormData => {
                let incoming: StampedForm = serde_json::from_value(payload)?;
                let changed = resolver::merge_form(&mut self.state.form, &incoming);
                if changed {
                    self.state.session.form_data = self.state.form.data.clone();
                    self.note_applied(collection, ts);
                }
                if !resolver::form_covers(&incoming, &self.state.form) {
                    self.save_merged(collection);
                }
                if !changed {
                    return Ok(false);
                }
            }
            Collection::InstanceMetadata => {
                let incoming: InstanceMetadata = serde_json::from_value(payload)?;
                let keys =
                    resolver::merge_instance_metadata(&mut self.state.instance_metadata, &incoming);
                if !keys.is_empty() {
                    debug!("Merged {} metadata cells from {}", keys.len(), origin);
                    self.note_applied(collection, ts);
                }
                if !resolver::metadata_covers(&incoming, &self.state.instance_metadata) {
                    self.save_merged(collection);
                }
                if keys.is_empty() {
                    return Ok(false);
                }
            }
            _ => {
                let applied = self.applied_at(collection);
                if !resolver::should_adopt(applied, ts) {
                    debug!("Stale {} from {} ({} <= {})", collection, origin, ts, applied);
                    return Ok(false);
                }
                self.replace_collection(collection, payload)?;
                self.note_applied(collection, ts);

                match collection {
                    Collection::Selections => {
                        let selections = self.state.selections.clone();
                        let rebound = self.reconcile_selection_list(selections);
                        self.apply_session_orders();
                        if rebound {
                            self.persist_adopted(collection, ts);
                        }
                    }
                    Collection::SessionState => {
                        self.state.session.form_data = self.state.form.data.clone();
                        self.apply_session_orders();
                    }
                    // Membership changed: the session may have been adopted first
                    Collection::Images | Collection::BulkData => self.apply_session_orders(),
                    _ => {}
                }
            }
        }

        debug!("Applied {} at {} from {}", collection, ts, origin);
        self.emit_changed(collection, origin);
        Ok(true)
    }

    /// Save a merged snapshot under a fresh local timestamp, so the writer
    /// whose snapshot was merged sees the result as someone else's write.
    fn save_merged(&mut self, collection: Collection) {
        let ts = self.clock.tick();
        self.persist_adopted(collection, ts);
    }

    fn note_applied(&mut self, collection: Collection, ts: Timestamp) {
        let applied = self.applied_at(collection).max(ts);
        self.applied.insert(collection, applied);
        self.clock.observe(ts);
    }

    /// Replace a collection's in-memory state with a stored snapshot.
    pub(crate) fn replace_collection(
        &mut self,
        collection: Collection,
        payload: Value,
    ) -> serde_json::Result<()> {
        match collection {
            Collection::FormData => {
                self.state.form = serde_json::from_value::<StampedForm>(payload)?;
            }
            Collection::Images => {
                self.state.images = serde_json::from_value::<Vec<ImageRecord>>(payload)?;
            }
            Collection::Selections => {
                self.state.selections = serde_json::from_value::<Vec<SelectionRecord>>(payload)?;
            }
            Collection::BulkData => {
                self.state.bulk_defects = serde_json::from_value::<Vec<BulkDefectRecord>>(payload)?;
            }
            Collection::SessionState => {
                self.state.session = serde_json::from_value::<SessionState>(payload)?;
            }
            Collection::SortPreferences => {
                self.state.sort = serde_json::from_value::<StampedSort>(payload)?;
            }
            Collection::InstanceMetadata => {
                self.state.instance_metadata = serde_json::from_value::<InstanceMetadata>(payload)?;
            }
        }
        Ok(())
    }

    /// Pull the project record, selections and instance metadata once.
    ///
    /// Selections merge additively: remote instances not known locally and
    /// not tombstoned are appended, and nothing is ever removed by a poll.
    pub async fn poll_once(&mut self) -> Result<PollReport> {
        let owner = self.project.owner.to_string();
        let project = self.project.id.clone();
        let mut report = PollReport::default();

        if let Some(envelope) = self.remote.get_project(&owner, &project).await? {
            let record = envelope.data;
            if resolver::merge_form(&mut self.state.form, &record.form) {
                self.state.session.form_data = self.state.form.data.clone();
                let ts = self.state.form.latest();
                self.persist_adopted(Collection::FormData, ts);
                report.project.push(Collection::FormData);
            }
            if resolver::merge_session(&mut self.state.session, &record.session) {
                self.state.session.form_data = self.state.form.data.clone();
                self.apply_session_orders();
                self.persist_adopted(Collection::SessionState, record.session.last_active_time);
                report.project.push(Collection::SessionState);
            }
            if resolver::merge_sort(&mut self.state.sort, &record.sort) {
                self.persist_adopted(Collection::SortPreferences, record.sort.updated_at);
                report.project.push(Collection::SortPreferences);
            }
            for &collection in &report.project {
                self.emit_changed(collection, "poll");
            }
        }

        if let Some(envelope) = self
            .remote
            .get_collection(&owner, &project, CollectionKind::Selections)
            .await?
        {
            let envelope = envelope.decode::<Vec<SelectionRecord>>()?;
            let merge = merge_selections_additive(
                &mut self.state.selections,
                envelope.data,
                &mut self.tombstones,
                &self.state.images,
            );
            self.report_dropped(&merge.dropped);
            report.selections_added = merge.added.len();
            report.selections_dropped = merge.dropped.len();
            report.confirmed_deletes = merge.confirmed_deletes;

            if !merge.added.is_empty() {
                self.apply_session_orders();
                self.persist_adopted(Collection::Selections, envelope.timestamp);
                self.emit_changed(Collection::Selections, "poll");
            }
        }

        if let Some(envelope) = self
            .remote
            .get_collection(&owner, &project, CollectionKind::InstanceMetadata)
            .await?
        {
            let envelope = envelope.decode::<InstanceMetadata>()?;
            let keys =
                resolver::merge_instance_metadata(&mut self.state.instance_metadata, &envelope.data);
            report.metadata_changed = keys.len();
            if !keys.is_empty() {
                self.persist_adopted(Collection::InstanceMetadata, envelope.timestamp);
                self.emit_changed(Collection::InstanceMetadata, "poll");
            }
        }

        debug!(
            "Poll: {} project parts, {} selections added, {} metadata cells",
            report.project.len(),
            report.selections_added,
            report.metadata_changed
        );
        Ok(report)
    }
}
