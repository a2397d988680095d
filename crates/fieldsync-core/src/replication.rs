//! Remote replication: debounced flushing, load, save and clear.
//!
//! Background writes (debounced flushes) never fail the caller; a failure is
//! logged and reported as an event, and the next mutation of that collection
//! schedules a fresh write. User-initiated operations (`load_all`,
//! `save_all_now`, `force_flush`, `clear_all`) return their errors.

use crate::broadcast::BroadcastChannel;
use crate::clock::Timestamp;
use crate::engine::{BackgroundSync, Outbound, ProjectSnapshot, Result, SyncEngine};
use crate::events::EngineEvent;
use crate::inbound::PROJECT_CLEARED_TOPIC;
use crate::model::{Collection, CollectionKind, InstanceMetadata};
use crate::poll::PollReport;
use crate::remote::{ObjectStore, RemoteError, RemoteReplica};
use crate::resolver;
use crate::sort::SortMachine;
use crate::storage::KeyValueStorage;
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// What `load_all` restored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Collections found in local storage.
    pub local: Vec<Collection>,
    /// Collections updated from the remote replica or by reconciliation.
    pub updated: Vec<Collection>,
    /// Images whose missing URL was found in the object store.
    pub urls_resolved: usize,
}

/// What one `background_tick` did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Inbox messages processed.
    pub inbound: usize,
    /// Debounced writes sent (successfully or not).
    pub flushed: usize,
    /// Result of the poll, when one was due and succeeded.
    pub poll: Option<PollReport>,
}

impl<S, R, O, B> SyncEngine<S, R, O, B>
where
    S: KeyValueStorage + ?Sized,
    R: RemoteReplica + ?Sized,
    O: ObjectStore + ?Sized,
    B: BroadcastChannel + ?Sized,
{
    async fn send(&self, outbound: &Outbound) -> std::result::Result<(), RemoteError> {
        let owner = self.project.owner.as_str();
        let project = self.project.id.as_str();
        match outbound {
            Outbound::Collection { kind, envelope } => {
                self.remote
                    .put_collection(owner, project, *kind, envelope.clone())
                    .await
            }
            Outbound::Project(patch) => self.remote.put_project(owner, project, patch.clone()).await,
        }
    }

    /// Send one write and report the outcome as an event.
    async fn send_reported(
        &self,
        collection: Collection,
        outbound: &Outbound,
    ) -> std::result::Result<(), RemoteError> {
        match self.send(outbound).await {
            Ok(()) => {
                debug!("Flushed {}", collection);
                self.events.emit(EngineEvent::Flushed { collection });
                Ok(())
            }
            Err(e) => {
                warn!("Remote write of {} failed: {}", collection, e);
                self.events.emit(EngineEvent::RemoteWriteFailed {
                    collection,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Send every pending write whose debounce window has elapsed.
    /// Returns how many writes were attempted.
    pub async fn flush_due(&mut self) -> usize {
        let due = self.scheduler.due(self.now_ms());
        let attempted = due.len();
        for (collection, outbound) in due {
            // Failures are already logged and reported.
            let _ = self.send_reported(collection, &outbound).await;
        }
        attempted
    }

    /// Send the pending write for `collection` now, skipping its debounce
    /// window. Returns `false` when nothing was pending.
    pub async fn force_flush(&mut self, collection: Collection) -> Result<bool> {
        let Some(outbound) = self.scheduler.force_flush(collection) else {
            return Ok(false);
        };
        self.send_reported(collection, &outbound).await?;
        Ok(true)
    }

    /// Send every pending write, plus the current state of every collection
    /// this writer last changed. Remote writes are not retried on their own,
    /// so this is how a user recovers from an earlier failed flush.
    ///
    /// Every write is attempted; the first failure is returned.
    pub async fn save_all_now(&mut self) -> Result<()> {
        let mut writes: Vec<(Collection, Outbound)> = self.scheduler.drain();
        let writer = self.writer();
        for collection in Collection::ALL {
            let applied = self.applied_at(collection);
            if applied.is_zero() || applied.writer != writer {
                continue;
            }
            if writes.iter().any(|(c, _)| *c == collection) {
                continue;
            }
            writes.push((collection, self.outbound(collection, applied)?));
        }

        info!("Saving {} collections", writes.len());
        let mut first_error = None;
        for (collection, outbound) in &writes {
            if let Err(e) = self.send_reported(*collection, outbound).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Restore the project from local storage, then bring it up to date with
    /// the remote replica.
    ///
    /// Local state is applied even when the remote is unreachable; the remote
    /// error is returned afterwards.
    pub async fn load_all(&mut self) -> Result<LoadReport> {
        let mut report = LoadReport::default();

        for collection in Collection::ALL {
            let Some(envelope) = self.store.load_envelope::<Value>(collection) else {
                continue;
            };
            match self.replace_collection(collection, envelope.data) {
                Ok(()) => {
                    self.applied.insert(collection, envelope.timestamp);
                    self.clock.observe(envelope.timestamp);
                    report.local.push(collection);
                }
                Err(e) => warn!("Ignoring stored {}: {}", collection, e),
            }
        }
        self.state.session.form_data = self.state.form.data.clone();
        info!(
            "Restored {} collections for {} from local storage",
            report.local.len(),
            self.project.id
        );

        let mut changed = BTreeSet::new();
        let remote_result = self.load_remote(&mut changed, &mut report).await;

        let selections = self.state.selections.clone();
        if self.reconcile_selection_list(selections) {
            changed.insert(Collection::Selections);
        }
        let before = self.state.session.clone();
        self.apply_session_orders();
        self.state.session.form_data = self.state.form.data.clone();
        if self.state.session != before {
            changed.insert(Collection::SessionState);
        }

        for &collection in &changed {
            let ts = self.collection_stamp(collection);
            self.persist_adopted(collection, ts);
            self.emit_changed(collection, "remote");
        }
        report.updated = changed.into_iter().collect();

        remote_result.map(|()| report)
    }

    async fn load_remote(
        &mut self,
        changed: &mut BTreeSet<Collection>,
        report: &mut LoadReport,
    ) -> Result<()> {
        let owner = self.project.owner.to_string();
        let project = self.project.id.clone();

        if let Some(envelope) = self.remote.get_project(&owner, &project).await? {
            let record = envelope.data;
            if resolver::merge_form(&mut self.state.form, &record.form) {
                changed.insert(Collection::FormData);
            }
            if resolver::merge_session(&mut self.state.session, &record.session) {
                changed.insert(Collection::SessionState);
            }
            if resolver::merge_sort(&mut self.state.sort, &record.sort) {
                changed.insert(Collection::SortPreferences);
            }
        }

        let replaced = [
            (Collection::Images, CollectionKind::Images),
            (Collection::Selections, CollectionKind::Selections),
            (Collection::BulkData, CollectionKind::BulkDefects),
        ];
        for (collection, kind) in replaced {
            let Some(envelope) = self.remote.get_collection(&owner, &project, kind).await? else {
                continue;
            };
            if !resolver::should_adopt(self.applied_at(collection), envelope.timestamp) {
                debug!("Remote {} is not newer than local", collection);
                continue;
            }
            self.replace_collection(collection, envelope.data)?;
            self.applied.insert(collection, envelope.timestamp);
            self.clock.observe(envelope.timestamp);
            changed.insert(collection);
        }

        if let Some(envelope) = self
            .remote
            .get_collection(&owner, &project, CollectionKind::InstanceMetadata)
            .await?
        {
            let envelope = envelope.decode::<InstanceMetadata>()?;
            let keys =
                resolver::merge_instance_metadata(&mut self.state.instance_metadata, &envelope.data);
            if !keys.is_empty() {
                debug!("Merged {} remote metadata cells", keys.len());
                changed.insert(Collection::InstanceMetadata);
            }
        }

        report.urls_resolved = self.resolve_missing_urls().await?;
        if report.urls_resolved > 0 {
            changed.insert(Collection::Images);
        }
        Ok(())
    }

    /// Fill in image URLs from the object store for uploads that finished
    /// after their record was saved.
    async fn resolve_missing_urls(&mut self) -> Result<usize> {
        if self.state.images.iter().all(|i| i.url.is_some()) {
            return Ok(0);
        }
        let prefix = self.object_prefix();
        let objects = self.objects.list(&prefix).await?;

        let mut resolved = 0;
        for image in self.state.images.iter_mut().filter(|i| i.url.is_none()) {
            let path = format!("{}{}/{}", prefix, image.id, image.file_name);
            if let Some(object) = objects.iter().find(|o| o.name == path) {
                image.url = Some(object.url.clone());
                resolved += 1;
            }
        }
        if resolved > 0 {
            info!("Resolved {} image URLs from the object store", resolved);
        }
        Ok(resolved)
    }

    /// The newest timestamp carried by a collection's current state.
    fn collection_stamp(&self, collection: Collection) -> Timestamp {
        let applied = self.applied_at(collection);
        match collection {
            Collection::FormData => applied.max(self.state.form.latest()),
            Collection::SessionState => applied.max(self.state.session.last_active_time),
            Collection::SortPreferences => applied.max(self.state.sort.updated_at),
            Collection::InstanceMetadata => self
                .state
                .instance_metadata
                .values()
                .map(|cell| cell.updated_at)
                .fold(applied, Timestamp::max),
            _ => applied,
        }
    }

    /// Start polling on the next tick and every `poll_interval_ms` after.
    pub fn start_background_sync(&mut self) {
        if self.background.is_some() {
            return;
        }
        info!(
            "Background sync started (poll every {}ms)",
            self.config.poll_interval_ms
        );
        self.background = Some(BackgroundSync {
            next_poll_at: self.now_ms(),
        });
    }

    pub fn stop_background_sync(&mut self) {
        if self.background.take().is_some() {
            info!("Background sync stopped");
        }
    }

    /// One turn of the background loop: drain the inbox, send due writes and
    /// poll when the interval has elapsed. Never fails; a failed poll is
    /// retried on the next interval.
    pub async fn background_tick(&mut self) -> TickReport {
        let mut report = TickReport {
            inbound: self.process_inbound(),
            flushed: self.flush_due().await,
            poll: None,
        };

        let now = self.now_ms();
        let interval = self.config.poll_interval_ms;
        let poll_due = match self.background.as_mut() {
            Some(background) if now >= background.next_poll_at => {
                background.next_poll_at = now + interval;
                true
            }
            _ => false,
        };

        if poll_due {
            match self.poll_once().await {
                Ok(poll) => report.poll = Some(poll),
                Err(e) => {
                    warn!("Poll failed: {}", e);
                    self.events.emit(EngineEvent::PollFailed {
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Forget all in-memory state and pending work for this project.
    pub(crate) fn reset_local_state(&mut self) {
        let cancelled = self.scheduler.cancel_all();
        if cancelled > 0 {
            debug!("Cancelled {} pending writes", cancelled);
        }
        self.state = ProjectSnapshot::default();
        self.applied.clear();
        self.undo.clear();
        self.tombstones.clear();
        self.sort_fsm = SortMachine::new();
    }

    /// Delete the project everywhere: local storage, remote replica, uploaded
    /// images, and the in-memory state of every open tab.
    pub async fn clear_all(&mut self) -> Result<()> {
        self.reset_local_state();
        let removed = self.store.clear_project()?;
        info!("Cleared {} local keys for {}", removed, self.project.id);

        let ts = self.clock.tick();
        if let Err(e) = self
            .broadcast
            .publish(PROJECT_CLEARED_TOPIC, Value::Null, ts)
        {
            warn!("Broadcast of project clear failed: {}", e);
        }
        for collection in Collection::ALL {
            self.emit_changed(collection, "local");
        }

        self.remote
            .delete_project(self.project.owner.as_str(), &self.project.id)
            .await?;
        self.objects.delete_prefix(&self.object_prefix()).await?;
        info!("Cleared remote data for {}", self.project.id);
        Ok(())
    }
}
