//! UI-facing write API.
//!
//! Every mutation updates in-memory state first, then goes through
//! [`SyncEngine::commit`]: local save, broadcast, debounced remote write.

use crate::broadcast::BroadcastChannel;
use crate::engine::{Result, SyncEngine, SyncError};
use crate::model::{
    BulkDefectRecord, Collection, DeletedDefect, FormPatch, ImageRecord, MetadataPatch, NewImage,
    SelectionRecord, SessionPatch, SortDirection, SortMode, SortPreferences,
};
use crate::remote::{ObjectStore, RemoteReplica};
use crate::resolver;
use crate::sort::{SortAction, SortEvent};
use crate::storage::KeyValueStorage;
use std::cmp::Ordering;
use tracing::{debug, info, warn};

impl<S, R, O, B> SyncEngine<S, R, O, B>
where
    S: KeyValueStorage + ?Sized,
    R: RemoteReplica + ?Sized,
    O: ObjectStore + ?Sized,
    B: BroadcastChannel + ?Sized,
{
    /// Set the form fields named in `patch`.
    pub fn set_form_field(&mut self, patch: FormPatch) {
        if patch.is_empty() {
            return;
        }
        let ts = self.clock.tick();
        self.state.form.apply_patch(&patch, ts);
        self.state.session.form_data = self.state.form.data.clone();
        self.commit(Collection::FormData, ts);
    }

    /// Register new images, upload their bytes and attach the resulting URLs.
    ///
    /// Records are committed locally before any upload starts, so a failed
    /// upload leaves the image listed without a URL; `load_all` resolves it
    /// later from the object store listing.
    pub async fn add_images(&mut self, files: Vec<NewImage>) -> Result<Vec<ImageRecord>> {
        let mut next_order = self
            .state
            .images
            .iter()
            .map(|i| i.upload_order + 1)
            .max()
            .unwrap_or(0);

        let mut added: Vec<(ImageRecord, &NewImage)> = Vec::new();
        for file in &files {
            let record = ImageRecord {
                id: self.project.image_id(&file.file_name, next_order),
                file_name: file.file_name.clone(),
                preview_ref: file.preview_ref.clone(),
                is_sketch: file.is_sketch,
                upload_order: next_order,
                url: None,
            };
            next_order += 1;
            self.state.images.push(record.clone());
            added.push((record, file));
        }

        if added.is_empty() {
            return Ok(Vec::new());
        }
        info!("Added {} images", added.len());
        self.commit_structural(&[Collection::Images]);

        let prefix = self.object_prefix();
        let mut uploaded = 0;
        for (record, file) in added.iter_mut() {
            let path = format!("{}{}/{}", prefix, record.id, record.file_name);
            match self.objects.upload(&file.bytes, &path).await {
                Ok(object) => {
                    if let Some(image) = self.state.images.iter_mut().find(|i| i.id == record.id) {
                        image.url = Some(object.url.clone());
                    }
                    record.url = Some(object.url);
                    uploaded += 1;
                }
                Err(e) => warn!("Upload of {} failed: {}", record.file_name, e),
            }
        }

        if uploaded > 0 {
            let ts = self.clock.tick();
            self.commit(Collection::Images, ts);
        }
        self.request_auto_sort();
        self.force_flush(Collection::Images).await?;
        Ok(added.into_iter().map(|(record, _)| record).collect())
    }

    /// Select `image_id` if it has no selections, otherwise remove all of its
    /// selections. Returns the new instance id when one was created.
    pub fn toggle_selection(&mut self, image_id: &str) -> Result<Option<String>> {
        let existing: Vec<String> = self
            .state
            .selections
            .iter()
            .filter(|s| s.image_id == image_id)
            .map(|s| s.instance_id.clone())
            .collect();

        if existing.is_empty() {
            return self.add_selection_instance(image_id).map(Some);
        }

        for instance_id in &existing {
            self.tombstones.insert(instance_id);
        }
        self.state.selections.retain(|s| s.image_id != image_id);
        self.commit_structural(&[Collection::Selections]);
        Ok(None)
    }

    /// Add another selection of `image_id`, returning its instance id.
    pub fn add_selection_instance(&mut self, image_id: &str) -> Result<String> {
        let image = self
            .state
            .images
            .iter()
            .find(|i| i.id == image_id)
            .ok_or_else(|| SyncError::UnknownImage(image_id.to_string()))?;

        let record = SelectionRecord {
            image_id: image.id.clone(),
            instance_id: self.project.new_instance_id(&image.id),
            file_name: image.file_name.clone(),
        };
        let instance_id = record.instance_id.clone();
        self.state.selections.push(record);
        self.commit_structural(&[Collection::Selections]);
        Ok(instance_id)
    }

    /// Remove one selection instance. Returns whether it existed.
    pub fn remove_selection(&mut self, instance_id: &str) -> bool {
        let before = self.state.selections.len();
        self.state.selections.retain(|s| s.instance_id != instance_id);
        if self.state.selections.len() == before {
            return false;
        }
        self.tombstones.insert(instance_id);
        self.commit_structural(&[Collection::Selections]);
        true
    }

    /// The user started dragging selections into a manual order.
    pub fn begin_reorder(&mut self) {
        self.sort_fsm.handle(SortEvent::BeginUserReorder);
    }

    /// Apply a manual selection order and end any drag in progress.
    ///
    /// Unknown ids are ignored and unlisted selections keep their relative
    /// order at the end.
    pub fn set_selection_order(&mut self, instance_ids: &[String]) {
        let order = resolver::reconcile_order(
            instance_ids,
            self.state.selections.iter().map(|s| s.instance_id.as_str()),
        );
        self.state.selections = resolver::apply_order(
            std::mem::take(&mut self.state.selections),
            &order,
            |s| s.instance_id.as_str(),
        );
        self.commit_structural(&[Collection::Selections]);

        if self.sort_fsm.handle(SortEvent::EndUserReorder) == SortAction::RunAutoSort {
            self.run_auto_sort();
        }
    }

    /// Update the photo number and/or description of one selection instance.
    pub fn update_instance_metadata(&mut self, instance_id: &str, patch: MetadataPatch) -> Result<()> {
        if !self
            .state
            .selections
            .iter()
            .any(|s| s.instance_id == instance_id)
        {
            return Err(SyncError::UnknownInstance(instance_id.to_string()));
        }

        let ts = self.clock.tick();
        let cell = self
            .state
            .instance_metadata
            .entry(instance_id.to_string())
            .or_default();
        if let Some(photo_number) = patch.photo_number {
            cell.photo_number = photo_number;
        }
        if let Some(description) = patch.description {
            cell.description = description;
        }
        cell.updated_at = ts;
        self.commit(Collection::InstanceMetadata, ts);

        if self.state.sort.prefs.mode == SortMode::PhotoNumber {
            self.request_auto_sort();
        }
        Ok(())
    }

    /// Replace the bulk-defect list. Records that disappear go to the undo log.
    pub fn set_bulk_defects(&mut self, records: Vec<BulkDefectRecord>) {
        let now = self.now_ms();
        let removed: Vec<DeletedDefect> = self
            .state
            .bulk_defects
            .iter()
            .enumerate()
            .filter(|(_, old)| !records.iter().any(|r| r.id == old.id))
            .map(|(original_index, record)| DeletedDefect {
                record: record.clone(),
                original_index,
                deleted_at: now,
            })
            .collect();

        for deleted in removed {
            self.push_undo(deleted);
        }
        self.state.bulk_defects = records;
        self.commit_structural(&[Collection::BulkData]);
    }

    /// Edit the bulk-defect list in place.
    pub fn update_bulk_defects(&mut self, updater: impl FnOnce(&mut Vec<BulkDefectRecord>)) {
        let mut records = self.state.bulk_defects.clone();
        updater(&mut records);
        self.set_bulk_defects(records);
    }

    /// Delete one bulk defect. Returns whether it existed.
    pub fn delete_bulk_defect(&mut self, id: &str) -> bool {
        if !self.state.bulk_defects.iter().any(|d| d.id == id) {
            return false;
        }
        self.update_bulk_defects(|records| records.retain(|d| d.id != id));
        true
    }

    /// Restore the most recently deleted bulk defect at its original position.
    pub fn undo_last_delete(&mut self) -> Option<BulkDefectRecord> {
        let deleted = self.undo.pop_back()?;
        if self
            .state
            .bulk_defects
            .iter()
            .any(|d| d.id == deleted.record.id)
        {
            debug!("Undo skipped: {} already present", deleted.record.id);
            return None;
        }
        let index = deleted.original_index.min(self.state.bulk_defects.len());
        self.state
            .bulk_defects
            .insert(index, deleted.record.clone());
        self.commit_structural(&[Collection::BulkData]);
        Some(deleted.record)
    }

    fn push_undo(&mut self, deleted: DeletedDefect) {
        self.undo.push_back(deleted);
        while self.undo.len() > self.config.undo_capacity {
            self.undo.pop_front();
        }
    }

    /// Update UI view state.
    pub fn set_session_view(&mut self, patch: SessionPatch) {
        let session = &mut self.state.session;
        if let Some(tab) = patch.last_active_tab {
            session.last_active_tab = tab;
        }
        if let Some(expanded) = patch.panel_expanded {
            session.panel_expanded = expanded;
        }
        if let Some(width) = patch.grid_width {
            session.grid_width = width;
        }
        if let Some(positions) = patch.scroll_positions {
            session.scroll_positions.extend(positions);
        }
        let ts = self.clock.tick();
        self.commit(Collection::SessionState, ts);
    }

    pub fn set_sort_preferences(&mut self, prefs: SortPreferences) {
        self.state.sort.prefs = prefs;
        let ts = self.clock.tick();
        self.commit(Collection::SortPreferences, ts);
        self.request_auto_sort();
    }

    /// Ask for an auto-sort; deferred while the user is reordering.
    pub(crate) fn request_auto_sort(&mut self) {
        if self.state.sort.prefs.mode == SortMode::Manual {
            return;
        }
        match self.sort_fsm.handle(SortEvent::AutoSortRequested) {
            SortAction::RunAutoSort => self.run_auto_sort(),
            SortAction::Deferred => debug!("Auto-sort deferred until reorder ends"),
            SortAction::None => {}
        }
    }

    fn run_auto_sort(&mut self) {
        let SortPreferences { mode, direction } = self.state.sort.prefs;
        let directed = |ord: Ordering| match direction {
            SortDirection::Ascending => ord,
            SortDirection::Descending => ord.reverse(),
        };

        match mode {
            SortMode::Manual => {}
            SortMode::FileName | SortMode::UploadOrder => {
                self.state.images.sort_by(|a, b| {
                    directed(match mode {
                        SortMode::FileName => resolver::normalize_file_name(&a.file_name)
                            .cmp(&resolver::normalize_file_name(&b.file_name)),
                        _ => a.upload_order.cmp(&b.upload_order),
                    })
                });
                let rank: std::collections::HashMap<&str, usize> = self
                    .state
                    .images
                    .iter()
                    .enumerate()
                    .map(|(i, img)| (img.id.as_str(), i))
                    .collect();
                let mut selections = std::mem::take(&mut self.state.selections);
                selections.sort_by_key(|s| rank.get(s.image_id.as_str()).copied().unwrap_or(usize::MAX));
                self.state.selections = selections;
            }
            SortMode::PhotoNumber => {
                let metadata = &self.state.instance_metadata;
                let key = |s: &SelectionRecord| {
                    metadata
                        .get(&s.instance_id)
                        .map(|c| photo_number_key(&c.photo_number))
                        .unwrap_or((u64::MAX, String::new()))
                };
                let mut selections = std::mem::take(&mut self.state.selections);
                selections.sort_by(|a, b| directed(key(a).cmp(&key(b))));
                self.state.selections = selections;
            }
        }

        self.commit_structural(&[Collection::Images, Collection::Selections]);
        self.sort_fsm.handle(SortEvent::AutoSortFinished);
        debug!("Auto-sort by {:?} {:?}", mode, direction);
    }
}

/// Numeric photo numbers sort numerically, everything else after them by text.
fn photo_number_key(photo_number: &str) -> (u64, String) {
    match photo_number.parse::<u64>() {
        Ok(n) => (n, String::new()),
        Err(_) if photo_number.is_empty() => (u64::MAX, String::new()),
        Err(_) => (u64::MAX - 1, photo_number.to_lowercase()),
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::engine::testing::{OWNER, World, new_image};
    use crate::identity;
    use crate::model::SessionPatch;

    #[test]
    fn test_form_edit_is_stamped_and_scheduled() {
        let world = World::new();
        let mut tab = world.tab(1);

        tab.set_form_field(FormPatch {
            elr: Some("ABC".into()),
            ..Default::default()
        });

        assert_eq!(tab.form().data.elr, "ABC");
        assert_eq!(tab.form().stamps.elr.time, 1_000);
        assert_eq!(tab.session().form_data.elr, "ABC");
        assert!(tab.is_pending(Collection::FormData));
        assert!(!world.storage.is_empty());
    }

    #[test]
    fn test_empty_form_patch_is_ignored() {
        let world = World::new();
        let mut tab = world.tab(1);
        tab.set_form_field(FormPatch::default());
        assert!(!tab.is_pending(Collection::FormData));
        assert!(world.storage.is_empty());
    }

    #[tokio::test]
    async fn test_add_images_derives_ids_and_uploads() {
        let world = World::new();
        let mut tab = world.tab(1);

        let added = tab
            .add_images(vec![new_image("PB080001.JPG"), new_image("PB080002.JPG")])
            .await
            .unwrap();

        assert_eq!(added.len(), 2);
        assert_eq!(
            added[0].id,
            identity::image_id(OWNER, "current", "PB080001.JPG", 0)
        );
        assert_eq!(added[1].upload_order, 1);
        assert!(tab.images().iter().all(|i| i.url.is_some()));
        assert_eq!(tab.session().image_order.len(), 2);

        let path = format!("{}{}/PB080001.JPG", tab.object_prefix(), added[0].id);
        assert!(world.objects.get(&path).is_some());
        // Images are flushed right away; the session snapshot still waits.
        assert!(!tab.is_pending(Collection::Images));
        assert!(tab.is_pending(Collection::SessionState));
    }

    #[tokio::test]
    async fn test_same_file_added_twice_is_two_images() {
        let world = World::new();
        let mut tab = world.tab(1);

        let first = tab.add_images(vec![new_image("PB080001.JPG")]).await.unwrap();
        let second = tab.add_images(vec![new_image("PB080001.JPG")]).await.unwrap();

        assert_eq!(second.len(), 1);
        assert_ne!(first[0].id, second[0].id);
        assert_eq!(second[0].upload_order, 1);
        assert_eq!(tab.images().len(), 2);
        assert_eq!(tab.session().image_order.len(), 2);
        assert!(tab.session().image_order.contains(&second[0].id));
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_record_without_url() {
        let world = World::new();
        let mut tab = world.tab(1);
        world.objects.fail_next(1);

        let added = tab.add_images(vec![new_image("a.jpg")]).await.unwrap();
        assert_eq!(added.len(), 1);
        assert!(tab.images()[0].url.is_none());
    }

    #[tokio::test]
    async fn test_toggle_selection_adds_then_removes() {
        let world = World::new();
        let mut tab = world.tab(1);
        let added = tab.add_images(vec![new_image("a.jpg")]).await.unwrap();
        let image_id = added[0].id.clone();

        let instance_id = tab.toggle_selection(&image_id).unwrap().unwrap();
        assert!(instance_id.starts_with("inst_"));
        assert_eq!(tab.selections().len(), 1);
        assert_eq!(tab.session().selected_image_order, vec![instance_id.clone()]);

        assert_eq!(tab.toggle_selection(&image_id).unwrap(), None);
        assert!(tab.selections().is_empty());
        assert!(tab.tombstones.contains(&instance_id));
    }

    #[tokio::test]
    async fn test_multiple_instances_of_one_image() {
        let world = World::new();
        let mut tab = world.tab(1);
        let added = tab.add_images(vec![new_image("a.jpg")]).await.unwrap();

        let first = tab.add_selection_instance(&added[0].id).unwrap();
        let second = tab.add_selection_instance(&added[0].id).unwrap();
        assert_ne!(first, second);
        assert_eq!(tab.selections().len(), 2);

        assert!(tab.remove_selection(&first));
        assert!(!tab.remove_selection(&first));
        assert_eq!(tab.selections()[0].instance_id, second);
    }

    #[test]
    fn test_selecting_unknown_image_fails() {
        let world = World::new();
        let mut tab = world.tab(1);
        assert!(matches!(
            tab.add_selection_instance("img_missing"),
            Err(SyncError::UnknownImage(_))
        ));
        assert!(matches!(
            tab.update_instance_metadata("inst_missing", MetadataPatch::default()),
            Err(SyncError::UnknownInstance(_))
        ));
    }

    #[tokio::test]
    async fn test_metadata_update_stamps_cell() {
        let world = World::new();
        let mut tab = world.tab(1);
        let added = tab.add_images(vec![new_image("a.jpg")]).await.unwrap();
        let instance_id = tab.add_selection_instance(&added[0].id).unwrap();

        world.time.set(5_000);
        tab.update_instance_metadata(
            &instance_id,
            MetadataPatch {
                photo_number: Some("12".into()),
                description: None,
            },
        )
        .unwrap();

        let cell = &tab.instance_metadata()[&instance_id];
        assert_eq!(cell.photo_number, "12");
        assert_eq!(cell.updated_at.time, 5_000);
        assert!(tab.is_pending(Collection::InstanceMetadata));
    }

    fn defect(id: &str) -> BulkDefectRecord {
        BulkDefectRecord {
            id: id.into(),
            photo_number: String::new(),
            description: format!("defect {}", id),
            selected_file: None,
        }
    }

    #[test]
    fn test_undo_restores_at_original_position() {
        let world = World::new();
        let mut tab = world.tab(1);
        tab.set_bulk_defects(vec![defect("a"), defect("b"), defect("c")]);

        assert!(tab.delete_bulk_defect("b"));
        assert!(!tab.delete_bulk_defect("b"));
        assert_eq!(tab.undo_depth(), 1);

        let restored = tab.undo_last_delete().unwrap();
        assert_eq!(restored.id, "b");
        let ids: Vec<&str> = tab.bulk_defects().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(tab.undo_last_delete(), None);
    }

    #[test]
    fn test_undo_log_is_bounded() {
        let world = World::new();
        let mut tab = world.tab_with_config(
            1,
            crate::config::SyncConfig {
                undo_capacity: 2,
                ..Default::default()
            },
        );
        tab.set_bulk_defects(vec![defect("a"), defect("b"), defect("c")]);
        tab.update_bulk_defects(|records| records.clear());

        assert_eq!(tab.undo_depth(), 2);
        assert_eq!(tab.undo_last_delete().unwrap().id, "c");
        assert_eq!(tab.undo_last_delete().unwrap().id, "b");
        assert_eq!(tab.undo_last_delete(), None);
    }

    #[tokio::test]
    async fn test_auto_sort_waits_for_reorder_to_finish() {
        let world = World::new();
        let mut tab = world.tab(1);
        tab.add_images(vec![new_image("b.jpg"), new_image("a.jpg")])
            .await
            .unwrap();
        let ids: Vec<String> = tab.images().iter().map(|i| i.id.clone()).collect();
        let b = tab.add_selection_instance(&ids[0]).unwrap();
        let a = tab.add_selection_instance(&ids[1]).unwrap();

        tab.begin_reorder();
        tab.set_sort_preferences(SortPreferences {
            mode: SortMode::FileName,
            direction: SortDirection::Ascending,
        });
        // Deferred: the user is still dragging.
        assert_eq!(tab.images()[0].file_name, "b.jpg");

        tab.set_selection_order(&[b.clone(), a.clone()]);
        assert_eq!(tab.images()[0].file_name, "a.jpg");
        assert_eq!(tab.selections()[0].instance_id, a);
        assert_eq!(tab.session().selected_image_order, vec![a, b]);
    }

    #[tokio::test]
    async fn test_photo_number_sort_is_numeric() {
        let world = World::new();
        let mut tab = world.tab(1);
        let added = tab
            .add_images(vec![new_image("a.jpg"), new_image("b.jpg"), new_image("c.jpg")])
            .await
            .unwrap();
        let mut instances = Vec::new();
        for (image, number) in added.iter().zip(["10", "9", ""]) {
            let instance_id = tab.add_selection_instance(&image.id).unwrap();
            tab.update_instance_metadata(
                &instance_id,
                MetadataPatch {
                    photo_number: Some(number.into()),
                    description: None,
                },
            )
            .unwrap();
            instances.push(instance_id);
        }

        tab.set_sort_preferences(SortPreferences {
            mode: SortMode::PhotoNumber,
            direction: SortDirection::Ascending,
        });
        let order: Vec<&str> = tab
            .selections()
            .iter()
            .map(|s| s.instance_id.as_str())
            .collect();
        assert_eq!(
            order,
            [
                instances[1].as_str(),
                instances[0].as_str(),
                instances[2].as_str()
            ]
        );
    }

    #[test]
    fn test_session_view_changes_are_snapshotted() {
        let world = World::new();
        let mut tab = world.tab(1);
        tab.set_session_view(SessionPatch {
            last_active_tab: Some("bulk".into()),
            grid_width: Some(4),
            ..Default::default()
        });
        assert_eq!(tab.session().last_active_tab, "bulk");
        assert!(!tab.session().last_active_time.is_zero());
        assert!(tab.is_pending(Collection::SessionState));
    }

    #[test]
    fn test_photo_number_keys() {
        assert!(photo_number_key("2") < photo_number_key("10"));
        assert!(photo_number_key("10") < photo_number_key("A1"));
        assert!(photo_number_key("A1") < photo_number_key(""));
    }
}
