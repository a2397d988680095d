//! Project state as stored locally and replicated remotely.
//!
//! Every type here serializes with camelCase field names; envelopes written by
//! older builds and by the browser host share the same JSON shape.

use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// A locally persisted collection. One storage key and one pending remote
/// write per collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    FormData,
    Images,
    Selections,
    BulkData,
    SessionState,
    SortPreferences,
    InstanceMetadata,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::FormData,
        Collection::Images,
        Collection::Selections,
        Collection::BulkData,
        Collection::SessionState,
        Collection::SortPreferences,
        Collection::InstanceMetadata,
    ];

    /// Name used in storage keys and broadcast topics.
    pub fn as_str(self) -> &'static str {
        match self {
            Collection::FormData => "formData",
            Collection::Images => "images",
            Collection::Selections => "selections",
            Collection::BulkData => "bulkData",
            Collection::SessionState => "sessionState",
            Collection::SortPreferences => "sortPreferences",
            Collection::InstanceMetadata => "instanceMetadata",
        }
    }

    pub fn parse(name: &str) -> Option<Collection> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    /// How long a burst of writes to this collection is coalesced.
    pub fn debounce_class(self) -> DebounceClass {
        match self {
            Collection::Images | Collection::Selections | Collection::BulkData => {
                DebounceClass::Structural
            }
            Collection::InstanceMetadata | Collection::FormData => DebounceClass::Metadata,
            Collection::SessionState | Collection::SortPreferences => DebounceClass::Snapshot,
        }
    }

    /// The remote collection this is replicated to, or `None` when it rides
    /// on the project record.
    pub fn remote_kind(self) -> Option<CollectionKind> {
        match self {
            Collection::Images => Some(CollectionKind::Images),
            Collection::Selections => Some(CollectionKind::Selections),
            Collection::BulkData => Some(CollectionKind::BulkDefects),
            Collection::InstanceMetadata => Some(CollectionKind::InstanceMetadata),
            Collection::FormData | Collection::SessionState | Collection::SortPreferences => None,
        }
    }
}

impl Display for Collection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Debounce window classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebounceClass {
    /// Images, selections, bulk defects.
    Structural,
    /// Per-keystroke data: instance metadata and form fields.
    Metadata,
    /// Session view and sort preferences.
    Snapshot,
}

/// Remote collections stored next to the project record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CollectionKind {
    Images,
    Selections,
    BulkDefects,
    InstanceMetadata,
}

impl CollectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CollectionKind::Images => "images",
            CollectionKind::Selections => "selections",
            CollectionKind::BulkDefects => "bulkDefects",
            CollectionKind::InstanceMetadata => "instanceMetadata",
        }
    }
}

impl Display for CollectionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormData {
    pub elr: String,
    pub structure_no: String,
    pub date: String,
}

/// A partial form update. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormPatch {
    pub elr: Option<String>,
    pub structure_no: Option<String>,
    pub date: Option<String>,
}

impl FormPatch {
    pub fn is_empty(&self) -> bool {
        self.elr.is_none() && self.structure_no.is_none() && self.date.is_none()
    }
}

/// Per-field write timestamps for [`FormData`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormStamps {
    pub elr: Timestamp,
    pub structure_no: Timestamp,
    pub date: Timestamp,
}

/// Form fields as independent last-writer-wins registers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StampedForm {
    pub data: FormData,
    pub stamps: FormStamps,
}

impl StampedForm {
    /// Apply a local patch, stamping every field it names with `ts`.
    pub fn apply_patch(&mut self, patch: &FormPatch, ts: Timestamp) {
        if let Some(elr) = &patch.elr {
            self.data.elr = elr.clone();
            self.stamps.elr = ts;
        }
        if let Some(structure_no) = &patch.structure_no {
            self.data.structure_no = structure_no.clone();
            self.stamps.structure_no = ts;
        }
        if let Some(date) = &patch.date {
            self.data.date = date.clone();
            self.stamps.date = ts;
        }
    }

    /// Newest field timestamp.
    pub fn latest(&self) -> Timestamp {
        self.stamps
            .elr
            .max(self.stamps.structure_no)
            .max(self.stamps.date)
    }
}

// ---------------------------------------------------------------------------
// Images and selections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRecord {
    pub id: String,
    pub file_name: String,
    #[serde(default)]
    pub preview_ref: String,
    #[serde(default)]
    pub is_sketch: bool,
    #[serde(default)]
    pub upload_order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A file handed to `add_images`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewImage {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub preview_ref: String,
    pub is_sketch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRecord {
    pub image_id: String,
    pub instance_id: String,
    pub file_name: String,
}

// ---------------------------------------------------------------------------
// Instance metadata
// ---------------------------------------------------------------------------

/// One last-writer-wins cell of instance metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataCell {
    pub photo_number: String,
    pub description: String,
    pub updated_at: Timestamp,
}

impl MetadataCell {
    pub fn is_empty(&self) -> bool {
        self.photo_number.is_empty() && self.description.is_empty()
    }
}

/// `instanceId -> cell`. Ordered so serialized snapshots are stable.
pub type InstanceMetadata = BTreeMap<String, MetadataCell>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataPatch {
    pub photo_number: Option<String>,
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Bulk defects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkDefectRecord {
    pub id: String,
    #[serde(default)]
    pub photo_number: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_file: Option<String>,
}

/// A removed bulk defect kept for single-step undo. Never replicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedDefect {
    pub record: BulkDefectRecord,
    pub original_index: usize,
    pub deleted_at: u64,
}

// ---------------------------------------------------------------------------
// Session and sort
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionState {
    pub last_active_tab: String,
    pub last_active_time: Timestamp,
    pub image_order: Vec<String>,
    pub selected_image_order: Vec<String>,
    pub bulk_defect_order: Vec<String>,
    pub panel_expanded: bool,
    pub grid_width: u32,
    pub scroll_positions: BTreeMap<String, f64>,
    pub form_data: FormData,
}

/// UI view changes for `set_session_view`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionPatch {
    pub last_active_tab: Option<String>,
    pub panel_expanded: Option<bool>,
    pub grid_width: Option<u32>,
    pub scroll_positions: Option<BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortMode {
    #[default]
    Manual,
    FileName,
    UploadOrder,
    PhotoNumber,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SortPreferences {
    pub mode: SortMode,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StampedSort {
    pub prefs: SortPreferences,
    pub updated_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Project record
// ---------------------------------------------------------------------------

/// The remote project document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectRecord {
    pub form: StampedForm,
    pub session: SessionState,
    pub sort: StampedSort,
}

/// A partial project write. Each present part is merged field-wise by the
/// receiver, so a patch never blanks out what it does not carry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form: Option<StampedForm>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<StampedSort>,
}

impl ProjectPatch {
    pub fn is_empty(&self) -> bool {
        self.form.is_none() && self.session.is_none() && self.sort.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer_id::WriterId;

    #[test]
    fn test_collection_names_round_trip() {
        for collection in Collection::ALL {
            assert_eq!(Collection::parse(collection.as_str()), Some(collection));
        }
        assert_eq!(Collection::parse("nope"), None);
    }

    #[test]
    fn test_debounce_classes() {
        assert_eq!(Collection::Images.debounce_class(), DebounceClass::Structural);
        assert_eq!(Collection::BulkData.debounce_class(), DebounceClass::Structural);
        assert_eq!(Collection::InstanceMetadata.debounce_class(), DebounceClass::Metadata);
        assert_eq!(Collection::FormData.debounce_class(), DebounceClass::Metadata);
        assert_eq!(Collection::SessionState.debounce_class(), DebounceClass::Snapshot);
    }

    #[test]
    fn test_form_patch_only_touches_named_fields() {
        let t1 = Timestamp::new(100, WriterId::from(1));
        let t2 = Timestamp::new(105, WriterId::from(2));
        let mut form = StampedForm::default();
        form.apply_patch(
            &FormPatch {
                elr: Some("ABC".into()),
                ..Default::default()
            },
            t1,
        );
        form.apply_patch(
            &FormPatch {
                structure_no: Some("X1".into()),
                ..Default::default()
            },
            t2,
        );
        assert_eq!(form.data.elr, "ABC");
        assert_eq!(form.data.structure_no, "X1");
        assert_eq!(form.stamps.elr, t1);
        assert_eq!(form.stamps.date, Timestamp::ZERO);
        assert_eq!(form.latest(), t2);
    }

    #[test]
    fn test_selection_record_json_shape() {
        let record = SelectionRecord {
            image_id: "img_1".into(),
            instance_id: "inst_1".into(),
            file_name: "a.jpg".into(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"imageId": "img_1", "instanceId": "inst_1", "fileName": "a.jpg"})
        );
    }

    #[test]
    fn test_image_record_tolerates_missing_optional_fields() {
        let image: ImageRecord =
            serde_json::from_str(r#"{"id":"img_1","fileName":"a.jpg"}"#).unwrap();
        assert_eq!(image.upload_order, 0);
        assert!(image.url.is_none());
    }

    #[test]
    fn test_metadata_cell_empty() {
        assert!(MetadataCell::default().is_empty());
        let cell = MetadataCell {
            description: "crack".into(),
            ..Default::default()
        };
        assert!(!cell.is_empty());
    }
}
