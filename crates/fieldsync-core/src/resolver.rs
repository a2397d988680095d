//! Conflict resolution and record reconciliation.
//!
//! All merges are last-writer-wins on [`Timestamp`]s. Structured records merge
//! at the finest grain that has its own timestamp: form fields individually,
//! instance metadata per `instanceId`. Every function here is pure and
//! idempotent; merging the same input twice changes nothing the second time.

use crate::clock::Timestamp;
use crate::model::{
    ImageRecord, InstanceMetadata, ProjectPatch, ProjectRecord, SelectionRecord, SessionState,
    StampedForm, StampedSort,
};
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// The timestamp rule: adopt incoming iff strictly newer.
pub fn should_adopt(local: Timestamp, incoming: Timestamp) -> bool {
    incoming > local
}

/// Merge form fields independently. Returns whether anything changed.
pub fn merge_form(local: &mut StampedForm, incoming: &StampedForm) -> bool {
    let mut changed = false;
    if should_adopt(local.stamps.elr, incoming.stamps.elr) {
        local.data.elr = incoming.data.elr.clone();
        local.stamps.elr = incoming.stamps.elr;
        changed = true;
    }
    if should_adopt(local.stamps.structure_no, incoming.stamps.structure_no) {
        local.data.structure_no = incoming.data.structure_no.clone();
        local.stamps.structure_no = incoming.stamps.structure_no;
        changed = true;
    }
    if should_adopt(local.stamps.date, incoming.stamps.date) {
        local.data.date = incoming.data.date.clone();
        local.stamps.date = incoming.stamps.date;
        changed = true;
    }
    changed
}

/// Session state is one register clocked by `last_active_time`.
pub fn merge_session(local: &mut SessionState, incoming: &SessionState) -> bool {
    if should_adopt(local.last_active_time, incoming.last_active_time) {
        *local = incoming.clone();
        true
    } else {
        false
    }
}

pub fn merge_sort(local: &mut StampedSort, incoming: &StampedSort) -> bool {
    if should_adopt(local.updated_at, incoming.updated_at) {
        *local = *incoming;
        true
    } else {
        false
    }
}

/// Merge every part a patch carries into a project record.
pub fn merge_project_patch(record: &mut ProjectRecord, patch: &ProjectPatch) -> bool {
    let mut changed = false;
    if let Some(form) = &patch.form {
        changed |= merge_form(&mut record.form, form);
    }
    if let Some(session) = &patch.session {
        changed |= merge_session(&mut record.session, session);
    }
    if let Some(sort) = &patch.sort {
        changed |= merge_sort(&mut record.sort, sort);
    }
    changed
}

/// Merge instance metadata per key. Returns the keys that changed.
///
/// A cell for a known key wins only when newer. A cell for an unknown key is
/// adopted only when it carries content, so a stale snapshot full of blank
/// rows cannot plant empty cells.
pub fn merge_instance_metadata(
    local: &mut InstanceMetadata,
    incoming: &InstanceMetadata,
) -> Vec<String> {
    let mut changed = Vec::new();
    for (instance_id, cell) in incoming {
        match local.get_mut(instance_id) {
            Some(existing) => {
                if should_adopt(existing.updated_at, cell.updated_at) {
                    *existing = cell.clone();
                    changed.push(instance_id.clone());
                }
            }
            None => {
                if !cell.is_empty() {
                    local.insert(instance_id.clone(), cell.clone());
                    changed.push(instance_id.clone());
                }
            }
        }
    }
    changed
}

/// Whether `snapshot` already holds every form field at least as new as `local`.
pub fn form_covers(snapshot: &StampedForm, local: &StampedForm) -> bool {
    snapshot.stamps.elr >= local.stamps.elr
        && snapshot.stamps.structure_no >= local.stamps.structure_no
        && snapshot.stamps.date >= local.stamps.date
}

/// Whether `snapshot` already holds every cell of `local` at least as new.
pub fn metadata_covers(snapshot: &InstanceMetadata, local: &InstanceMetadata) -> bool {
    local.iter().all(|(instance_id, cell)| {
        snapshot
            .get(instance_id)
            .is_some_and(|theirs| theirs.updated_at >= cell.updated_at)
    })
}

/// Reconcile an order list against current membership.
///
/// Ids absent from `members` are dropped, duplicates keep their first
/// position, and members missing from `order` are appended in membership
/// order.
pub fn reconcile_order<'a>(
    order: &[String],
    members: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let members: Vec<&str> = members.into_iter().collect();
    let member_set: HashSet<&str> = members.iter().copied().collect();
    let mut seen = HashSet::new();

    let mut result: Vec<String> = order
        .iter()
        .filter(|id| member_set.contains(id.as_str()) && seen.insert(id.as_str()))
        .cloned()
        .collect();

    for id in members {
        if seen.insert(id) {
            result.push(id.to_string());
        }
    }
    result
}

/// Sort `items` by `order`, appending anything unlisted in its current order.
pub fn apply_order<T>(items: Vec<T>, order: &[String], id_of: impl Fn(&T) -> &str) -> Vec<T> {
    let rank: HashMap<&str, usize> = order
        .iter()
        .enumerate()
        .rev()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let mut keyed: Vec<(usize, usize, T)> = items
        .into_iter()
        .enumerate()
        .map(|(pos, item)| {
            let r = rank.get(id_of(&item)).copied().unwrap_or(usize::MAX);
            (r, pos, item)
        })
        .collect();
    keyed.sort_by_key(|(r, pos, _)| (*r, *pos));
    keyed.into_iter().map(|(_, _, item)| item).collect()
}

/// Case-folded file name with everything but letters and digits stripped.
pub fn normalize_file_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreconciledReason {
    /// No current image matches by id or file name.
    NoCandidate,
    /// Several current images share the normalized file name.
    Ambiguous { candidates: usize },
}

impl Display for UnreconciledReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            UnreconciledReason::NoCandidate => write!(f, "no candidate"),
            UnreconciledReason::Ambiguous { candidates } => {
                write!(f, "ambiguous ({} candidates)", candidates)
            }
        }
    }
}

/// A selection record that could not be bound to a current image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Selection {} ({}) dropped: {reason}", .record.instance_id, .record.file_name)]
pub struct Unreconciled {
    pub record: SelectionRecord,
    pub reason: UnreconciledReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    /// Surviving records in input order, with rebound image ids.
    pub kept: Vec<SelectionRecord>,
    /// `(instance_id, old_image_id, new_image_id)` for each rebinding.
    pub rebound: Vec<(String, String, String)>,
    pub dropped: Vec<Unreconciled>,
}

/// Bind selection records to the current image set.
///
/// Tries an exact image id match, then a unique normalized file name match.
/// Anything else is dropped. Instance ids are never changed; duplicates keep
/// their first occurrence.
pub fn reconcile_selections(records: Vec<SelectionRecord>, images: &[ImageRecord]) -> Reconciled {
    let by_id: HashSet<&str> = images.iter().map(|img| img.id.as_str()).collect();
    let mut by_name: HashMap<String, Vec<&ImageRecord>> = HashMap::new();
    for image in images {
        by_name
            .entry(normalize_file_name(&image.file_name))
            .or_default()
            .push(image);
    }

    let mut result = Reconciled::default();
    let mut seen_instances = HashSet::new();

    for mut record in records {
        if !seen_instances.insert(record.instance_id.clone()) {
            continue;
        }

        if by_id.contains(record.image_id.as_str()) {
            result.kept.push(record);
            continue;
        }

        let candidates = by_name
            .get(&normalize_file_name(&record.file_name))
            .map(Vec::as_slice)
            .unwrap_or_default();

        match candidates {
            [image] => {
                let old = std::mem::replace(&mut record.image_id, image.id.clone());
                record.file_name = image.file_name.clone();
                result
                    .rebound
                    .push((record.instance_id.clone(), old, image.id.clone()));
                result.kept.push(record);
            }
            [] => result.dropped.push(Unreconciled {
                record,
                reason: UnreconciledReason::NoCandidate,
            }),
            many => result.dropped.push(Unreconciled {
                record,
                reason: UnreconciledReason::Ambiguous {
                    candidates: many.len(),
                },
            }),
        }
    }

    result
}
