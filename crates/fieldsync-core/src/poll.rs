//! Additive selection merge for the poll loop.
//!
//! A poll only ever adds selections. Anything deleted locally is tombstoned so
//! a poll that still sees it remotely (because the delete has not been flushed
//! yet) does not bring it back. The tombstone is cleared by the first poll
//! that no longer sees the instance.

use crate::model::{Collection, ImageRecord, SelectionRecord};
use crate::resolver::{Unreconciled, reconcile_selections};
use std::collections::{BTreeSet, HashSet};

/// Instance ids deleted locally and not yet confirmed gone remotely.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tombstones {
    ids: BTreeSet<String>,
}

impl Tombstones {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instance_id: &str) {
        self.ids.insert(instance_id.to_string());
    }

    pub fn remove(&mut self, instance_id: &str) -> bool {
        self.ids.remove(instance_id)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.ids.contains(instance_id)
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Forget tombstones for instances the remote no longer has.
    fn prune_absent(&mut self, remote: &HashSet<&str>) -> usize {
        let before = self.ids.len();
        self.ids.retain(|id| remote.contains(id.as_str()));
        before - self.ids.len()
    }
}

#[derive(Debug, Default)]
pub struct PollMerge {
    /// Records appended to the local list.
    pub added: Vec<SelectionRecord>,
    /// Remote records that could not be bound to a current image.
    pub dropped: Vec<Unreconciled>,
    /// Tombstones cleared because the remote confirmed the delete.
    pub confirmed_deletes: usize,
}

/// What one poll cycle changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollReport {
    /// Parts of the project record that were newer remotely.
    pub project: Vec<Collection>,
    pub selections_added: usize,
    pub metadata_changed: usize,
    pub selections_dropped: usize,
    pub confirmed_deletes: usize,
}

/// Append remote selections that are neither known locally nor tombstoned.
pub fn merge_selections_additive(
    local: &mut Vec<SelectionRecord>,
    remote: Vec<SelectionRecord>,
    tombstones: &mut Tombstones,
    images: &[ImageRecord],
) -> PollMerge {
    let remote_ids: HashSet<&str> = remote.iter().map(|r| r.instance_id.as_str()).collect();
    let confirmed_deletes = tombstones.prune_absent(&remote_ids);

    let known: HashSet<&str> = local.iter().map(|r| r.instance_id.as_str()).collect();
    let candidates: Vec<SelectionRecord> = remote
        .iter()
        .filter(|r| !known.contains(r.instance_id.as_str()) && !tombstones.contains(&r.instance_id))
        .cloned()
        .collect();

    let reconciled = reconcile_selections(candidates, images);
    local.extend(reconciled.kept.iter().cloned());

    PollMerge {
        added: reconciled.kept,
        dropped: reconciled.dropped,
        confirmed_deletes,
    }
}
