use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::changeset::Changeset;

/// Node of the changeset log.
///
/// A regular entry has a parent edge carrying the changes that lead from
/// the parent to this entry. A merge entry additionally has a merge edge
/// carrying the changes that lead from the merged branch to this entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesetEntry {
    pub id: Uuid,
    /// Previous entry, `None` for the first entry of the log
    pub parent_id: Option<Uuid>,
    /// Changes from the parent entry to this one
    pub parent_changeset: Option<Changeset>,
    /// Merged branch tip, for merge entries
    pub merge_id: Option<Uuid>,
    /// Changes from the merged branch tip to this one
    pub merge_changeset: Option<Changeset>,
    /// Whether the entry has been sent to a remote replica
    pub pushed: bool,
    /// Caller-defined metadata
    pub meta: serde_json::Value,
}

impl ChangesetEntry {
    /// A regular entry following `parent_id`.
    pub fn new(parent_id: Option<Uuid>, changeset: Changeset, meta: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id,
            parent_changeset: Some(changeset),
            merge_id: None,
            merge_changeset: None,
            pushed: false,
            meta,
        }
    }

    pub fn is_merge(&self) -> bool {
        self.merge_id.is_some()
    }

    /// Changes leading from `from` to this entry, if `from` is one of its
    /// parents.
    pub fn changeset_from(&self, from: Option<Uuid>) -> Option<&Changeset> {
        if self.parent_id == from {
            self.parent_changeset.as_ref()
        } else if from.is_some() && self.merge_id == from {
            self.merge_changeset.as_ref()
        } else {
            None
        }
    }

    /// Whether this entry directly follows `id` through either edge.
    pub fn follows(&self, id: Option<Uuid>) -> bool {
        match id {
            None => self.parent_id.is_none() && self.merge_id.is_none(),
            Some(id) => self.parent_id == Some(id) || self.merge_id == Some(id),
        }
    }
}
