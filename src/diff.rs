//! Item graph differences
//!
//! An [`ItemGraphDiff`] records, item by item, how one item graph turns into
//! another. Diffs are the basis of selective undo: the change made by a past
//! revision is computed as a diff against its parent, inverted, and applied to
//! the current content.
//!
//! Applying a diff is strict. Every change states the item content it
//! expects to find; if a later edit touched the same item the application
//! fails with [`VersoError::SelectiveUndoConflict`] rather than merging.
//! Changes that are already in effect are skipped, so applying a diff twice
//! is the same as applying it once.

use crate::error::{Result, VersoError};
use crate::item_graph::{Item, ItemGraph};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Change to one item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ItemChange {
    /// Item added
    Insert(Item),
    /// Item content replaced
    Update {
        /// Content before the change
        before: Item,
        /// Content after the change
        after: Item,
    },
    /// Item removed
    Remove(Item),
}

impl ItemChange {
    /// UUID of the changed item
    pub fn uuid(&self) -> Uuid {
        match self {
            ItemChange::Insert(item) | ItemChange::Remove(item) => item.uuid,
            ItemChange::Update { after, .. } => after.uuid,
        }
    }

    /// The change that undoes this one
    pub fn inverse(&self) -> Self {
        match self {
            ItemChange::Insert(item) => ItemChange::Remove(item.clone()),
            ItemChange::Remove(item) => ItemChange::Insert(item.clone()),
            ItemChange::Update { before, after } => ItemChange::Update {
                before: after.clone(),
                after: before.clone(),
            },
        }
    }
}

/// Changes turning one item graph into another
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemGraphDiff {
    /// Root item UUID before and after, when it changed
    pub root_change: Option<(Uuid, Uuid)>,
    /// Item changes ordered by UUID
    pub changes: Vec<ItemChange>,
}

impl ItemGraphDiff {
    /// Diff from `old` to `new`
    pub fn between(old: &ItemGraph, new: &ItemGraph) -> Self {
        let mut changes = Vec::new();
        for (uuid, after) in &new.items {
            match old.items.get(uuid) {
                None => changes.push(ItemChange::Insert(after.clone())),
                Some(before) if before != after => changes.push(ItemChange::Update {
                    before: before.clone(),
                    after: after.clone(),
                }),
                Some(_) => {}
            }
        }
        for (uuid, before) in &old.items {
            if !new.items.contains_key(uuid) {
                changes.push(ItemChange::Remove(before.clone()));
            }
        }
        changes.sort_by_key(ItemChange::uuid);

        Self {
            root_change: (old.root != new.root).then_some((old.root, new.root)),
            changes,
        }
    }

    /// The diff that undoes this one
    pub fn inverse(&self) -> Self {
        Self {
            root_change: self.root_change.map(|(before, after)| (after, before)),
            changes: self.changes.iter().map(ItemChange::inverse).collect(),
        }
    }

    /// Whether the diff changes nothing
    pub fn is_empty(&self) -> bool {
        self.root_change.is_none() && self.changes.is_empty()
    }

    /// UUIDs of the changed items
    pub fn changed_items(&self) -> Vec<Uuid> {
        self.changes.iter().map(ItemChange::uuid).collect()
    }

    /// Apply the diff to `graph`, producing a new validated graph
    pub fn apply_to(&self, graph: &ItemGraph) -> Result<ItemGraph> {
        let mut result = graph.clone();

        if let Some((before, after)) = self.root_change {
            if result.root == before {
                result.root = after;
            } else if result.root != after {
                return Err(conflict(result.root, "root item was replaced by a later change"));
            }
        }

        for change in &self.changes {
            match change {
                ItemChange::Insert(item) => match result.get(&item.uuid) {
                    None => {
                        result.insert(item.clone());
                    }
                    Some(existing) if existing == item => {}
                    Some(_) => return Err(conflict(item.uuid, "item already exists with different content")),
                },
                ItemChange::Update { before, after } => match result.get(&after.uuid) {
                    Some(existing) if existing == after => {}
                    Some(existing) if existing == before => {
                        result.insert(after.clone());
                    }
                    Some(_) => return Err(conflict(after.uuid, "item was modified by a later change")),
                    None => return Err(conflict(after.uuid, "item was removed by a later change")),
                },
                ItemChange::Remove(item) => match result.get(&item.uuid) {
                    None => {}
                    Some(existing) if existing == item => {
                        result.remove(&item.uuid);
                    }
                    Some(_) => return Err(conflict(item.uuid, "item was modified by a later change")),
                },
            }
        }

        result
            .validate()
            .map_err(|e| conflict(result.root, format!("result is not a valid item graph: {}", e)))?;
        Ok(result)
    }
}

fn conflict(item: Uuid, reason: impl Into<String>) -> VersoError {
    VersoError::SelectiveUndoConflict {
        item,
        reason: reason.into(),
    }
}
