//! History navigation
//!
//! A [`Track`] is a sequence of nodes with a current position that can move
//! back (undo) and forth (redo), plus selective undo and redo of a single
//! past node. Two kinds of tracks implement it:
//!
//! - [`BranchTrack`]: the revisions of one branch. Undo and redo move the
//!   branch's current pointer; nothing new is written unless the branch does
//!   not support revert.
//! - [`crate::undo::UndoTrack`]: recorded command groups spanning any number
//!   of persistent roots.
//!
//! Selective undo never moves the pointer. It computes the change the target
//! node made, inverts it, applies it to the current content and commits the
//! result as a new revision. If a later change touched the same items the
//! operation fails with [`VersoError::SelectiveUndoConflict`] and nothing is
//! committed.

use crate::catalog::Catalog;
use crate::diff::ItemGraphDiff;
use crate::error::{Result, VersoError};
use crate::history::RevisionGraph;
use crate::item_graph::ItemGraph;
use crate::store::Store;
use crate::types::{BranchInfo, Metadata, RevisionInfo, RevisionInfoOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// One position on a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackNode {
    /// Revision or command group UUID
    pub uuid: Uuid,
    /// Previous node in the node graph
    pub parent: Option<Uuid>,
    /// Commit order
    pub sequence: u64,
    /// Commit time
    pub timestamp: DateTime<Utc>,
    /// Metadata recorded with the node
    pub metadata: Metadata,
    /// Name of the track the node belongs to
    pub track: String,
}

/// Uniform navigation over branches and undo tracks
pub trait Track {
    /// Display name
    fn name(&self) -> String;

    /// Nodes from the start of the track to its head, oldest first
    fn nodes(&self) -> Result<Vec<TrackNode>>;

    /// Current node, `None` at the start of an empty track
    fn current_node(&self) -> Result<Option<TrackNode>>;

    /// Whether [`Track::undo`] would move
    fn can_undo(&self) -> Result<bool>;

    /// Whether [`Track::redo`] would move
    fn can_redo(&self) -> Result<bool>;

    /// Step back one node; returns false if there is nothing to undo
    fn undo(&self) -> Result<bool>;

    /// Step forward one node toward the head; returns false at the head
    fn redo(&self) -> Result<bool>;

    /// Revert only the change made by `node`, as a new commit
    fn undo_node(&self, node: Uuid) -> Result<()>;

    /// Re-apply only the change made by `node`, as a new commit
    fn redo_node(&self, node: Uuid) -> Result<()>;

    /// Move the current position to `node`
    fn set_current_node(&self, node: Uuid) -> Result<()>;
}

impl TrackNode {
    pub(crate) fn from_revision(info: &RevisionInfo, track: &str) -> Self {
        Self {
            uuid: info.uuid,
            parent: info.parent,
            sequence: info.sequence,
            timestamp: info.timestamp,
            metadata: info.metadata.clone(),
            track: track.to_string(),
        }
    }
}

/// Metadata of a commit made by a track operation
pub(crate) fn command_metadata(command: &str, target: Option<Uuid>) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("command".to_string(), serde_json::json!(command));
    if let Some(target) = target {
        metadata.insert("target".to_string(), serde_json::json!(target.to_string()));
    }
    metadata
}

const UNDONE_KEY: &str = "undone";

/// Revision whose content an "undo" commit restored
fn restored_by(info: &RevisionInfo) -> Option<Uuid> {
    if info.metadata.get("command").and_then(|c| c.as_str()) != Some("undo") {
        return None;
    }
    info.metadata
        .get("target")
        .and_then(|t| t.as_str())
        .and_then(|t| Uuid::parse_str(t).ok())
}

/// Position a non-revert branch is logically at
///
/// Each "undo" commit stands for the revision it restored. Restored
/// revisions are always ancestors, so the walk ends.
fn restored_position(graph: &RevisionGraph<'_>, mut revision: Uuid, initial: Option<Uuid>) -> Uuid {
    while Some(revision) != initial {
        match graph
            .get(&revision)
            .and_then(restored_by)
            .filter(|restored| graph.is_ancestor_or_equal(*restored, revision) && *restored != revision)
        {
            Some(restored) => revision = restored,
            None => break,
        }
    }
    revision
}

/// Track over the revisions of one branch
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use verso::{BranchTrack, Store, Track};
///
/// # fn main() -> verso::Result<()> {
/// let store = Arc::new(Store::open("./notes.verso")?);
/// let root = store.persistent_root_uuids()[0];
/// let track = BranchTrack::current(Arc::clone(&store), root)?;
/// if track.can_undo()? {
///     track.undo()?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct BranchTrack {
    store: Arc<Store>,
    persistent_root: Uuid,
    branch: Uuid,
}

impl BranchTrack {
    /// Track over `branch` of `persistent_root`
    pub fn new(store: Arc<Store>, persistent_root: Uuid, branch: Uuid) -> Result<Self> {
        let root = store
            .persistent_root_info(persistent_root)?
            .ok_or(VersoError::PersistentRootNotFound(persistent_root))?;
        if !root.branches.contains_key(&branch) {
            return Err(VersoError::BranchNotFound(branch));
        }
        Ok(Self {
            store,
            persistent_root,
            branch,
        })
    }

    /// Track over the current branch of `persistent_root`
    pub fn current(store: Arc<Store>, persistent_root: Uuid) -> Result<Self> {
        let root = store
            .persistent_root_info(persistent_root)?
            .ok_or(VersoError::PersistentRootNotFound(persistent_root))?;
        let branch = root.current_branch.ok_or_else(|| {
            VersoError::consistency(format!("persistent root {} has no current branch", persistent_root))
        })?;
        Self::new(store, persistent_root, branch)
    }

    /// Persistent root of the branch
    pub fn persistent_root(&self) -> Uuid {
        self.persistent_root
    }

    /// Branch UUID
    pub fn branch(&self) -> Uuid {
        self.branch
    }

    fn state(&self) -> Result<(Arc<Catalog>, BranchInfo)> {
        let catalog = self.store.catalog();
        let info = catalog
            .root(&self.persistent_root)
            .and_then(|root| root.branches.get(&self.branch))
            .cloned()
            .ok_or(VersoError::BranchNotFound(self.branch))?;
        Ok((catalog, info))
    }

    /// Parent of the effective current revision, if undo may move there
    fn undo_target(&self, catalog: &Catalog, info: &BranchInfo) -> Option<Uuid> {
        let current = info.current_revision?;
        let graph = catalog.backing_for_root(&self.persistent_root)?.graph();
        let effective = if info.supports_revert {
            current
        } else {
            restored_position(&graph, current, info.initial_revision)
        };
        if Some(effective) == info.initial_revision {
            return None;
        }
        graph.get(&effective)?.parent.filter(|parent| graph.contains(parent))
    }

    fn redo_target(&self, catalog: &Catalog, info: &BranchInfo) -> Option<Uuid> {
        let (current, head) = (info.current_revision?, info.head_revision?);
        if current == head {
            return None;
        }
        catalog
            .backing_for_root(&self.persistent_root)?
            .graph()
            .child_toward(current, head)
    }

    fn graph_of(&self, revision: Uuid) -> Result<ItemGraph> {
        self.store
            .item_graph(revision, self.persistent_root)?
            .ok_or(VersoError::RevisionNotFound(revision))
    }

    fn move_to(&self, current: Uuid, head: Option<Uuid>) -> Result<()> {
        let mut tx = self.store.transaction_for(&[self.persistent_root])?;
        tx.set_current_revision(self.persistent_root, self.branch, current, head);
        self.store.commit(tx)?;
        Ok(())
    }

    /// Commit `graph` on top of the current revision
    fn commit_on_current(&self, info: &BranchInfo, graph: ItemGraph, metadata: Metadata) -> Result<Uuid> {
        let mut tx = self.store.transaction_for(&[self.persistent_root])?;
        let revision = tx.commit_revision(self.persistent_root, self.branch, info.current_revision, graph, metadata);
        self.store.commit(tx)?;
        Ok(revision)
    }

    /// The change `revision` made relative to its parent
    fn change_of(&self, catalog: &Catalog, revision: Uuid) -> Result<ItemGraphDiff> {
        let info = catalog
            .revision_for_root(&self.persistent_root, &revision)
            .ok_or(VersoError::RevisionNotFound(revision))?;
        let parent = info.parent.ok_or_else(|| {
            VersoError::consistency(format!("revision {} has no parent to diff against", revision))
        })?;
        Ok(ItemGraphDiff::between(&self.graph_of(parent)?, &self.graph_of(revision)?))
    }

    fn apply_selective(&self, diff: ItemGraphDiff, command: &str, target: Uuid) -> Result<()> {
        let (_, info) = self.state()?;
        let current = info
            .current_revision
            .ok_or_else(|| VersoError::consistency(format!("branch {} has no revisions", self.branch)))?;
        let merged = diff.apply_to(&self.graph_of(current)?)?;
        let revision = self.commit_on_current(&info, merged, command_metadata(command, Some(target)))?;
        debug!("{} of {} committed as {}", command, target, revision);
        Ok(())
    }
}

impl Track for BranchTrack {
    fn name(&self) -> String {
        self.state()
            .map(|(_, info)| info.name())
            .unwrap_or_else(|_| self.branch.to_string())
    }

    fn nodes(&self) -> Result<Vec<TrackNode>> {
        let name = self.name();
        Ok(self
            .store
            .revision_infos(self.branch, RevisionInfoOptions::default())?
            .unwrap_or_default()
            .iter()
            .map(|info| TrackNode::from_revision(info, &name))
            .collect())
    }

    fn current_node(&self) -> Result<Option<TrackNode>> {
        let (catalog, info) = self.state()?;
        Ok(info
            .current_revision
            .and_then(|rev| catalog.revision_for_root(&self.persistent_root, &rev))
            .map(|rev| TrackNode::from_revision(rev, &info.name())))
    }

    fn can_undo(&self) -> Result<bool> {
        let (catalog, info) = self.state()?;
        Ok(self.undo_target(&catalog, &info).is_some())
    }

    fn can_redo(&self) -> Result<bool> {
        let (catalog, info) = self.state()?;
        Ok(self.redo_target(&catalog, &info).is_some())
    }

    #[instrument(skip(self), fields(branch = %self.branch))]
    fn undo(&self) -> Result<bool> {
        let (catalog, info) = self.state()?;
        let Some(parent) = self.undo_target(&catalog, &info) else {
            return Ok(false);
        };

        if info.supports_revert {
            self.move_to(parent, info.head_revision)?;
        } else {
            // Head must stay equal to current, so the parent's content is recommitted
            let graph = self.graph_of(parent)?;
            let mut metadata = command_metadata("undo", Some(parent));
            if let Some(undone) = info.current_revision {
                metadata.insert(UNDONE_KEY.to_string(), serde_json::json!(undone.to_string()));
            }
            self.commit_on_current(&info, graph, metadata)?;
        }
        debug!("Undid branch {} to {}", self.branch, parent);
        Ok(true)
    }

    #[instrument(skip(self), fields(branch = %self.branch))]
    fn redo(&self) -> Result<bool> {
        let (catalog, info) = self.state()?;
        let Some(child) = self.redo_target(&catalog, &info) else {
            return Ok(false);
        };
        self.move_to(child, info.head_revision)?;
        debug!("Redid branch {} to {}", self.branch, child);
        Ok(true)
    }

    #[instrument(skip(self), fields(branch = %self.branch))]
    fn undo_node(&self, node: Uuid) -> Result<()> {
        let (catalog, _) = self.state()?;
        let diff = self.change_of(&catalog, node)?.inverse();
        self.apply_selective(diff, "selective-undo", node)
    }

    #[instrument(skip(self), fields(branch = %self.branch))]
    fn redo_node(&self, node: Uuid) -> Result<()> {
        let (catalog, _) = self.state()?;
        let diff = self.change_of(&catalog, node)?;
        self.apply_selective(diff, "selective-redo", node)
    }

    fn set_current_node(&self, node: Uuid) -> Result<()> {
        self.move_to(node, None)
    }
}
