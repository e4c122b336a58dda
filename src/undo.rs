//! Persistent undo tracks
//!
//! An undo track records user actions as [`CommandGroup`]s. Each group is a
//! list of invertible [`Command`]s describing what one store transaction did
//! to the catalog: pointer moves, branch and root creation, deletion flags and
//! metadata edits. Revision content is never part of a command; revisions are
//! immutable and commands only point at them.
//!
//! Groups form a tree. Recording after an undo adds a sibling of the undone
//! group instead of discarding it, so every past state stays reachable through
//! [`UndoTrack::children_of_node`] and [`Track::set_current_node`].
//!
//! Track state lives in `undo/tracks.json` inside the store directory and is
//! replaced atomically under `undo/undo.lock`. Several processes may share a
//! track; each update re-reads the file under the lock.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use verso::{Metadata, Store, Track, UndoTrack, UndoTrackStore};
//!
//! # fn main() -> verso::Result<()> {
//! let store = Arc::new(Store::open("./notes.verso")?);
//! let tracks = UndoTrackStore::open(Arc::clone(&store))?;
//! let track = UndoTrack::open(&tracks, "editor")?;
//!
//! let root = store.persistent_root_uuids()[0];
//! let mut tx = store.transaction_for(&[root])?;
//! tx.delete_persistent_root(root);
//! track.commit(tx, Metadata::new())?;
//!
//! track.undo()?;
//! # Ok(())
//! # }
//! ```

use crate::catalog::Catalog;
use crate::diff::ItemGraphDiff;
use crate::error::{Result, VersoError};
use crate::flock::FileLock;
use crate::item_graph::ItemGraph;
use crate::store::{Store, UNDO_DIR};
use crate::track::{command_metadata, Track, TrackNode};
use crate::transaction::{Operation, StoreTransaction};
use crate::types::{CopySource, Metadata, StoreChangeNotification, TransactionId};
use crate::utils::atomic_write;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const TRACKS_FILE: &str = "tracks.json";
const UNDO_LOCK_FILE: &str = "undo.lock";

/// One invertible catalog change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// Branch current pointer moved
    SetBranchRevision {
        /// Owning root
        persistent_root: Uuid,
        /// Branch that moved
        branch: Uuid,
        /// Current revision before
        old_revision: Option<Uuid>,
        /// Current revision after
        new_revision: Option<Uuid>,
    },
    /// Current branch selection changed
    SetCurrentBranch {
        /// Owning root
        persistent_root: Uuid,
        /// Branch selected before
        old_branch: Option<Uuid>,
        /// Branch selected after
        new_branch: Option<Uuid>,
    },
    /// Branch created; with `retract` set, the creation is taken back
    CreateBranch {
        /// Owning root
        persistent_root: Uuid,
        /// Created branch
        branch: Uuid,
        /// Branch it was forked from
        parent_branch: Option<Uuid>,
        /// Starting revision
        initial_revision: Option<Uuid>,
        /// Branch metadata at creation
        metadata: Metadata,
        /// Applying soft-deletes the branch instead of creating it
        retract: bool,
    },
    /// Branch deletion flag changed
    SetBranchDeleted {
        /// Owning root
        persistent_root: Uuid,
        /// Branch
        branch: Uuid,
        /// Flag after the change
        deleted: bool,
    },
    /// Persistent root created; with `retract` set, the creation is taken back
    CreatePersistentRoot {
        /// Created root
        persistent_root: Uuid,
        /// Its initial branch
        initial_branch: Uuid,
        /// Root metadata at creation
        metadata: Metadata,
        /// Cheap-copy source
        copy_of: Option<CopySource>,
        /// Applying soft-deletes the root instead of creating it
        retract: bool,
    },
    /// Persistent root deletion flag changed
    SetPersistentRootDeleted {
        /// Root
        persistent_root: Uuid,
        /// Flag after the change
        deleted: bool,
    },
    /// Branch metadata replaced
    SetBranchMetadata {
        /// Owning root
        persistent_root: Uuid,
        /// Branch
        branch: Uuid,
        /// Metadata before
        old: Metadata,
        /// Metadata after
        new: Metadata,
    },
    /// Persistent root metadata replaced
    SetPersistentRootMetadata {
        /// Root
        persistent_root: Uuid,
        /// Metadata before
        old: Metadata,
        /// Metadata after
        new: Metadata,
    },
}

impl Command {
    /// Persistent root the command changes
    pub fn persistent_root(&self) -> Uuid {
        match self {
            Command::SetBranchRevision { persistent_root, .. }
            | Command::SetCurrentBranch { persistent_root, .. }
            | Command::CreateBranch { persistent_root, .. }
            | Command::SetBranchDeleted { persistent_root, .. }
            | Command::CreatePersistentRoot { persistent_root, .. }
            | Command::SetPersistentRootDeleted { persistent_root, .. }
            | Command::SetBranchMetadata { persistent_root, .. }
            | Command::SetPersistentRootMetadata { persistent_root, .. } => *persistent_root,
        }
    }

    /// The command that reverts this one; inverting twice gives the original
    pub fn inverse(&self) -> Self {
        let mut inverse = self.clone();
        match &mut inverse {
            Command::SetBranchRevision {
                old_revision,
                new_revision,
                ..
            } => std::mem::swap(old_revision, new_revision),
            Command::SetCurrentBranch {
                old_branch, new_branch, ..
            } => std::mem::swap(old_branch, new_branch),
            Command::CreateBranch { retract, .. } | Command::CreatePersistentRoot { retract, .. } => {
                *retract = !*retract
            }
            Command::SetBranchDeleted { deleted, .. } | Command::SetPersistentRootDeleted { deleted, .. } => {
                *deleted = !*deleted
            }
            Command::SetBranchMetadata { old, new, .. } | Command::SetPersistentRootMetadata { old, new, .. } => {
                std::mem::swap(old, new)
            }
        }
        inverse
    }

    /// Short name for logs and listings
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetBranchRevision { .. } => "set-branch-revision",
            Command::SetCurrentBranch { .. } => "set-current-branch",
            Command::CreateBranch { retract: false, .. } => "create-branch",
            Command::CreateBranch { retract: true, .. } => "retract-branch",
            Command::SetBranchDeleted { .. } => "set-branch-deleted",
            Command::CreatePersistentRoot { retract: false, .. } => "create-persistent-root",
            Command::CreatePersistentRoot { retract: true, .. } => "retract-persistent-root",
            Command::SetPersistentRootDeleted { .. } => "set-persistent-root-deleted",
            Command::SetBranchMetadata { .. } => "set-branch-metadata",
            Command::SetPersistentRootMetadata { .. } => "set-persistent-root-metadata",
        }
    }
}

/// A recorded user action: the commands of one or more coalesced commits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandGroup {
    /// Node UUID
    pub uuid: Uuid,
    /// Track position this group was recorded on top of
    pub parent: Option<Uuid>,
    /// Owning track
    pub track: String,
    /// Record order across all tracks of the store
    pub sequence: u64,
    /// Record time
    pub timestamp: DateTime<Utc>,
    /// Caller metadata (action name, ...)
    pub metadata: Metadata,
    /// Commands in application order
    pub commands: Vec<Command>,
}

impl CommandGroup {
    /// The group reverting this one: commands reversed and each inverted
    pub fn inverse(&self) -> Self {
        Self {
            commands: self.inverse_commands(),
            ..self.clone()
        }
    }

    /// Commands reverting the whole group, in application order
    pub fn inverse_commands(&self) -> Vec<Command> {
        self.commands.iter().rev().map(Command::inverse).collect()
    }

    /// Persistent roots the group changes
    pub fn persistent_roots(&self) -> BTreeSet<Uuid> {
        self.commands.iter().map(Command::persistent_root).collect()
    }

    fn node(&self) -> TrackNode {
        TrackNode {
            uuid: self.uuid,
            parent: self.parent,
            sequence: self.sequence,
            timestamp: self.timestamp,
            metadata: self.metadata.clone(),
            track: self.track.clone(),
        }
    }
}

/// Position of one track
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackState {
    /// Current node; `None` is the start of the track
    pub current: Option<Uuid>,
    /// Furthest node redo can reach
    pub head: Option<Uuid>,
}

/// Published after a track's position or nodes changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoTrackNotification {
    /// Track name
    pub track: String,
    /// New position; `None` when the track was cleared
    pub state: Option<TrackState>,
}

/// Observer of undo track changes
pub trait UndoTrackObserver: Send + Sync {
    /// Called after a track changed in this process or was seen changed on reload
    fn track_changed(&self, notification: &UndoTrackNotification) -> Result<()>;
}

impl<F> UndoTrackObserver for F
where
    F: Fn(&UndoTrackNotification) + Send + Sync,
{
    fn track_changed(&self, notification: &UndoTrackNotification) -> Result<()> {
        self(notification);
        Ok(())
    }
}

/// On-disk state of every track of a store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct UndoState {
    generation: u64,
    next_sequence: u64,
    tracks: BTreeMap<String, TrackState>,
    groups: BTreeMap<Uuid, CommandGroup>,
}

impl UndoState {
    fn load(path: &Path) -> Result<Self> {
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        atomic_write(path, &serde_json::to_vec_pretty(self)?)
    }

    fn track(&self, name: &str) -> Result<TrackState> {
        self.tracks
            .get(name)
            .copied()
            .ok_or_else(|| VersoError::UndoTrackNotFound(name.to_string()))
    }

    fn track_mut(&mut self, name: &str) -> Result<&mut TrackState> {
        self.tracks
            .get_mut(name)
            .ok_or_else(|| VersoError::UndoTrackNotFound(name.to_string()))
    }

    fn group(&self, track: &str, node: Uuid) -> Result<&CommandGroup> {
        self.groups
            .get(&node)
            .filter(|group| group.track == track)
            .ok_or_else(|| VersoError::invalid_argument(format!("node {} is not on undo track '{}'", node, track)))
    }

    fn groups_of<'a>(&'a self, track: &'a str) -> impl Iterator<Item = &'a CommandGroup> + 'a {
        self.groups.values().filter(move |group| group.track == track)
    }

    /// `node` and its ancestors, nearest first
    fn ancestors(&self, node: Option<Uuid>) -> Vec<Uuid> {
        let mut chain = Vec::new();
        let mut cursor = node;
        while let Some(uuid) = cursor {
            if chain.contains(&uuid) {
                break;
            }
            chain.push(uuid);
            cursor = self.groups.get(&uuid).and_then(|group| group.parent);
        }
        chain
    }

    fn is_ancestor_or_equal(&self, ancestor: Uuid, node: Option<Uuid>) -> bool {
        self.ancestors(node).contains(&ancestor)
    }

    /// Child of `current` on the path to `head`
    fn child_toward(&self, current: Option<Uuid>, head: Option<Uuid>) -> Option<Uuid> {
        if current == head {
            return None;
        }
        self.ancestors(head)
            .into_iter()
            .find(|uuid| self.groups.get(uuid).map(|group| group.parent) == Some(current))
    }

    /// Nodes to revert walking up from `from`, then to apply walking down to `to`
    fn path(&self, from: Option<Uuid>, to: Option<Uuid>) -> (Vec<Uuid>, Vec<Uuid>) {
        let up = self.ancestors(from);
        let down = self.ancestors(to);
        let common = up.iter().copied().find(|uuid| down.contains(uuid));
        let undo = up.into_iter().take_while(|uuid| Some(*uuid) != common).collect();
        let mut redo: Vec<Uuid> = down.into_iter().take_while(|uuid| Some(*uuid) != common).collect();
        redo.reverse();
        (undo, redo)
    }

    /// Append a group on top of `track`'s current node and move to it
    fn record(&mut self, track: &str, metadata: Metadata, commands: Vec<Command>) -> Result<Uuid> {
        let parent = self.track(track)?.current;
        let uuid = Uuid::new_v4();
        self.groups.insert(
            uuid,
            CommandGroup {
                uuid,
                parent,
                track: track.to_string(),
                sequence: self.next_sequence,
                timestamp: Utc::now(),
                metadata,
                commands,
            },
        );
        self.next_sequence += 1;
        let state = self.track_mut(track)?;
        state.current = Some(uuid);
        state.head = Some(uuid);
        Ok(uuid)
    }
}

/// Names of tracks whose position or groups differ between two states
fn changed_tracks(old: &UndoState, new: &UndoState) -> BTreeSet<String> {
    let mut changed: BTreeSet<String> = old
        .tracks
        .keys()
        .chain(new.tracks.keys())
        .filter(|name| old.tracks.get(*name) != new.tracks.get(*name))
        .cloned()
        .collect();
    for uuid in old.groups.keys().chain(new.groups.keys()) {
        let (before, after) = (old.groups.get(uuid), new.groups.get(uuid));
        if before != after {
            if let Some(group) = after.or(before) {
                changed.insert(group.track.clone());
            }
        }
    }
    changed
}

/// Catalog view that follows the operations of a transaction
struct WorkingView<'a> {
    catalog: &'a Catalog,
    currents: BTreeMap<Uuid, Option<Uuid>>,
    selected: BTreeMap<Uuid, Option<Uuid>>,
    root_metadata: BTreeMap<Uuid, Metadata>,
    branch_metadata: BTreeMap<Uuid, Metadata>,
}

impl<'a> WorkingView<'a> {
    fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            currents: BTreeMap::new(),
            selected: BTreeMap::new(),
            root_metadata: BTreeMap::new(),
            branch_metadata: BTreeMap::new(),
        }
    }

    fn current(&self, branch: Uuid) -> Option<Uuid> {
        match self.currents.get(&branch) {
            Some(current) => *current,
            None => self.catalog.branch(&branch).and_then(|b| b.current_revision),
        }
    }

    fn selected(&self, root: Uuid) -> Option<Uuid> {
        match self.selected.get(&root) {
            Some(branch) => *branch,
            None => self.catalog.root(&root).and_then(|r| r.current_branch),
        }
    }

    fn root_metadata(&self, root: Uuid) -> Metadata {
        self.root_metadata
            .get(&root)
            .cloned()
            .or_else(|| self.catalog.root(&root).map(|r| r.metadata.clone()))
            .unwrap_or_default()
    }

    fn branch_metadata(&self, branch: Uuid) -> Metadata {
        self.branch_metadata
            .get(&branch)
            .cloned()
            .or_else(|| self.catalog.branch(&branch).map(|b| b.metadata.clone()))
            .unwrap_or_default()
    }
}

/// Commands describing what `tx` does to `catalog`
pub fn commands_for(catalog: &Catalog, tx: &StoreTransaction) -> Vec<Command> {
    let mut view = WorkingView::new(catalog);
    let mut commands = Vec::new();

    for operation in tx.operations() {
        match operation {
            // Revisions are immutable and history compaction is not undoable
            Operation::WriteRevision(_) | Operation::SetInitialRevision { .. } => {}
            Operation::CreatePersistentRoot {
                uuid,
                initial_branch,
                metadata,
                copy_of,
            } => {
                view.currents.insert(*initial_branch, copy_of.map(|source| source.revision));
                view.selected.insert(*uuid, Some(*initial_branch));
                view.root_metadata.insert(*uuid, metadata.clone());
                view.branch_metadata.insert(*initial_branch, Metadata::new());
                commands.push(Command::CreatePersistentRoot {
                    persistent_root: *uuid,
                    initial_branch: *initial_branch,
                    metadata: metadata.clone(),
                    copy_of: *copy_of,
                    retract: false,
                });
            }
            Operation::CreateBranch {
                persistent_root,
                branch,
                parent_branch,
                initial_revision,
                metadata,
                ..
            } => {
                view.currents.insert(*branch, *initial_revision);
                view.branch_metadata.insert(*branch, metadata.clone());
                commands.push(Command::CreateBranch {
                    persistent_root: *persistent_root,
                    branch: *branch,
                    parent_branch: *parent_branch,
                    initial_revision: *initial_revision,
                    metadata: metadata.clone(),
                    retract: false,
                });
            }
            Operation::SetCurrentBranch { persistent_root, branch } => {
                let old_branch = view.selected(*persistent_root);
                if old_branch != Some(*branch) {
                    view.selected.insert(*persistent_root, Some(*branch));
                    commands.push(Command::SetCurrentBranch {
                        persistent_root: *persistent_root,
                        old_branch,
                        new_branch: Some(*branch),
                    });
                }
            }
            Operation::SetCurrentRevision {
                persistent_root,
                branch,
                current,
                ..
            } => {
                let old_revision = view.current(*branch);
                if old_revision != Some(*current) {
                    view.currents.insert(*branch, Some(*current));
                    commands.push(Command::SetBranchRevision {
                        persistent_root: *persistent_root,
                        branch: *branch,
                        old_revision,
                        new_revision: Some(*current),
                    });
                }
            }
            Operation::SetPersistentRootMetadata { persistent_root, metadata } => {
                let old = view.root_metadata(*persistent_root);
                view.root_metadata.insert(*persistent_root, metadata.clone());
                commands.push(Command::SetPersistentRootMetadata {
                    persistent_root: *persistent_root,
                    old,
                    new: metadata.clone(),
                });
            }
            Operation::SetBranchMetadata {
                persistent_root,
                branch,
                metadata,
            } => {
                let old = view.branch_metadata(*branch);
                view.branch_metadata.insert(*branch, metadata.clone());
                commands.push(Command::SetBranchMetadata {
                    persistent_root: *persistent_root,
                    branch: *branch,
                    old,
                    new: metadata.clone(),
                });
            }
            Operation::DeletePersistentRoot(uuid) | Operation::UndeletePersistentRoot(uuid) => {
                commands.push(Command::SetPersistentRootDeleted {
                    persistent_root: *uuid,
                    deleted: matches!(operation, Operation::DeletePersistentRoot(_)),
                });
            }
            Operation::DeleteBranch { persistent_root, branch } | Operation::UndeleteBranch { persistent_root, branch } => {
                commands.push(Command::SetBranchDeleted {
                    persistent_root: *persistent_root,
                    branch: *branch,
                    deleted: matches!(operation, Operation::DeleteBranch { .. }),
                });
            }
        }
    }
    commands
}

/// Applies commands to the store as a single transaction
///
/// A pointer move whose branch has moved on since the command was recorded
/// is replayed as a content change on top of the branch's current revision.
struct Replay<'a> {
    store: &'a Store,
    catalog: Arc<Catalog>,
    tx: StoreTransaction,
    currents: BTreeMap<Uuid, Option<Uuid>>,
    pending: BTreeMap<Uuid, ItemGraph>,
    created: BTreeSet<Uuid>,
    applied: Vec<Command>,
}

impl<'a> Replay<'a> {
    fn new(store: &'a Store) -> Self {
        Self {
            store,
            catalog: store.catalog(),
            tx: StoreTransaction::new(),
            currents: BTreeMap::new(),
            pending: BTreeMap::new(),
            created: BTreeSet::new(),
            applied: Vec::new(),
        }
    }

    /// Apply `commands`; returns the commands as they took effect
    fn run(mut self, commands: &[Command]) -> Result<Vec<Command>> {
        for command in commands {
            self.apply(command)?;
        }
        let Replay {
            store,
            catalog,
            mut tx,
            applied,
            ..
        } = self;
        if tx.is_empty() {
            return Ok(applied);
        }

        for root in tx.touched_persistent_roots() {
            if tx.old_transaction_id(&root).is_none() {
                let id = catalog
                    .root(&root)
                    .map(|info| info.transaction_id)
                    .unwrap_or(TransactionId::NONEXISTENT);
                tx.set_old_transaction_id(root, id);
            }
        }
        store.commit(tx)?;
        Ok(applied)
    }

    fn root_exists(&self, root: Uuid) -> bool {
        self.created.contains(&root) || self.catalog.root(&root).is_some()
    }

    fn branch_exists(&self, root: Uuid, branch: Uuid) -> bool {
        self.created.contains(&branch)
            || self
                .catalog
                .root(&root)
                .is_some_and(|info| info.branches.contains_key(&branch))
    }

    fn current(&self, branch: Uuid) -> Option<Uuid> {
        match self.currents.get(&branch) {
            Some(current) => *current,
            None => self.catalog.branch(&branch).and_then(|b| b.current_revision),
        }
    }

    fn graph(&self, root: Uuid, revision: Uuid) -> Result<ItemGraph> {
        if let Some(graph) = self.pending.get(&revision) {
            return Ok(graph.clone());
        }
        self.store
            .item_graph(revision, root)?
            .ok_or(VersoError::RevisionNotFound(revision))
    }

    fn apply(&mut self, command: &Command) -> Result<()> {
        match command {
            Command::SetBranchRevision {
                persistent_root,
                branch,
                old_revision,
                new_revision,
            } => {
                let Some(target) = *new_revision else {
                    // A branch never returns to having no revision
                    return Ok(());
                };
                let current = self.current(*branch);
                if current == Some(target) {
                    return Ok(());
                }
                let landed = match (*old_revision, current) {
                    (Some(expected), Some(actual)) if expected != actual => {
                        let change = ItemGraphDiff::between(
                            &self.graph(*persistent_root, expected)?,
                            &self.graph(*persistent_root, target)?,
                        );
                        let merged = change.apply_to(&self.graph(*persistent_root, actual)?)?;
                        let revision = self.tx.commit_revision(
                            *persistent_root,
                            *branch,
                            Some(actual),
                            merged.clone(),
                            command_metadata("replay", Some(target)),
                        );
                        self.pending.insert(revision, merged);
                        revision
                    }
                    _ => {
                        self.tx.set_current_revision(*persistent_root, *branch, target, None);
                        target
                    }
                };
                self.currents.insert(*branch, Some(landed));
                self.applied.push(Command::SetBranchRevision {
                    persistent_root: *persistent_root,
                    branch: *branch,
                    old_revision: current,
                    new_revision: Some(landed),
                });
                return Ok(());
            }
            Command::SetCurrentBranch {
                persistent_root,
                new_branch,
                ..
            } => {
                if let Some(branch) = new_branch {
                    self.tx.set_current_branch(*persistent_root, *branch);
                }
            }
            Command::CreateBranch {
                persistent_root,
                branch,
                parent_branch,
                initial_revision,
                metadata,
                retract,
            } => {
                if *retract {
                    self.tx.delete_branch(*persistent_root, *branch);
                } else if self.branch_exists(*persistent_root, *branch) {
                    self.tx.undelete_branch(*persistent_root, *branch);
                } else {
                    self.tx.push(Operation::CreateBranch {
                        persistent_root: *persistent_root,
                        branch: *branch,
                        parent_branch: *parent_branch,
                        initial_revision: *initial_revision,
                        metadata: metadata.clone(),
                        supports_revert: None,
                    });
                    self.created.insert(*branch);
                    self.currents.insert(*branch, *initial_revision);
                }
            }
            Command::SetBranchDeleted {
                persistent_root,
                branch,
                deleted,
            } => {
                if *deleted {
                    self.tx.delete_branch(*persistent_root, *branch);
                } else {
                    self.tx.undelete_branch(*persistent_root, *branch);
                }
            }
            Command::CreatePersistentRoot {
                persistent_root,
                initial_branch,
                metadata,
                copy_of,
                retract,
            } => {
                if *retract {
                    self.tx.delete_persistent_root(*persistent_root);
                } else if self.root_exists(*persistent_root) {
                    self.tx.undelete_persistent_root(*persistent_root);
                } else {
                    self.tx.push(Operation::CreatePersistentRoot {
                        uuid: *persistent_root,
                        initial_branch: *initial_branch,
                        metadata: metadata.clone(),
                        copy_of: *copy_of,
                    });
                    self.created.insert(*persistent_root);
                    self.created.insert(*initial_branch);
                    self.currents.insert(*initial_branch, copy_of.map(|source| source.revision));
                }
            }
            Command::SetPersistentRootDeleted {
                persistent_root,
                deleted,
            } => {
                if *deleted {
                    self.tx.delete_persistent_root(*persistent_root);
                } else {
                    self.tx.undelete_persistent_root(*persistent_root);
                }
            }
            Command::SetBranchMetadata {
                persistent_root,
                branch,
                new,
                ..
            } => self.tx.set_branch_metadata(*persistent_root, *branch, new.clone()),
            Command::SetPersistentRootMetadata {
                persistent_root, new, ..
            } => self.tx.set_persistent_root_metadata(*persistent_root, new.clone()),
        }
        self.applied.push(command.clone());
        Ok(())
    }
}

/// Shared state of every undo track of one store
pub struct UndoTrackStore {
    store: Arc<Store>,
    dir: PathBuf,
    state: RwLock<Arc<UndoState>>,
    write_lock: Mutex<()>,
    observers: Mutex<Vec<Box<dyn UndoTrackObserver>>>,
}

impl std::fmt::Debug for UndoTrackStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("UndoTrackStore")
            .field("dir", &self.dir)
            .field("tracks", &state.tracks.len())
            .field("groups", &state.groups.len())
            .field("observers", &self.observers.lock().len())
            .finish()
    }
}

impl UndoTrackStore {
    /// Open the undo tracks kept inside `store`
    pub fn open(store: Arc<Store>) -> Result<Arc<Self>> {
        let dir = store.path().join(UNDO_DIR);
        fs::create_dir_all(&dir)?;
        let state = UndoState::load(&dir.join(TRACKS_FILE))?;
        debug!(
            "Opened undo tracks at {:?} ({} tracks, {} groups)",
            dir,
            state.tracks.len(),
            state.groups.len()
        );
        Ok(Arc::new(Self {
            store,
            dir,
            state: RwLock::new(Arc::new(state)),
            write_lock: Mutex::new(()),
            observers: Mutex::new(Vec::new()),
        }))
    }

    /// Store the tracks belong to
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Names of every track
    pub fn track_names(&self) -> Vec<String> {
        self.snapshot().tracks.keys().cloned().collect()
    }

    /// Every recorded group of every track, in record order
    pub fn all_command_groups(&self) -> Vec<CommandGroup> {
        let mut groups: Vec<CommandGroup> = self.snapshot().groups.values().cloned().collect();
        groups.sort_by_key(|group| group.sequence);
        groups
    }

    /// Register an observer of track changes
    pub fn add_observer(&self, observer: Box<dyn UndoTrackObserver>) {
        self.observers.lock().push(observer);
    }

    /// Pick up changes other processes made; returns the changed track names
    pub fn reload(&self) -> Result<BTreeSet<String>> {
        let notifications = {
            let _guard = self.write_lock.lock();
            let fresh = Arc::new(UndoState::load(&self.tracks_path())?);
            let old = std::mem::replace(&mut *self.state.write(), Arc::clone(&fresh));
            notifications_for(&old, &fresh)
        };
        let changed = notifications.iter().map(|n| n.track.clone()).collect();
        self.notify(&notifications);
        Ok(changed)
    }

    fn tracks_path(&self) -> PathBuf {
        self.dir.join(TRACKS_FILE)
    }

    fn snapshot(&self) -> Arc<UndoState> {
        Arc::clone(&self.state.read())
    }

    /// Run `f` on the freshest on-disk state and persist the result
    ///
    /// Nothing is saved when `f` fails. Observers run after the locks are
    /// released.
    fn update<R>(&self, f: impl FnOnce(&mut UndoState) -> Result<R>) -> Result<R> {
        let (result, notifications) = {
            let _guard = self.write_lock.lock();
            let _lock = FileLock::acquire(self.dir.join(UNDO_LOCK_FILE))?;
            let path = self.tracks_path();
            let before = UndoState::load(&path)?;
            let mut state = before.clone();
            let result = f(&mut state)?;

            if state != before {
                state.generation += 1;
                state.save(&path)?;
            }
            let fresh = Arc::new(state);
            let old = std::mem::replace(&mut *self.state.write(), Arc::clone(&fresh));
            (result, notifications_for(&old, &fresh))
        };
        self.notify(&notifications);
        Ok(result)
    }

    fn notify(&self, notifications: &[UndoTrackNotification]) {
        let observers = self.observers.lock();
        for notification in notifications {
            for observer in observers.iter() {
                if let Err(e) = observer.track_changed(notification) {
                    warn!("Undo track observer failed for '{}': {}", notification.track, e);
                }
            }
        }
    }
}

fn notifications_for(old: &UndoState, new: &UndoState) -> Vec<UndoTrackNotification> {
    changed_tracks(old, new)
        .into_iter()
        .map(|track| UndoTrackNotification {
            state: new.tracks.get(&track).copied(),
            track,
        })
        .collect()
}

/// A named, persistent undo track
pub struct UndoTrack {
    tracks: Arc<UndoTrackStore>,
    name: String,
    // None: not coalescing; Some(None): coalescing, nothing recorded yet
    coalescing: Mutex<Option<Option<Uuid>>>,
}

impl std::fmt::Debug for UndoTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoTrack")
            .field("name", &self.name)
            .field("coalescing", &self.is_coalescing())
            .finish()
    }
}

impl UndoTrack {
    /// Open the track called `name`, creating it if needed
    pub fn open(tracks: &Arc<UndoTrackStore>, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(VersoError::invalid_argument("undo track name must not be empty"));
        }
        tracks.update(|state| {
            state.tracks.entry(name.clone()).or_default();
            Ok(())
        })?;
        Ok(Self::handle(tracks, name))
    }

    fn handle(tracks: &Arc<UndoTrackStore>, name: String) -> Self {
        Self {
            tracks: Arc::clone(tracks),
            name,
            coalescing: Mutex::new(None),
        }
    }

    fn store(&self) -> &Store {
        &self.tracks.store
    }

    /// Current position
    pub fn state(&self) -> Result<TrackState> {
        self.tracks.snapshot().track(&self.name)
    }

    /// Record `commands` as a new node (or into the coalescing group)
    pub fn record_command(&self, commands: Vec<Command>, metadata: Metadata) -> Result<Uuid> {
        self.tracks.update(|state| self.record_locked(state, commands, metadata))
    }

    fn record_locked(&self, state: &mut UndoState, commands: Vec<Command>, metadata: Metadata) -> Result<Uuid> {
        let position = state.track(&self.name)?;
        let mut coalescing = self.coalescing.lock();
        if let Some(Some(group)) = *coalescing {
            if position.current == Some(group) {
                if let Some(open) = state.groups.get_mut(&group) {
                    open.commands.extend(commands);
                    return Ok(group);
                }
            }
        }
        let uuid = state.record(&self.name, metadata, commands)?;
        if coalescing.is_some() {
            *coalescing = Some(Some(uuid));
        }
        Ok(uuid)
    }

    /// Commit `tx` to the store and record what it did
    ///
    /// The track must exist before the store is touched; a transaction that
    /// changes no catalog state commits without recording a node.
    #[instrument(skip(self, tx, metadata), fields(track = %self.name))]
    pub fn commit(&self, tx: StoreTransaction, metadata: Metadata) -> Result<StoreChangeNotification> {
        self.tracks.update(|state| {
            state.track(&self.name)?;
            let commands = commands_for(&self.store().catalog(), &tx);
            let notification = self.store().commit(tx)?;
            if !commands.is_empty() {
                let node = self.record_locked(state, commands, metadata)?;
                debug!("Recorded node {} on '{}'", node, self.name);
            }
            Ok(notification)
        })
    }

    /// Nodes recorded on top of `node` (`None` for the start of the track)
    pub fn children_of_node(&self, node: Option<Uuid>) -> Result<Vec<CommandGroup>> {
        let state = self.tracks.snapshot();
        state.track(&self.name)?;
        let mut children: Vec<CommandGroup> = state
            .groups_of(&self.name)
            .filter(|group| group.parent == node)
            .cloned()
            .collect();
        children.sort_by_key(|group| group.sequence);
        Ok(children)
    }

    /// Every group ever recorded on the track, in record order
    pub fn all_command_groups(&self) -> Result<Vec<CommandGroup>> {
        let state = self.tracks.snapshot();
        state.track(&self.name)?;
        let mut groups: Vec<CommandGroup> = state.groups_of(&self.name).cloned().collect();
        groups.sort_by_key(|group| group.sequence);
        Ok(groups)
    }

    /// Recorded group by UUID
    pub fn command_group(&self, node: Uuid) -> Option<CommandGroup> {
        self.tracks.snapshot().group(&self.name, node).ok().cloned()
    }

    /// Start merging subsequent records into one node
    pub fn begin_coalescing(&self) {
        *self.coalescing.lock() = Some(None);
    }

    /// Stop merging records
    pub fn end_coalescing(&self) {
        *self.coalescing.lock() = None;
    }

    /// Whether records are being merged
    pub fn is_coalescing(&self) -> bool {
        self.coalescing.lock().is_some()
    }

    /// Delete the track and every node recorded on it
    pub fn clear(&self) -> Result<()> {
        self.tracks.update(|state| {
            state
                .tracks
                .remove(&self.name)
                .ok_or_else(|| VersoError::UndoTrackNotFound(self.name.clone()))?;
            state.groups.retain(|_, group| group.track != self.name);
            Ok(())
        })?;
        self.end_coalescing();
        info!("Cleared undo track '{}'", self.name);
        Ok(())
    }

    fn redo_candidate(&self, state: &UndoState) -> Result<Option<Uuid>> {
        let position = state.track(&self.name)?;
        Ok(state.child_toward(position.current, position.head))
    }

    /// Re-apply or revert a single node as a new recorded node
    fn selective(&self, node: Uuid, invert: bool) -> Result<()> {
        self.tracks.update(|state| {
            let group = state.group(&self.name, node)?;
            let commands = if invert {
                group.inverse_commands()
            } else {
                group.commands.clone()
            };
            let applied = Replay::new(self.store()).run(&commands)?;
            if !applied.is_empty() {
                let command = if invert { "selective-undo" } else { "selective-redo" };
                state.record(&self.name, command_metadata(command, Some(node)), applied)?;
            }
            Ok(())
        })
    }
}

impl Track for UndoTrack {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn nodes(&self) -> Result<Vec<TrackNode>> {
        let state = self.tracks.snapshot();
        let position = state.track(&self.name)?;
        let mut nodes: Vec<TrackNode> = state
            .ancestors(position.head)
            .iter()
            .filter_map(|uuid| state.groups.get(uuid))
            .map(CommandGroup::node)
            .collect();
        nodes.reverse();
        Ok(nodes)
    }

    fn current_node(&self) -> Result<Option<TrackNode>> {
        let state = self.tracks.snapshot();
        let position = state.track(&self.name)?;
        Ok(position
            .current
            .and_then(|uuid| state.groups.get(&uuid))
            .map(CommandGroup::node))
    }

    fn can_undo(&self) -> Result<bool> {
        Ok(self.state()?.current.is_some())
    }

    fn can_redo(&self) -> Result<bool> {
        Ok(self.redo_candidate(&self.tracks.snapshot())?.is_some())
    }

    #[instrument(skip(self), fields(track = %self.name))]
    fn undo(&self) -> Result<bool> {
        self.tracks.update(|state| {
            let Some(current) = state.track(&self.name)?.current else {
                return Ok(false);
            };
            let group = state.group(&self.name, current)?;
            let parent = group.parent;
            Replay::new(self.store()).run(&group.inverse_commands())?;
            state.track_mut(&self.name)?.current = parent;
            debug!("Undid node {} on '{}'", current, self.name);
            Ok(true)
        })
    }

    #[instrument(skip(self), fields(track = %self.name))]
    fn redo(&self) -> Result<bool> {
        self.tracks.update(|state| {
            let Some(child) = self.redo_candidate(state)? else {
                return Ok(false);
            };
            let commands = state.group(&self.name, child)?.commands.clone();
            Replay::new(self.store()).run(&commands)?;
            state.track_mut(&self.name)?.current = Some(child);
            debug!("Redid node {} on '{}'", child, self.name);
            Ok(true)
        })
    }

    fn undo_node(&self, node: Uuid) -> Result<()> {
        self.selective(node, true)
    }

    fn redo_node(&self, node: Uuid) -> Result<()> {
        self.selective(node, false)
    }

    #[instrument(skip(self), fields(track = %self.name))]
    fn set_current_node(&self, node: Uuid) -> Result<()> {
        self.tracks.update(|state| {
            state.group(&self.name, node)?;
            let position = state.track(&self.name)?;
            let (up, down) = state.path(position.current, Some(node));

            let mut commands = Vec::new();
            for uuid in &up {
                commands.extend(state.group(&self.name, *uuid)?.inverse_commands());
            }
            for uuid in &down {
                commands.extend(state.group(&self.name, *uuid)?.commands.iter().cloned());
            }
            Replay::new(self.store()).run(&commands)?;

            let keep_head = state.is_ancestor_or_equal(node, position.head);
            let position = state.track_mut(&self.name)?;
            position.current = Some(node);
            if !keep_head {
                position.head = Some(node);
            }
            Ok(())
        })
    }
}

/// Read-only union of every track whose name matches a glob pattern
///
/// Undo steps back on the member holding the most recent current node; redo
/// steps forward on the member whose next node is oldest.
#[derive(Debug)]
pub struct PatternTrack {
    tracks: Arc<UndoTrackStore>,
    pattern: String,
    matcher: GlobMatcher,
}

impl PatternTrack {
    /// Track over the members matching `pattern`
    pub fn new(tracks: &Arc<UndoTrackStore>, pattern: &str) -> Result<Self> {
        let matcher = Glob::new(pattern)?.compile_matcher();
        Ok(Self {
            tracks: Arc::clone(tracks),
            pattern: pattern.to_string(),
            matcher,
        })
    }

    /// The glob pattern
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Names of the matching tracks
    pub fn member_names(&self) -> Vec<String> {
        self.tracks
            .track_names()
            .into_iter()
            .filter(|name| self.matcher.is_match(name))
            .collect()
    }

    fn members(&self) -> Vec<UndoTrack> {
        self.member_names()
            .into_iter()
            .map(|name| UndoTrack::handle(&self.tracks, name))
            .collect()
    }

    fn owner(&self, node: Uuid) -> Result<UndoTrack> {
        let state = self.tracks.snapshot();
        let group = state
            .groups
            .get(&node)
            .filter(|group| self.matcher.is_match(&group.track))
            .ok_or_else(|| {
                VersoError::invalid_argument(format!("node {} is not on a track matching '{}'", node, self.pattern))
            })?;
        Ok(UndoTrack::handle(&self.tracks, group.track.clone()))
    }

    /// Pattern tracks cannot record
    pub fn record_command(&self, _commands: Vec<Command>, _metadata: Metadata) -> Result<Uuid> {
        Err(VersoError::ReadOnlyTrack(self.pattern.clone()))
    }

    /// Pattern tracks cannot record
    pub fn commit(&self, _tx: StoreTransaction, _metadata: Metadata) -> Result<StoreChangeNotification> {
        Err(VersoError::ReadOnlyTrack(self.pattern.clone()))
    }

    fn undo_member(&self) -> Result<Option<UndoTrack>> {
        let mut best: Option<(u64, UndoTrack)> = None;
        for member in self.members() {
            if let Some(node) = member.current_node()? {
                if best.as_ref().map_or(true, |(sequence, _)| node.sequence > *sequence) {
                    best = Some((node.sequence, member));
                }
            }
        }
        Ok(best.map(|(_, member)| member))
    }

    fn redo_member(&self) -> Result<Option<UndoTrack>> {
        let state = self.tracks.snapshot();
        let mut best: Option<(u64, UndoTrack)> = None;
        for member in self.members() {
            let candidate = member
                .redo_candidate(&state)?
                .and_then(|uuid| state.groups.get(&uuid))
                .map(|group| group.sequence);
            if let Some(sequence) = candidate {
                if best.as_ref().map_or(true, |(best_sequence, _)| sequence < *best_sequence) {
                    best = Some((sequence, member));
                }
            }
        }
        Ok(best.map(|(_, member)| member))
    }
}

impl Track for PatternTrack {
    fn name(&self) -> String {
        self.pattern.clone()
    }

    fn nodes(&self) -> Result<Vec<TrackNode>> {
        let mut nodes = Vec::new();
        for member in self.members() {
            nodes.extend(member.nodes()?);
        }
        nodes.sort_by_key(|node| node.sequence);
        Ok(nodes)
    }

    fn current_node(&self) -> Result<Option<TrackNode>> {
        let mut current: Option<TrackNode> = None;
        for member in self.members() {
            if let Some(node) = member.current_node()? {
                if current.as_ref().map_or(true, |best| node.sequence > best.sequence) {
                    current = Some(node);
                }
            }
        }
        Ok(current)
    }

    fn can_undo(&self) -> Result<bool> {
        Ok(self.undo_member()?.is_some())
    }

    fn can_redo(&self) -> Result<bool> {
        Ok(self.redo_member()?.is_some())
    }

    fn undo(&self) -> Result<bool> {
        match self.undo_member()? {
            Some(member) => member.undo(),
            None => Ok(false),
        }
    }

    fn redo(&self) -> Result<bool> {
        match self.redo_member()? {
            Some(member) => member.redo(),
            None => Ok(false),
        }
    }

    fn undo_node(&self, node: Uuid) -> Result<()> {
        self.owner(node)?.undo_node(node)
    }

    fn redo_node(&self, node: Uuid) -> Result<()> {
        self.owner(node)?.redo_node(node)
    }

    fn set_current_node(&self, node: Uuid) -> Result<()> {
        self.owner(node)?.set_current_node(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item_graph::{Item, Value};
    use tempfile::TempDir;

    struct Fixture {
        store: Arc<Store>,
        tracks: Arc<UndoTrackStore>,
        _temp: TempDir,
    }

    struct Doc {
        root: Uuid,
        branch: Uuid,
        title: Uuid,
        body: Uuid,
    }

    fn setup() -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(Store::init(temp.path().join("store")).unwrap());
        let tracks = UndoTrackStore::open(Arc::clone(&store)).unwrap();
        Fixture {
            store,
            tracks,
            _temp: temp,
        }
    }

    fn document() -> (ItemGraph, Uuid, Uuid) {
        let title = Item::new("Title", "text", 1).with("text", "Draft");
        let body = Item::new("Body", "text", 1).with("text", "hello");
        let (title_id, body_id) = (title.uuid, body.uuid);
        let mut graph = ItemGraph::new(Item::new("Document", "text", 1).with(
            "parts",
            Value::Array(vec![Value::Composite(title_id), Value::Composite(body_id)]),
        ));
        graph.insert(title);
        graph.insert(body);
        (graph, title_id, body_id)
    }

    fn action(name: &str) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("action".to_string(), serde_json::json!(name));
        metadata
    }

    impl Fixture {
        fn create(&self, track: &UndoTrack) -> Doc {
            let (graph, title, body) = document();
            let mut tx = StoreTransaction::new();
            let (root, branch, _) = tx.create_persistent_root_with_graph(graph, Metadata::new());
            track.commit(tx, action("create")).unwrap();
            Doc {
                root,
                branch,
                title,
                body,
            }
        }

        fn current(&self, doc: &Doc) -> Uuid {
            self.store.branch_info(doc.branch).unwrap().unwrap().current_revision.unwrap()
        }

        fn edit_tx(&self, doc: &Doc, item: Uuid, text: &str) -> StoreTransaction {
            let current = self.current(doc);
            let mut graph = self.store.item_graph(current, doc.root).unwrap().unwrap();
            graph.get_mut(&item).unwrap().set("text", text);
            let mut tx = self.store.transaction_for(&[doc.root]).unwrap();
            tx.commit_revision(doc.root, doc.branch, Some(current), graph, Metadata::new());
            tx
        }

        fn edit(&self, track: &UndoTrack, doc: &Doc, item: Uuid, text: &str) {
            track.commit(self.edit_tx(doc, item, text), action("edit")).unwrap();
        }

        fn text(&self, doc: &Doc, item: Uuid) -> String {
            let graph = self.store.item_graph(self.current(doc), doc.root).unwrap().unwrap();
            graph.get(&item).unwrap().get_str("text").unwrap().to_string()
        }

        fn root_deleted(&self, doc: &Doc) -> bool {
            self.store.persistent_root_info(doc.root).unwrap().unwrap().deleted
        }
    }

    #[test]
    fn test_undo_redo_across_creation() {
        let fx = setup();
        let track = UndoTrack::open(&fx.tracks, "editor").unwrap();
        let doc = fx.create(&track);
        let r1 = fx.current(&doc);
        fx.edit(&track, &doc, doc.title, "Final");

        assert!(track.undo().unwrap());
        assert_eq!(fx.current(&doc), r1);
        assert!(track.undo().unwrap());
        assert!(fx.root_deleted(&doc));
        assert!(!track.can_undo().unwrap());
        assert!(!track.undo().unwrap());

        assert!(track.redo().unwrap());
        assert!(!fx.root_deleted(&doc));
        assert!(track.redo().unwrap());
        assert_eq!(fx.text(&doc, doc.title), "Final");
        assert!(!track.can_redo().unwrap());
        assert_eq!(track.nodes().unwrap().len(), 2);
    }

    #[test]
    fn test_record_after_undo_creates_sibling() {
        let fx = setup();
        let track = UndoTrack::open(&fx.tracks, "editor").unwrap();
        let doc = fx.create(&track);
        let first = track.current_node().unwrap().unwrap().uuid;
        fx.edit(&track, &doc, doc.title, "A");
        let abandoned = track.current_node().unwrap().unwrap().uuid;

        track.undo().unwrap();
        fx.edit(&track, &doc, doc.title, "B");
        let replacement = track.current_node().unwrap().unwrap();

        assert_eq!(replacement.parent, Some(first));
        let children: Vec<Uuid> = track
            .children_of_node(Some(first))
            .unwrap()
            .iter()
            .map(|g| g.uuid)
            .collect();
        assert_eq!(children, vec![abandoned, replacement.uuid]);
        assert!(!track.can_redo().unwrap());
        assert_eq!(track.all_command_groups().unwrap().len(), 3);

        // The abandoned node is still reachable
        track.set_current_node(abandoned).unwrap();
        assert_eq!(fx.text(&doc, doc.title), "A");
        assert_eq!(track.state().unwrap().head, Some(abandoned));
    }

    #[test]
    fn test_selective_undo_records_new_node() {
        let fx = setup();
        let track = UndoTrack::open(&fx.tracks, "editor").unwrap();
        let doc = fx.create(&track);
        fx.edit(&track, &doc, doc.title, "Final");
        let title_edit = track.current_node().unwrap().unwrap().uuid;
        fx.edit(&track, &doc, doc.body, "goodbye");

        track.undo_node(title_edit).unwrap();
        assert_eq!(fx.text(&doc, doc.title), "Draft");
        assert_eq!(fx.text(&doc, doc.body), "goodbye");

        let node = track.current_node().unwrap().unwrap();
        assert_eq!(node.metadata["command"], "selective-undo");
        assert_eq!(track.nodes().unwrap().len(), 4);

        // Plain undo of the selective node restores the title edit
        track.undo().unwrap();
        assert_eq!(fx.text(&doc, doc.title), "Final");
    }

    #[test]
    fn test_failed_undo_leaves_track_unchanged() {
        let fx = setup();
        let track = UndoTrack::open(&fx.tracks, "editor").unwrap();
        let doc = fx.create(&track);
        fx.edit(&track, &doc, doc.title, "Final");
        let first_edit = track.current_node().unwrap().unwrap().uuid;
        fx.edit(&track, &doc, doc.title, "Final v2");
        let before = track.state().unwrap();
        let revision = fx.current(&doc);

        let err = track.undo_node(first_edit).unwrap_err();
        assert!(matches!(err, VersoError::SelectiveUndoConflict { .. }));
        assert_eq!(track.state().unwrap(), before);
        assert_eq!(fx.current(&doc), revision);
    }

    #[test]
    fn test_coalescing_merges_records() {
        let fx = setup();
        let track = UndoTrack::open(&fx.tracks, "editor").unwrap();
        let doc = fx.create(&track);
        let r1 = fx.current(&doc);

        track.begin_coalescing();
        fx.edit(&track, &doc, doc.title, "Final");
        fx.edit(&track, &doc, doc.body, "goodbye");
        track.end_coalescing();

        assert_eq!(track.all_command_groups().unwrap().len(), 2);
        let group = track.command_group(track.state().unwrap().current.unwrap()).unwrap();
        assert_eq!(group.commands.len(), 2);

        track.undo().unwrap();
        assert_eq!(fx.current(&doc), r1);
    }

    #[test]
    fn test_branch_commands_invert() {
        let fx = setup();
        let track = UndoTrack::open(&fx.tracks, "editor").unwrap();
        let doc = fx.create(&track);

        let mut tx = fx.store.transaction_for(&[doc.root]).unwrap();
        let feature = tx.create_branch(doc.root, Some(doc.branch), Some(fx.current(&doc)), action("feature"));
        tx.set_current_branch(doc.root, feature);
        track.commit(tx, action("branch")).unwrap();

        let group = track.command_group(track.state().unwrap().current.unwrap()).unwrap();
        let names: Vec<&str> = group.commands.iter().map(Command::name).collect();
        assert_eq!(names, vec!["create-branch", "set-current-branch"]);
        for command in &group.commands {
            assert_eq!(&command.inverse().inverse(), command);
        }

        track.undo().unwrap();
        let info = fx.store.persistent_root_info(doc.root).unwrap().unwrap();
        assert_eq!(info.current_branch, Some(doc.branch));
        assert!(info.branches[&feature].deleted);

        track.redo().unwrap();
        let info = fx.store.persistent_root_info(doc.root).unwrap().unwrap();
        assert_eq!(info.current_branch, Some(feature));
        assert!(!info.branches[&feature].deleted);
    }

    #[test]
    fn test_clear_and_missing_track() {
        let fx = setup();
        let track = UndoTrack::open(&fx.tracks, "editor").unwrap();
        fx.create(&track);
        track.clear().unwrap();

        assert!(matches!(
            track.record_command(Vec::new(), Metadata::new()),
            Err(VersoError::UndoTrackNotFound(_))
        ));
        assert!(fx.tracks.all_command_groups().is_empty());
        assert!(matches!(track.clear(), Err(VersoError::UndoTrackNotFound(_))));
        assert!(UndoTrack::open(&fx.tracks, " ").is_err());
    }

    #[test]
    fn test_state_persists_and_notifies() {
        let fx = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        fx.tracks
            .add_observer(Box::new(move |n: &UndoTrackNotification| sink.lock().push(n.track.clone())));

        let track = UndoTrack::open(&fx.tracks, "editor").unwrap();
        fx.create(&track);
        let position = track.state().unwrap();
        assert!(seen.lock().iter().all(|name| name == "editor"));
        assert!(!seen.lock().is_empty());

        let reopened = UndoTrackStore::open(Arc::clone(&fx.store)).unwrap();
        assert_eq!(reopened.track_names(), vec!["editor".to_string()]);
        let again = UndoTrack::open(&reopened, "editor").unwrap();
        assert_eq!(again.state().unwrap(), position);
        assert!(again.can_undo().unwrap());

        // A change made through the other handle shows up on reload
        again.undo().unwrap();
        let changed = fx.tracks.reload().unwrap();
        assert!(changed.contains("editor"));
        assert_eq!(track.state().unwrap().current, None);
    }

    #[test]
    fn test_pattern_track_union() {
        let fx = setup();
        let setup_track = UndoTrack::open(&fx.tracks, "setup").unwrap();
        let edits = UndoTrack::open(&fx.tracks, "doc.edit").unwrap();
        let styles = UndoTrack::open(&fx.tracks, "doc.style").unwrap();
        let doc = fx.create(&setup_track);

        fx.edit(&edits, &doc, doc.title, "Final");
        fx.edit(&styles, &doc, doc.body, "goodbye");
        let mut tx = fx.store.transaction_for(&[doc.root]).unwrap();
        tx.set_persistent_root_metadata(doc.root, action("renamed"));
        setup_track.commit(tx, action("rename")).unwrap();

        let pattern = PatternTrack::new(&fx.tracks, "doc.*").unwrap();
        assert_eq!(pattern.member_names(), vec!["doc.edit".to_string(), "doc.style".to_string()]);
        let sequences: Vec<u64> = pattern.nodes().unwrap().iter().map(|n| n.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);

        // Most recent member node first; the non-member rename is untouched
        assert!(pattern.undo().unwrap());
        assert_eq!(fx.text(&doc, doc.body), "hello");
        assert_eq!(fx.text(&doc, doc.title), "Final");
        let info = fx.store.persistent_root_info(doc.root).unwrap().unwrap();
        assert_eq!(info.metadata["action"], "renamed");

        assert!(pattern.undo().unwrap());
        assert_eq!(fx.text(&doc, doc.title), "Draft");
        assert!(!pattern.can_undo().unwrap());

        assert!(pattern.redo().unwrap());
        assert_eq!(fx.text(&doc, doc.title), "Final");
        assert_eq!(fx.text(&doc, doc.body), "hello");

        assert!(matches!(
            pattern.record_command(Vec::new(), Metadata::new()),
            Err(VersoError::ReadOnlyTrack(_))
        ));
        assert!(matches!(
            PatternTrack::new(&fx.tracks, "doc.["),
            Err(VersoError::InvalidPattern(_))
        ));
    }
}
