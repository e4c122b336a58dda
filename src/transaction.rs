//! Store transactions
//!
//! A [`StoreTransaction`] is an ordered list of primitive [`Operation`]s plus
//! the optimistic concurrency token the caller last observed for every
//! persistent root it touches. [`crate::Store::commit`] applies the whole list
//! or nothing.
//!
//! ## Example
//!
//! ```rust,no_run
//! use verso::{Item, ItemGraph, Metadata, Store, StoreTransaction};
//!
//! # fn main() -> verso::Result<()> {
//! let store = Store::init("./store")?;
//!
//! let mut tx = StoreTransaction::new();
//! let graph = ItemGraph::new(Item::new("Document", "text", 1).with("title", "Notes"));
//! let (root, branch, r1) = tx.create_persistent_root_with_graph(graph.clone(), Metadata::new());
//! store.commit(tx)?;
//!
//! let mut edited = graph;
//! let root_item = edited.root;
//! edited.get_mut(&root_item).unwrap().set("title", "Meeting notes");
//!
//! let mut tx = store.transaction_for(&[root])?;
//! tx.commit_revision(root, branch, Some(r1), edited, Metadata::new());
//! store.commit(tx)?;
//! # Ok(())
//! # }
//! ```

use crate::attachments::AttachmentStore;
use crate::catalog::{BackingIndex, Catalog, SearchEntry};
use crate::error::{Result, VersoError};
use crate::item_graph::ItemGraph;
use crate::revisions::RevisionStore;
use crate::types::{
    require_uuid, BranchInfo, CopySource, Metadata, PersistentRootInfo, RevisionInfo, TransactionId,
};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};
use uuid::Uuid;

/// A revision to be written
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionWrite {
    /// Persistent root the revision is committed through
    pub persistent_root: Uuid,
    /// Branch the revision is committed on
    pub branch: Uuid,
    /// New revision UUID
    pub revision: Uuid,
    /// Parent revision
    pub parent: Option<Uuid>,
    /// Second parent of a merge
    pub merge_parent: Option<Uuid>,
    /// Complete item graph of the revision
    pub graph: ItemGraph,
    /// Commit metadata
    pub metadata: Metadata,
    /// Schema version the graph was produced with
    pub schema_version: u32,
}

impl RevisionWrite {
    /// A write of `graph` on `branch` with a fresh revision UUID
    pub fn new(persistent_root: Uuid, branch: Uuid, parent: Option<Uuid>, graph: ItemGraph) -> Self {
        Self {
            persistent_root,
            branch,
            revision: Uuid::new_v4(),
            parent,
            merge_parent: None,
            graph,
            metadata: Metadata::new(),
            schema_version: 1,
        }
    }

    /// Set the merge parent
    pub fn merge_parent(mut self, merge_parent: Uuid) -> Self {
        self.merge_parent = Some(merge_parent);
        self
    }

    /// Set the commit metadata
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set the schema version recorded with the revision
    pub fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }
}

/// One primitive mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Append an immutable revision to a branch's backing store
    WriteRevision(RevisionWrite),
    /// Create a persistent root with its initial branch
    CreatePersistentRoot {
        /// New root UUID
        uuid: Uuid,
        /// UUID of the initial branch
        initial_branch: Uuid,
        /// Root metadata
        metadata: Metadata,
        /// Cheap-copy source
        copy_of: Option<CopySource>,
    },
    /// Add a branch to an existing persistent root
    CreateBranch {
        /// Owning root
        persistent_root: Uuid,
        /// New branch UUID
        branch: Uuid,
        /// Branch this one is forked from
        parent_branch: Option<Uuid>,
        /// Revision the branch starts at
        initial_revision: Option<Uuid>,
        /// Branch metadata
        metadata: Metadata,
        /// Overrides the store default when set
        supports_revert: Option<bool>,
    },
    /// Select the branch of a persistent root
    SetCurrentBranch {
        /// Owning root
        persistent_root: Uuid,
        /// Branch to select
        branch: Uuid,
    },
    /// Move a branch's current (and optionally head) pointer
    SetCurrentRevision {
        /// Owning root
        persistent_root: Uuid,
        /// Branch to move
        branch: Uuid,
        /// New current revision
        current: Uuid,
        /// New head revision; computed from `current` when absent
        head: Option<Uuid>,
    },
    /// Move a branch's initial pointer (history compaction)
    SetInitialRevision {
        /// Owning root
        persistent_root: Uuid,
        /// Branch to compact
        branch: Uuid,
        /// New initial revision
        revision: Uuid,
    },
    /// Replace persistent root metadata
    SetPersistentRootMetadata {
        /// Root to update
        persistent_root: Uuid,
        /// New metadata
        metadata: Metadata,
    },
    /// Replace branch metadata
    SetBranchMetadata {
        /// Owning root
        persistent_root: Uuid,
        /// Branch to update
        branch: Uuid,
        /// New metadata
        metadata: Metadata,
    },
    /// Soft-delete a persistent root
    DeletePersistentRoot(Uuid),
    /// Clear a persistent root's deletion flag
    UndeletePersistentRoot(Uuid),
    /// Soft-delete a branch
    DeleteBranch {
        /// Owning root
        persistent_root: Uuid,
        /// Branch to delete
        branch: Uuid,
    },
    /// Clear a branch's deletion flag
    UndeleteBranch {
        /// Owning root
        persistent_root: Uuid,
        /// Branch to restore
        branch: Uuid,
    },
}

impl Operation {
    /// Persistent root the operation mutates
    pub fn persistent_root(&self) -> Uuid {
        match self {
            Operation::WriteRevision(write) => write.persistent_root,
            Operation::CreatePersistentRoot { uuid, .. } => *uuid,
            Operation::CreateBranch { persistent_root, .. }
            | Operation::SetCurrentBranch { persistent_root, .. }
            | Operation::SetCurrentRevision { persistent_root, .. }
            | Operation::SetInitialRevision { persistent_root, .. }
            | Operation::SetPersistentRootMetadata { persistent_root, .. }
            | Operation::SetBranchMetadata { persistent_root, .. }
            | Operation::DeleteBranch { persistent_root, .. }
            | Operation::UndeleteBranch { persistent_root, .. } => *persistent_root,
            Operation::DeletePersistentRoot(uuid) | Operation::UndeletePersistentRoot(uuid) => *uuid,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Operation::WriteRevision(_) => "write-revision",
            Operation::CreatePersistentRoot { .. } => "create-persistent-root",
            Operation::CreateBranch { .. } => "create-branch",
            Operation::SetCurrentBranch { .. } => "set-current-branch",
            Operation::SetCurrentRevision { .. } => "set-current-revision",
            Operation::SetInitialRevision { .. } => "set-initial-revision",
            Operation::SetPersistentRootMetadata { .. } => "set-persistent-root-metadata",
            Operation::SetBranchMetadata { .. } => "set-branch-metadata",
            Operation::DeletePersistentRoot(_) => "delete-persistent-root",
            Operation::UndeletePersistentRoot(_) => "undelete-persistent-root",
            Operation::DeleteBranch { .. } => "delete-branch",
            Operation::UndeleteBranch { .. } => "undelete-branch",
        }
    }
}

/// Ordered batch of operations applied atomically
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreTransaction {
    operations: Vec<Operation>,
    old_transaction_ids: BTreeMap<Uuid, TransactionId>,
}

impl StoreTransaction {
    /// Empty transaction
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the transaction id the caller last observed for `persistent_root`
    pub fn set_old_transaction_id(&mut self, persistent_root: Uuid, id: TransactionId) {
        self.old_transaction_ids.insert(persistent_root, id);
    }

    /// Recorded token for `persistent_root`
    pub fn old_transaction_id(&self, persistent_root: &Uuid) -> Option<TransactionId> {
        self.old_transaction_ids.get(persistent_root).copied()
    }

    /// Operations in application order
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Number of operations
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether the transaction holds no operations
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Append an operation
    ///
    /// Creating a persistent root records [`TransactionId::NONEXISTENT`] as its
    /// expected token.
    pub fn push(&mut self, operation: Operation) {
        if let Operation::CreatePersistentRoot { uuid, .. } = &operation {
            self.old_transaction_ids.insert(*uuid, TransactionId::NONEXISTENT);
        }
        self.operations.push(operation);
    }

    /// Append a revision write; returns the revision UUID
    pub fn write_revision(&mut self, write: RevisionWrite) -> Uuid {
        let revision = write.revision;
        self.push(Operation::WriteRevision(write));
        revision
    }

    /// Write a revision and make it the branch's current revision
    pub fn commit_revision(
        &mut self,
        persistent_root: Uuid,
        branch: Uuid,
        parent: Option<Uuid>,
        graph: ItemGraph,
        metadata: Metadata,
    ) -> Uuid {
        let revision = self.write_revision(
            RevisionWrite::new(persistent_root, branch, parent, graph).metadata(metadata),
        );
        self.set_current_revision(persistent_root, branch, revision, None);
        revision
    }

    /// Create an empty persistent root; returns `(root, initial branch)`
    pub fn create_persistent_root(&mut self, metadata: Metadata) -> (Uuid, Uuid) {
        let (uuid, branch) = (Uuid::new_v4(), Uuid::new_v4());
        self.push(Operation::CreatePersistentRoot {
            uuid,
            initial_branch: branch,
            metadata,
            copy_of: None,
        });
        (uuid, branch)
    }

    /// Create a persistent root whose first revision holds `graph`
    ///
    /// Returns `(root, initial branch, first revision)`.
    pub fn create_persistent_root_with_graph(
        &mut self,
        graph: ItemGraph,
        metadata: Metadata,
    ) -> (Uuid, Uuid, Uuid) {
        let (root, branch) = self.create_persistent_root(metadata);
        let revision = self.commit_revision(root, branch, None, graph, Metadata::new());
        (root, branch, revision)
    }

    /// Create a cheap copy of `source` starting at `revision`
    ///
    /// The copy shares the source's backing store; no history is duplicated.
    pub fn create_cheap_copy(&mut self, source: Uuid, revision: Uuid, metadata: Metadata) -> (Uuid, Uuid) {
        let (uuid, branch) = (Uuid::new_v4(), Uuid::new_v4());
        self.push(Operation::CreatePersistentRoot {
            uuid,
            initial_branch: branch,
            metadata,
            copy_of: Some(CopySource {
                persistent_root: source,
                revision,
            }),
        });
        (uuid, branch)
    }

    /// Add a branch starting at `initial_revision`; returns the branch UUID
    pub fn create_branch(
        &mut self,
        persistent_root: Uuid,
        parent_branch: Option<Uuid>,
        initial_revision: Option<Uuid>,
        metadata: Metadata,
    ) -> Uuid {
        let branch = Uuid::new_v4();
        self.push(Operation::CreateBranch {
            persistent_root,
            branch,
            parent_branch,
            initial_revision,
            metadata,
            supports_revert: None,
        });
        branch
    }

    /// Select a branch
    pub fn set_current_branch(&mut self, persistent_root: Uuid, branch: Uuid) {
        self.push(Operation::SetCurrentBranch { persistent_root, branch });
    }

    /// Move a branch's current pointer
    pub fn set_current_revision(&mut self, persistent_root: Uuid, branch: Uuid, current: Uuid, head: Option<Uuid>) {
        self.push(Operation::SetCurrentRevision {
            persistent_root,
            branch,
            current,
            head,
        });
    }

    /// Move a branch's initial pointer forward
    pub fn set_initial_revision(&mut self, persistent_root: Uuid, branch: Uuid, revision: Uuid) {
        self.push(Operation::SetInitialRevision {
            persistent_root,
            branch,
            revision,
        });
    }

    /// Replace persistent root metadata
    pub fn set_persistent_root_metadata(&mut self, persistent_root: Uuid, metadata: Metadata) {
        self.push(Operation::SetPersistentRootMetadata { persistent_root, metadata });
    }

    /// Replace branch metadata
    pub fn set_branch_metadata(&mut self, persistent_root: Uuid, branch: Uuid, metadata: Metadata) {
        self.push(Operation::SetBranchMetadata {
            persistent_root,
            branch,
            metadata,
        });
    }

    /// Soft-delete a persistent root
    pub fn delete_persistent_root(&mut self, persistent_root: Uuid) {
        self.push(Operation::DeletePersistentRoot(persistent_root));
    }

    /// Undo a soft deletion
    pub fn undelete_persistent_root(&mut self, persistent_root: Uuid) {
        self.push(Operation::UndeletePersistentRoot(persistent_root));
    }

    /// Soft-delete a branch
    pub fn delete_branch(&mut self, persistent_root: Uuid, branch: Uuid) {
        self.push(Operation::DeleteBranch { persistent_root, branch });
    }

    /// Undo a branch soft deletion
    pub fn undelete_branch(&mut self, persistent_root: Uuid, branch: Uuid) {
        self.push(Operation::UndeleteBranch { persistent_root, branch });
    }

    /// Whether anything other than a revision write touches `persistent_root`
    pub fn touches_mutable_state(&self, persistent_root: &Uuid) -> bool {
        self.operations
            .iter()
            .any(|op| !matches!(op, Operation::WriteRevision(_)) && op.persistent_root() == *persistent_root)
    }

    /// Every persistent root an operation mutates
    pub fn touched_persistent_roots(&self) -> BTreeSet<Uuid> {
        self.operations.iter().map(Operation::persistent_root).collect()
    }

    /// Roots created by this transaction
    pub fn created_persistent_roots(&self) -> BTreeSet<Uuid> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                Operation::CreatePersistentRoot { uuid, .. } => Some(*uuid),
                _ => None,
            })
            .collect()
    }

    /// Roots soft-deleted by this transaction
    pub fn deleted_persistent_roots(&self) -> BTreeSet<Uuid> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                Operation::DeletePersistentRoot(uuid) => Some(*uuid),
                _ => None,
            })
            .collect()
    }

    /// Revisions written by this transaction
    pub fn written_revisions(&self) -> Vec<Uuid> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                Operation::WriteRevision(write) => Some(write.revision),
                _ => None,
            })
            .collect()
    }
}

/// Working state of one commit
///
/// Operations mutate a private copy of the catalog; payload files written
/// along the way are remembered so a failed commit can remove them.
pub(crate) struct CommitState<'a> {
    pub catalog: Catalog,
    pub written: Vec<(Uuid, Uuid)>,
    revisions: &'a RevisionStore,
    attachments: &'a AttachmentStore,
    default_supports_revert: bool,
}

impl<'a> CommitState<'a> {
    pub fn new(
        catalog: Catalog,
        revisions: &'a RevisionStore,
        attachments: &'a AttachmentStore,
        default_supports_revert: bool,
    ) -> Self {
        Self {
            catalog,
            written: Vec::new(),
            revisions,
            attachments,
            default_supports_revert,
        }
    }

    /// Compare every touched root's token with the stored one
    pub fn check_transaction_ids(&self, tx: &StoreTransaction) -> Result<()> {
        for root in tx.touched_persistent_roots() {
            let expected = tx.old_transaction_id(&root).ok_or_else(|| {
                VersoError::invalid_argument(format!(
                    "transaction touches persistent root {} without an old transaction id",
                    root
                ))
            })?;
            let actual = self
                .catalog
                .root(&root)
                .map(|r| r.transaction_id)
                .unwrap_or(TransactionId::NONEXISTENT);
            if expected != actual {
                return Err(VersoError::TransactionConflict {
                    persistent_root: root,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Apply one operation to the working catalog
    pub fn apply(&mut self, operation: &Operation) -> Result<()> {
        trace!("Applying {}", operation.name());
        match operation {
            Operation::WriteRevision(write) => self.write_revision(write),
            Operation::CreatePersistentRoot {
                uuid,
                initial_branch,
                metadata,
                copy_of,
            } => self.create_persistent_root(*uuid, *initial_branch, metadata, copy_of.as_ref()),
            Operation::CreateBranch {
                persistent_root,
                branch,
                parent_branch,
                initial_revision,
                metadata,
                supports_revert,
            } => self.create_branch(
                *persistent_root,
                *branch,
                *parent_branch,
                *initial_revision,
                metadata,
                supports_revert.unwrap_or(self.default_supports_revert),
            ),
            Operation::SetCurrentBranch { persistent_root, branch } => {
                let root = self.root_mut(*persistent_root)?;
                match root.branches.get(branch) {
                    None => return Err(VersoError::BranchNotFound(*branch)),
                    Some(b) if b.deleted => {
                        return Err(VersoError::consistency(format!(
                            "cannot select deleted branch {}",
                            branch
                        )))
                    }
                    Some(_) => {}
                }
                root.current_branch = Some(*branch);
                Ok(())
            }
            Operation::SetCurrentRevision {
                persistent_root,
                branch,
                current,
                head,
            } => self.set_current_revision(*persistent_root, *branch, *current, *head),
            Operation::SetInitialRevision {
                persistent_root,
                branch,
                revision,
            } => self.set_initial_revision(*persistent_root, *branch, *revision),
            Operation::SetPersistentRootMetadata { persistent_root, metadata } => {
                self.root_mut(*persistent_root)?.metadata = metadata.clone();
                Ok(())
            }
            Operation::SetBranchMetadata {
                persistent_root,
                branch,
                metadata,
            } => {
                self.branch_mut(*persistent_root, *branch)?.metadata = metadata.clone();
                Ok(())
            }
            Operation::DeletePersistentRoot(uuid) => {
                self.root_mut(*uuid)?.deleted = true;
                Ok(())
            }
            Operation::UndeletePersistentRoot(uuid) => {
                self.root_mut(*uuid)?.deleted = false;
                Ok(())
            }
            Operation::DeleteBranch { persistent_root, branch } => {
                let root = self.root_mut(*persistent_root)?;
                if root.current_branch == Some(*branch) {
                    return Err(VersoError::consistency(format!(
                        "cannot delete branch {}: it is the current branch of {}",
                        branch, persistent_root
                    )));
                }
                self.branch_mut(*persistent_root, *branch)?.deleted = true;
                Ok(())
            }
            Operation::UndeleteBranch { persistent_root, branch } => {
                self.branch_mut(*persistent_root, *branch)?.deleted = false;
                Ok(())
            }
        }
    }

    /// Advance the token of every touched root that still exists
    pub fn advance_transaction_ids(&mut self, tx: &StoreTransaction) -> BTreeMap<Uuid, TransactionId> {
        let mut ids = BTreeMap::new();
        for uuid in tx.touched_persistent_roots() {
            if let Some(root) = self.catalog.root_mut(&uuid) {
                root.transaction_id = root.transaction_id.next();
                ids.insert(uuid, root.transaction_id);
            }
        }
        ids
    }

    fn root_mut(&mut self, uuid: Uuid) -> Result<&mut PersistentRootInfo> {
        require_uuid(uuid, "persistent root")?;
        self.catalog
            .root_mut(&uuid)
            .ok_or(VersoError::PersistentRootNotFound(uuid))
    }

    fn branch_mut(&mut self, root: Uuid, branch: Uuid) -> Result<&mut BranchInfo> {
        require_uuid(branch, "branch")?;
        self.root_mut(root)?
            .branches
            .get_mut(&branch)
            .ok_or(VersoError::BranchNotFound(branch))
    }

    fn backing_of(&self, root: Uuid) -> Result<&BackingIndex> {
        self.catalog
            .backing_for_root(&root)
            .ok_or(VersoError::PersistentRootNotFound(root))
    }

    fn require_fresh(&self, uuid: Uuid, what: &str) -> Result<()> {
        require_uuid(uuid, what)?;
        if self.catalog.contains_uuid(&uuid) {
            return Err(VersoError::invalid_argument(format!(
                "{} UUID {} is already in use",
                what, uuid
            )));
        }
        Ok(())
    }

    fn require_revision(&self, root: Uuid, revision: Uuid) -> Result<()> {
        require_uuid(revision, "revision")?;
        if !self.backing_of(root)?.revisions.contains_key(&revision) {
            return Err(VersoError::RevisionNotFound(revision));
        }
        Ok(())
    }

    fn write_revision(&mut self, write: &RevisionWrite) -> Result<()> {
        let root = write.persistent_root;
        self.require_fresh(write.revision, "revision")?;
        let branch = self.branch_mut(root, write.branch)?.clone();
        write.graph.validate()?;

        match write.parent {
            None if branch.initial_revision.is_some() => {
                return Err(VersoError::consistency(format!(
                    "revision {} has no parent but branch {} already has history",
                    write.revision, branch.uuid
                )));
            }
            None => {}
            Some(parent) => self.require_revision(root, parent)?,
        }
        if let Some(merge_parent) = write.merge_parent {
            self.require_revision(root, merge_parent)?;
        }

        let attachments = write.graph.attachments();
        if let Some(missing) = attachments.iter().find(|id| !self.attachments.contains(id)) {
            return Err(VersoError::consistency(format!(
                "revision {} references attachment {} which is not stored",
                write.revision, missing
            )));
        }

        let backing = self.backing_of(root)?.uuid;
        let parent_graph = match write.parent {
            Some(parent) => Some((parent, self.revisions.item_graph(backing, parent)?)),
            None => None,
        };
        let written = self.revisions.write(
            backing,
            write.revision,
            &write.graph,
            parent_graph.as_ref().map(|(uuid, graph)| (*uuid, &**graph)),
        )?;
        self.written.push((backing, write.revision));

        let search_entries: Vec<SearchEntry> = written
            .changed_items
            .iter()
            .filter_map(|item| {
                let text = write.graph.text_fragments(item).join(" ");
                (!text.is_empty()).then(|| SearchEntry { item: *item, text })
            })
            .collect();
        if !search_entries.is_empty() {
            self.catalog.search.insert(write.revision, search_entries);
        }
        let referenced = write.graph.referenced_persistent_roots();
        if !referenced.is_empty() {
            self.catalog.cross_references.insert(write.revision, referenced);
        }

        let index = self
            .catalog
            .backing_stores
            .get_mut(&backing)
            .ok_or(VersoError::PersistentRootNotFound(root))?;
        let sequence = index.next_sequence;
        index.next_sequence += 1;
        let stored_size = written.stored_size;
        index.revisions.insert(
            write.revision,
            RevisionInfo {
                uuid: write.revision,
                persistent_root: root,
                branch: write.branch,
                backing_store: backing,
                parent: write.parent,
                merge_parent: write.merge_parent,
                timestamp: Utc::now(),
                metadata: write.metadata.clone(),
                schema_version: write.schema_version,
                sequence,
                changed_items: written.changed_items,
                removed_items: written.removed_items,
                attachments: attachments.into_iter().collect(),
                payload_hash: written.payload_hash,
            },
        );

        let branch = self.branch_mut(root, write.branch)?;
        if branch.initial_revision.is_none() {
            branch.initial_revision = Some(write.revision);
        }
        debug!(
            "Wrote revision {} on branch {} ({} bytes)",
            write.revision, write.branch, stored_size
        );
        Ok(())
    }

    fn create_persistent_root(
        &mut self,
        uuid: Uuid,
        initial_branch: Uuid,
        metadata: &Metadata,
        copy_of: Option<&CopySource>,
    ) -> Result<()> {
        self.require_fresh(uuid, "persistent root")?;
        self.require_fresh(initial_branch, "branch")?;
        if uuid == initial_branch {
            return Err(VersoError::invalid_argument("persistent root and branch UUIDs must differ"));
        }

        let (backing_store, start) = match copy_of {
            Some(source) => {
                let source_root = self
                    .catalog
                    .root(&source.persistent_root)
                    .ok_or(VersoError::PersistentRootNotFound(source.persistent_root))?;
                let backing = source_root.backing_store;
                self.require_revision(source.persistent_root, source.revision)?;
                (backing, Some(source.revision))
            }
            None => {
                self.catalog.backing_stores.insert(uuid, BackingIndex::new(uuid));
                (uuid, None)
            }
        };

        let branch = BranchInfo {
            uuid: initial_branch,
            persistent_root: uuid,
            current_revision: start,
            head_revision: start,
            initial_revision: start,
            parent_branch: None,
            deleted: false,
            supports_revert: self.default_supports_revert,
            metadata: Metadata::new(),
        };
        self.catalog.persistent_roots.insert(
            uuid,
            PersistentRootInfo {
                uuid,
                backing_store,
                current_branch: Some(initial_branch),
                branches: BTreeMap::from([(initial_branch, branch)]),
                deleted: false,
                metadata: metadata.clone(),
                transaction_id: TransactionId::NONEXISTENT,
                copied_from: copy_of.copied(),
            },
        );
        debug!("Created persistent root {} (backing {})", uuid, backing_store);
        Ok(())
    }

    fn create_branch(
        &mut self,
        root: Uuid,
        branch: Uuid,
        parent_branch: Option<Uuid>,
        initial_revision: Option<Uuid>,
        metadata: &Metadata,
        supports_revert: bool,
    ) -> Result<()> {
        self.require_fresh(branch, "branch")?;
        if let Some(revision) = initial_revision {
            self.require_revision(root, revision)?;
        }
        let info = self.root_mut(root)?;
        if let Some(parent) = parent_branch {
            if !info.branches.contains_key(&parent) {
                return Err(VersoError::BranchNotFound(parent));
            }
        }
        info.branches.insert(
            branch,
            BranchInfo {
                uuid: branch,
                persistent_root: root,
                current_revision: initial_revision,
                head_revision: initial_revision,
                initial_revision,
                parent_branch,
                deleted: false,
                supports_revert,
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    fn set_current_revision(&mut self, root: Uuid, branch: Uuid, current: Uuid, head: Option<Uuid>) -> Result<()> {
        self.require_revision(root, current)?;
        if let Some(head) = head {
            self.require_revision(root, head)?;
        }

        let info = self.branch_mut(root, branch)?.clone();
        let graph = self.backing_of(root)?.graph();

        if let Some(initial) = info.initial_revision {
            if !graph.is_ancestor_or_equal(initial, current) {
                return Err(VersoError::consistency(format!(
                    "revision {} does not descend from the initial revision {} of branch {}",
                    current, initial, branch
                )));
            }
        }

        let new_head = match head {
            Some(head) => {
                if !graph.is_ancestor_or_equal(current, head) {
                    return Err(VersoError::consistency(format!(
                        "current revision {} is not an ancestor of head {}",
                        current, head
                    )));
                }
                if !info.supports_revert && head != current {
                    return Err(VersoError::consistency(format!(
                        "branch {} does not support revert; head must equal current",
                        branch
                    )));
                }
                head
            }
            None if !info.supports_revert => current,
            None => match info.head_revision {
                Some(existing) if graph.is_ancestor_or_equal(current, existing) => existing,
                _ => current,
            },
        };

        let branch = self.branch_mut(root, branch)?;
        branch.current_revision = Some(current);
        branch.head_revision = Some(new_head);
        if branch.initial_revision.is_none() {
            branch.initial_revision = Some(current);
        }
        Ok(())
    }

    fn set_initial_revision(&mut self, root: Uuid, branch: Uuid, revision: Uuid) -> Result<()> {
        self.require_revision(root, revision)?;
        let current = self.branch_mut(root, branch)?.current_revision;
        let graph = self.backing_of(root)?.graph();
        match current {
            Some(current) if graph.is_ancestor_or_equal(revision, current) => {}
            _ => {
                return Err(VersoError::consistency(format!(
                    "initial revision {} must be an ancestor of the current revision of branch {}",
                    revision, branch
                )))
            }
        }
        self.branch_mut(root, branch)?.initial_revision = Some(revision);
        Ok(())
    }
}
