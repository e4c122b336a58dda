//! The metadata catalog
//!
//! All mutable store state lives in one JSON document: persistent roots with
//! their branches, the revision index of every backing store, the full-text
//! index and the cross-reference index. A commit builds a new catalog and
//! replaces `catalog.json` with an fsynced rename, so readers in any process
//! see either the state before a transaction or the state after it.

use crate::error::Result;
use crate::types::{BranchInfo, PersistentRootInfo, RevisionInfo, SearchResult};
use crate::utils;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::trace;
use uuid::Uuid;

/// Current catalog format
pub const CATALOG_FORMAT: u32 = 1;

/// Revisions of one backing store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackingIndex {
    /// Backing store UUID
    pub uuid: Uuid,
    /// Revision metadata by UUID
    pub revisions: BTreeMap<Uuid, RevisionInfo>,
    /// Sequence number the next revision receives
    pub next_sequence: u64,
}

impl BackingIndex {
    /// Empty index for a new backing store
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            revisions: BTreeMap::new(),
            next_sequence: 0,
        }
    }
}

/// One indexed item of one revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchEntry {
    /// Item UUID
    pub item: Uuid,
    /// String values of the item joined by spaces
    pub text: String,
}

/// Snapshot of all store metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// Catalog format version
    pub format_version: u32,
    /// Incremented on every save
    pub generation: u64,
    /// Persistent roots by UUID, including soft-deleted ones
    pub persistent_roots: BTreeMap<Uuid, PersistentRootInfo>,
    /// Backing store revision indexes
    pub backing_stores: BTreeMap<Uuid, BackingIndex>,
    /// Changed-item text by revision
    #[serde(default)]
    pub search: BTreeMap<Uuid, Vec<SearchEntry>>,
    /// Persistent roots referenced by each revision's item graph
    #[serde(default)]
    pub cross_references: BTreeMap<Uuid, BTreeSet<Uuid>>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            format_version: CATALOG_FORMAT,
            generation: 0,
            persistent_roots: BTreeMap::new(),
            backing_stores: BTreeMap::new(),
            search: BTreeMap::new(),
            cross_references: BTreeMap::new(),
        }
    }
}

impl Catalog {
    /// Load the catalog at `path`; a missing file is an empty catalog
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Catalog::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace the catalog at `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec(self)?;
        utils::atomic_write(path, &bytes)?;
        trace!("Saved catalog generation {} ({} bytes)", self.generation, bytes.len());
        Ok(())
    }

    /// Look up a persistent root
    pub fn root(&self, uuid: &Uuid) -> Option<&PersistentRootInfo> {
        self.persistent_roots.get(uuid)
    }

    /// Mutable persistent root lookup
    pub fn root_mut(&mut self, uuid: &Uuid) -> Option<&mut PersistentRootInfo> {
        self.persistent_roots.get_mut(uuid)
    }

    /// Find a branch in any persistent root
    pub fn branch(&self, branch: &Uuid) -> Option<&BranchInfo> {
        self.persistent_roots
            .values()
            .find_map(|root| root.branches.get(branch))
    }

    /// Backing store index
    pub fn backing(&self, uuid: &Uuid) -> Option<&BackingIndex> {
        self.backing_stores.get(uuid)
    }

    /// Revision index of a persistent root's backing store
    pub fn backing_for_root(&self, root: &Uuid) -> Option<&BackingIndex> {
        self.root(root).and_then(|r| self.backing_stores.get(&r.backing_store))
    }

    /// Revision as seen from `root`
    pub fn revision_for_root(&self, root: &Uuid, revision: &Uuid) -> Option<&RevisionInfo> {
        self.backing_for_root(root).and_then(|b| b.revisions.get(revision))
    }

    /// Revision in any backing store
    pub fn find_revision(&self, revision: &Uuid) -> Option<&RevisionInfo> {
        self.backing_stores
            .values()
            .find_map(|b| b.revisions.get(revision))
    }

    /// Whether `uuid` names any root, branch or revision
    pub fn contains_uuid(&self, uuid: &Uuid) -> bool {
        self.persistent_roots.contains_key(uuid)
            || self.branch(uuid).is_some()
            || self.find_revision(uuid).is_some()
    }

    /// Persistent roots sharing `backing`
    pub fn roots_sharing(&self, backing: &Uuid) -> Vec<Uuid> {
        self.persistent_roots
            .values()
            .filter(|r| r.backing_store == *backing)
            .map(|r| r.uuid)
            .collect()
    }

    /// Drop the index entries of an erased revision
    pub fn forget_revision(&mut self, backing: &Uuid, revision: &Uuid) -> Option<RevisionInfo> {
        self.search.remove(revision);
        self.cross_references.remove(revision);
        self.backing_stores
            .get_mut(backing)
            .and_then(|b| b.revisions.remove(revision))
    }

    /// Live persistent roots whose current revisions reference `target`
    pub fn roots_referencing(&self, target: &Uuid) -> Vec<Uuid> {
        self.persistent_roots
            .values()
            .filter(|root| !root.deleted && root.uuid != *target)
            .filter(|root| {
                root.live_branches().any(|branch| {
                    branch
                        .current_revision
                        .and_then(|rev| self.cross_references.get(&rev))
                        .is_some_and(|targets| targets.contains(target))
                })
            })
            .map(|root| root.uuid)
            .collect()
    }

    /// Token search over the indexed text of live roots
    ///
    /// Every stored revision is searched, so text an item no longer holds can
    /// still match. Each item of a root is reported once, from its best
    /// ranked revision. Ranked by the number of query tokens matched, then
    /// newest first.
    pub fn search(&self, query: &str) -> Vec<SearchResult> {
        let tokens = utils::tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<(usize, u64, SearchResult)> = Vec::new();
        for (revision, entries) in &self.search {
            let Some(info) = self.find_revision(revision) else {
                continue;
            };
            if self.root(&info.persistent_root).map_or(true, |r| r.deleted) {
                continue;
            }
            for entry in entries {
                let words = utils::tokenize(&entry.text);
                let score = tokens
                    .iter()
                    .filter(|t| words.binary_search(t).is_ok())
                    .count();
                if score > 0 {
                    hits.push((
                        score,
                        info.sequence,
                        SearchResult {
                            persistent_root: info.persistent_root,
                            revision: *revision,
                            item: entry.item,
                            text: entry.text.clone(),
                            score,
                        },
                    ));
                }
            }
        }

        hits.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.cmp(&a.1))
                .then(a.2.revision.cmp(&b.2.revision))
                .then(a.2.item.cmp(&b.2.item))
        });
        let mut seen = BTreeSet::new();
        hits.into_iter()
            .map(|(_, _, r)| r)
            .filter(|r| seen.insert((r.persistent_root, r.item)))
            .collect()
    }
}
