//! Revision graph navigation
//!
//! Revisions form a DAG through their parent and merge-parent links. This
//! module provides the walks the rest of the store needs: parent chains,
//! ancestor tests, the redo step from current toward head, common ancestors
//! and history shape. Every walk is iterative with a visited set, so history
//! depth is bounded only by memory.
//!
//! ```text
//! r1 ── r2 ── r3 ── r4   (head)
//!        │
//!        └─── r5          (divergent: same branch, off the head path)
//! ```

use crate::catalog::BackingIndex;
use crate::collections::{HashSet, HashSetExt, UuidSet};
use crate::types::RevisionInfo;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Read-only view of one backing store's revisions
#[derive(Debug, Clone, Copy)]
pub struct RevisionGraph<'a> {
    revisions: &'a BTreeMap<Uuid, RevisionInfo>,
}

impl BackingIndex {
    /// Graph view over this backing store
    pub fn graph(&self) -> RevisionGraph<'_> {
        RevisionGraph {
            revisions: &self.revisions,
        }
    }
}

impl<'a> RevisionGraph<'a> {
    /// Graph view over an arbitrary revision map
    pub fn new(revisions: &'a BTreeMap<Uuid, RevisionInfo>) -> Self {
        Self { revisions }
    }

    /// Look up a revision
    pub fn get(&self, revision: &Uuid) -> Option<&'a RevisionInfo> {
        self.revisions.get(revision)
    }

    /// Whether the revision exists in this backing store
    pub fn contains(&self, revision: &Uuid) -> bool {
        self.revisions.contains_key(revision)
    }

    /// `start` followed by its parents, newest first
    ///
    /// Stops at a null parent or at a parent that has been erased.
    pub fn parent_chain(&self, start: Uuid) -> Vec<Uuid> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self.revisions.get(&start);
        while let Some(info) = cursor {
            if !seen.insert(info.uuid) {
                break;
            }
            chain.push(info.uuid);
            cursor = info.parent.and_then(|p| self.revisions.get(&p));
        }
        chain
    }

    /// Parent chain from `descendant` up to and including `ancestor`
    ///
    /// `None` if `ancestor` is not on the parent chain of `descendant`.
    pub fn path_to_ancestor(&self, descendant: Uuid, ancestor: Uuid) -> Option<Vec<Uuid>> {
        let mut path = Vec::new();
        for uuid in self.parent_chain(descendant) {
            path.push(uuid);
            if uuid == ancestor {
                return Some(path);
            }
        }
        None
    }

    /// Whether `ancestor` is `descendant` or on its parent chain
    pub fn is_ancestor_or_equal(&self, ancestor: Uuid, descendant: Uuid) -> bool {
        self.path_to_ancestor(descendant, ancestor).is_some()
    }

    /// The child of `current` on the parent path leading to `head`
    pub fn child_toward(&self, current: Uuid, head: Uuid) -> Option<Uuid> {
        let path = self.path_to_ancestor(head, current)?;
        // path = [head, ..., child, current]
        if path.len() < 2 {
            return None;
        }
        Some(path[path.len() - 2])
    }

    /// Nearest revision on both parent chains
    pub fn common_ancestor(&self, a: Uuid, b: Uuid) -> Option<Uuid> {
        let ancestors: UuidSet = self.parent_chain(a).into_iter().collect();
        self.parent_chain(b).into_iter().find(|uuid| ancestors.contains(uuid))
    }

    /// Revisions whose parent or merge parent is `revision`
    pub fn children(&self, revision: Uuid) -> Vec<&'a RevisionInfo> {
        let mut children: Vec<&RevisionInfo> = self
            .revisions
            .values()
            .filter(|info| info.parents().any(|p| p == revision))
            .collect();
        children.sort_by_key(|info| info.sequence);
        children
    }

    /// Summary numbers for display
    pub fn stats(&self) -> HistoryStats {
        let mut child_counts: BTreeMap<Uuid, usize> = BTreeMap::new();
        for info in self.revisions.values() {
            for parent in info.parents() {
                *child_counts.entry(parent).or_default() += 1;
            }
        }

        let leaves = self
            .revisions
            .keys()
            .filter(|uuid| !child_counts.contains_key(uuid))
            .count();
        let fork_points = child_counts.values().filter(|count| **count > 1).count();
        let merges = self
            .revisions
            .values()
            .filter(|info| info.merge_parent.is_some())
            .count();
        let longest_chain = self
            .revisions
            .keys()
            .filter(|uuid| !child_counts.contains_key(uuid))
            .map(|leaf| self.parent_chain(*leaf).len())
            .max()
            .unwrap_or(0);

        HistoryStats {
            total_revisions: self.revisions.len(),
            leaves,
            fork_points,
            merges,
            longest_chain,
        }
    }
}

/// Shape of a backing store's history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryStats {
    /// Number of revisions
    pub total_revisions: usize,
    /// Revisions without children
    pub leaves: usize,
    /// Revisions with more than one child
    pub fork_points: usize,
    /// Revisions with a merge parent
    pub merges: usize,
    /// Longest parent chain
    pub longest_chain: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;
    use chrono::Utc;

    fn add(index: &mut BackingIndex, parent: Option<Uuid>) -> Uuid {
        let uuid = Uuid::new_v4();
        let sequence = index.next_sequence;
        index.next_sequence += 1;
        index.revisions.insert(
            uuid,
            RevisionInfo {
                uuid,
                persistent_root: index.uuid,
                branch: Uuid::nil(),
                backing_store: index.uuid,
                parent,
                merge_parent: None,
                timestamp: Utc::now(),
                metadata: Metadata::new(),
                schema_version: 1,
                sequence,
                changed_items: vec![],
                removed_items: vec![],
                attachments: vec![],
                payload_hash: String::new(),
            },
        );
        uuid
    }

    fn linear_with_fork() -> (BackingIndex, Vec<Uuid>, Uuid) {
        let mut index = BackingIndex::new(Uuid::new_v4());
        let r1 = add(&mut index, None);
        let r2 = add(&mut index, Some(r1));
        let r3 = add(&mut index, Some(r2));
        let r4 = add(&mut index, Some(r3));
        let r5 = add(&mut index, Some(r2));
        (index, vec![r1, r2, r3, r4], r5)
    }

    #[test]
    fn test_parent_chain_and_ancestry() {
        let (index, line, fork) = linear_with_fork();
        let graph = index.graph();
        assert_eq!(graph.parent_chain(line[3]), vec![line[3], line[2], line[1], line[0]]);
        assert!(graph.is_ancestor_or_equal(line[1], line[3]));
        assert!(graph.is_ancestor_or_equal(line[3], line[3]));
        assert!(!graph.is_ancestor_or_equal(line[3], line[1]));
        assert!(!graph.is_ancestor_or_equal(fork, line[3]));
    }

    #[test]
    fn test_child_toward_head() {
        let (index, line, fork) = linear_with_fork();
        let graph = index.graph();
        assert_eq!(graph.child_toward(line[1], line[3]), Some(line[2]));
        assert_eq!(graph.child_toward(line[3], line[3]), None);
        assert_eq!(graph.child_toward(fork, line[3]), None);
    }

    #[test]
    fn test_common_ancestor_and_children() {
        let (index, line, fork) = linear_with_fork();
        let graph = index.graph();
        assert_eq!(graph.common_ancestor(line[3], fork), Some(line[1]));
        let children: Vec<Uuid> = graph.children(line[1]).iter().map(|i| i.uuid).collect();
        assert_eq!(children, vec![line[2], fork]);
    }

    #[test]
    fn test_chain_stops_at_erased_parent() {
        let (mut index, line, _) = linear_with_fork();
        index.revisions.remove(&line[1]);
        assert_eq!(index.graph().parent_chain(line[3]), vec![line[3], line[2]]);
    }

    #[test]
    fn test_history_stats() {
        let (index, _, _) = linear_with_fork();
        let graph = index.graph();
        let stats = graph.stats();
        assert_eq!(stats.total_revisions, 5);
        assert_eq!(stats.leaves, 2);
        assert_eq!(stats.fork_points, 1);
        assert_eq!(stats.longest_chain, 4);
    }

    #[test]
    fn test_deep_history_is_iterative() {
        let mut index = BackingIndex::new(Uuid::new_v4());
        let mut tip = add(&mut index, None);
        for _ in 0..50_000 {
            tip = add(&mut index, Some(tip));
        }
        assert_eq!(index.graph().parent_chain(tip).len(), 50_001);
    }
}
