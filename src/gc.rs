//! Reachability garbage collection over the catalog
//!
//! Finalizing deletions of a persistent root runs in two halves. This module
//! is the catalog half: it erases soft-deleted rows, marks every revision of
//! the root's backing store that a remaining branch can still reach, and
//! drops the rest from the catalog. [`crate::Store::finalize_deletions`]
//! performs the file half (snapshot rewrites, payload and attachment removal)
//! around the atomic catalog write.
//!
//! Marking starts from the head (and current) revision of every branch row
//! still in the catalog that shares the backing store, including rows of
//! other persistent roots that are soft-deleted but not yet finalized. The
//! walk follows parent and merge-parent links and does not expand past the
//! seeding branch's initial revision; that is what lets moving `initial`
//! forward reclaim older history. A head lost to a revert is not a seed, so
//! the revisions only it reached are erased.

use crate::catalog::Catalog;
use crate::collections::{HashSet, HashSetExt, UuidSet};
use crate::error::Result;
use crate::types::{AttachmentId, GcStats, RevisionInfo};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, trace};
use uuid::Uuid;

/// Outcome of the catalog half of a collection
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Sweep {
    /// Backing store that was swept
    pub backing: Uuid,
    /// Revisions removed from the catalog
    pub erased: Vec<Uuid>,
    /// Surviving revisions whose parent was erased
    pub orphaned_children: Vec<Uuid>,
    /// Whether the backing store index itself was removed
    pub backing_dropped: bool,
}

/// Erase deleted rows and unreachable revisions of `target` in `catalog`
///
/// Returns `None` when the catalog has no such persistent root.
pub(crate) fn collect(catalog: &mut Catalog, target: Uuid, stats: &mut GcStats) -> Result<Option<Sweep>> {
    let Some(root) = catalog.root(&target).cloned() else {
        return Ok(None);
    };
    let backing = root.backing_store;

    if root.deleted {
        catalog.persistent_roots.remove(&target);
        stats.persistent_roots_erased += 1;
        stats.branches_erased += root.branches.len();
        debug!("Erased persistent root {} with {} branches", target, root.branches.len());
    } else {
        let deleted: Vec<Uuid> = root.deleted_branches().map(|b| b.uuid).collect();
        if let Some(row) = catalog.root_mut(&target) {
            for branch in &deleted {
                row.branches.remove(branch);
            }
        }
        stats.branches_erased += deleted.len();
        if !deleted.is_empty() {
            debug!("Erased {} deleted branches of {}", deleted.len(), target);
        }
    }

    let Some(index) = catalog.backing(&backing) else {
        return Ok(Some(Sweep {
            backing,
            ..Sweep::default()
        }));
    };
    stats.revisions_examined += index.revisions.len();

    let sharing = catalog.roots_sharing(&backing);
    let live = if sharing.is_empty() {
        UuidSet::new()
    } else {
        let seeds = seeds_for(catalog, &backing);
        mark_live(&index.revisions, seeds)
    };

    let erased: Vec<Uuid> = index
        .revisions
        .keys()
        .filter(|uuid| !live.contains(uuid))
        .copied()
        .collect();
    let erased_set: BTreeSet<Uuid> = erased.iter().copied().collect();
    let orphaned_children: Vec<Uuid> = index
        .revisions
        .values()
        .filter(|info| live.contains(&info.uuid))
        .filter(|info| info.parent.is_some_and(|p| erased_set.contains(&p)))
        .map(|info| info.uuid)
        .collect();

    for revision in &erased {
        catalog.forget_revision(&backing, revision);
    }
    let backing_dropped = sharing.is_empty();
    if backing_dropped {
        catalog.backing_stores.remove(&backing);
    }

    stats.revisions_erased += erased.len();
    stats.erased_revisions.extend(erased.iter().copied());
    debug!(
        "Swept backing store {}: {} live, {} erased",
        backing,
        live.len(),
        erased.len()
    );

    Ok(Some(Sweep {
        backing,
        erased,
        orphaned_children,
        backing_dropped,
    }))
}

/// Seeds of the trace: every branch pointer into `backing` with its stop
fn seeds_for(catalog: &Catalog, backing: &Uuid) -> Vec<(Uuid, Option<Uuid>)> {
    let mut seeds = Vec::new();
    for root in catalog.persistent_roots.values() {
        if root.backing_store != *backing {
            continue;
        }
        for branch in root.branches.values() {
            for pointer in [branch.head_revision, branch.current_revision].into_iter().flatten() {
                seeds.push((pointer, branch.initial_revision));
            }
        }
    }
    seeds
}

/// Revisions reachable from `seeds`, each walk stopping at its initial revision
pub(crate) fn mark_live(
    revisions: &BTreeMap<Uuid, RevisionInfo>,
    seeds: impl IntoIterator<Item = (Uuid, Option<Uuid>)>,
) -> UuidSet {
    let mut marked = UuidSet::new();
    // A revision reached under two different stops must be expanded for both.
    let mut expanded: HashSet<(Uuid, Option<Uuid>)> = HashSet::new();
    let mut queue: VecDeque<(Uuid, Option<Uuid>)> = seeds.into_iter().collect();

    while let Some((uuid, stop)) = queue.pop_front() {
        let Some(info) = revisions.get(&uuid) else {
            continue;
        };
        marked.insert(uuid);
        if Some(uuid) == stop || !expanded.insert((uuid, stop)) {
            continue;
        }
        for parent in info.parents() {
            queue.push_back((parent, stop));
        }
    }
    trace!("Marked {} live revisions", marked.len());
    marked
}

/// Attachments referenced by any revision left in the catalog
pub(crate) fn live_attachments(catalog: &Catalog) -> BTreeSet<AttachmentId> {
    catalog
        .backing_stores
        .values()
        .flat_map(|index| index.revisions.values())
        .flat_map(|info| info.attachments.iter().cloned())
        .collect()
}

/// Fold the counters of `other` into `total`
pub(crate) fn accumulate(total: &mut GcStats, other: GcStats) {
    total.persistent_roots_erased += other.persistent_roots_erased;
    total.branches_erased += other.branches_erased;
    total.revisions_examined += other.revisions_examined;
    total.revisions_erased += other.revisions_erased;
    total.revisions_rewritten += other.revisions_rewritten;
    total.attachments_erased += other.attachments_erased;
    total.bytes_reclaimed += other.bytes_reclaimed;
    total.erased_revisions.extend(other.erased_revisions);
}
