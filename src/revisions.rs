//! Revision payload storage
//!
//! Each revision's item graph is stored in its own payload file under the
//! backing store it belongs to:
//!
//! ```text
//! backing/
//! └── <backing-store-uuid>/
//!     └── <revision-uuid>.rev
//! ```
//!
//! A payload is a bincode [`RevisionRecord`] passed through the
//! [`CompressionEngine`]. Most records are deltas against the parent revision
//! (upserted items plus removed item UUIDs); a full snapshot is written for
//! the first revision of a history and whenever the delta chain would reach
//! the configured snapshot interval. Materializing a revision replays the
//! chain from the nearest snapshot; results are cached.
//!
//! Payload files become visible only once the catalog lists them, so a file
//! written by a transaction that never committed is simply an orphan.

use crate::collections::{concurrent_map, ConcurrentUuidMap};
use crate::compression::CompressionEngine;
use crate::error::{Result, VersoError};
use crate::item_graph::{Item, ItemGraph};
use crate::utils;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

const RECORD_FORMAT: u32 = 1;

/// Depth entries kept per cached graph
const DEPTHS_PER_GRAPH: usize = 16;

/// Stored body of a revision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordBody {
    /// Complete item graph
    Snapshot(ItemGraph),
    /// Changes relative to `base`
    Delta {
        /// Revision the delta applies to (the parent)
        base: Uuid,
        /// Root item UUID of the resulting graph
        root: Uuid,
        /// Items inserted or modified
        upserts: Vec<Item>,
        /// Items removed
        removals: Vec<Uuid>,
    },
}

/// On-disk payload of one revision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionRecord {
    /// Record format version
    pub format: u32,
    /// Revision UUID, checked against the file name on read
    pub revision: Uuid,
    /// Number of deltas between this record and its snapshot
    pub depth: u32,
    /// Snapshot or delta
    pub body: RecordBody,
}

impl RevisionRecord {
    /// Delta base, if this record is a delta
    pub fn delta_base(&self) -> Option<Uuid> {
        match &self.body {
            RecordBody::Snapshot(_) => None,
            RecordBody::Delta { base, .. } => Some(*base),
        }
    }
}

/// Outcome of writing one payload
#[derive(Debug, Clone)]
pub struct WrittenRevision {
    /// Payload file
    pub path: PathBuf,
    /// SHA-256 of the stored bytes
    pub payload_hash: String,
    /// Items inserted or modified relative to the parent
    pub changed_items: Vec<Uuid>,
    /// Items removed relative to the parent
    pub removed_items: Vec<Uuid>,
    /// Stored size in bytes
    pub stored_size: u64,
}

/// Payload files of all backing stores
pub struct RevisionStore {
    root: PathBuf,
    compression: Arc<Mutex<CompressionEngine>>,
    snapshot_interval: u32,
    cache_capacity: usize,
    graphs: ConcurrentUuidMap<Arc<ItemGraph>>,
    depths: ConcurrentUuidMap<u32>,
}

impl std::fmt::Debug for RevisionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionStore")
            .field("root", &self.root)
            .field("snapshot_interval", &self.snapshot_interval)
            .field("cached_graphs", &self.graphs.len())
            .finish()
    }
}

impl RevisionStore {
    /// Open the payload directory under `root`
    pub fn open(
        root: PathBuf,
        compression: Arc<Mutex<CompressionEngine>>,
        snapshot_interval: u32,
        cache_capacity: usize,
    ) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            compression,
            snapshot_interval: snapshot_interval.max(1),
            cache_capacity: cache_capacity.max(1),
            graphs: concurrent_map(cache_capacity.max(1)),
            depths: concurrent_map(cache_capacity.max(1)),
        })
    }

    /// Directory of a backing store
    pub fn backing_dir(&self, backing: Uuid) -> PathBuf {
        self.root.join(backing.to_string())
    }

    /// Payload file of a revision
    pub fn payload_path(&self, backing: Uuid, revision: Uuid) -> PathBuf {
        self.backing_dir(backing).join(format!("{}.rev", revision))
    }

    /// Write the payload of `revision`
    ///
    /// `parent` is the parent revision and its materialized graph; the payload
    /// is a delta against it unless a snapshot is due.
    pub fn write(
        &self,
        backing: Uuid,
        revision: Uuid,
        graph: &ItemGraph,
        parent: Option<(Uuid, &ItemGraph)>,
    ) -> Result<WrittenRevision> {
        let path = self.payload_path(backing, revision);
        if path.exists() {
            return Err(VersoError::consistency(format!(
                "payload for revision {} already exists",
                revision
            )));
        }

        let (changed_items, removed_items) = match parent {
            Some((_, parent_graph)) => changed_between(parent_graph, graph),
            None => (graph.items.keys().copied().collect(), Vec::new()),
        };

        let parent_depth = match parent {
            Some((parent_uuid, _)) => Some(self.depth(backing, parent_uuid)?),
            None => None,
        };

        let record = match (parent, parent_depth) {
            (Some((base, _)), Some(depth)) if depth + 1 < self.snapshot_interval => RevisionRecord {
                format: RECORD_FORMAT,
                revision,
                depth: depth + 1,
                body: RecordBody::Delta {
                    base,
                    root: graph.root,
                    upserts: changed_items
                        .iter()
                        .filter_map(|uuid| graph.get(uuid).cloned())
                        .collect(),
                    removals: removed_items.clone(),
                },
            },
            _ => RevisionRecord {
                format: RECORD_FORMAT,
                revision,
                depth: 0,
                body: RecordBody::Snapshot(graph.clone()),
            },
        };

        let stored = self.encode(&record)?;
        utils::write_durable(&path, &stored)?;
        trace!(
            "Wrote revision {} ({} bytes, depth {})",
            revision,
            stored.len(),
            record.depth
        );

        self.cache_depth(revision, record.depth);
        self.cache_graph(revision, Arc::new(graph.clone()));

        Ok(WrittenRevision {
            path,
            payload_hash: utils::hash_data(&stored),
            changed_items,
            removed_items,
            stored_size: stored.len() as u64,
        })
    }

    /// Materialize the item graph of `revision`
    pub fn item_graph(&self, backing: Uuid, revision: Uuid) -> Result<Arc<ItemGraph>> {
        if let Some(graph) = self.graphs.get(&revision) {
            return Ok(Arc::clone(graph.value()));
        }

        let mut deltas = Vec::new();
        let mut cursor = revision;
        let base = loop {
            if let Some(graph) = self.graphs.get(&cursor) {
                break Arc::clone(graph.value());
            }
            let record = match self.read_record(backing, cursor) {
                Ok(record) => record,
                Err(VersoError::RevisionNotFound(missing)) if missing != revision => {
                    return Err(VersoError::CorruptionDetected(format!(
                        "delta base {} of revision {} is missing",
                        missing, revision
                    )));
                }
                Err(e) => return Err(e),
            };
            match record.body {
                RecordBody::Snapshot(graph) => break Arc::new(graph),
                RecordBody::Delta { base, root, upserts, removals } => {
                    deltas.push((root, upserts, removals));
                    cursor = base;
                }
            }
        };

        let graph = if deltas.is_empty() {
            base
        } else {
            let mut graph = (*base).clone();
            for (root, upserts, removals) in deltas.into_iter().rev() {
                graph.root = root;
                for uuid in &removals {
                    graph.items.remove(uuid);
                }
                for item in upserts {
                    graph.items.insert(item.uuid, item);
                }
            }
            Arc::new(graph)
        };

        self.cache_graph(revision, Arc::clone(&graph));
        Ok(graph)
    }

    /// Read and decode the record of `revision`
    pub fn read_record(&self, backing: Uuid, revision: Uuid) -> Result<RevisionRecord> {
        let bytes = self.read_payload(backing, revision)?;
        let decoded = self.compression.lock().decompress(&bytes)?;
        let (record, _): (RevisionRecord, usize) =
            bincode::serde::decode_from_slice(&decoded, bincode::config::standard())?;
        if record.revision != revision {
            return Err(VersoError::CorruptionDetected(format!(
                "payload file of {} contains revision {}",
                revision, record.revision
            )));
        }
        if record.format != RECORD_FORMAT {
            return Err(VersoError::CorruptionDetected(format!(
                "revision {} has unknown record format {}",
                revision, record.format
            )));
        }
        self.cache_depth(revision, record.depth);
        Ok(record)
    }

    /// Raw stored bytes of a payload
    pub fn read_payload(&self, backing: Uuid, revision: Uuid) -> Result<Vec<u8>> {
        match fs::read(self.payload_path(backing, revision)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(VersoError::RevisionNotFound(revision)),
            Err(e) => Err(e.into()),
        }
    }

    /// Delta depth of a stored revision
    pub fn depth(&self, backing: Uuid, revision: Uuid) -> Result<u32> {
        if let Some(depth) = self.depths.get(&revision) {
            return Ok(*depth);
        }
        Ok(self.read_record(backing, revision)?.depth)
    }

    /// Replace a delta payload with an equivalent snapshot
    ///
    /// Used before the delta base is erased. The materialized graph does not
    /// change; the new payload hash is returned.
    pub fn rewrite_as_snapshot(&self, backing: Uuid, revision: Uuid) -> Result<String> {
        let graph = self.item_graph(backing, revision)?;
        let record = RevisionRecord {
            format: RECORD_FORMAT,
            revision,
            depth: 0,
            body: RecordBody::Snapshot((*graph).clone()),
        };
        let stored = self.encode(&record)?;
        utils::atomic_write(&self.payload_path(backing, revision), &stored)?;
        self.cache_depth(revision, 0);
        debug!("Rewrote revision {} as snapshot", revision);
        Ok(utils::hash_data(&stored))
    }

    /// Delete a payload file; returns the bytes freed
    pub fn delete(&self, backing: Uuid, revision: Uuid) -> Result<u64> {
        let path = self.payload_path(backing, revision);
        let size = utils::file_size(&path);
        self.graphs.remove(&revision);
        self.depths.remove(&revision);
        match fs::remove_file(&path) {
            Ok(()) => Ok(size),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Revision UUIDs with a payload file in `backing`
    pub fn list_payloads(&self, backing: Uuid) -> Result<Vec<Uuid>> {
        let dir = self.backing_dir(backing);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut revisions = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("rev") {
                continue;
            }
            if let Some(uuid) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                revisions.push(uuid);
            }
        }
        revisions.sort();
        Ok(revisions)
    }

    /// Backing store directories present on disk
    pub fn list_backing_stores(&self) -> Result<Vec<Uuid>> {
        let mut stores = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Ok(uuid) = Uuid::parse_str(&entry.file_name().to_string_lossy()) {
                    stores.push(uuid);
                }
            }
        }
        stores.sort();
        Ok(stores)
    }

    /// Stored size of one payload
    pub fn payload_size(&self, backing: Uuid, revision: Uuid) -> u64 {
        utils::file_size(&self.payload_path(backing, revision))
    }

    /// Remove the backing directory if nothing is left in it
    pub fn remove_backing_if_empty(&self, backing: Uuid) -> Result<bool> {
        utils::remove_dir_if_empty(&self.backing_dir(backing))
    }

    /// Drop all cached graphs and depths
    pub fn clear_cache(&self) {
        self.graphs.clear();
        self.depths.clear();
    }

    fn encode(&self, record: &RevisionRecord) -> Result<Vec<u8>> {
        let encoded = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
        self.compression.lock().compress(&encoded)
    }

    fn cache_graph(&self, revision: Uuid, graph: Arc<ItemGraph>) {
        if self.graphs.len() >= self.cache_capacity {
            let victim = self.graphs.iter().next().map(|entry| *entry.key());
            if let Some(victim) = victim {
                self.graphs.remove(&victim);
            }
        }
        self.graphs.insert(revision, graph);
    }

    fn cache_depth(&self, revision: Uuid, depth: u32) {
        if self.depths.len() >= self.cache_capacity * DEPTHS_PER_GRAPH {
            let victim = self.depths.iter().next().map(|entry| *entry.key());
            if let Some(victim) = victim {
                self.depths.remove(&victim);
            }
        }
        self.depths.insert(revision, depth);
    }
}

/// Items of `new` that differ from `old`, and items of `old` missing from `new`
pub fn changed_between(old: &ItemGraph, new: &ItemGraph) -> (Vec<Uuid>, Vec<Uuid>) {
    let changed = new
        .items
        .iter()
        .filter(|(uuid, item)| old.items.get(uuid) != Some(item))
        .map(|(uuid, _)| *uuid)
        .collect();
    let removed = old
        .items
        .keys()
        .filter(|uuid| !new.items.contains_key(uuid))
        .copied()
        .collect();
    (changed, removed)
}
