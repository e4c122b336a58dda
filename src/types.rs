//! Core types and data structures for verso
//!
//! Catalog records (persistent roots, branches, revision metadata), the
//! identifiers tying them together, store configuration, and the statistics
//! returned by maintenance operations.

use crate::compression::CompressionStrategy;
use crate::error::{Result, VersoError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Optimistic concurrency token of a persistent root
///
/// Advanced by one on every committed transaction that touches the root.
/// A transaction carries the value its author last observed; the commit is
/// rejected if the store has moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub i64);

impl TransactionId {
    /// Sentinel meaning "this persistent root does not exist yet"
    pub const NONEXISTENT: TransactionId = TransactionId(-1);

    /// Id of a freshly created persistent root
    pub const INITIAL: TransactionId = TransactionId(0);

    /// The id following this one
    pub fn next(self) -> Self {
        TransactionId(self.0 + 1)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content address of an attachment blob (lowercase hex SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttachmentId(String);

impl AttachmentId {
    /// Hash `data` into its attachment id
    pub fn for_data(data: &[u8]) -> Self {
        AttachmentId(crate::utils::hash_data(data))
    }

    /// The hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shard prefix and file name inside the attachments directory
    pub fn shard(&self) -> (&str, &str) {
        self.0.split_at(2)
    }
}

impl FromStr for AttachmentId {
    type Err = VersoError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(VersoError::invalid_argument(format!(
                "attachment id must be 64 lowercase hex characters, got '{}'",
                s
            )));
        }
        Ok(AttachmentId(s.to_string()))
    }
}

impl TryFrom<String> for AttachmentId {
    type Error = VersoError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AttachmentId> for String {
    fn from(id: AttachmentId) -> Self {
        id.0
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reject the nil UUID where a real identifier is required
pub(crate) fn require_uuid(uuid: Uuid, what: &str) -> Result<Uuid> {
    if uuid.is_nil() {
        return Err(VersoError::invalid_argument(format!("{} must not be the nil UUID", what)));
    }
    Ok(uuid)
}

/// Free-form metadata attached to revisions, branches and roots
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Metadata of one immutable revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionInfo {
    /// Revision UUID
    pub uuid: Uuid,
    /// Persistent root the revision was committed through
    pub persistent_root: Uuid,
    /// Nominal branch the revision was committed on
    pub branch: Uuid,
    /// Backing store holding the payload
    pub backing_store: Uuid,
    /// Parent revision (`None` only for the first revision of a history)
    pub parent: Option<Uuid>,
    /// Second parent of a merge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_parent: Option<Uuid>,
    /// Commit time
    pub timestamp: DateTime<Utc>,
    /// Commit metadata (message, command name, ...)
    #[serde(default)]
    pub metadata: Metadata,
    /// Schema version the payload was written with
    pub schema_version: u32,
    /// Commit order within the backing store
    pub sequence: u64,
    /// Items inserted or modified relative to the parent
    #[serde(default)]
    pub changed_items: Vec<Uuid>,
    /// Items removed relative to the parent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_items: Vec<Uuid>,
    /// Attachments referenced anywhere in the revision's item graph
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentId>,
    /// SHA-256 of the stored payload bytes
    pub payload_hash: String,
}

impl RevisionInfo {
    /// Parent and merge parent, in that order
    pub fn parents(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.parent.iter().chain(self.merge_parent.iter()).copied()
    }

    /// Short display form (first 8 UUID characters)
    pub fn short_id(&self) -> String {
        self.uuid.to_string()[..8].to_string()
    }
}

/// A named line of development inside a persistent root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchInfo {
    /// Branch UUID
    pub uuid: Uuid,
    /// Owning persistent root
    pub persistent_root: Uuid,
    /// Revision currently checked out
    pub current_revision: Option<Uuid>,
    /// Newest revision reachable by redo
    pub head_revision: Option<Uuid>,
    /// Oldest revision undo may reach; history before it is reclaimable
    pub initial_revision: Option<Uuid>,
    /// Branch this one was forked from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_branch: Option<Uuid>,
    /// Soft-deletion flag
    #[serde(default)]
    pub deleted: bool,
    /// When false, head always equals current and undo writes a new revision
    #[serde(default = "default_true")]
    pub supports_revert: bool,
    /// Branch metadata (name, ...)
    #[serde(default)]
    pub metadata: Metadata,
}

fn default_true() -> bool {
    true
}

impl BranchInfo {
    /// Display name from metadata, falling back to the short UUID
    pub fn name(&self) -> String {
        self.metadata
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| self.uuid.to_string()[..8].to_string())
    }
}

/// Source of a cheap copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopySource {
    /// Persistent root that was copied
    pub persistent_root: Uuid,
    /// Revision the copy started from
    pub revision: Uuid,
}

/// Top-level versioned document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentRootInfo {
    /// Persistent root UUID
    pub uuid: Uuid,
    /// Backing store shared with cheap copies
    pub backing_store: Uuid,
    /// Branch currently selected
    pub current_branch: Option<Uuid>,
    /// All branch rows, including soft-deleted ones
    pub branches: BTreeMap<Uuid, BranchInfo>,
    /// Soft-deletion flag
    #[serde(default)]
    pub deleted: bool,
    /// Root metadata
    #[serde(default)]
    pub metadata: Metadata,
    /// Optimistic concurrency token
    pub transaction_id: TransactionId,
    /// Set when this root was created as a cheap copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copied_from: Option<CopySource>,
}

impl PersistentRootInfo {
    /// The currently selected branch row
    pub fn current_branch_info(&self) -> Option<&BranchInfo> {
        self.current_branch.and_then(|uuid| self.branches.get(&uuid))
    }

    /// Current revision of the current branch
    pub fn current_revision(&self) -> Option<Uuid> {
        self.current_branch_info().and_then(|b| b.current_revision)
    }

    /// Branch rows that are not soft-deleted
    pub fn live_branches(&self) -> impl Iterator<Item = &BranchInfo> {
        self.branches.values().filter(|b| !b.deleted)
    }

    /// Branch rows that are soft-deleted
    pub fn deleted_branches(&self) -> impl Iterator<Item = &BranchInfo> {
        self.branches.values().filter(|b| b.deleted)
    }
}

/// Options for [`crate::Store::revision_infos`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevisionInfoOptions {
    /// Keep walking past the branch's initial revision into the revisions it
    /// was forked from
    pub include_parent_branches: bool,
    /// Include revisions committed on this branch that are no longer on the
    /// path to head
    pub include_divergent: bool,
}

/// A full-text search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Persistent root the revision belongs to
    pub persistent_root: Uuid,
    /// Revision whose changed item matched
    pub revision: Uuid,
    /// Matching item
    pub item: Uuid,
    /// Indexed text that matched
    pub text: String,
    /// Number of query tokens found
    pub score: usize,
}

/// Change notification published after each successful commit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreChangeNotification {
    /// Store that changed
    pub store_uuid: Uuid,
    /// Persistent roots created by the transaction
    pub inserted: BTreeSet<Uuid>,
    /// Persistent roots deleted (soft) by the transaction
    pub deleted: BTreeSet<Uuid>,
    /// New transaction id of every touched root
    pub transaction_ids: BTreeMap<Uuid, TransactionId>,
    /// Revisions written by the transaction
    #[serde(default)]
    pub revisions: Vec<Uuid>,
}

impl StoreChangeNotification {
    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.transaction_ids.is_empty() && self.inserted.is_empty() && self.deleted.is_empty()
    }
}

/// Observer invoked after committed changes
///
/// Implementations must be cheap; they run while the commit lock is releasing.
///
/// ```rust,ignore
/// struct Printer;
///
/// impl StoreObserver for Printer {
///     fn store_changed(&self, n: &StoreChangeNotification) -> verso::Result<()> {
///         println!("{} roots changed", n.transaction_ids.len());
///         Ok(())
///     }
/// }
/// ```
pub trait StoreObserver: Send + Sync {
    /// Called after a transaction committed or a reload observed changes
    fn store_changed(&self, notification: &StoreChangeNotification) -> Result<()>;
}

impl<F> StoreObserver for F
where
    F: Fn(&StoreChangeNotification) + Send + Sync,
{
    fn store_changed(&self, notification: &StoreChangeNotification) -> Result<()> {
        self(notification);
        Ok(())
    }
}

/// Configuration persisted with the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Compression strategy, including its size threshold
    pub compression_strategy: CompressionStrategy,
    /// Maximum delta chain length before a full snapshot is written
    pub snapshot_interval: u32,
    /// Materialized item graphs kept in memory
    pub revision_cache_capacity: usize,
    /// Worker threads for verification and vacuum
    pub parallel_workers: usize,
    /// `supports_revert` of branches created without an explicit choice
    pub default_supports_revert: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            compression_strategy: CompressionStrategy::Fast,
            snapshot_interval: 16,
            revision_cache_capacity: 256,
            parallel_workers: num_cpus::get(),
            default_supports_revert: true,
        }
    }
}

impl StoreConfig {
    /// Check values that would make the store unusable
    pub fn validate(&self) -> Result<()> {
        if self.snapshot_interval == 0 {
            return Err(VersoError::InvalidConfiguration(
                "snapshot_interval must be at least 1".to_string(),
            ));
        }
        if self.parallel_workers == 0 {
            return Err(VersoError::InvalidConfiguration(
                "parallel_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Information about the host that created the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    /// Hostname
    pub hostname: String,
    /// Operating system
    pub os: String,
    /// Process id of the creating process
    pub pid: u32,
}

impl Default for HostInfo {
    fn default() -> Self {
        Self {
            hostname: hostname::get()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            os: std::env::consts::OS.to_string(),
            pid: std::process::id(),
        }
    }
}

/// Metadata stored with the store (`metadata.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// Version of the on-disk format
    pub format_version: u32,
    /// Store UUID
    pub store_uuid: Uuid,
    /// Library version that created the store
    pub verso_version: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last time the store was opened
    pub last_accessed: DateTime<Utc>,
    /// Creating host
    pub created_by: HostInfo,
    /// Configuration
    pub config: StoreConfig,
}

/// Statistics from finalizing deletions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GcStats {
    /// Persistent root rows erased
    pub persistent_roots_erased: usize,
    /// Branch rows erased
    pub branches_erased: usize,
    /// Revisions examined in the swept backing stores
    pub revisions_examined: usize,
    /// Revisions erased
    pub revisions_erased: usize,
    /// Surviving revisions rewritten as snapshots because their delta base was erased
    pub revisions_rewritten: usize,
    /// Attachments erased
    pub attachments_erased: usize,
    /// Payload and attachment bytes reclaimed
    pub bytes_reclaimed: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Revisions that were (or in a dry run would be) erased
    pub erased_revisions: Vec<Uuid>,
}

impl GcStats {
    /// One-line summary for logs and the CLI
    pub fn summary(&self) -> String {
        format!(
            "{} roots, {} branches, {} of {} revisions erased ({} rewritten), {} attachments, {} reclaimed",
            self.persistent_roots_erased,
            self.branches_erased,
            self.revisions_erased,
            self.revisions_examined,
            self.revisions_rewritten,
            self.attachments_erased,
            crate::utils::format_bytes(self.bytes_reclaimed)
        )
    }
}

/// Statistics from a vacuum pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VacuumStats {
    /// Payload files examined
    pub payloads_examined: usize,
    /// Orphaned payload files removed
    pub orphans_removed: usize,
    /// Empty backing directories removed
    pub directories_removed: usize,
    /// Bytes reclaimed
    pub bytes_reclaimed: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl VacuumStats {
    /// One-line summary for logs and the CLI
    pub fn summary(&self) -> String {
        format!(
            "{} orphaned payloads and {} directories removed, {} reclaimed",
            self.orphans_removed,
            self.directories_removed,
            crate::utils::format_bytes(self.bytes_reclaimed)
        )
    }
}

/// Size attributes of one persistent root
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentRootAttributes {
    /// Bytes needed to export the root's live history (its own revisions)
    pub export_size: u64,
    /// Bytes of its backing store on disk, shared with cheap copies
    pub used_size: u64,
}

/// Store-wide page accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageStatistics {
    /// Page size used for accounting
    pub page_size: u64,
    /// Pages occupied by store files
    pub total_pages: u64,
    /// Pages held by orphaned payloads that vacuum would free
    pub free_pages: u64,
}

/// Page size used by [`PageStatistics`]
pub const PAGE_SIZE: u64 = 4096;
