//! The store facade
//!
//! [`Store`] is the entry point for everything persistent: committing
//! transactions, querying revisions and item graphs, attachments, garbage
//! collection and maintenance. It coordinates the subsystems below it:
//!
//! - **Catalog**: the single JSON document holding all mutable state
//! - **Revision store**: immutable payload files, delta-encoded
//! - **Attachment store**: content-addressed blobs
//! - **Migration registry**: upgrades item graphs written with older schemas
//!
//! ## On-disk layout
//!
//! ```text
//! <store>/
//! ├── metadata.json    # StoreMetadata (format, uuid, config)
//! ├── catalog.json     # Catalog, replaced atomically on every commit
//! ├── store.lock       # flock(2) serializing writers across processes
//! ├── backing/         # revision payloads per backing store
//! ├── attachments/     # sharded attachment blobs
//! └── undo/            # undo track state
//! ```
//!
//! ## Thread Safety
//!
//! `Store` is `Send + Sync` and is meant to be shared through an `Arc`.
//! Queries read an immutable snapshot of the catalog. Writers (commit,
//! garbage collection, vacuum) take the in-process commit lock and then the
//! store's file lock, so commits from threads and from other processes are
//! serialized. Optimistic transaction ids detect the lost-update races that
//! serialization alone cannot.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use verso::{Item, ItemGraph, Metadata, Store, StoreTransaction};
//!
//! # fn main() -> verso::Result<()> {
//! let store = Store::init("./notes.verso")?;
//!
//! let mut tx = StoreTransaction::new();
//! let graph = ItemGraph::new(Item::new("Document", "text", 1).with("title", "Groceries"));
//! let (root, _branch, revision) = tx.create_persistent_root_with_graph(graph, Metadata::new());
//! store.commit(tx)?;
//!
//! let content = store.item_graph(revision, root)?.expect("just committed");
//! assert_eq!(content.root_item().unwrap().get_str("title"), Some("Groceries"));
//! # Ok(())
//! # }
//! ```

use crate::attachments::AttachmentStore;
use crate::catalog::Catalog;
use crate::compression::{CompressionEngine, CompressionStrategy};
use crate::error::{Result, VersoError};
use crate::flock::FileLock;
use crate::gc;
use crate::item_graph::ItemGraph;
use crate::migration::{MigrationDriver, MigrationRegistry};
use crate::revisions::RevisionStore;
use crate::transaction::{CommitState, StoreTransaction};
use crate::types::*;
use crate::utils;
use crate::verification::{StoreVerifier, VerificationReport};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// On-disk store format
pub const STORE_FORMAT: u32 = 1;

const METADATA_FILE: &str = "metadata.json";
const CATALOG_FILE: &str = "catalog.json";
const LOCK_FILE: &str = "store.lock";
const BACKING_DIR: &str = "backing";
const ATTACHMENTS_DIR: &str = "attachments";
/// Directory holding undo track state
pub(crate) const UNDO_DIR: &str = "undo";

/// A versioned object store
///
/// # Examples
///
/// ```rust,no_run
/// use verso::{Store, StoreBuilder, CompressionStrategy};
///
/// # fn main() -> verso::Result<()> {
/// // Direct initialization with default configuration
/// let store = Store::init("./a.verso")?;
///
/// // Builder for custom configuration; opens the store if it already exists
/// let store = StoreBuilder::new()
///     .compression_strategy(CompressionStrategy::None)
///     .snapshot_interval(8)
///     .build("./b.verso")?;
/// # Ok(())
/// # }
/// ```
pub struct Store {
    /// Store directory
    root: PathBuf,
    /// Persisted store metadata
    metadata: RwLock<StoreMetadata>,
    /// Last catalog loaded or written by this handle
    catalog: RwLock<Arc<Catalog>>,
    /// Revision payloads
    revisions: Arc<RevisionStore>,
    /// Attachment blobs
    attachments: Arc<AttachmentStore>,
    /// Serializes writers within the process
    commit_lock: Mutex<()>,
    /// Change observers
    observers: Mutex<Vec<Box<dyn StoreObserver>>>,
    /// Schema migrations applied when item graphs are read
    migrations: Option<Arc<MigrationRegistry>>,
    /// Sized by `parallel_workers`; runs verification and vacuum
    workers: rayon::ThreadPool,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root)
            .field("store_uuid", &self.metadata.read().store_uuid)
            .field("generation", &self.catalog.read().generation)
            .field("revisions", &self.revisions)
            .field("observers", &format!("<{} observers>", self.observers.lock().len()))
            .field("migrations", &self.migrations.as_ref().map(|m| m.len()))
            .finish()
    }
}

impl Store {
    /// Create a new store at `path` with the default configuration
    ///
    /// # Errors
    ///
    /// - [`VersoError::StorageAlreadyExists`] if a store is already there
    /// - I/O errors creating the directory layout
    #[instrument(skip(path))]
    pub fn init(path: impl Into<PathBuf>) -> Result<Self> {
        Self::init_with(path.into(), StoreConfig::default(), None)
    }

    /// Open an existing store at `path`
    ///
    /// The persisted configuration is used.
    ///
    /// # Errors
    ///
    /// - [`VersoError::StorageNotInitialized`] if there is no store at `path`
    /// - [`VersoError::InvalidConfiguration`] if the store was written by a
    ///   newer format
    #[instrument(skip(path))]
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with(path.into(), None)
    }

    fn init_with(root: PathBuf, config: StoreConfig, migrations: Option<Arc<MigrationRegistry>>) -> Result<Self> {
        info!("Initializing store at {:?}", root);
        config.validate()?;

        let metadata_path = root.join(METADATA_FILE);
        if metadata_path.exists() {
            return Err(VersoError::StorageAlreadyExists(root));
        }

        fs::create_dir_all(root.join(BACKING_DIR))?;
        fs::create_dir_all(root.join(ATTACHMENTS_DIR))?;
        fs::create_dir_all(root.join(UNDO_DIR))?;

        let now = Utc::now();
        let metadata = StoreMetadata {
            format_version: STORE_FORMAT,
            store_uuid: Uuid::new_v4(),
            verso_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: now,
            last_accessed: now,
            created_by: HostInfo::default(),
            config,
        };

        let catalog = Catalog::default();
        catalog.save(&root.join(CATALOG_FILE))?;
        // metadata.json last: its presence marks a complete store
        utils::atomic_write(&metadata_path, &serde_json::to_vec_pretty(&metadata)?)?;

        debug!("Created store {}", metadata.store_uuid);
        Self::assemble(root, metadata, catalog, migrations)
    }

    fn open_with(root: PathBuf, migrations: Option<Arc<MigrationRegistry>>) -> Result<Self> {
        info!("Opening store at {:?}", root);
        let metadata_path = root.join(METADATA_FILE);
        if !metadata_path.exists() {
            return Err(VersoError::StorageNotInitialized(root));
        }

        let mut metadata: StoreMetadata = serde_json::from_slice(&fs::read(&metadata_path)?)?;
        if metadata.format_version > STORE_FORMAT {
            return Err(VersoError::InvalidConfiguration(format!(
                "store format {} is newer than the supported format {}",
                metadata.format_version, STORE_FORMAT
            )));
        }
        metadata.config.validate()?;

        metadata.last_accessed = Utc::now();
        if let Err(e) = serde_json::to_vec_pretty(&metadata)
            .map_err(VersoError::from)
            .and_then(|bytes| utils::atomic_write(&metadata_path, &bytes))
        {
            // Another process opening the store at the same time can race us
            warn!("Failed to update last access time: {}", e);
        }

        let catalog = Catalog::load(&root.join(CATALOG_FILE))?;
        Self::assemble(root, metadata, catalog, migrations)
    }

    fn assemble(
        root: PathBuf,
        metadata: StoreMetadata,
        catalog: Catalog,
        migrations: Option<Arc<MigrationRegistry>>,
    ) -> Result<Self> {
        let strategy = metadata.config.compression_strategy.clone();
        let compression = Arc::new(Mutex::new(CompressionEngine::new(strategy)));
        let revisions = RevisionStore::open(
            root.join(BACKING_DIR),
            Arc::clone(&compression),
            metadata.config.snapshot_interval,
            metadata.config.revision_cache_capacity,
        )?;
        let attachments = AttachmentStore::open(root.join(ATTACHMENTS_DIR), compression)?;
        fs::create_dir_all(root.join(UNDO_DIR))?;
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(metadata.config.parallel_workers)
            .thread_name(|i| format!("verso-worker-{}", i))
            .build()
            .map_err(|e| VersoError::Internal(format!("failed to start worker pool: {}", e)))?;

        Ok(Self {
            root,
            metadata: RwLock::new(metadata),
            catalog: RwLock::new(Arc::new(catalog)),
            revisions: Arc::new(revisions),
            attachments: Arc::new(attachments),
            commit_lock: Mutex::new(()),
            observers: Mutex::new(Vec::new()),
            migrations,
            workers,
        })
    }

    pub(crate) fn workers(&self) -> &rayon::ThreadPool {
        &self.workers
    }

    /// Store directory
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Store UUID
    pub fn store_uuid(&self) -> Uuid {
        self.metadata.read().store_uuid
    }

    /// Persisted store metadata
    pub fn metadata(&self) -> StoreMetadata {
        self.metadata.read().clone()
    }

    /// Active configuration
    pub fn config(&self) -> StoreConfig {
        self.metadata.read().config.clone()
    }

    /// Snapshot of the catalog as last seen by this handle
    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog.read())
    }

    pub(crate) fn revision_store(&self) -> &RevisionStore {
        &self.revisions
    }

    fn catalog_path(&self) -> PathBuf {
        self.root.join(CATALOG_FILE)
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Empty transaction carrying the current ids of `persistent_roots`
    ///
    /// # Errors
    ///
    /// [`VersoError::PersistentRootNotFound`] for an unknown root.
    pub fn transaction_for(&self, persistent_roots: &[Uuid]) -> Result<StoreTransaction> {
        let catalog = self.catalog();
        let mut tx = StoreTransaction::new();
        for uuid in persistent_roots {
            require_uuid(*uuid, "persistent root")?;
            let root = catalog.root(uuid).ok_or(VersoError::PersistentRootNotFound(*uuid))?;
            tx.set_old_transaction_id(*uuid, root.transaction_id);
        }
        Ok(tx)
    }

    /// Current transaction id of a persistent root
    pub fn transaction_id(&self, persistent_root: Uuid) -> Option<TransactionId> {
        self.catalog.read().root(&persistent_root).map(|r| r.transaction_id)
    }

    /// Apply a transaction atomically
    ///
    /// Either every operation takes effect and each touched persistent root's
    /// transaction id advances by one, or nothing changes and the error says
    /// why. Registered observers receive the returned notification.
    ///
    /// # Errors
    ///
    /// - [`VersoError::TransactionConflict`] if a touched root moved on since
    ///   the transaction's ids were recorded
    /// - [`VersoError::InvalidArgument`] for nil or reused UUIDs, or a touched
    ///   root without a recorded id
    /// - [`VersoError::ConsistencyViolation`] and the `*NotFound` variants when
    ///   an operation breaks a structural rule
    #[instrument(skip(self, tx), fields(operations = tx.len()))]
    pub fn commit(&self, tx: StoreTransaction) -> Result<StoreChangeNotification> {
        let start = Instant::now();
        let store_uuid = self.store_uuid();
        if tx.is_empty() {
            return Ok(StoreChangeNotification {
                store_uuid,
                ..StoreChangeNotification::default()
            });
        }

        let transaction_ids = {
            let _guard = self.commit_lock.lock();
            let _file_lock = FileLock::acquire(self.lock_path())?;

            let catalog = Catalog::load(&self.catalog_path())?;
            let default_supports_revert = self.metadata.read().config.default_supports_revert;
            let mut state = CommitState::new(catalog, &self.revisions, &self.attachments, default_supports_revert);

            match self.apply_transaction(&mut state, &tx) {
                Ok(ids) => {
                    let catalog = std::mem::take(&mut state.catalog);
                    *self.catalog.write() = Arc::new(catalog);
                    ids
                }
                Err(e) => {
                    debug!("Commit failed, discarding {} payloads: {}", state.written.len(), e);
                    for (backing, revision) in &state.written {
                        if let Err(cleanup) = self.revisions.delete(*backing, *revision) {
                            warn!("Failed to remove payload of uncommitted revision {}: {}", revision, cleanup);
                        }
                    }
                    return Err(e);
                }
            }
        };

        let notification = StoreChangeNotification {
            store_uuid,
            inserted: tx.created_persistent_roots(),
            deleted: tx.deleted_persistent_roots(),
            transaction_ids,
            revisions: tx.written_revisions(),
        };

        info!(
            "Committed {} operations on {} persistent roots in {}ms",
            tx.len(),
            notification.transaction_ids.len(),
            start.elapsed().as_millis()
        );
        self.notify(&notification);
        Ok(notification)
    }

    fn apply_transaction(
        &self,
        state: &mut CommitState<'_>,
        tx: &StoreTransaction,
    ) -> Result<BTreeMap<Uuid, TransactionId>> {
        state.check_transaction_ids(tx)?;
        for operation in tx.operations() {
            state.apply(operation)?;
        }
        let ids = state.advance_transaction_ids(tx);
        state.catalog.generation += 1;
        state.catalog.save(&self.catalog_path())?;
        Ok(ids)
    }

    /// Re-read the catalog written by other processes
    ///
    /// Returns, and publishes to observers, the persistent roots whose
    /// transaction ids differ from what this handle last saw.
    #[instrument(skip(self))]
    pub fn reload(&self) -> Result<StoreChangeNotification> {
        let _guard = self.commit_lock.lock();
        let fresh = Catalog::load(&self.catalog_path())?;
        let old = self.catalog();

        let mut notification = StoreChangeNotification {
            store_uuid: self.store_uuid(),
            ..StoreChangeNotification::default()
        };
        if fresh.generation == old.generation {
            return Ok(notification);
        }

        for (uuid, root) in &fresh.persistent_roots {
            match old.root(uuid) {
                None => {
                    notification.inserted.insert(*uuid);
                    notification.transaction_ids.insert(*uuid, root.transaction_id);
                }
                Some(previous) => {
                    if previous.transaction_id != root.transaction_id {
                        notification.transaction_ids.insert(*uuid, root.transaction_id);
                    }
                    if root.deleted && !previous.deleted {
                        notification.deleted.insert(*uuid);
                    }
                }
            }
        }
        for index in fresh.backing_stores.values() {
            let known = old.backing(&index.uuid);
            notification.revisions.extend(
                index
                    .revisions
                    .values()
                    .filter(|info| known.map_or(true, |k| !k.revisions.contains_key(&info.uuid)))
                    .map(|info| info.uuid),
            );
        }

        debug!(
            "Reloaded catalog generation {} -> {}: {} roots changed",
            old.generation,
            fresh.generation,
            notification.transaction_ids.len()
        );
        *self.catalog.write() = Arc::new(fresh);
        drop(_guard);

        self.notify(&notification);
        Ok(notification)
    }

    /// Register a change observer
    ///
    /// Observers run on the committing thread after the commit lock is
    /// released; they must not commit to this store from the callback.
    pub fn add_observer(&self, observer: Box<dyn StoreObserver>) {
        self.observers.lock().push(observer);
    }

    fn notify(&self, notification: &StoreChangeNotification) {
        if notification.is_empty() {
            return;
        }
        for observer in self.observers.lock().iter() {
            if let Err(e) = observer.store_changed(notification) {
                warn!("Store observer failed: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Metadata of `revision` as seen from `persistent_root`
    pub fn revision_info(&self, revision: Uuid, persistent_root: Uuid) -> Result<Option<RevisionInfo>> {
        require_uuid(revision, "revision")?;
        require_uuid(persistent_root, "persistent root")?;
        Ok(self
            .catalog
            .read()
            .revision_for_root(&persistent_root, &revision)
            .cloned())
    }

    /// History of a branch, oldest first
    ///
    /// By default the revisions from the branch's head back to its initial
    /// revision. See [`RevisionInfoOptions`] for wider views. `None` if the
    /// branch is unknown.
    pub fn revision_infos(&self, branch: Uuid, options: RevisionInfoOptions) -> Result<Option<Vec<RevisionInfo>>> {
        require_uuid(branch, "branch")?;
        let catalog = self.catalog();
        let Some(info) = catalog.branch(&branch) else {
            return Ok(None);
        };
        let Some(index) = catalog.backing_for_root(&info.persistent_root) else {
            return Ok(Some(Vec::new()));
        };
        let graph = index.graph();

        let mut selected = BTreeSet::new();
        if let Some(head) = info.head_revision {
            for uuid in graph.parent_chain(head) {
                selected.insert(uuid);
                if !options.include_parent_branches && Some(uuid) == info.initial_revision {
                    break;
                }
            }
        }
        if options.include_divergent {
            selected.extend(
                index
                    .revisions
                    .values()
                    .filter(|r| r.branch == branch)
                    .map(|r| r.uuid),
            );
        }

        let mut revisions: Vec<RevisionInfo> = selected
            .iter()
            .filter_map(|uuid| graph.get(uuid).cloned())
            .collect();
        revisions.sort_by_key(|r| r.sequence);
        Ok(Some(revisions))
    }

    /// Item graph of `revision`, migrated to the registered schema versions
    ///
    /// `None` if the revision is unknown to `persistent_root`.
    ///
    /// # Errors
    ///
    /// - [`VersoError::CorruptionDetected`] if the payload cannot be decoded
    /// - Migration errors when a registry is attached and a step is missing
    ///   or fails
    pub fn item_graph(&self, revision: Uuid, persistent_root: Uuid) -> Result<Option<ItemGraph>> {
        require_uuid(revision, "revision")?;
        require_uuid(persistent_root, "persistent root")?;
        let backing = {
            let catalog = self.catalog.read();
            match catalog.revision_for_root(&persistent_root, &revision) {
                Some(info) => info.backing_store,
                None => return Ok(None),
            }
        };

        let graph = self.revisions.item_graph(backing, revision)?;
        match &self.migrations {
            Some(registry) if registry.needs_migration(&graph) => {
                debug!("Migrating item graph of revision {}", revision);
                Ok(Some(MigrationDriver::new(registry).migrate(&graph)?))
            }
            _ => Ok(Some((*graph).clone())),
        }
    }

    /// Items of `to` changed on the parent path from `from` to `to`
    ///
    /// The result keeps the root UUID of `to`; items unchanged since `from`
    /// are left out.
    ///
    /// # Errors
    ///
    /// - [`VersoError::RevisionNotFound`] if either revision is unknown
    /// - [`VersoError::ConsistencyViolation`] if `from` is not an ancestor of `to`
    pub fn partial_item_graph(&self, from: Uuid, to: Uuid, persistent_root: Uuid) -> Result<ItemGraph> {
        require_uuid(from, "revision")?;
        require_uuid(to, "revision")?;
        let changed: BTreeSet<Uuid> = {
            let catalog = self.catalog();
            let index = catalog
                .backing_for_root(&persistent_root)
                .ok_or(VersoError::PersistentRootNotFound(persistent_root))?;
            let graph = index.graph();
            for revision in [from, to] {
                if !graph.contains(&revision) {
                    return Err(VersoError::RevisionNotFound(revision));
                }
            }
            let path = graph.path_to_ancestor(to, from).ok_or_else(|| {
                VersoError::consistency(format!("revision {} is not an ancestor of {}", from, to))
            })?;
            path.iter()
                .filter(|uuid| **uuid != from)
                .filter_map(|uuid| graph.get(uuid))
                .flat_map(|info| info.changed_items.iter().copied())
                .collect()
        };

        let full = self
            .item_graph(to, persistent_root)?
            .ok_or(VersoError::RevisionNotFound(to))?;
        Ok(full.subgraph(&changed))
    }

    /// Catalog row of a persistent root, deleted or not
    pub fn persistent_root_info(&self, persistent_root: Uuid) -> Result<Option<PersistentRootInfo>> {
        require_uuid(persistent_root, "persistent root")?;
        Ok(self.catalog.read().root(&persistent_root).cloned())
    }

    /// Catalog row of a branch, deleted or not
    pub fn branch_info(&self, branch: Uuid) -> Result<Option<BranchInfo>> {
        require_uuid(branch, "branch")?;
        Ok(self.catalog.read().branch(&branch).cloned())
    }

    /// Persistent roots that are not deleted
    pub fn persistent_root_uuids(&self) -> Vec<Uuid> {
        self.catalog
            .read()
            .persistent_roots
            .values()
            .filter(|r| !r.deleted)
            .map(|r| r.uuid)
            .collect()
    }

    /// Soft-deleted persistent roots awaiting finalization
    pub fn deleted_persistent_root_uuids(&self) -> Vec<Uuid> {
        self.catalog
            .read()
            .persistent_roots
            .values()
            .filter(|r| r.deleted)
            .map(|r| r.uuid)
            .collect()
    }

    /// Full-text search over the items each revision changed
    pub fn search(&self, query: &str) -> Vec<SearchResult> {
        self.catalog.read().search(query)
    }

    /// Live persistent roots whose current content references `persistent_root`
    pub fn persistent_roots_referencing(&self, persistent_root: Uuid) -> Result<Vec<Uuid>> {
        require_uuid(persistent_root, "persistent root")?;
        Ok(self.catalog.read().roots_referencing(&persistent_root))
    }

    // ------------------------------------------------------------------
    // Attachments
    // ------------------------------------------------------------------

    /// Store `data` as an attachment; idempotent
    pub fn import_attachment(&self, data: &[u8]) -> Result<AttachmentId> {
        self.attachments.import(data)
    }

    /// Store the contents of a file as an attachment
    pub fn import_attachment_file(&self, path: &Path) -> Result<AttachmentId> {
        self.attachments.import_file(path)
    }

    /// Bytes of an attachment, `None` if it is not stored
    pub fn attachment(&self, id: &AttachmentId) -> Result<Option<Vec<u8>>> {
        self.attachments.load(id)
    }

    /// Whether an attachment is stored
    pub fn has_attachment(&self, id: &AttachmentId) -> bool {
        self.attachments.contains(id)
    }

    // ------------------------------------------------------------------
    // Garbage collection and maintenance
    // ------------------------------------------------------------------

    /// Permanently erase what `persistent_root` no longer needs
    ///
    /// Erases the root itself if it is soft-deleted, its soft-deleted
    /// branches otherwise, then every revision of its backing store that no
    /// remaining branch can reach, and finally attachments no surviving
    /// revision references. Running it twice in a row is a no-op the second
    /// time.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// # use verso::{Store, StoreTransaction};
    /// # fn main() -> verso::Result<()> {
    /// # let store = Store::open("./notes.verso")?;
    /// # let root = store.persistent_root_uuids()[0];
    /// let preview = store.gc_analyze(root)?;
    /// println!("would erase {} revisions", preview.revisions_erased);
    ///
    /// let stats = store.finalize_deletions(root)?;
    /// println!("reclaimed {} bytes", stats.bytes_reclaimed);
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Notes
    ///
    /// - This operation is irreversible
    /// - The catalog write is the commit point; payload files are removed
    ///   after it, and leftovers from a crash are swept by the next run or by
    ///   [`Store::vacuum`]
    #[instrument(skip(self))]
    pub fn finalize_deletions(&self, persistent_root: Uuid) -> Result<GcStats> {
        require_uuid(persistent_root, "persistent root")?;
        info!("Finalizing deletions of persistent root {}", persistent_root);
        let start = Instant::now();

        let mut stats = {
            let _guard = self.commit_lock.lock();
            let _file_lock = FileLock::acquire(self.lock_path())?;
            self.collect_locked(persistent_root, false)?
        };

        stats.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Garbage collection complete in {}ms: {} revisions erased, {} rewritten, {} attachments erased, {} bytes reclaimed",
            stats.duration_ms,
            stats.revisions_erased,
            stats.revisions_rewritten,
            stats.attachments_erased,
            stats.bytes_reclaimed
        );
        Ok(stats)
    }

    /// Finalize deletions of every persistent root in the store
    #[instrument(skip(self))]
    pub fn finalize_all_deletions(&self) -> Result<GcStats> {
        info!("Finalizing deletions of all persistent roots");
        let start = Instant::now();
        let mut total = GcStats::default();
        {
            let _guard = self.commit_lock.lock();
            let _file_lock = FileLock::acquire(self.lock_path())?;
            let roots: Vec<Uuid> = Catalog::load(&self.catalog_path())?
                .persistent_roots
                .keys()
                .copied()
                .collect();
            for root in roots {
                gc::accumulate(&mut total, self.collect_locked(root, false)?);
            }
        }
        total.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Garbage collection of all roots complete in {}ms: {} revisions erased, {} bytes reclaimed",
            total.duration_ms,
            total.revisions_erased,
            total.bytes_reclaimed
        );
        Ok(total)
    }

    /// Report what [`Store::finalize_deletions`] would erase without erasing it
    #[instrument(skip(self))]
    pub fn gc_analyze(&self, persistent_root: Uuid) -> Result<GcStats> {
        require_uuid(persistent_root, "persistent root")?;
        info!("Analyzing garbage collection of {} (dry run)", persistent_root);
        let start = Instant::now();

        let mut stats = {
            let _guard = self.commit_lock.lock();
            self.collect_locked(persistent_root, true)?
        };

        stats.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Garbage collection analysis complete in {}ms: {} revisions would be erased, {} bytes would be reclaimed",
            stats.duration_ms,
            stats.revisions_erased,
            stats.bytes_reclaimed
        );
        Ok(stats)
    }

    /// One collection with the writer locks held
    fn collect_locked(&self, target: Uuid, dry_run: bool) -> Result<GcStats> {
        let mut catalog = Catalog::load(&self.catalog_path())?;
        let mut stats = GcStats::default();
        let Some(sweep) = gc::collect(&mut catalog, target, &mut stats)? else {
            debug!("Persistent root {} is not in the catalog", target);
            return Ok(stats);
        };
        let backing = sweep.backing;
        let erased: BTreeSet<Uuid> = sweep.erased.iter().copied().collect();

        let mut rebase = Vec::new();
        for child in &sweep.orphaned_children {
            let record = self.revisions.read_record(backing, *child)?;
            if record.delta_base().is_some_and(|base| erased.contains(&base)) {
                rebase.push(*child);
            }
        }

        let live_attachments = gc::live_attachments(&catalog);
        let dead_attachments: Vec<AttachmentId> = self
            .attachments
            .list()?
            .into_iter()
            .filter(|id| !live_attachments.contains(id))
            .collect();
        stats.attachments_erased = dead_attachments.len();

        if dry_run {
            stats.revisions_rewritten = rebase.len();
            stats.bytes_reclaimed = sweep
                .erased
                .iter()
                .map(|revision| self.revisions.payload_size(backing, *revision))
                .sum::<u64>()
                + dead_attachments
                    .iter()
                    .map(|id| self.attachments.stored_size(id))
                    .sum::<u64>();
            return Ok(stats);
        }

        // Survivors must not replay through an erased payload
        for revision in &rebase {
            let hash = self.revisions.rewrite_as_snapshot(backing, *revision)?;
            if let Some(info) = catalog
                .backing_stores
                .get_mut(&backing)
                .and_then(|index| index.revisions.get_mut(revision))
            {
                info.payload_hash = hash;
            }
            stats.revisions_rewritten += 1;
        }

        catalog.generation += 1;
        catalog.save(&self.catalog_path())?;
        let catalog = Arc::new(catalog);
        *self.catalog.write() = Arc::clone(&catalog);

        for revision in &sweep.erased {
            match self.revisions.delete(backing, *revision) {
                Ok(bytes) => stats.bytes_reclaimed += bytes,
                Err(e) => warn!("Failed to delete payload of erased revision {}: {}", revision, e),
            }
        }
        // Payloads of earlier interrupted runs and failed commits
        let known = catalog.backing(&backing);
        for revision in self.revisions.list_payloads(backing)? {
            if known.map_or(true, |index| !index.revisions.contains_key(&revision)) {
                match self.revisions.delete(backing, revision) {
                    Ok(bytes) => stats.bytes_reclaimed += bytes,
                    Err(e) => warn!("Failed to delete orphaned payload {}: {}", revision, e),
                }
            }
        }
        if sweep.backing_dropped && self.revisions.remove_backing_if_empty(backing)? {
            debug!("Removed backing store directory {}", backing);
        }
        for id in &dead_attachments {
            match self.attachments.delete(id) {
                Ok(bytes) => stats.bytes_reclaimed += bytes,
                Err(e) => warn!("Failed to delete attachment {}: {}", id, e),
            }
        }

        Ok(stats)
    }

    /// Remove payload files the catalog does not list and rewrite the catalog
    ///
    /// Blocks writers for its duration.
    #[instrument(skip(self))]
    pub fn vacuum(&self) -> Result<VacuumStats> {
        info!("Vacuuming store at {:?}", self.root);
        let start = Instant::now();
        let mut stats = VacuumStats::default();

        {
            let _guard = self.commit_lock.lock();
            let _file_lock = FileLock::acquire(self.lock_path())?;
            let mut catalog = Catalog::load(&self.catalog_path())?;

            for backing in self.revisions.list_backing_stores()? {
                let payloads = self.revisions.list_payloads(backing)?;
                stats.payloads_examined += payloads.len();

                let known = catalog.backing(&backing);
                let orphans: Vec<Uuid> = payloads
                    .into_iter()
                    .filter(|revision| known.map_or(true, |index| !index.revisions.contains_key(revision)))
                    .collect();

                let results: Vec<(Uuid, Result<u64>)> = self.workers.install(|| {
                    orphans
                        .par_iter()
                        .map(|revision| (*revision, self.revisions.delete(backing, *revision)))
                        .collect()
                });
                for (revision, result) in results {
                    match result {
                        Ok(bytes) => {
                            stats.orphans_removed += 1;
                            stats.bytes_reclaimed += bytes;
                        }
                        Err(e) => warn!("Failed to remove orphaned payload {}: {}", revision, e),
                    }
                }

                if known.is_none() && self.revisions.remove_backing_if_empty(backing)? {
                    stats.directories_removed += 1;
                }
            }

            catalog.generation += 1;
            catalog.save(&self.catalog_path())?;
            *self.catalog.write() = Arc::new(catalog);
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Vacuum complete in {}ms: {} of {} payloads removed, {} bytes reclaimed",
            stats.duration_ms,
            stats.orphans_removed,
            stats.payloads_examined,
            stats.bytes_reclaimed
        );
        Ok(stats)
    }

    /// Size attributes of a persistent root, `None` if it is unknown
    ///
    /// `export_size` counts the payloads reachable from the root's live
    /// branches; `used_size` is the whole backing store, which cheap copies
    /// share.
    pub fn persistent_root_attributes(&self, persistent_root: Uuid) -> Result<Option<PersistentRootAttributes>> {
        require_uuid(persistent_root, "persistent root")?;
        let catalog = self.catalog();
        let Some(root) = catalog.root(&persistent_root) else {
            return Ok(None);
        };
        let Some(index) = catalog.backing(&root.backing_store) else {
            return Ok(Some(PersistentRootAttributes::default()));
        };

        let seeds: Vec<(Uuid, Option<Uuid>)> = root
            .live_branches()
            .flat_map(|b| {
                [b.head_revision, b.current_revision]
                    .into_iter()
                    .flatten()
                    .map(move |r| (r, b.initial_revision))
            })
            .collect();
        let live = gc::mark_live(&index.revisions, seeds);

        let export_size = live
            .iter()
            .map(|revision| self.revisions.payload_size(root.backing_store, *revision))
            .sum();
        let used_size = utils::dir_size(&self.revisions.backing_dir(root.backing_store))?;
        Ok(Some(PersistentRootAttributes { export_size, used_size }))
    }

    /// Page accounting for the whole store
    pub fn page_statistics(&self) -> Result<PageStatistics> {
        let catalog = self.catalog();
        let total_bytes = utils::dir_size(&self.root)?;

        let mut orphan_bytes = 0;
        for backing in self.revisions.list_backing_stores()? {
            let known = catalog.backing(&backing);
            for revision in self.revisions.list_payloads(backing)? {
                if known.map_or(true, |index| !index.revisions.contains_key(&revision)) {
                    orphan_bytes += self.revisions.payload_size(backing, revision);
                }
            }
        }

        Ok(PageStatistics {
            page_size: PAGE_SIZE,
            total_pages: utils::pages(total_bytes, PAGE_SIZE),
            free_pages: utils::pages(orphan_bytes, PAGE_SIZE),
        })
    }

    /// Check payload integrity and the structural invariants of the catalog
    pub fn verify(&self) -> Result<VerificationReport> {
        StoreVerifier::new(self).verify()
    }
}

/// Builder pattern for store configuration
///
/// # Examples
///
/// ```rust,no_run
/// use verso::{CompressionStrategy, MigrationRegistry, StoreBuilder};
///
/// # fn main() -> verso::Result<()> {
/// let mut registry = MigrationRegistry::new();
/// registry.set_target_version("text", 1);
///
/// let store = StoreBuilder::new()
///     .compression_strategy(CompressionStrategy::Fast)
///     .snapshot_interval(32)
///     .revision_cache_capacity(1024)
///     .default_supports_revert(true)
///     .migrations(registry)
///     .build("./notes.verso")?;
/// # Ok(())
/// # }
/// ```
///
/// # Default Values
///
/// - `compression_strategy`: `CompressionStrategy::Fast`
/// - `snapshot_interval`: 16
/// - `revision_cache_capacity`: 256
/// - `parallel_workers`: number of CPU cores
/// - `default_supports_revert`: true
#[derive(Debug, Default)]
pub struct StoreBuilder {
    config: StoreConfig,
    migrations: Option<MigrationRegistry>,
}

impl StoreBuilder {
    /// Create a new builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set compression strategy
    pub fn compression_strategy(mut self, strategy: CompressionStrategy) -> Self {
        self.config.compression_strategy = strategy;
        self
    }

    /// Maximum delta chain length before a full snapshot is written
    pub fn snapshot_interval(mut self, interval: u32) -> Self {
        self.config.snapshot_interval = interval;
        self
    }

    /// Number of materialized item graphs kept in memory
    pub fn revision_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.revision_cache_capacity = capacity;
        self
    }

    /// Worker threads for verification and vacuum
    ///
    /// Values less than 1 are set to 1.
    pub fn parallel_workers(mut self, count: usize) -> Self {
        self.config.parallel_workers = count.max(1);
        self
    }

    /// `supports_revert` of branches created without an explicit choice
    pub fn default_supports_revert(mut self, supports_revert: bool) -> Self {
        self.config.default_supports_revert = supports_revert;
        self
    }

    /// Attach a migration registry used when item graphs are read
    pub fn migrations(mut self, registry: MigrationRegistry) -> Self {
        self.migrations = Some(registry);
        self
    }

    /// Open the store at `path`, creating it with this configuration if needed
    ///
    /// An existing store keeps its persisted configuration.
    ///
    /// # Errors
    ///
    /// - [`VersoError::InvalidConfiguration`] for unusable settings
    /// - [`VersoError::CircularDependency`] if the migration registry has a
    ///   dependency cycle
    pub fn build(self, path: impl Into<PathBuf>) -> Result<Store> {
        let path = path.into();
        self.config.validate()?;
        let migrations = match self.migrations {
            Some(registry) => {
                registry.validate()?;
                Some(Arc::new(registry))
            }
            None => None,
        };

        if path.join(METADATA_FILE).exists() {
            Store::open_with(path, migrations)
        } else {
            Store::init_with(path, self.config, migrations)
        }
    }
}
