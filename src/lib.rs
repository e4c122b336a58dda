//! # Verso - A versioned object store
//!
//! Verso keeps documents as graphs of items and records every change to them
//! as an immutable revision. Documents can be branched, copied cheaply,
//! navigated backwards and forwards, and migrated between schema versions.
//!
//! ## Overview
//!
//! - **Persistent roots** are the top-level documents. Each owns one or more
//!   branches and a backing store holding its revisions.
//! - **Branches** point into the revision graph with three pointers: the
//!   initial revision (where undoable history starts), the current revision
//!   (what is checked out) and the head revision (how far redo can go).
//! - **Revisions** are immutable snapshots of an item graph. Payloads are
//!   written as deltas against their parent with periodic full snapshots, and
//!   compressed with LZ4.
//! - **Transactions** batch catalog changes and commit them atomically. Each
//!   persistent root carries a transaction id; a transaction built from stale
//!   state is rejected instead of overwriting newer changes.
//! - **Undo tracks** record user actions as invertible command groups that
//!   survive restarts and can span several persistent roots.
//! - **Garbage collection** erases deleted roots and branches and every
//!   revision no live pointer can reach.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use verso::{Item, ItemGraph, Metadata, Store, StoreTransaction};
//!
//! # fn main() -> verso::Result<()> {
//! let store = Store::init("./notes.verso")?;
//!
//! // Create a document holding a single item
//! let graph = ItemGraph::new(Item::new("Note", "notes", 1).with("text", "Buy milk"));
//! let mut tx = StoreTransaction::new();
//! let (root, branch, first) = tx.create_persistent_root_with_graph(graph, Metadata::new());
//! store.commit(tx)?;
//!
//! // Commit an edit on top of the first revision
//! let mut graph = store.item_graph(first, root)?.expect("revision exists");
//! let note = graph.root;
//! graph.get_mut(&note).expect("root item").set("text", "Buy oat milk");
//! let mut tx = store.transaction_for(&[root])?;
//! tx.commit_revision(root, branch, Some(first), graph, Metadata::new());
//! store.commit(tx)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! ```rust,no_run
//! use verso::{CompressionStrategy, MigrationRegistry, StoreBuilder};
//!
//! # fn main() -> verso::Result<()> {
//! let store = StoreBuilder::new()
//!     .compression_strategy(CompressionStrategy::Adaptive { min_size: 4096 })
//!     .snapshot_interval(32)
//!     .revision_cache_capacity(512)
//!     .migrations(MigrationRegistry::new())
//!     .build("./notes.verso")?;
//! println!("Opened store {}", store.store_uuid());
//! # Ok(())
//! # }
//! ```
//!
//! ## Navigation
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use verso::{BranchTrack, Store, Track};
//!
//! # fn main() -> verso::Result<()> {
//! let store = Arc::new(Store::open("./notes.verso")?);
//! let root = store.persistent_root_uuids()[0];
//! let track = BranchTrack::current(Arc::clone(&store), root)?;
//! while track.can_undo()? {
//!     track.undo()?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Maintenance
//!
//! ```rust,no_run
//! # use verso::Store;
//! # fn main() -> verso::Result<()> {
//! # let store = Store::open("./notes.verso")?;
//! let stats = store.finalize_all_deletions()?;
//! println!("Erased {} revisions", stats.revisions_erased);
//!
//! let report = store.verify()?;
//! if !report.is_valid() {
//!     eprintln!("{}", report.summary());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## On-disk Layout
//!
//! ```text
//! store/
//! ├── metadata.json        store identity and configuration
//! ├── catalog.json         persistent roots, branches and revision metadata
//! ├── store.lock           commit lock
//! ├── backing/<uuid>/      revision payloads, one directory per backing store
//! ├── attachments/         content-addressed binary blobs
//! └── undo/tracks.json     undo track state
//! ```
//!
//! Every file that is replaced is written to a temporary sibling and renamed
//! over the original. The catalog rename is the commit point of every
//! transaction and every garbage collection.
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result<T>`], an alias over
//! [`VersoError`]. Conflicts ([`VersoError::TransactionConflict`],
//! [`VersoError::SelectiveUndoConflict`]) are recoverable: reload the state
//! and retry.
//!
//! ## Module Organization
//!
//! - [`store`]: the store facade, commits, queries and maintenance
//! - [`transaction`]: transaction building
//! - [`item_graph`]: items, values and item graphs
//! - [`catalog`] and [`history`]: catalog rows and revision graph queries
//! - [`track`] and [`undo`]: branch navigation and undo tracks
//! - [`diff`]: item graph differences used by selective undo
//! - [`migration`]: schema migration registry and driver
//! - [`verification`]: integrity checking
//! - [`compression`], [`types`], [`error`]: supporting types

// Public API modules
pub mod catalog;
pub mod compression;
pub mod diff;
pub mod error;
pub mod history;
pub mod item_graph;
pub mod migration;
pub mod store;
pub mod track;
pub mod transaction;
pub mod types;
pub mod undo;
pub mod verification;

// Internal modules (not part of public API)
mod attachments;
mod collections;
mod flock;
mod gc;
mod revisions;
mod utils;

// Re-export main types for convenience
pub use catalog::{BackingIndex, Catalog};
pub use compression::{CompressionEngine, CompressionStrategy};
pub use diff::{ItemChange, ItemGraphDiff};
pub use error::{Result, VersoError};
pub use history::{HistoryStats, RevisionGraph};
pub use item_graph::{Item, ItemGraph, Value};
pub use migration::{Migration, MigrationDriver, MigrationHandler, MigrationRegistry, PackageVersion};
pub use store::{Store, StoreBuilder};
pub use track::{BranchTrack, Track, TrackNode};
pub use transaction::{Operation, RevisionWrite, StoreTransaction};
pub use types::*;
pub use undo::{
    Command, CommandGroup, PatternTrack, TrackState, UndoTrack, UndoTrackNotification, UndoTrackObserver,
    UndoTrackStore,
};
pub use verification::{PayloadVerification, StoreVerifier, VerificationReport};
