//! End-to-end scenarios for Verso
//!
//! Exercises the store through its public API the way an editor would:
//! documents are created, edited on branches, navigated with tracks and
//! finally collected.

use ::verso::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;
use uuid::Uuid;

/// Test harness for multi-step store scenarios
pub struct StoreTestHarness {
    pub temp_dir: TempDir,
    pub store: Arc<Store>,
    pub tracks: Arc<UndoTrackStore>,
    pub generator: GraphGenerator,
}

/// A document created by the harness
#[derive(Debug, Clone, Copy)]
pub struct TestDocument {
    pub root: Uuid,
    pub branch: Uuid,
    pub first_revision: Uuid,
}

impl StoreTestHarness {
    /// Create a new harness over a fresh store
    pub fn new() -> Self {
        Self::with_builder(StoreBuilder::new().compression_strategy(CompressionStrategy::Fast))
    }

    /// Create a harness over a store built by `builder`
    pub fn with_builder(builder: StoreBuilder) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(builder.build(temp_dir.path().join("store")).unwrap());
        let tracks = UndoTrackStore::open(Arc::clone(&store)).unwrap();

        Self {
            temp_dir,
            store,
            tracks,
            generator: GraphGenerator::new(42),
        }
    }

    pub fn store_path(&self) -> std::path::PathBuf {
        self.temp_dir.path().join("store")
    }

    /// Create a document holding `graph`
    pub fn create(&self, graph: ItemGraph) -> TestDocument {
        let mut tx = StoreTransaction::new();
        let (root, branch, first_revision) = tx.create_persistent_root_with_graph(graph, Metadata::new());
        self.store.commit(tx).unwrap();
        TestDocument {
            root,
            branch,
            first_revision,
        }
    }

    pub fn current(&self, doc: &TestDocument) -> Uuid {
        self.branch(doc).current_revision.unwrap()
    }

    pub fn branch(&self, doc: &TestDocument) -> BranchInfo {
        self.store.branch_info(doc.branch).unwrap().unwrap()
    }

    pub fn graph(&self, doc: &TestDocument, revision: Uuid) -> ItemGraph {
        self.store.item_graph(revision, doc.root).unwrap().unwrap()
    }

    /// Commit `edit` applied to the current graph and return the new revision
    pub fn edit(&self, doc: &TestDocument, edit: impl FnOnce(&mut ItemGraph)) -> Uuid {
        let current = self.current(doc);
        let mut graph = self.graph(doc, current);
        edit(&mut graph);
        let mut tx = self.store.transaction_for(&[doc.root]).unwrap();
        let revision = tx.commit_revision(doc.root, doc.branch, Some(current), graph, Metadata::new());
        self.store.commit(tx).unwrap();
        revision
    }

    /// Set the root item's `text` attribute in a new revision
    pub fn set_text(&self, doc: &TestDocument, text: &str) -> Uuid {
        self.edit(doc, |graph| {
            let root = graph.root;
            graph.get_mut(&root).unwrap().set("text", text);
        })
    }

    pub fn text(&self, doc: &TestDocument, revision: Uuid) -> String {
        let graph = self.graph(doc, revision);
        graph.root_item().unwrap().get_str("text").unwrap_or_default().to_string()
    }

    pub fn revision_exists(&self, doc: &TestDocument, revision: Uuid) -> bool {
        self.store.revision_info(revision, doc.root).unwrap().is_some()
    }
}

impl Default for StoreTestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic random item graphs
pub struct GraphGenerator {
    rng: StdRng,
}

impl GraphGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A note with `children` composite children carrying random attributes
    pub fn note(&mut self, children: usize) -> ItemGraph {
        let mut child_refs = Vec::with_capacity(children);
        let mut items = Vec::with_capacity(children);
        for i in 0..children {
            let words = self.rng.random_range(1..8);
            let text: Vec<String> = (0..words).map(|w| format!("word{}", (i + w) % 17)).collect();
            let item = Item::new("Paragraph", "notes", 1)
                .with("text", text.join(" "))
                .with("weight", self.rng.random_range(0..1000) as i64)
                .with("pinned", self.rng.random_bool(0.3));
            child_refs.push(Value::Composite(item.uuid));
            items.push(item);
        }

        let mut graph = ItemGraph::new(
            Item::new("Note", "notes", 1)
                .with("text", "note")
                .with("paragraphs", Value::Array(child_refs)),
        );
        for item in items {
            graph.insert(item);
        }
        graph
    }

    /// Rewrite the text of one random paragraph
    pub fn mutate(&mut self, graph: &mut ItemGraph) {
        let paragraphs: Vec<Uuid> = graph.items.keys().filter(|uuid| **uuid != graph.root).copied().collect();
        if paragraphs.is_empty() {
            return;
        }
        let target = paragraphs[self.rng.random_range(0..paragraphs.len())];
        let word = self.rng.random_range(0..10_000u32);
        graph.get_mut(&target).unwrap().set("text", format!("edited {}", word));
    }
}

fn simple_note(text: &str) -> ItemGraph {
    ItemGraph::new(Item::new("Note", "notes", 1).with("text", text))
}

#[test]
fn test_lost_head_is_collected() {
    let harness = StoreTestHarness::new();
    let doc = harness.create(simple_note("v1"));
    let r1 = doc.first_revision;

    let branch = harness.branch(&doc);
    assert_eq!(branch.current_revision, Some(r1));
    assert_eq!(branch.head_revision, Some(r1));

    let r2 = harness.set_text(&doc, "v2");
    let branch = harness.branch(&doc);
    assert_eq!(branch.current_revision, Some(r2));
    assert_eq!(branch.head_revision, Some(r2));

    let track = BranchTrack::new(Arc::clone(&harness.store), doc.root, doc.branch).unwrap();
    assert!(track.undo().unwrap());
    let branch = harness.branch(&doc);
    assert_eq!(branch.current_revision, Some(r1));
    assert_eq!(branch.head_revision, Some(r2));

    let r3 = harness.set_text(&doc, "v3");
    let branch = harness.branch(&doc);
    assert_eq!(branch.current_revision, Some(r3));
    assert_eq!(branch.head_revision, Some(r3));
    assert!(!track.can_redo().unwrap());

    let stats = harness.store.finalize_deletions(doc.root).unwrap();
    info!("{}", stats.summary());
    assert_eq!(stats.erased_revisions, vec![r2]);
    assert!(!harness.revision_exists(&doc, r2));
    assert!(harness.revision_exists(&doc, r1));
    assert!(harness.revision_exists(&doc, r3));
    assert_eq!(harness.text(&doc, r3), "v3");
    assert!(harness.store.verify().unwrap().is_valid());
}

#[test]
fn test_stale_token_rejected_regardless_of_order() {
    let harness = StoreTestHarness::new();
    let doc = harness.create(simple_note("start"));
    for i in 0..5 {
        harness.set_text(&doc, &format!("edit {}", i));
    }
    assert_eq!(harness.store.transaction_id(doc.root), Some(TransactionId(5)));

    let current = harness.current(&doc);
    let mut t1 = harness.store.transaction_for(&[doc.root]).unwrap();
    let mut t2 = harness.store.transaction_for(&[doc.root]).unwrap();
    assert_eq!(t1.old_transaction_id(&doc.root), Some(TransactionId(5)));
    assert_eq!(t2.old_transaction_id(&doc.root), Some(TransactionId(5)));

    // T2 is built first but submitted second
    let lost = t2.commit_revision(doc.root, doc.branch, Some(current), simple_note("T2"), Metadata::new());
    let won = t1.commit_revision(doc.root, doc.branch, Some(current), simple_note("T1"), Metadata::new());

    let notification = harness.store.commit(t1).unwrap();
    assert_eq!(notification.transaction_ids.get(&doc.root), Some(&TransactionId(6)));

    match harness.store.commit(t2) {
        Err(VersoError::TransactionConflict {
            persistent_root,
            expected,
            actual,
        }) => {
            assert_eq!(persistent_root, doc.root);
            assert_eq!(expected, TransactionId(5));
            assert_eq!(actual, TransactionId(6));
        }
        other => panic!("expected a conflict, got {:?}", other),
    }

    assert_eq!(harness.current(&doc), won);
    assert!(!harness.revision_exists(&doc, lost));
    assert_eq!(harness.store.transaction_id(doc.root), Some(TransactionId(6)));
}

#[test]
fn test_multi_root_transaction_is_atomic() {
    let harness = StoreTestHarness::new();
    let a = harness.create(simple_note("a"));
    let b = harness.create(simple_note("b"));

    let mut tx = harness.store.transaction_for(&[a.root, b.root]).unwrap();
    let written = tx.commit_revision(a.root, a.branch, Some(a.first_revision), simple_note("a2"), Metadata::new());
    // The current branch of b cannot be deleted, which fails the whole transaction
    tx.delete_branch(b.root, b.branch);
    assert!(matches!(
        harness.store.commit(tx),
        Err(VersoError::ConsistencyViolation(_))
    ));

    assert_eq!(harness.current(&a), a.first_revision);
    assert!(!harness.revision_exists(&a, written));
    assert!(!harness.branch(&b).deleted);
    assert_eq!(harness.store.transaction_id(a.root), Some(TransactionId::INITIAL));
    assert_eq!(harness.store.transaction_id(b.root), Some(TransactionId::INITIAL));

    // The same batch without the bad operation lands on both roots together
    let mut tx = harness.store.transaction_for(&[a.root, b.root]).unwrap();
    tx.commit_revision(a.root, a.branch, Some(a.first_revision), simple_note("a2"), Metadata::new());
    tx.commit_revision(b.root, b.branch, Some(b.first_revision), simple_note("b2"), Metadata::new());
    let notification = harness.store.commit(tx).unwrap();
    assert_eq!(notification.transaction_ids.len(), 2);
    assert_eq!(notification.revisions.len(), 2);
    assert_eq!(harness.text(&a, harness.current(&a)), "a2");
    assert_eq!(harness.text(&b, harness.current(&b)), "b2");
}

#[test]
fn test_revisions_are_immutable() {
    let mut harness = StoreTestHarness::with_builder(StoreBuilder::new().snapshot_interval(3));
    let note = harness.generator.note(12);
    let doc = harness.create(note);

    let mut revisions = vec![doc.first_revision];
    for _ in 0..10 {
        let mut graph = harness.graph(&doc, harness.current(&doc));
        harness.generator.mutate(&mut graph);
        let current = harness.current(&doc);
        let mut tx = harness.store.transaction_for(&[doc.root]).unwrap();
        revisions.push(tx.commit_revision(doc.root, doc.branch, Some(current), graph, Metadata::new()));
        harness.store.commit(tx).unwrap();
    }

    let before: Vec<ItemGraph> = revisions.iter().map(|r| harness.graph(&doc, *r)).collect();
    let again: Vec<ItemGraph> = revisions.iter().map(|r| harness.graph(&doc, *r)).collect();
    assert_eq!(before, again);

    // A second handle decodes every payload from disk
    let reopened = Store::open(harness.store_path()).unwrap();
    for (revision, graph) in revisions.iter().zip(&before) {
        assert_eq!(&reopened.item_graph(*revision, doc.root).unwrap().unwrap(), graph);
    }
}

#[test]
fn test_cheap_copy_survives_source_deletion() {
    let harness = StoreTestHarness::new();
    let source = harness.create(simple_note("shared"));
    let r2 = harness.set_text(&source, "source only");

    let mut tx = harness.store.transaction_for(&[source.root]).unwrap();
    let (copy, copy_branch) = tx.create_cheap_copy(source.root, source.first_revision, Metadata::new());
    tx.delete_persistent_root(source.root);
    harness.store.commit(tx).unwrap();

    let stats = harness.store.finalize_deletions(source.root).unwrap();
    assert_eq!(stats.persistent_roots_erased, 1);
    assert_eq!(stats.erased_revisions, vec![r2]);

    assert!(harness.store.persistent_root_info(source.root).unwrap().is_none());
    let copy_info = harness.store.branch_info(copy_branch).unwrap().unwrap();
    assert_eq!(copy_info.current_revision, Some(source.first_revision));
    let graph = harness.store.item_graph(source.first_revision, copy).unwrap().unwrap();
    assert_eq!(graph.root_item().unwrap().get_str("text"), Some("shared"));
}

#[test]
fn test_compacting_history_by_moving_initial() {
    let harness = StoreTestHarness::new();
    let doc = harness.create(simple_note("v1"));
    let r2 = harness.set_text(&doc, "v2");
    let r3 = harness.set_text(&doc, "v3");
    let r4 = harness.set_text(&doc, "v4");

    let mut tx = harness.store.transaction_for(&[doc.root]).unwrap();
    tx.set_initial_revision(doc.root, doc.branch, r3);
    harness.store.commit(tx).unwrap();

    let stats = harness.store.finalize_all_deletions().unwrap();
    assert_eq!(stats.revisions_erased, 2);
    assert!(!harness.revision_exists(&doc, doc.first_revision));
    assert!(!harness.revision_exists(&doc, r2));
    assert_eq!(harness.text(&doc, r4), "v4");

    // Nothing left to do
    let again = harness.store.finalize_all_deletions().unwrap();
    assert_eq!(again.revisions_erased, 0);
    assert_eq!(again.attachments_erased, 0);
}

#[test]
fn test_undo_track_spans_documents() {
    let harness = StoreTestHarness::new();
    let track = UndoTrack::open(&harness.tracks, "workspace").unwrap();

    let mut tx = StoreTransaction::new();
    let (a, a_branch, _) = tx.create_persistent_root_with_graph(simple_note("a"), Metadata::new());
    let (b, b_branch, _) = tx.create_persistent_root_with_graph(simple_note("b"), Metadata::new());
    track.commit(tx, Metadata::new()).unwrap();

    let node = track.current_node().unwrap().unwrap();
    let group = track.command_group(node.uuid).unwrap();
    assert_eq!(group.persistent_roots(), BTreeSet::from([a, b]));

    assert!(track.undo().unwrap());
    assert!(harness.store.persistent_root_info(a).unwrap().unwrap().deleted);
    assert!(harness.store.persistent_root_info(b).unwrap().unwrap().deleted);

    assert!(track.redo().unwrap());
    assert!(!harness.store.persistent_root_info(a).unwrap().unwrap().deleted);
    let a_info = harness.store.branch_info(a_branch).unwrap().unwrap();
    let b_info = harness.store.branch_info(b_branch).unwrap().unwrap();
    assert!(a_info.current_revision.is_some());
    assert!(b_info.current_revision.is_some());
}

#[test]
fn test_undo_track_shared_between_processes() {
    let harness = StoreTestHarness::new();
    let writer = UndoTrack::open(&harness.tracks, "editor").unwrap();

    let other_store = Arc::new(Store::open(harness.store_path()).unwrap());
    let other_tracks = UndoTrackStore::open(Arc::clone(&other_store)).unwrap();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    other_tracks.add_observer(Box::new(move |n: &UndoTrackNotification| {
        sink.lock().push(n.track.clone());
    }));

    let mut tx = StoreTransaction::new();
    let (root, branch, _) = tx.create_persistent_root_with_graph(simple_note("v1"), Metadata::new());
    writer.commit(tx, Metadata::new()).unwrap();
    let first_revision = harness.store.branch_info(branch).unwrap().unwrap().current_revision.unwrap();
    let doc = TestDocument {
        root,
        branch,
        first_revision,
    };
    let mut tx = harness.store.transaction_for(&[root]).unwrap();
    tx.commit_revision(root, branch, Some(doc.first_revision), simple_note("v2"), Metadata::new());
    writer.commit(tx, Metadata::new()).unwrap();

    let changed = other_tracks.reload().unwrap();
    assert!(changed.contains("editor"));
    assert_eq!(seen.lock().as_slice(), ["editor".to_string()]);

    // The second handle undoes the edit made through the first
    other_store.reload().unwrap();
    let reader = UndoTrack::open(&other_tracks, "editor").unwrap();
    assert_eq!(reader.nodes().unwrap().len(), 2);
    assert!(reader.undo().unwrap());

    harness.store.reload().unwrap();
    assert_eq!(harness.current(&doc), doc.first_revision);
    harness.tracks.reload().unwrap();
    assert!(writer.can_redo().unwrap());
}

#[test]
fn test_migrations_run_step_by_step() {
    let harness = StoreTestHarness::new();
    let doc = harness.create(simple_note("legacy"));
    let path = harness.store_path();

    let mut registry = MigrationRegistry::new();
    registry.set_target_version("notes", 3);
    registry
        .register(Migration::new("notes", 2, |items: Vec<Item>, old, new| {
            assert_eq!((old, new), (1, 2));
            Ok(items
                .into_iter()
                .map(|mut item| {
                    item.version = new;
                    item.set("body", item.get_str("text").unwrap_or_default().to_string());
                    item
                })
                .collect())
        }))
        .unwrap();
    registry
        .register(Migration::new("notes", 3, |items: Vec<Item>, old, new| {
            assert_eq!((old, new), (2, 3));
            Ok(items
                .into_iter()
                .map(|mut item| {
                    item.version = new;
                    item.attributes.remove("text");
                    item
                })
                .collect())
        }))
        .unwrap();

    let migrated = StoreBuilder::new().migrations(registry).build(&path).unwrap();
    let graph = migrated.item_graph(doc.first_revision, doc.root).unwrap().unwrap();
    let note = graph.root_item().unwrap();
    assert_eq!(note.version, 3);
    assert_eq!(note.get_str("body"), Some("legacy"));
    assert!(note.get("text").is_none());
}
