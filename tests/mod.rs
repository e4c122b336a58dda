//! Main test module for Verso
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end scenarios
//! - Property-based tests for invariants
//! - Concurrency tests for racing writers
//! - Edge cases at the public API boundary

pub mod concurrency;
pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::verso::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn open_store() -> (Store, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Store::init(temp_dir.path().join("store")).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_empty_store() {
        let (store, _temp) = open_store();

        assert!(store.persistent_root_uuids().is_empty());
        assert!(store.search("anything").is_empty());
        let stats = store.finalize_all_deletions().unwrap();
        assert_eq!(stats.revisions_erased, 0);
        assert!(store.verify().unwrap().is_valid());
        assert!(store.commit(StoreTransaction::new()).unwrap().is_empty());
    }

    #[test]
    fn test_nil_identifiers_are_rejected() {
        let (store, _temp) = open_store();

        assert!(matches!(
            store.transaction_for(&[Uuid::nil()]),
            Err(VersoError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.branch_info(Uuid::nil()),
            Err(VersoError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.persistent_root_info(Uuid::nil()),
            Err(VersoError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_unknown_identifiers_are_absent() {
        let (store, _temp) = open_store();
        let unknown = Uuid::new_v4();

        assert!(store.persistent_root_info(unknown).unwrap().is_none());
        assert!(store.branch_info(unknown).unwrap().is_none());
        assert!(store.revision_info(unknown, unknown).unwrap().is_none());
        assert!(store.item_graph(unknown, unknown).unwrap().is_none());
        assert!(matches!(
            store.transaction_for(&[unknown]),
            Err(VersoError::PersistentRootNotFound(_))
        ));
    }

    #[test]
    fn test_commit_requires_token_for_existing_root() {
        let (store, _temp) = open_store();
        let mut tx = StoreTransaction::new();
        let (root, _, _) = tx.create_persistent_root_with_graph(
            ItemGraph::new(Item::new("Doc", "text", 1)),
            Metadata::new(),
        );
        store.commit(tx).unwrap();

        let mut tx = StoreTransaction::new();
        tx.set_persistent_root_metadata(root, Metadata::new());
        assert!(matches!(store.commit(tx), Err(VersoError::InvalidArgument(_))));
    }

    #[test]
    fn test_invalid_graph_is_rejected() {
        let (store, _temp) = open_store();
        let missing_child = Uuid::new_v4();
        let graph = ItemGraph::new(Item::new("Doc", "text", 1).with("child", Value::Composite(missing_child)));

        let mut tx = StoreTransaction::new();
        tx.create_persistent_root_with_graph(graph, Metadata::new());
        assert!(store.commit(tx).is_err());
        assert!(store.persistent_root_uuids().is_empty());
    }

    #[test]
    fn test_unicode_text_roundtrips() {
        let (store, _temp) = open_store();
        let text = "naïve café 日本語 🚀 \u{0}";
        let mut tx = StoreTransaction::new();
        let (root, _, revision) = tx.create_persistent_root_with_graph(
            ItemGraph::new(Item::new("Doc", "text", 1).with("title", text)),
            Metadata::new(),
        );
        store.commit(tx).unwrap();

        let graph = store.item_graph(revision, root).unwrap().unwrap();
        assert_eq!(graph.root_item().unwrap().get_str("title"), Some(text));
        assert_eq!(store.search("café").len(), 1);
    }

    #[test]
    fn test_branch_track_on_single_revision() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(Store::init(temp_dir.path().join("store")).unwrap());
        let mut tx = StoreTransaction::new();
        let (root, _, _) = tx.create_persistent_root_with_graph(
            ItemGraph::new(Item::new("Doc", "text", 1)),
            Metadata::new(),
        );
        store.commit(tx).unwrap();

        let track = BranchTrack::current(Arc::clone(&store), root).unwrap();
        assert!(!track.can_undo().unwrap());
        assert!(!track.can_redo().unwrap());
        assert!(!track.undo().unwrap());
        assert!(!track.redo().unwrap());
        assert_eq!(track.nodes().unwrap().len(), 1);
    }

    #[test]
    fn test_undo_track_names() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(Store::init(temp_dir.path().join("store")).unwrap());
        let tracks = UndoTrackStore::open(store).unwrap();

        assert!(matches!(UndoTrack::open(&tracks, ""), Err(VersoError::InvalidArgument(_))));
        let track = UndoTrack::open(&tracks, "…unicode track…").unwrap();
        assert_eq!(track.name(), "…unicode track…");
        assert!(track.current_node().unwrap().is_none());
        assert!(!track.undo().unwrap());
    }
}
