//! Concurrent access to one store
//!
//! Threads race on the same persistent root through one handle and through
//! separate handles (standing in for separate processes). The optimistic
//! token must let exactly one writer win each round.

use ::verso::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use tracing::info;
use tracing_test::traced_test;
use uuid::Uuid;

fn counter_graph(value: i64) -> ItemGraph {
    ItemGraph::new(Item::new("Counter", "test", 1).with("value", value))
}

fn create_counter(store: &Store) -> (Uuid, Uuid) {
    let mut tx = StoreTransaction::new();
    let (root, branch, _) = tx.create_persistent_root_with_graph(counter_graph(0), Metadata::new());
    store.commit(tx).unwrap();
    (root, branch)
}

/// Build a commit from one consistent catalog snapshot
fn commit_from_snapshot(store: &Store, root: Uuid, branch: Uuid, value: i64) -> Result<Uuid> {
    let catalog = store.catalog();
    let row = catalog.root(&root).ok_or(VersoError::PersistentRootNotFound(root))?;
    let current = row.branches[&branch].current_revision;

    let mut tx = StoreTransaction::new();
    tx.set_old_transaction_id(root, row.transaction_id);
    let revision = tx.commit_revision(root, branch, current, counter_graph(value), Metadata::new());
    store.commit(tx)?;
    Ok(revision)
}

fn chain_length(store: &Store, root: Uuid, branch: Uuid) -> usize {
    let catalog = store.catalog();
    let row = catalog.root(&root).unwrap();
    let current = row.branches[&branch].current_revision.unwrap();
    catalog.backing(&row.backing_store).unwrap().graph().parent_chain(current).len()
}

#[test]
#[traced_test]
fn test_racing_commits_on_one_handle() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(Store::init(temp.path().join("store")).unwrap());
    let (root, branch) = create_counter(&store);

    let wins = AtomicUsize::new(0);
    let conflicts = AtomicUsize::new(0);

    thread::scope(|scope| {
        for worker in 0..4 {
            let store = Arc::clone(&store);
            let (wins, conflicts) = (&wins, &conflicts);
            scope.spawn(move || {
                for attempt in 0..10 {
                    match commit_from_snapshot(&store, root, branch, worker * 100 + attempt) {
                        Ok(_) => {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(VersoError::TransactionConflict { .. }) => {
                            conflicts.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => panic!("unexpected commit failure: {}", e),
                    }
                }
            });
        }
    });

    let wins = wins.load(Ordering::SeqCst);
    let conflicts = conflicts.load(Ordering::SeqCst);
    info!("{} commits won, {} rejected", wins, conflicts);
    assert_eq!(wins + conflicts, 40);
    assert!(wins >= 1);

    // Every winner advanced the token once and extended one linear chain
    assert_eq!(store.transaction_id(root), Some(TransactionId(wins as i64)));
    assert_eq!(chain_length(&store, root, branch), wins + 1);
    assert!(store.verify().unwrap().is_valid());
    assert!(logs_contain("commits won"));
}

#[test]
#[traced_test]
fn test_separate_handles_retry_until_applied() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("store");
    let first = Arc::new(Store::init(&path).unwrap());
    let (root, branch) = create_counter(&first);
    let second = Arc::new(Store::open(&path).unwrap());

    const PER_WRITER: usize = 8;
    let retries = AtomicUsize::new(0);

    thread::scope(|scope| {
        for (offset, handle) in [Arc::clone(&first), Arc::clone(&second)].into_iter().enumerate() {
            let retries = &retries;
            scope.spawn(move || {
                let mut applied = 0;
                while applied < PER_WRITER {
                    match commit_from_snapshot(&handle, root, branch, (offset * 1000 + applied) as i64) {
                        Ok(_) => applied += 1,
                        Err(VersoError::TransactionConflict { .. }) => {
                            retries.fetch_add(1, Ordering::SeqCst);
                            handle.reload().unwrap();
                        }
                        Err(e) => panic!("unexpected commit failure: {}", e),
                    }
                }
            });
        }
    });

    info!("Writers retried {} times", retries.load(Ordering::SeqCst));
    first.reload().unwrap();
    second.reload().unwrap();
    for handle in [&first, &second] {
        assert_eq!(handle.transaction_id(root), Some(TransactionId(2 * PER_WRITER as i64)));
        assert_eq!(chain_length(handle, root, branch), 2 * PER_WRITER + 1);
    }
    assert!(logs_contain("Writers retried"));
}

#[test]
fn test_readers_see_only_committed_revisions() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(Store::init(temp.path().join("store")).unwrap());
    let (root, branch) = create_counter(&store);

    thread::scope(|scope| {
        let writer = Arc::clone(&store);
        scope.spawn(move || {
            for value in 1..=20 {
                commit_from_snapshot(&writer, root, branch, value).unwrap();
            }
        });

        for _ in 0..3 {
            let reader = Arc::clone(&store);
            scope.spawn(move || {
                for _ in 0..50 {
                    let Some(info) = reader.branch_info(branch).unwrap() else {
                        panic!("branch vanished");
                    };
                    let current = info.current_revision.unwrap();
                    let graph = reader.item_graph(current, root).unwrap().unwrap();
                    assert!(matches!(graph.root_item().unwrap().get("value"), Some(Value::Integer(_))));
                }
            });
        }
    });

    let current = store.branch_info(branch).unwrap().unwrap().current_revision.unwrap();
    let graph = store.item_graph(current, root).unwrap().unwrap();
    assert_eq!(graph.root_item().unwrap().get("value"), Some(&Value::Integer(20)));
}

#[test]
fn test_tracks_record_independently() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(Store::init(temp.path().join("store")).unwrap());
    let tracks = UndoTrackStore::open(Arc::clone(&store)).unwrap();

    thread::scope(|scope| {
        for name in ["left", "right"] {
            let tracks = Arc::clone(&tracks);
            scope.spawn(move || {
                let track = UndoTrack::open(&tracks, name).unwrap();
                let mut tx = StoreTransaction::new();
                let (root, branch, mut current) =
                    tx.create_persistent_root_with_graph(counter_graph(0), Metadata::new());
                track.commit(tx, Metadata::new()).unwrap();

                for value in 1..=5 {
                    let mut tx = tracks.store().transaction_for(&[root]).unwrap();
                    current = tx.commit_revision(root, branch, Some(current), counter_graph(value), Metadata::new());
                    track.commit(tx, Metadata::new()).unwrap();
                }
            });
        }
    });

    for name in ["left", "right"] {
        let track = UndoTrack::open(&tracks, name).unwrap();
        assert_eq!(track.nodes().unwrap().len(), 6);
    }
    assert_eq!(tracks.track_names(), vec!["left".to_string(), "right".to_string()]);
    assert_eq!(store.persistent_root_uuids().len(), 2);
}
