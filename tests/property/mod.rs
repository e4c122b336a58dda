//! Property-based testing for Verso
//!
//! Uses proptest to check invariants of item graph diffs and of garbage
//! collection over randomly generated histories.

use ::verso::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use tempfile::TempDir;
use uuid::Uuid;

/// A step in a generated branch history
#[derive(Debug, Clone)]
pub enum HistoryStep {
    /// Commit an edit on top of the current revision
    Commit(String),
    /// Move current back by this many revisions (when possible)
    Revert(usize),
    /// Fork a branch at the current revision and commit on it
    Fork(String),
    /// Soft-delete the most recently forked branch
    DeleteFork,
}

fn history_step_strategy() -> impl Strategy<Value = HistoryStep> {
    prop_oneof![
        4 => "[a-z]{1,12}".prop_map(HistoryStep::Commit),
        2 => (1usize..4).prop_map(HistoryStep::Revert),
        1 => "[a-z]{1,12}".prop_map(HistoryStep::Fork),
        1 => Just(HistoryStep::DeleteFork),
    ]
}

fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Integer),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::String),
        any::<bool>().prop_map(Value::Boolean),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
    ];
    leaf.prop_recursive(2, 8, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..4).prop_map(Value::Map),
        ]
    })
}

/// Attribute maps for a fixed pool of child items
fn attributes_strategy() -> impl Strategy<Value = Vec<Option<Vec<(String, Value)>>>> {
    prop::collection::vec(
        prop::option::of(prop::collection::vec(("[a-z]{1,6}", value_strategy()), 0..4)),
        6,
    )
}

/// Build a graph whose root owns the children that are present in `children`
fn build_graph(root: Uuid, pool: &[Uuid], children: &[Option<Vec<(String, Value)>>]) -> ItemGraph {
    let mut graph = ItemGraph::with_root(root);
    let mut owned = Vec::new();
    for (uuid, attributes) in pool.iter().zip(children) {
        if let Some(attributes) = attributes {
            let mut item = Item::with_uuid(*uuid, "Cell", "sheet", 1);
            for (key, value) in attributes {
                item.set(key.clone(), value.clone());
            }
            graph.insert(item);
            owned.push(Value::Composite(*uuid));
        }
    }
    graph.insert(Item::with_uuid(root, "Sheet", "sheet", 1).with("cells", Value::Array(owned)));
    graph
}

struct History {
    _temp: TempDir,
    store: Store,
    root: Uuid,
    branches: Vec<Uuid>,
}

fn title_graph(title: &str) -> ItemGraph {
    ItemGraph::new(Item::new("Doc", "text", 1).with("title", title))
}

/// Replay `steps` against a fresh store
fn run_history(steps: &[HistoryStep]) -> History {
    let temp = TempDir::new().unwrap();
    let store = StoreBuilder::new().snapshot_interval(4).build(temp.path().join("store")).unwrap();

    let mut tx = StoreTransaction::new();
    let (root, main, _) = tx.create_persistent_root_with_graph(title_graph("start"), Metadata::new());
    store.commit(tx).unwrap();
    let mut branches = vec![main];
    let mut forks: Vec<Uuid> = Vec::new();

    for step in steps {
        let branch = store.branch_info(main).unwrap().unwrap();
        let current = branch.current_revision.unwrap();
        let mut tx = store.transaction_for(&[root]).unwrap();
        match step {
            HistoryStep::Commit(title) => {
                tx.commit_revision(root, main, Some(current), title_graph(title), Metadata::new());
            }
            HistoryStep::Revert(steps) => {
                let info = store.revision_info(current, root).unwrap().unwrap();
                let mut target = current;
                let mut parent = info.parent;
                for _ in 0..*steps {
                    match parent {
                        Some(p) => {
                            target = p;
                            parent = store.revision_info(p, root).unwrap().unwrap().parent;
                        }
                        None => break,
                    }
                }
                tx.set_current_revision(root, main, target, None);
            }
            HistoryStep::Fork(title) => {
                let fork = tx.create_branch(root, Some(main), Some(current), Metadata::new());
                tx.commit_revision(root, fork, Some(current), title_graph(title), Metadata::new());
                forks.push(fork);
                branches.push(fork);
            }
            HistoryStep::DeleteFork => match forks.pop() {
                Some(fork) => tx.delete_branch(root, fork),
                None => continue,
            },
        }
        store.commit(tx).unwrap();
    }

    History {
        _temp: temp,
        store,
        root,
        branches,
    }
}

/// Revisions reachable from the pointers of every branch left in the store
fn expected_live(history: &History) -> BTreeSet<Uuid> {
    let catalog = history.store.catalog();
    let root = catalog.root(&history.root).unwrap();
    let backing = catalog.backing(&root.backing_store).unwrap();
    let graph = backing.graph();

    let mut live = BTreeSet::new();
    for branch in root.branches.values() {
        for pointer in [branch.head_revision, branch.current_revision].into_iter().flatten() {
            for revision in graph.parent_chain(pointer) {
                live.insert(revision);
                if Some(revision) == branch.initial_revision {
                    break;
                }
            }
        }
    }
    live
}

fn stored_revisions(history: &History) -> BTreeSet<Uuid> {
    let catalog = history.store.catalog();
    let root = catalog.root(&history.root).unwrap();
    catalog
        .backing(&root.backing_store)
        .unwrap()
        .revisions
        .keys()
        .copied()
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Applying a diff turns the old graph into the new one; its inverse turns it back
    #[test]
    fn diff_inverse_law(before in attributes_strategy(), after in attributes_strategy()) {
        let root = Uuid::new_v4();
        let pool: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();
        let old = build_graph(root, &pool, &before);
        let new = build_graph(root, &pool, &after);

        let diff = ItemGraphDiff::between(&old, &new);
        prop_assert_eq!(&diff.apply_to(&old).unwrap(), &new);
        prop_assert_eq!(&diff.inverse().apply_to(&new).unwrap(), &old);
        prop_assert_eq!(diff.is_empty(), old == new);
    }

    /// Collection keeps exactly the revisions some surviving branch reaches
    #[test]
    fn gc_soundness(steps in prop::collection::vec(history_step_strategy(), 1..16)) {
        let history = run_history(&steps);
        let deleted: Vec<Uuid> = history
            .branches
            .iter()
            .filter(|b| history.store.branch_info(**b).unwrap().unwrap().deleted)
            .copied()
            .collect();

        history.store.finalize_deletions(history.root).unwrap();

        for branch in &deleted {
            prop_assert!(history.store.branch_info(*branch).unwrap().is_none());
        }
        prop_assert_eq!(stored_revisions(&history), expected_live(&history));

        // Every survivor still decodes, even after snapshots were rewritten
        for revision in stored_revisions(&history) {
            prop_assert!(history.store.item_graph(revision, history.root).unwrap().is_some());
        }
        prop_assert!(history.store.verify().unwrap().is_valid());
    }

    /// A second collection with no commits in between changes nothing
    #[test]
    fn gc_idempotence(steps in prop::collection::vec(history_step_strategy(), 1..16)) {
        let history = run_history(&steps);

        history.store.finalize_deletions(history.root).unwrap();
        let after_first = stored_revisions(&history);
        let catalog_first = history.store.catalog();

        let second = history.store.finalize_deletions(history.root).unwrap();
        prop_assert_eq!(second.revisions_erased, 0);
        prop_assert_eq!(second.branches_erased, 0);
        prop_assert_eq!(second.persistent_roots_erased, 0);
        prop_assert_eq!(stored_revisions(&history), after_first);
        prop_assert_eq!(
            &history.store.catalog().persistent_roots,
            &catalog_first.persistent_roots
        );
    }

    /// Reading a revision twice yields the same graph
    #[test]
    fn revisions_read_identically(steps in prop::collection::vec(history_step_strategy(), 1..12)) {
        let history = run_history(&steps);
        for revision in stored_revisions(&history) {
            let first = history.store.item_graph(revision, history.root).unwrap();
            let second = history.store.item_graph(revision, history.root).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
