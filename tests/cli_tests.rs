use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;
use verso::{Item, ItemGraph};

fn verso(store: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_verso"))
        .arg("--store")
        .arg(store)
        .args(args)
        .env("NO_COLOR", "1")
        .output()
        .expect("Failed to run verso")
}

fn write_graph(dir: &Path, name: &str, graph: &ItemGraph) -> String {
    let path = dir.join(name);
    fs::write(&path, serde_json::to_string_pretty(graph).unwrap()).unwrap();
    path.to_str().unwrap().to_string()
}

/// Prefix printed after "✓ Created persistent root"
fn created_root(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find(|l| l.contains("✓ Created persistent root"))
        .and_then(|l| l.split_whitespace().last())
        .expect("Failed to parse persistent root")
        .to_string()
}

#[test]
fn test_cli_create_commit_undo() {
    let tmp = TempDir::new().unwrap();
    let store = tmp.path().join("store");

    let output = verso(&store, &["init"]);
    assert!(output.status.success(), "CLI init failed");

    let mut graph = ItemGraph::new(Item::new("Note", "notes", 1).with("text", "first draft"));
    let v1 = write_graph(tmp.path(), "v1.json", &graph);
    let output = verso(&store, &["create", &v1, "-m", "Initial"]);
    assert!(output.status.success(), "CLI create failed");
    let root = created_root(&output);

    let note = graph.root;
    graph.get_mut(&note).unwrap().set("text", "second draft");
    let v2 = write_graph(tmp.path(), "v2.json", &graph);
    let output = verso(&store, &["commit", &root, &v2, "-m", "Edit"]);
    assert!(output.status.success(), "CLI commit failed");
    assert!(String::from_utf8_lossy(&output.stdout).contains("✓ Committed revision"));

    let output = verso(&store, &["history", &root]);
    assert!(output.status.success(), "CLI history failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Initial") && stdout.contains("Edit"), "Unexpected history: {}", stdout);

    let output = verso(&store, &["undo", &root]);
    assert!(output.status.success(), "CLI undo failed");
    assert!(String::from_utf8_lossy(&output.stdout).contains("✓ undo to"));

    let output = verso(&store, &["undo", &root]);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Nothing to undo"));

    let output = verso(&store, &["search", "second"]);
    assert!(output.status.success(), "CLI search failed");

    let output = verso(&store, &["verify"]);
    assert!(output.status.success(), "CLI verify failed");
    assert!(String::from_utf8_lossy(&output.stdout).contains("Verification Report:"));

    let output = verso(&store, &["stats"]);
    assert!(output.status.success(), "CLI stats failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    // Undo moves the pointer; the two revisions stay one chain
    assert!(stdout.contains("Longest chain: 2"), "Unexpected stats: {}", stdout);
}

#[test]
fn test_cli_track_and_gc() {
    let tmp = TempDir::new().unwrap();
    let store = tmp.path().join("store");
    assert!(verso(&store, &["init", "--compression", "none"]).status.success());

    let graph = ItemGraph::new(Item::new("Note", "notes", 1).with("text", "tracked"));
    let v1 = write_graph(tmp.path(), "v1.json", &graph);
    let output = verso(&store, &["--track", "cli", "create", &v1]);
    assert!(output.status.success(), "CLI create on track failed");
    let root = created_root(&output);

    let output = verso(&store, &["--track", "cli", "undo"]);
    assert!(output.status.success(), "CLI track undo failed");

    let output = verso(&store, &["list", "--deleted"]);
    assert!(String::from_utf8_lossy(&output.stdout).contains(&root));

    let output = verso(&store, &["gc", "--dry-run"]);
    assert!(output.status.success(), "CLI gc dry run failed");
    assert!(String::from_utf8_lossy(&output.stdout).contains("No changes made (dry run)"));

    let output = verso(&store, &["gc"]);
    assert!(output.status.success(), "CLI gc failed");
    assert!(String::from_utf8_lossy(&output.stdout).contains("✓ Garbage collection complete"));

    // The root is gone for good; redo has nothing left to restore
    let output = verso(&store, &["info", &root]);
    assert!(!output.status.success());
}

#[test]
fn test_cli_errors_are_reported() {
    let tmp = TempDir::new().unwrap();
    let store = tmp.path().join("missing");

    let output = verso(&store, &["list"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error"));

    assert!(verso(&store, &["init"]).status.success());
    let output = verso(&store, &["init"]);
    assert!(!output.status.success(), "second init must fail");

    let output = verso(&store, &["undo"]);
    assert!(!output.status.success(), "undo without a root or track must fail");
}
