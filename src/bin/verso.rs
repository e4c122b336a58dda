//! # Verso CLI - Versioned documents from the command line
//!
//! A command-line interface for inspecting and maintaining a verso store.
//!
//! ## Usage
//! ```bash
//! # Create a store in ./.verso
//! verso init
//!
//! # Create a persistent root from an item graph file
//! verso create document.json -m "First draft"
//!
//! # Commit a new revision and walk back through history
//! verso commit 3f2a document.json -m "Second draft"
//! verso history 3f2a
//! verso undo 3f2a
//!
//! # Record actions on a named undo track instead of a branch
//! verso --track editor delete 3f2a
//! verso --track editor undo
//!
//! # Reclaim space
//! verso gc --dry-run
//! verso gc
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use verso::{
    BranchTrack, CompressionStrategy, HistoryStats, ItemGraph, Metadata, RevisionInfoOptions, Store, StoreBuilder,
    StoreTransaction, Track, UndoTrack, UndoTrackStore,
};

/// Verso CLI - Inspect and maintain a versioned object store
#[derive(Parser)]
#[command(name = "verso")]
#[command(version)]
#[command(about = "Versioned documents with branches, undo tracks and garbage collection")]
#[command(long_about = None)]
struct Cli {
    /// Store directory (defaults to ./.verso)
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Record commits on this undo track and undo/redo through it
    #[arg(short, long, global = true)]
    track: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new store
    Init {
        /// Compression strategy
        #[arg(long, value_enum, default_value = "fast")]
        compression: CompressionMode,

        /// Full snapshot every N revisions
        #[arg(long, default_value = "16")]
        snapshot_interval: u32,
    },

    /// Create a persistent root from an item graph JSON file
    Create {
        /// Item graph file
        graph: PathBuf,

        /// Commit message
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Commit an item graph JSON file as the next revision
    #[command(alias = "ci")]
    Commit {
        /// Persistent root (UUID prefix)
        root: String,

        /// Item graph file
        graph: PathBuf,

        /// Commit message
        #[arg(short, long)]
        message: Option<String>,
    },

    /// List persistent roots
    #[command(alias = "ls")]
    List {
        /// Include soft-deleted roots
        #[arg(long)]
        deleted: bool,
    },

    /// Show persistent root details
    Info {
        /// Persistent root (UUID prefix)
        root: String,
    },

    /// Show the revision history of the current branch
    #[command(alias = "log")]
    History {
        /// Persistent root (UUID prefix)
        root: String,

        /// Include revisions no longer on the path to head
        #[arg(long)]
        divergent: bool,

        /// Continue into the branch this one was forked from
        #[arg(long)]
        parents: bool,
    },

    /// Step back on the current branch (or on --track)
    Undo {
        /// Persistent root (UUID prefix); not needed with --track
        root: Option<String>,
    },

    /// Step forward on the current branch (or on --track)
    Redo {
        /// Persistent root (UUID prefix); not needed with --track
        root: Option<String>,
    },

    /// Soft-delete a persistent root
    #[command(alias = "rm")]
    Delete {
        /// Persistent root (UUID prefix)
        root: String,
    },

    /// Restore a soft-deleted persistent root
    Undelete {
        /// Persistent root (UUID prefix)
        root: String,
    },

    /// Finalize deletions and erase unreachable revisions
    Gc {
        /// Only this persistent root
        root: Option<String>,

        /// Report without changing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove orphaned payload files
    Vacuum,

    /// Verify store integrity
    Verify,

    /// Search committed text
    Search {
        /// Query words
        query: String,
    },

    /// Show store statistics
    Stats,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum CompressionMode {
    None,
    Fast,
    Adaptive,
}

fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins unless --verbose asks for debug output
    let filter = if cli.verbose {
        EnvFilter::new("verso=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        let message = match e.downcast_ref::<verso::VersoError>() {
            Some(err) => err.user_message(),
            None => format!("{:#}", e),
        };
        eprintln!("{}: {}", "Error".red().bold(), message);
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> anyhow::Result<()> {
    let store_path = cli.store.unwrap_or_else(|| PathBuf::from(".verso"));
    let track = cli.track;

    match cli.command {
        Commands::Init {
            compression,
            snapshot_interval,
        } => cmd_init(&store_path, compression, snapshot_interval),
        Commands::Create { graph, message } => cmd_create(&store_path, track, &graph, message),
        Commands::Commit { root, graph, message } => cmd_commit(&store_path, track, &root, &graph, message),
        Commands::List { deleted } => cmd_list(&store_path, deleted),
        Commands::Info { root } => cmd_info(&store_path, &root),
        Commands::History {
            root,
            divergent,
            parents,
        } => cmd_history(&store_path, &root, divergent, parents),
        Commands::Undo { root } => cmd_step(&store_path, track, root, true),
        Commands::Redo { root } => cmd_step(&store_path, track, root, false),
        Commands::Delete { root } => cmd_set_deleted(&store_path, track, &root, true),
        Commands::Undelete { root } => cmd_set_deleted(&store_path, track, &root, false),
        Commands::Gc { root, dry_run } => cmd_gc(&store_path, root, dry_run),
        Commands::Vacuum => cmd_vacuum(&store_path),
        Commands::Verify => cmd_verify(&store_path),
        Commands::Search { query } => cmd_search(&store_path, &query),
        Commands::Stats => cmd_stats(&store_path),
    }
}

/// Create a new store
fn cmd_init(store_path: &Path, compression: CompressionMode, snapshot_interval: u32) -> anyhow::Result<()> {
    if store_path.join("metadata.json").exists() {
        bail!("{} already holds a verso store", store_path.display());
    }

    println!("{}", "Initializing verso store...".blue().bold());
    let strategy = match compression {
        CompressionMode::None => CompressionStrategy::None,
        CompressionMode::Fast => CompressionStrategy::Fast,
        CompressionMode::Adaptive => CompressionStrategy::Adaptive { min_size: 4096 },
    };
    let store = StoreBuilder::new()
        .compression_strategy(strategy)
        .snapshot_interval(snapshot_interval)
        .build(store_path)?;

    println!("{} Initialized store {}", "✓".green().bold(), store.store_uuid().to_string().yellow());
    println!("  Location: {}", store_path.display().to_string().cyan());
    println!("\nNext steps:");
    println!("  - Create a document: {}", "verso create document.json".yellow());
    Ok(())
}

/// Create a persistent root whose first revision is `graph_path`
fn cmd_create(
    store_path: &Path,
    track: Option<String>,
    graph_path: &Path,
    message: Option<String>,
) -> anyhow::Result<()> {
    let store = Arc::new(open_store(store_path)?);
    let graph = read_graph(graph_path)?;

    let mut tx = StoreTransaction::new();
    let (root, branch, revision) =
        tx.create_persistent_root_with_graph(graph, message_metadata(message.as_deref()));
    commit(&store, track.as_deref(), tx, "create")?;

    println!("{} Created persistent root {}", "✓".green().bold(), short(root).yellow().bold());
    println!("  Branch: {}", branch.to_string().dimmed());
    println!("  Revision: {}", revision.to_string().dimmed());
    Ok(())
}

/// Commit `graph_path` on top of the current revision of `root`
fn cmd_commit(
    store_path: &Path,
    track: Option<String>,
    root: &str,
    graph_path: &Path,
    message: Option<String>,
) -> anyhow::Result<()> {
    let store = Arc::new(open_store(store_path)?);
    let root = resolve_root(&store, root)?;
    let graph = read_graph(graph_path)?;

    let info = store
        .persistent_root_info(root)?
        .context("persistent root disappeared")?;
    let branch = info
        .current_branch_info()
        .context("persistent root has no current branch")?;

    let start = Instant::now();
    let mut tx = store.transaction_for(&[root])?;
    let revision = tx.commit_revision(
        root,
        branch.uuid,
        branch.current_revision,
        graph,
        message_metadata(message.as_deref()),
    );
    commit(&store, track.as_deref(), tx, "commit")?;

    println!("{} Committed revision {}", "✓".green().bold(), short(revision).yellow().bold());
    if let Some(msg) = &message {
        println!("  Message: {}", msg.cyan());
    }
    println!("  Branch: {}", branch.name().cyan());
    println!("  Time: {}", format_duration(start.elapsed()).to_string().cyan());
    Ok(())
}

/// List persistent roots
fn cmd_list(store_path: &Path, include_deleted: bool) -> anyhow::Result<()> {
    let store = open_store(store_path)?;
    let mut roots = store.persistent_root_uuids();
    if include_deleted {
        roots.extend(store.deleted_persistent_root_uuids());
    }

    if roots.is_empty() {
        println!("{}", "No persistent roots found.".yellow());
        return Ok(());
    }

    println!("{}", "Persistent roots:".blue().bold());
    println!();
    for uuid in roots {
        let Some(info) = store.persistent_root_info(uuid)? else {
            continue;
        };
        let marker = if info.deleted { "x".red() } else { " ".normal() };
        print!("{} {} ", marker, short(uuid).yellow().bold());
        if let Some(branch) = info.current_branch_info() {
            print!("{} ", branch.name().cyan());
        }
        if let Some(revision) = info.current_revision() {
            print!("@ {} ", short(revision).dimmed());
        }
        if let Some(source) = info.copied_from {
            print!("{}", format!("(copy of {})", short(source.persistent_root)).dimmed());
        }
        println!();
    }
    Ok(())
}

/// Show persistent root details
fn cmd_info(store_path: &Path, root: &str) -> anyhow::Result<()> {
    let store = open_store(store_path)?;
    let root = resolve_root(&store, root)?;
    let info = store
        .persistent_root_info(root)?
        .context("persistent root disappeared")?;

    println!("{} {}", "Persistent root".blue().bold(), short(root).yellow().bold());
    println!();
    println!("{}", "Basic Information:".bold());
    println!("  Full ID: {}", root.to_string().dimmed());
    println!("  Backing store: {}", info.backing_store.to_string().dimmed());
    println!("  Transaction id: {}", info.transaction_id);
    println!(
        "  Deleted: {}",
        if info.deleted { "yes".red() } else { "no".green() }
    );
    if !info.metadata.is_empty() {
        println!("  Metadata: {}", serde_json::Value::Object(info.metadata.clone()).to_string().cyan());
    }

    let catalog = store.catalog();
    let graph = catalog.backing(&info.backing_store).map(|backing| backing.graph());

    println!("\n{}", "Branches:".bold());
    for branch in info.branches.values() {
        let marker = if info.current_branch == Some(branch.uuid) {
            "*".green().bold()
        } else {
            " ".normal()
        };
        let state = if branch.deleted { " (deleted)".red() } else { "".normal() };
        println!("{} {}{}", marker, branch.name().cyan(), state);
        println!(
            "    initial {} | current {} | head {}",
            branch.initial_revision.map(short).unwrap_or_else(|| "-".into()).dimmed(),
            branch.current_revision.map(short).unwrap_or_else(|| "-".into()).yellow(),
            branch.head_revision.map(short).unwrap_or_else(|| "-".into()).dimmed()
        );
        let parent = branch.parent_branch.and_then(|uuid| info.branches.get(&uuid));
        if let (Some(graph), Some(parent)) = (graph, parent) {
            if let (Some(ours), Some(theirs)) = (branch.current_revision, parent.current_revision) {
                if let Some(fork) = graph.common_ancestor(ours, theirs) {
                    println!("    forked from {} at {}", parent.name().cyan(), short(fork).dimmed());
                }
            }
        }
    }

    if let Some(attributes) = store.persistent_root_attributes(root)? {
        println!("\n{}", "Storage:".bold());
        println!("  Export size: {}", format_bytes(attributes.export_size).cyan());
        println!("  Used size: {}", format_bytes(attributes.used_size).cyan());
    }

    let referencing = store.persistent_roots_referencing(root)?;
    if !referencing.is_empty() {
        print!("\n  Referenced by: ");
        for (i, uuid) in referencing.iter().enumerate() {
            if i > 0 {
                print!(", ");
            }
            print!("{}", short(*uuid).yellow());
        }
        println!();
    }
    Ok(())
}

/// Show the revisions of the current branch
fn cmd_history(store_path: &Path, root: &str, divergent: bool, parents: bool) -> anyhow::Result<()> {
    let store = open_store(store_path)?;
    let root = resolve_root(&store, root)?;
    let info = store
        .persistent_root_info(root)?
        .context("persistent root disappeared")?;
    let branch = info
        .current_branch_info()
        .context("persistent root has no current branch")?;

    let options = RevisionInfoOptions {
        include_parent_branches: parents,
        include_divergent: divergent,
    };
    let revisions = store.revision_infos(branch.uuid, options)?.unwrap_or_default();
    if revisions.is_empty() {
        println!("{}", "No revisions yet.".yellow());
        return Ok(());
    }

    let catalog = store.catalog();
    let graph = catalog.backing(&info.backing_store).map(|backing| backing.graph());

    println!("{} {}", "History of".blue().bold(), branch.name().cyan());
    println!();
    for (idx, revision) in revisions.iter().enumerate().rev() {
        let is_current = branch.current_revision == Some(revision.uuid);
        let is_head = branch.head_revision == Some(revision.uuid);
        if idx + 1 < revisions.len() {
            println!("{}", "│".dimmed());
        }
        let prefix = if is_current { "*" } else { "○" };
        print!("{} {} ", prefix.green().bold(), revision.short_id().yellow());
        print!("{} ", revision.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed());
        if let Some(message) = revision.metadata.get("message").and_then(|m| m.as_str()) {
            print!("{}", message.cyan());
        }
        if is_current {
            print!(" {}", "(current)".green().dimmed());
        }
        if is_head && !is_current {
            print!(" {}", "(head)".dimmed());
        }
        let children = graph.map_or(0, |graph| graph.children(revision.uuid).len());
        if children > 1 {
            print!(" {}", format!("({} children)", children).magenta());
        }
        println!();
    }
    Ok(())
}

/// Undo or redo on a branch or an undo track
fn cmd_step(store_path: &Path, track: Option<String>, root: Option<String>, undo: bool) -> anyhow::Result<()> {
    let store = Arc::new(open_store(store_path)?);
    let verb = if undo { "undo" } else { "redo" };

    let moved = match (track, root) {
        (Some(name), _) => {
            let tracks = UndoTrackStore::open(Arc::clone(&store))?;
            let track = UndoTrack::open(&tracks, name)?;
            step(&track, undo)?
        }
        (None, Some(root)) => {
            let root = resolve_root(&store, &root)?;
            let track = BranchTrack::current(Arc::clone(&store), root)?;
            step(&track, undo)?
        }
        (None, None) => bail!("{} needs a persistent root or --track", verb),
    };

    match moved {
        Some(node) => println!("{} {} to {}", "✓".green().bold(), verb, node.yellow()),
        None => println!("{}", format!("Nothing to {}", verb).yellow()),
    }
    Ok(())
}

fn step(track: &dyn Track, undo: bool) -> verso::Result<Option<String>> {
    let moved = if undo { track.undo()? } else { track.redo()? };
    if !moved {
        return Ok(None);
    }
    Ok(Some(
        track
            .current_node()?
            .map(|node| short(node.uuid))
            .unwrap_or_else(|| "start of track".to_string()),
    ))
}

/// Soft-delete or restore a persistent root
fn cmd_set_deleted(store_path: &Path, track: Option<String>, root: &str, deleted: bool) -> anyhow::Result<()> {
    let store = Arc::new(open_store(store_path)?);
    let root = resolve_root(&store, root)?;

    let mut tx = store.transaction_for(&[root])?;
    if deleted {
        tx.delete_persistent_root(root);
    } else {
        tx.undelete_persistent_root(root);
    }
    commit(&store, track.as_deref(), tx, if deleted { "delete" } else { "undelete" })?;

    let verb = if deleted { "Deleted" } else { "Restored" };
    println!("{} {} persistent root {}", "✓".green().bold(), verb, short(root).yellow());
    if deleted {
        println!("  Run {} to reclaim its space", "verso gc".yellow());
    }
    Ok(())
}

/// Finalize deletions
fn cmd_gc(store_path: &Path, root: Option<String>, dry_run: bool) -> anyhow::Result<()> {
    let store = open_store(store_path)?;
    let start = Instant::now();
    let targets = match root {
        Some(root) => vec![resolve_root(&store, &root)?],
        None => {
            let mut all = store.persistent_root_uuids();
            all.extend(store.deleted_persistent_root_uuids());
            all
        }
    };

    if dry_run {
        println!("{}", "Analyzing garbage collection (dry run)...".blue().bold());
        let mut erasable = Vec::new();
        let mut bytes = 0;
        for uuid in &targets {
            let stats = store.gc_analyze(*uuid)?;
            bytes += stats.bytes_reclaimed;
            erasable.extend(stats.erased_revisions);
        }

        println!("\n{}", "Analysis Results:".bold());
        println!("  Roots examined: {}", targets.len());
        println!("  Erasable revisions: {}", erasable.len().to_string().yellow());
        println!("  Space to reclaim: {}", format_bytes(bytes).green());
        for revision in erasable.iter().take(10) {
            println!("  - {}", short(*revision).dimmed());
        }
        if erasable.len() > 10 {
            println!("  ... and {} more", (erasable.len() - 10).to_string().dimmed());
        }
        println!("\n{}", "No changes made (dry run)".dimmed());
    } else {
        let spinner = spinner("Running garbage collection...");
        let stats = if targets.len() == 1 {
            store.finalize_deletions(targets[0])?
        } else {
            store.finalize_all_deletions()?
        };
        spinner.finish_and_clear();

        println!("{} Garbage collection complete", "✓".green().bold());
        println!("  {}", stats.summary());
        println!(
            "  Time: {}",
            format_duration(Duration::from_millis(stats.duration_ms)).to_string().cyan()
        );
    }

    println!("\n{}", format!("Total time: {}", format_duration(start.elapsed())).dimmed());
    Ok(())
}

/// Remove orphaned payload files
fn cmd_vacuum(store_path: &Path) -> anyhow::Result<()> {
    let store = open_store(store_path)?;
    let spinner = spinner("Vacuuming store...");
    let stats = store.vacuum()?;
    spinner.finish_and_clear();

    println!("{} Vacuum complete", "✓".green().bold());
    println!("  Payloads examined: {}", stats.payloads_examined);
    println!("  {}", stats.summary());
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(stats.duration_ms)).to_string().cyan()
    );
    Ok(())
}

/// Verify store integrity
fn cmd_verify(store_path: &Path) -> anyhow::Result<()> {
    let store = open_store(store_path)?;
    let spinner = spinner("Verifying store...");
    let report = store.verify()?;
    spinner.finish_and_clear();

    let check = |ok: bool| if ok { "✓ Valid".green() } else { "✗ Invalid".red() };
    println!("{}", "Verification Report:".bold());
    println!("  Revisions checked: {}", report.revisions_checked);
    println!(
        "  Payloads: {}/{} valid",
        report.payloads_valid.to_string().green(),
        report.revisions_checked
    );
    println!("  Branch pointers: {}", check(report.ancestry_valid));
    println!("  Parents: {}", check(report.parents_valid));
    println!("  UUIDs unique: {}", check(report.uuids_unique));
    println!("  Current graphs: {}", check(report.graphs_valid));
    println!("  Verification time: {}ms", report.verification_time_ms);

    if !report.is_valid() {
        println!("\n{} {}", "⚠".yellow().bold(), report.summary());
        for error in report.errors.iter().take(20) {
            println!("  - {}", error.red());
        }
        bail!("store failed verification");
    }
    Ok(())
}

/// Search committed text
fn cmd_search(store_path: &Path, query: &str) -> anyhow::Result<()> {
    let store = open_store(store_path)?;
    let results = store.search(query);
    if results.is_empty() {
        println!("{}", "No matches.".yellow());
        return Ok(());
    }

    println!("{} {}", results.len().to_string().bold(), "matches:".blue().bold());
    for result in results {
        println!(
            "  {} @ {} {}",
            short(result.persistent_root).yellow(),
            short(result.revision).dimmed(),
            result.text.cyan()
        );
    }
    Ok(())
}

/// Show store statistics
fn cmd_stats(store_path: &Path) -> anyhow::Result<()> {
    let store = open_store(store_path)?;
    let metadata = store.metadata();
    let catalog = store.catalog();
    let pages = store.page_statistics()?;

    println!("{}", "Store Status:".blue().bold());
    println!();
    println!("  Store: {}", metadata.store_uuid.to_string().yellow());
    println!("  Created: {} by {}", metadata.created_at.format("%Y-%m-%d %H:%M:%S"), metadata.created_by.hostname);
    println!("  Compression: {}", metadata.config.compression_strategy.to_string().cyan());

    println!("\n{}", "Catalog:".bold());
    println!("  Persistent roots: {}", store.persistent_root_uuids().len());
    println!("  Deleted roots: {}", store.deleted_persistent_root_uuids().len());
    println!("  Backing stores: {}", catalog.backing_stores.len());
    println!("  Generation: {}", catalog.generation);

    let history = catalog
        .backing_stores
        .values()
        .map(|backing| backing.graph().stats())
        .fold(HistoryStats::default(), |total, stats| HistoryStats {
            total_revisions: total.total_revisions + stats.total_revisions,
            leaves: total.leaves + stats.leaves,
            fork_points: total.fork_points + stats.fork_points,
            merges: total.merges + stats.merges,
            longest_chain: total.longest_chain.max(stats.longest_chain),
        });
    println!("\n{}", "History:".bold());
    println!("  Revisions: {}", history.total_revisions);
    println!("  Leaves: {} | Fork points: {} | Merges: {}", history.leaves, history.fork_points, history.merges);
    println!("  Longest chain: {}", history.longest_chain);

    println!("\n{}", "Pages:".bold());
    println!("  Page size: {}", format_bytes(pages.page_size));
    println!("  Total: {} ({})", pages.total_pages, format_bytes(pages.total_pages * pages.page_size));
    println!("  Free: {} ({})", pages.free_pages, format_bytes(pages.free_pages * pages.page_size));
    Ok(())
}

// Helper functions

fn open_store(store_path: &Path) -> anyhow::Result<Store> {
    if !store_path.join("metadata.json").exists() {
        bail!("{} is not a verso store. Run 'verso init' first.", store_path.display());
    }
    Ok(Store::open(store_path)?)
}

/// Commit directly or through the named undo track
fn commit(store: &Arc<Store>, track: Option<&str>, tx: StoreTransaction, action: &str) -> anyhow::Result<()> {
    match track {
        Some(name) => {
            let tracks = UndoTrackStore::open(Arc::clone(store))?;
            let track = UndoTrack::open(&tracks, name)?;
            let mut metadata = Metadata::new();
            metadata.insert("action".to_string(), serde_json::json!(action));
            track.commit(tx, metadata)?;
        }
        None => {
            store.commit(tx)?;
        }
    }
    Ok(())
}

fn read_graph(path: &Path) -> anyhow::Result<ItemGraph> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let graph: ItemGraph =
        serde_json::from_str(&text).with_context(|| format!("parsing item graph {}", path.display()))?;
    graph.validate()?;
    Ok(graph)
}

/// Resolve a UUID prefix against live and deleted roots
fn resolve_root(store: &Store, prefix: &str) -> anyhow::Result<Uuid> {
    let mut all = store.persistent_root_uuids();
    all.extend(store.deleted_persistent_root_uuids());
    let matches: Vec<Uuid> = all
        .into_iter()
        .filter(|uuid| uuid.to_string().starts_with(prefix))
        .collect();
    match matches.as_slice() {
        [uuid] => Ok(*uuid),
        [] => bail!("no persistent root matches '{}'", prefix),
        _ => bail!("'{}' is ambiguous ({} persistent roots match)", prefix, matches.len()),
    }
}

fn message_metadata(message: Option<&str>) -> Metadata {
    let mut metadata = Metadata::new();
    if let Some(message) = message {
        metadata.insert("message".to_string(), serde_json::json!(message));
    }
    metadata
}

fn spinner(message: &'static str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn short(uuid: Uuid) -> String {
    uuid.to_string()[..8].to_string()
}

/// Format bytes in human-readable form
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
