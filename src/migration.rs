//! Schema migration on load
//!
//! Items carry the package and version of the schema they were written with.
//! When an item graph is read and some package is behind the version the
//! registry declares as current, the [`MigrationDriver`] brings it forward one
//! version at a time before the graph is handed out.
//!
//! A step may declare dependencies on other packages reaching a version first
//! (typically because entities move between packages). Dependencies run out of
//! band before the step; a dependency chain that leads back into a package
//! already being migrated is a [`VersoError::CircularDependency`].
//!
//! ```rust
//! use verso::{Item, ItemGraph, Migration, MigrationDriver, MigrationRegistry};
//!
//! let mut registry = MigrationRegistry::new();
//! registry.set_target_version("text", 2);
//! registry
//!     .register(Migration::new("text", 2, |items: Vec<Item>, _old: u32, new: u32| {
//!         Ok(items
//!             .into_iter()
//!             .map(|mut item| {
//!                 item.version = new;
//!                 item
//!             })
//!             .collect())
//!     }))
//!     .unwrap();
//!
//! let graph = ItemGraph::new(Item::new("Document", "text", 1));
//! let migrated = MigrationDriver::new(&registry).migrate(&graph).unwrap();
//! assert_eq!(migrated.root_item().unwrap().version, 2);
//! ```

use crate::error::{Result, VersoError};
use crate::item_graph::{Item, ItemGraph};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Transforms the items of one package from one version to the next
pub trait MigrationHandler: Send + Sync {
    /// Migrate `items` (all at `old_version`) to `new_version`
    fn migrate(&self, items: Vec<Item>, old_version: u32, new_version: u32) -> Result<Vec<Item>>;
}

impl<F> MigrationHandler for F
where
    F: Fn(Vec<Item>, u32, u32) -> Result<Vec<Item>> + Send + Sync,
{
    fn migrate(&self, items: Vec<Item>, old_version: u32, new_version: u32) -> Result<Vec<Item>> {
        self(items, old_version, new_version)
    }
}

/// A package at a schema version
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageVersion {
    /// Package name
    pub package: String,
    /// Schema version
    pub version: u32,
}

impl PackageVersion {
    /// Package `package` at `version`
    pub fn new(package: impl Into<String>, version: u32) -> Self {
        Self {
            package: package.into(),
            version,
        }
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.package, self.version)
    }
}

/// One version step of one package
#[derive(Clone)]
pub struct Migration {
    /// Package the step migrates
    pub package: String,
    /// Version the step produces (items enter at `to_version - 1`)
    pub to_version: u32,
    /// Packages that must reach the given versions before this step runs
    pub dependencies: Vec<PackageVersion>,
    /// Other packages items may be moved into by this step
    pub moves: Vec<PackageVersion>,
    handler: Arc<dyn MigrationHandler>,
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("package", &self.package)
            .field("to_version", &self.to_version)
            .field("dependencies", &self.dependencies)
            .field("moves", &self.moves)
            .finish()
    }
}

impl Migration {
    /// A step producing `to_version` of `package` from a closure
    pub fn new<F>(package: impl Into<String>, to_version: u32, handler: F) -> Self
    where
        F: Fn(Vec<Item>, u32, u32) -> Result<Vec<Item>> + Send + Sync + 'static,
    {
        Self::from_handler(package, to_version, handler)
    }

    /// A step producing `to_version` of `package`
    pub fn from_handler(package: impl Into<String>, to_version: u32, handler: impl MigrationHandler + 'static) -> Self {
        Self {
            package: package.into(),
            to_version,
            dependencies: Vec::new(),
            moves: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    /// Require `package` to reach `version` before this step
    pub fn depends_on(mut self, package: impl Into<String>, version: u32) -> Self {
        self.dependencies.push(PackageVersion::new(package, version));
        self
    }

    /// Allow this step to emit items of `package` at `version`
    pub fn moves_to(mut self, package: impl Into<String>, version: u32) -> Self {
        self.moves.push(PackageVersion::new(package, version));
        self
    }

    fn key(&self) -> PackageVersion {
        PackageVersion::new(self.package.clone(), self.to_version)
    }
}

/// Current schema versions and the steps leading to them
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    targets: BTreeMap<String, u32>,
    migrations: BTreeMap<PackageVersion, Migration>,
}

impl MigrationRegistry {
    /// Empty registry; no package is migrated
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the in-memory version of `package`
    pub fn set_target_version(&mut self, package: impl Into<String>, version: u32) {
        self.targets.insert(package.into(), version);
    }

    /// In-memory version of `package`
    pub fn target_version(&self, package: &str) -> Option<u32> {
        self.targets.get(package).copied()
    }

    /// Register a step
    pub fn register(&mut self, migration: Migration) -> Result<()> {
        if migration.to_version < 2 {
            return Err(VersoError::invalid_argument(format!(
                "migration of '{}' must produce version 2 or later",
                migration.package
            )));
        }
        let key = migration.key();
        if self.migrations.contains_key(&key) {
            return Err(VersoError::invalid_argument(format!("migration {} registered twice", key)));
        }
        self.migrations.insert(key, migration);
        Ok(())
    }

    /// The step producing `version` of `package`
    pub fn get(&self, package: &str, version: u32) -> Option<&Migration> {
        self.migrations.get(&PackageVersion::new(package, version))
    }

    /// Number of registered steps
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Whether no steps are registered
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Whether any item of `graph` is at a version other than its package's target
    pub fn needs_migration(&self, graph: &ItemGraph) -> bool {
        graph
            .items
            .values()
            .any(|item| self.target_version(&item.package).is_some_and(|v| v != item.version))
    }

    /// Reject dependency cycles among the registered steps
    ///
    /// A step depends on the previous step of its own package and on every
    /// step its declared dependencies require.
    pub fn validate(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        let mut marks: BTreeMap<PackageVersion, Mark> = BTreeMap::new();
        for start in self.migrations.keys() {
            if marks.contains_key(start) {
                continue;
            }
            // Explicit stack of (node, expanded)
            let mut stack = vec![(start.clone(), false)];
            let mut path: Vec<PackageVersion> = Vec::new();
            while let Some((node, expanded)) = stack.pop() {
                if expanded {
                    marks.insert(node, Mark::Done);
                    path.pop();
                    continue;
                }
                match marks.get(&node) {
                    Some(Mark::Done) => continue,
                    Some(Mark::InProgress) => {
                        let cycle: Vec<String> = path.iter().map(ToString::to_string).collect();
                        return Err(VersoError::CircularDependency(format!(
                            "{} -> {}",
                            cycle.join(" -> "),
                            node
                        )));
                    }
                    None => {}
                }
                marks.insert(node.clone(), Mark::InProgress);
                path.push(node.clone());
                stack.push((node.clone(), true));
                for next in self.step_dependencies(&node) {
                    match marks.get(&next) {
                        Some(Mark::Done) => {}
                        Some(Mark::InProgress) => {
                            let cycle: Vec<String> = path.iter().map(ToString::to_string).collect();
                            return Err(VersoError::CircularDependency(format!(
                                "{} -> {}",
                                cycle.join(" -> "),
                                next
                            )));
                        }
                        None => stack.push((next, false)),
                    }
                }
            }
        }
        Ok(())
    }

    fn step_dependencies(&self, node: &PackageVersion) -> Vec<PackageVersion> {
        let Some(migration) = self.migrations.get(node) else {
            return Vec::new();
        };
        let mut deps = Vec::new();
        let previous = PackageVersion::new(node.package.clone(), node.version - 1);
        if self.migrations.contains_key(&previous) {
            deps.push(previous);
        }
        for dep in &migration.dependencies {
            // Reaching version w requires every registered step up to w; the
            // step producing w transitively covers the earlier ones.
            if self.migrations.contains_key(dep) {
                deps.push(dep.clone());
            }
        }
        deps
    }
}

/// Migrates one item graph with a registry
#[derive(Debug)]
pub struct MigrationDriver<'a> {
    registry: &'a MigrationRegistry,
    buckets: BTreeMap<String, Vec<Item>>,
    in_progress: Vec<String>,
    steps_run: usize,
}

impl<'a> MigrationDriver<'a> {
    /// Driver over `registry`
    pub fn new(registry: &'a MigrationRegistry) -> Self {
        Self {
            registry,
            buckets: BTreeMap::new(),
            in_progress: Vec::new(),
            steps_run: 0,
        }
    }

    /// Bring every package of `graph` to its target version
    ///
    /// Packages without a declared target are left untouched. The migrated
    /// graph is validated before it is returned.
    pub fn migrate(mut self, graph: &ItemGraph) -> Result<ItemGraph> {
        self.buckets.clear();
        for item in graph.items.values() {
            self.buckets.entry(item.package.clone()).or_default().push(item.clone());
        }

        for (package, items) in &self.buckets {
            if let Some(target) = self.registry.target_version(package) {
                if let Some(item) = items.iter().find(|item| item.version > target) {
                    return Err(VersoError::migration(
                        package.clone(),
                        format!(
                            "item {} is at version {}, newer than the current schema version {}",
                            item.uuid, item.version, target
                        ),
                    ));
                }
            }
        }

        // Moves can add items to packages already finished, so loop until
        // no package is behind.
        while let Some(package) = self.next_behind() {
            let target = self.registry.target_version(&package).unwrap_or(0);
            self.migrate_package(&package, target)?;
        }

        let mut migrated = ItemGraph::with_root(graph.root);
        for item in self.buckets.into_values().flatten() {
            if migrated.insert(item).is_some() {
                return Err(VersoError::migration(
                    "*",
                    "migrations produced two items with the same UUID",
                ));
            }
        }
        migrated
            .validate()
            .map_err(|e| VersoError::migration("*", format!("migrated graph is invalid: {}", e)))?;
        debug!("Migrated item graph in {} steps", self.steps_run);
        Ok(migrated)
    }

    fn next_behind(&self) -> Option<String> {
        self.buckets
            .iter()
            .find(|(package, items)| {
                self.registry
                    .target_version(package)
                    .is_some_and(|target| items.iter().any(|item| item.version < target))
            })
            .map(|(package, _)| package.clone())
    }

    fn lowest_version(&self, package: &str) -> Option<u32> {
        self.buckets
            .get(package)
            .and_then(|items| items.iter().map(|item| item.version).min())
    }

    fn migrate_package(&mut self, package: &str, up_to: u32) -> Result<()> {
        if self.in_progress.iter().any(|p| p == package) {
            return Err(VersoError::CircularDependency(format!(
                "{} -> {}",
                self.in_progress.join(" -> "),
                package
            )));
        }
        self.in_progress.push(package.to_string());

        while let Some(lowest) = self.lowest_version(package).filter(|v| *v < up_to) {
            let next = lowest + 1;
            let migration = self
                .registry
                .get(package, next)
                .ok_or_else(|| VersoError::MigrationMissing {
                    package: package.to_string(),
                    version: next,
                })?
                .clone();

            for dep in &migration.dependencies {
                let reached = self.lowest_version(&dep.package).map_or(true, |v| v >= dep.version);
                if reached {
                    continue;
                }
                let dep_target = self.registry.target_version(&dep.package).unwrap_or(0);
                if dep.version > dep_target {
                    return Err(VersoError::migration(
                        package.to_string(),
                        format!(
                            "step to {} depends on {} beyond its current version {}",
                            next, dep, dep_target
                        ),
                    ));
                }
                trace!("Running dependency {} before {}@{}", dep, package, next);
                self.migrate_package(&dep.package, dep.version)?;
            }

            self.run_step(&migration, lowest)?;
        }

        self.in_progress.pop();
        Ok(())
    }

    fn run_step(&mut self, migration: &Migration, from: u32) -> Result<()> {
        let bucket = self.buckets.entry(migration.package.clone()).or_default();
        let (input, rest): (Vec<Item>, Vec<Item>) = bucket.drain(..).partition(|item| item.version == from);
        *bucket = rest;

        trace!(
            "Migrating {} items of {} from {} to {}",
            input.len(),
            migration.package,
            from,
            migration.to_version
        );
        let output = migration.handler.migrate(input, from, migration.to_version)?;
        self.steps_run += 1;

        let allowed: BTreeSet<(&str, u32)> = std::iter::once((migration.package.as_str(), migration.to_version))
            .chain(migration.moves.iter().map(|m| (m.package.as_str(), m.version)))
            .collect();
        for item in output {
            if !allowed.contains(&(item.package.as_str(), item.version)) {
                return Err(VersoError::migration(
                    migration.package.clone(),
                    format!(
                        "step to {} produced item {} at {}@{}",
                        migration.to_version, item.uuid, item.package, item.version
                    ),
                ));
            }
            self.buckets.entry(item.package.clone()).or_default().push(item);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn bump(items: Vec<Item>, _old: u32, new: u32) -> Result<Vec<Item>> {
        Ok(items
            .into_iter()
            .map(|mut item| {
                item.version = new;
                item
            })
            .collect())
    }

    #[test]
    fn test_linear_steps() {
        let mut registry = MigrationRegistry::new();
        registry.set_target_version("text", 3);
        registry.register(Migration::new("text", 2, bump)).unwrap();
        registry
            .register(Migration::new("text", 3, |items: Vec<Item>, _old: u32, new: u32| {
                Ok(items
                    .into_iter()
                    .map(|mut item| {
                        item.version = new;
                        item.set("migrated", true);
                        item
                    })
                    .collect())
            }))
            .unwrap();

        let graph = ItemGraph::new(Item::new("Document", "text", 1));
        assert!(registry.needs_migration(&graph));
        let migrated = MigrationDriver::new(&registry).migrate(&graph).unwrap();
        let root = migrated.root_item().unwrap();
        assert_eq!(root.version, 3);
        assert_eq!(root.get("migrated"), Some(&crate::item_graph::Value::Boolean(true)));
        assert!(!registry.needs_migration(&migrated));
    }

    #[test]
    fn test_missing_step() {
        let mut registry = MigrationRegistry::new();
        registry.set_target_version("text", 3);
        registry.register(Migration::new("text", 3, bump)).unwrap();

        let graph = ItemGraph::new(Item::new("Document", "text", 1));
        let err = MigrationDriver::new(&registry).migrate(&graph).unwrap_err();
        assert!(matches!(err, VersoError::MigrationMissing { version: 2, .. }));
    }

    #[test]
    fn test_newer_than_model_rejected() {
        let mut registry = MigrationRegistry::new();
        registry.set_target_version("text", 1);
        let graph = ItemGraph::new(Item::new("Document", "text", 4));
        assert!(matches!(
            MigrationDriver::new(&registry).migrate(&graph),
            Err(VersoError::MigrationFailed { .. })
        ));
    }

    #[test]
    fn test_dependency_runs_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut registry = MigrationRegistry::new();
        registry.set_target_version("body", 2);
        registry.set_target_version("style", 2);

        let log = Arc::clone(&order);
        registry
            .register(
                Migration::new("body", 2, move |items: Vec<Item>, old: u32, new: u32| {
                    log.lock().push("body");
                    bump(items, old, new)
                })
                .depends_on("style", 2),
            )
            .unwrap();
        let log = Arc::clone(&order);
        registry
            .register(Migration::new("style", 2, move |items: Vec<Item>, old: u32, new: u32| {
                log.lock().push("style");
                bump(items, old, new)
            }))
            .unwrap();
        registry.validate().unwrap();

        let mut graph = ItemGraph::new(Item::new("Document", "body", 1));
        graph.insert(Item::new("Font", "style", 1));
        MigrationDriver::new(&registry).migrate(&graph).unwrap();
        // "body" sorts first and would otherwise run first
        assert_eq!(*order.lock(), vec!["style", "body"]);
    }

    #[test]
    fn test_moved_items_join_destination() {
        let mut registry = MigrationRegistry::new();
        registry.set_target_version("legacy", 2);
        registry.set_target_version("text", 1);
        registry
            .register(
                Migration::new("legacy", 2, |items: Vec<Item>, _old: u32, _new: u32| {
                    Ok(items
                        .into_iter()
                        .map(|mut item| {
                            item.package = "text".to_string();
                            item.version = 1;
                            item
                        })
                        .collect())
                })
                .moves_to("text", 1),
            )
            .unwrap();

        let graph = ItemGraph::new(Item::new("Document", "legacy", 1));
        let migrated = MigrationDriver::new(&registry).migrate(&graph).unwrap();
        assert_eq!(migrated.root_item().unwrap().package, "text");
    }

    #[test]
    fn test_undeclared_output_rejected() {
        let mut registry = MigrationRegistry::new();
        registry.set_target_version("text", 2);
        registry
            .register(Migration::new("text", 2, |items: Vec<Item>, _old: u32, _new: u32| Ok(items)))
            .unwrap();
        let graph = ItemGraph::new(Item::new("Document", "text", 1));
        assert!(matches!(
            MigrationDriver::new(&registry).migrate(&graph),
            Err(VersoError::MigrationFailed { .. })
        ));
    }

    #[test]
    fn test_circular_dependency_detected() {
        let mut registry = MigrationRegistry::new();
        registry.set_target_version("a", 2);
        registry.set_target_version("b", 2);
        registry.register(Migration::new("a", 2, bump).depends_on("b", 2)).unwrap();
        registry.register(Migration::new("b", 2, bump).depends_on("a", 2)).unwrap();

        assert!(matches!(registry.validate(), Err(VersoError::CircularDependency(_))));

        let mut graph = ItemGraph::new(Item::new("Root", "a", 1));
        graph.insert(Item::new("Other", "b", 1));
        assert!(matches!(
            MigrationDriver::new(&registry).migrate(&graph),
            Err(VersoError::CircularDependency(_))
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = MigrationRegistry::new();
        registry.register(Migration::new("text", 2, bump)).unwrap();
        assert!(registry.register(Migration::new("text", 2, bump)).is_err());
        assert!(registry.register(Migration::new("text", 1, bump)).is_err());
    }
}
