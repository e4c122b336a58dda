//! Store verification and integrity checking
//!
//! [`StoreVerifier`] checks a store at two levels:
//!
//! 1. **Payload level**: every revision listed in the catalog has a payload
//!    file whose SHA-256 matches the recorded `payload_hash` and which decodes
//!    to a record for that revision. Payloads are checked in parallel.
//! 2. **Catalog level**: branch pointers satisfy the ancestor invariant,
//!    parents exist (a missing parent is allowed only at or before a branch's
//!    initial revision, where garbage collection may have erased it), UUIDs
//!    are unique across roots, branches and revisions, and the current item
//!    graph of every branch is structurally valid.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use verso::Store;
//!
//! # fn main() -> verso::Result<()> {
//! let store = Store::open("./notes.verso")?;
//! let report = store.verify()?;
//! if report.is_valid() {
//!     println!("{}", report.summary());
//! } else {
//!     for error in &report.errors {
//!         eprintln!("{}", error);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Verification failures are reported in the [`VerificationReport`];
//! `Err` is returned only when the check itself cannot run.

use crate::catalog::Catalog;
use crate::collections::{HashSet, HashSetExt, UuidSet};
use crate::error::Result;
use crate::store::Store;
use crate::types::RevisionInfo;
use crate::utils;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Verifier for the payloads and catalog of one store
#[derive(Debug)]
pub struct StoreVerifier<'a> {
    store: &'a Store,
}

impl<'a> StoreVerifier<'a> {
    /// Create a verifier over `store`
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Run every check against the store's current catalog
    pub fn verify(&self) -> Result<VerificationReport> {
        let start = Instant::now();
        let catalog = self.store.catalog();
        let mut report = VerificationReport::new(self.store.store_uuid(), catalog.generation);

        // 1. Payloads
        let revisions: Vec<&RevisionInfo> = catalog
            .backing_stores
            .values()
            .flat_map(|index| index.revisions.values())
            .collect();
        debug!("Verifying {} revision payloads", revisions.len());
        let checks: Vec<PayloadVerification> = self
            .store
            .workers()
            .install(|| revisions.par_iter().map(|info| self.verify_payload(info)).collect());
        report.revisions_checked = checks.len();
        for check in checks {
            if check.is_valid() {
                report.payloads_valid += 1;
            } else {
                report.errors.push(format!(
                    "Payload of revision {} is invalid: {}",
                    check.revision,
                    check.error.as_deref().unwrap_or("unknown")
                ));
                report.payload_failures.push(check);
            }
        }

        // 2. Catalog structure
        report.uuids_unique = check_uuids(&catalog, &mut report.errors);
        report.parents_valid = check_parents(&catalog, &mut report.errors);
        report.branches_checked = catalog.persistent_roots.values().map(|r| r.branches.len()).sum();
        report.ancestry_valid = check_branch_pointers(&catalog, &mut report.errors);

        // 3. Current content
        report.graphs_valid = self.check_current_graphs(&catalog, &mut report.errors);

        report.verification_time_ms = start.elapsed().as_millis() as u64;
        if report.is_valid() {
            info!("{}", report.summary());
        } else {
            warn!("{}", report.summary());
        }
        Ok(report)
    }

    fn verify_payload(&self, info: &RevisionInfo) -> PayloadVerification {
        let mut check = PayloadVerification {
            revision: info.uuid,
            backing_store: info.backing_store,
            exists: false,
            hash_valid: false,
            decodable: false,
            error: None,
        };

        let revisions = self.store.revision_store();
        let bytes = match revisions.read_payload(info.backing_store, info.uuid) {
            Ok(bytes) => bytes,
            Err(e) => {
                check.error = Some(e.to_string());
                return check;
            }
        };
        check.exists = true;

        let actual = utils::hash_data(&bytes);
        check.hash_valid = actual == info.payload_hash;
        if !check.hash_valid {
            check.error = Some(format!(
                "hash mismatch - expected: {}, actual: {}",
                info.payload_hash, actual
            ));
        }

        match revisions.read_record(info.backing_store, info.uuid) {
            Ok(_) => check.decodable = true,
            Err(e) => {
                check.error.get_or_insert_with(|| e.to_string());
            }
        }
        check
    }

    fn check_current_graphs(&self, catalog: &Catalog, errors: &mut Vec<String>) -> bool {
        let mut valid = true;
        for root in catalog.persistent_roots.values().filter(|r| !r.deleted) {
            for branch in root.live_branches() {
                let Some(current) = branch.current_revision else {
                    continue;
                };
                let outcome = self
                    .store
                    .revision_store()
                    .item_graph(root.backing_store, current)
                    .and_then(|graph| graph.validate());
                if let Err(e) = outcome {
                    valid = false;
                    errors.push(format!(
                        "Current item graph of branch {} ({}) is invalid: {}",
                        branch.uuid, current, e
                    ));
                }
            }
        }
        valid
    }
}

fn check_uuids(catalog: &Catalog, errors: &mut Vec<String>) -> bool {
    let mut seen = UuidSet::new();
    let mut unique = true;

    for root in catalog.persistent_roots.values() {
        unique &= claim(&mut seen, root.uuid, "persistent root", errors);
        for branch in root.branches.values() {
            unique &= claim(&mut seen, branch.uuid, "branch", errors);
        }
    }
    for index in catalog.backing_stores.values() {
        for (key, info) in &index.revisions {
            unique &= claim(&mut seen, *key, "revision", errors);
            if info.uuid != *key || info.backing_store != index.uuid {
                errors.push(format!(
                    "Revision {} is filed under the wrong key or backing store",
                    key
                ));
                unique = false;
            }
        }
    }
    unique
}

fn claim(seen: &mut UuidSet, uuid: Uuid, what: &str, errors: &mut Vec<String>) -> bool {
    if seen.insert(uuid) {
        return true;
    }
    errors.push(format!("UUID {} of {} is used more than once", uuid, what));
    false
}

fn check_parents(catalog: &Catalog, errors: &mut Vec<String>) -> bool {
    let mut valid = true;
    for index in catalog.backing_stores.values() {
        let graph = index.graph();

        // Revisions at or before some branch's initial may have lost their parent
        let mut truncated: HashSet<Uuid> = HashSet::new();
        for root in catalog.persistent_roots.values() {
            if root.backing_store != index.uuid {
                continue;
            }
            for branch in root.branches.values() {
                if let Some(initial) = branch.initial_revision {
                    truncated.extend(graph.parent_chain(initial));
                }
            }
        }

        for info in index.revisions.values() {
            for parent in info.parents() {
                if !graph.contains(&parent) && !truncated.contains(&info.uuid) {
                    valid = false;
                    errors.push(format!("Revision {} has missing parent {}", info.uuid, parent));
                }
            }
        }
    }
    valid
}

fn check_branch_pointers(catalog: &Catalog, errors: &mut Vec<String>) -> bool {
    let mut valid = true;
    for root in catalog.persistent_roots.values() {
        let Some(index) = catalog.backing(&root.backing_store) else {
            valid = false;
            errors.push(format!(
                "Persistent root {} has no backing store {}",
                root.uuid, root.backing_store
            ));
            continue;
        };
        let graph = index.graph();

        if let Some(current) = root.current_branch {
            if !root.branches.contains_key(&current) {
                valid = false;
                errors.push(format!("Current branch {} of {} does not exist", current, root.uuid));
            }
        }

        for branch in root.branches.values() {
            let pointers = [
                ("initial", branch.initial_revision),
                ("current", branch.current_revision),
                ("head", branch.head_revision),
            ];
            let mut missing = false;
            for (name, pointer) in pointers {
                if let Some(revision) = pointer {
                    if !graph.contains(&revision) {
                        missing = true;
                        errors.push(format!(
                            "Branch {} points its {} revision at missing {}",
                            branch.uuid, name, revision
                        ));
                    }
                }
            }
            if missing {
                valid = false;
                continue;
            }

            if let (Some(initial), Some(current)) = (branch.initial_revision, branch.current_revision) {
                if !graph.is_ancestor_or_equal(initial, current) {
                    valid = false;
                    errors.push(format!(
                        "Branch {}: initial {} is not an ancestor of current {}",
                        branch.uuid, initial, current
                    ));
                }
            }
            if let (Some(current), Some(head)) = (branch.current_revision, branch.head_revision) {
                if !graph.is_ancestor_or_equal(current, head) {
                    valid = false;
                    errors.push(format!(
                        "Branch {}: current {} is not an ancestor of head {}",
                        branch.uuid, current, head
                    ));
                }
                if !branch.supports_revert && current != head {
                    valid = false;
                    errors.push(format!(
                        "Branch {} does not support revert but head differs from current",
                        branch.uuid
                    ));
                }
            }
        }
    }
    valid
}

/// Verification report for one store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Store that was verified
    pub store_uuid: Uuid,
    /// Catalog generation that was verified
    pub catalog_generation: u64,
    /// Revisions whose payload was checked
    pub revisions_checked: usize,
    /// Payloads that passed every check
    pub payloads_valid: usize,
    /// Payloads that failed a check
    pub payload_failures: Vec<PayloadVerification>,
    /// Branch rows checked
    pub branches_checked: usize,
    /// Whether every branch satisfies the ancestor invariant
    pub ancestry_valid: bool,
    /// Whether every missing parent is explained by a branch initial
    pub parents_valid: bool,
    /// Whether UUIDs are unique across the catalog
    pub uuids_unique: bool,
    /// Whether every branch's current item graph is valid
    pub graphs_valid: bool,
    /// Time taken for verification in milliseconds
    pub verification_time_ms: u64,
    /// List of errors encountered
    pub errors: Vec<String>,
}

impl VerificationReport {
    /// Create an empty report
    pub fn new(store_uuid: Uuid, catalog_generation: u64) -> Self {
        Self {
            store_uuid,
            catalog_generation,
            revisions_checked: 0,
            payloads_valid: 0,
            payload_failures: Vec::new(),
            branches_checked: 0,
            ancestry_valid: false,
            parents_valid: false,
            uuids_unique: false,
            graphs_valid: false,
            verification_time_ms: 0,
            errors: Vec::new(),
        }
    }

    /// Check if the store is fully valid
    pub fn is_valid(&self) -> bool {
        self.payloads_valid == self.revisions_checked
            && self.ancestry_valid
            && self.parents_valid
            && self.uuids_unique
            && self.graphs_valid
            && self.errors.is_empty()
    }

    /// Get a summary of the verification
    pub fn summary(&self) -> String {
        if self.is_valid() {
            format!(
                "Store {} is valid ({} revisions, {} branches verified in {}ms)",
                &self.store_uuid.to_string()[..8],
                self.revisions_checked,
                self.branches_checked,
                self.verification_time_ms
            )
        } else {
            let issues = [
                (self.payloads_valid < self.revisions_checked).then_some("payload failures"),
                (!self.ancestry_valid).then_some("branch pointer violations"),
                (!self.parents_valid).then_some("missing parents"),
                (!self.uuids_unique).then_some("duplicate UUIDs"),
                (!self.graphs_valid).then_some("invalid item graphs"),
            ]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(", ");

            format!(
                "Store {} is invalid: {} ({}/{} payloads valid)",
                &self.store_uuid.to_string()[..8],
                issues,
                self.payloads_valid,
                self.revisions_checked
            )
        }
    }
}

/// Verification result for a single revision payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadVerification {
    /// Revision UUID
    pub revision: Uuid,
    /// Backing store holding the payload
    pub backing_store: Uuid,
    /// Whether the payload file exists
    pub exists: bool,
    /// Whether the stored bytes match the recorded hash
    pub hash_valid: bool,
    /// Whether the payload decodes to a record of this revision
    pub decodable: bool,
    /// Error message if verification failed
    pub error: Option<String>,
}

impl PayloadVerification {
    /// Check if the payload verification passed
    pub fn is_valid(&self) -> bool {
        self.exists && self.hash_valid && self.decodable && self.error.is_none()
    }
}
