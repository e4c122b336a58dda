//! Item graphs: the content of one revision
//!
//! An item graph is a set of items keyed by UUID with one distinguished root
//! item. Items carry typed attribute values. `Composite` values are ownership
//! edges and must form a tree rooted at the root item; plain references and
//! cross-persistent-root references are free-form and are not required to
//! resolve (their targets may be deleted and later undeleted).
//!
//! Graphs use ordered maps throughout so that encoding the same graph always
//! produces the same bytes.

use crate::collections::{HashMap, HashMapExt, HashSet, HashSetExt};
use crate::error::{Result, VersoError};
use crate::types::AttachmentId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// A typed attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// Absent value
    Null,
    /// Signed integer
    Integer(i64),
    /// Floating point number
    Double(f64),
    /// UTF-8 text
    String(String),
    /// Boolean
    Boolean(bool),
    /// Opaque bytes
    Bytes(Vec<u8>),
    /// Non-owning reference to an item in the same graph
    Reference(Uuid),
    /// Owning reference to an item in the same graph
    Composite(Uuid),
    /// Reference to the root item of another persistent root
    PersistentRootRef(Uuid),
    /// Reference to a specific branch of another persistent root
    BranchRef {
        /// Target persistent root
        persistent_root: Uuid,
        /// Target branch
        branch: Uuid,
    },
    /// Reference to an attachment blob
    Attachment(AttachmentId),
    /// Ordered container
    Array(Vec<Value>),
    /// Unordered container
    Set(Vec<Value>),
    /// Keyed container
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Visit this value and every value nested inside it
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Value)) {
        let mut stack = vec![self];
        while let Some(value) = stack.pop() {
            visit(value);
            match value {
                Value::Array(values) | Value::Set(values) => stack.extend(values.iter().rev()),
                Value::Map(map) => stack.extend(map.values().rev()),
                _ => {}
            }
        }
    }

    /// Whether this is a container value
    pub fn is_container(&self) -> bool {
        matches!(self, Value::Array(_) | Value::Set(_) | Value::Map(_))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

/// One object in an item graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Item UUID, unique within the graph
    pub uuid: Uuid,
    /// Entity (type) name within the package
    pub entity: String,
    /// Schema package the entity belongs to
    pub package: String,
    /// Schema version of the package the item was written with
    pub version: u32,
    /// Attribute values
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl Item {
    /// Create an item with a fresh UUID
    pub fn new(entity: impl Into<String>, package: impl Into<String>, version: u32) -> Self {
        Self::with_uuid(Uuid::new_v4(), entity, package, version)
    }

    /// Create an item with a given UUID
    pub fn with_uuid(uuid: Uuid, entity: impl Into<String>, package: impl Into<String>, version: u32) -> Self {
        Self {
            uuid,
            entity: entity.into(),
            package: package.into(),
            version,
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set an attribute
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Read an attribute
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Read a string attribute
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    fn values(&self) -> impl Iterator<Item = &Value> {
        let mut all = Vec::new();
        for value in self.attributes.values() {
            value.walk(&mut |v| all.push(v));
        }
        all.into_iter()
    }

    /// Targets of the composite (ownership) edges of this item
    pub fn composite_children(&self) -> Vec<Uuid> {
        self.values()
            .filter_map(|v| match v {
                Value::Composite(uuid) => Some(*uuid),
                _ => None,
            })
            .collect()
    }

    /// Targets of plain inner references
    pub fn references(&self) -> Vec<Uuid> {
        self.values()
            .filter_map(|v| match v {
                Value::Reference(uuid) => Some(*uuid),
                _ => None,
            })
            .collect()
    }
}

/// The content of one revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemGraph {
    /// Root item UUID
    pub root: Uuid,
    /// All items by UUID
    pub items: BTreeMap<Uuid, Item>,
}

impl ItemGraph {
    /// Graph containing only `root_item`
    pub fn new(root_item: Item) -> Self {
        let root = root_item.uuid;
        let mut items = BTreeMap::new();
        items.insert(root, root_item);
        Self { root, items }
    }

    /// Empty graph with a root UUID but no items yet
    pub fn with_root(root: Uuid) -> Self {
        Self {
            root,
            items: BTreeMap::new(),
        }
    }

    /// Insert or replace an item
    pub fn insert(&mut self, item: Item) -> Option<Item> {
        self.items.insert(item.uuid, item)
    }

    /// Remove an item
    pub fn remove(&mut self, uuid: &Uuid) -> Option<Item> {
        self.items.remove(uuid)
    }

    /// Look up an item
    pub fn get(&self, uuid: &Uuid) -> Option<&Item> {
        self.items.get(uuid)
    }

    /// Mutable lookup
    pub fn get_mut(&mut self, uuid: &Uuid) -> Option<&mut Item> {
        self.items.get_mut(uuid)
    }

    /// The root item
    pub fn root_item(&self) -> Option<&Item> {
        self.items.get(&self.root)
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the graph holds no items
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Check the structural rules of an item graph
    ///
    /// The root item must exist, every composite target must exist, and
    /// composite edges must form a tree rooted at the root item.
    pub fn validate(&self) -> Result<()> {
        if self.root.is_nil() {
            return Err(VersoError::invalid_argument("item graph root must not be the nil UUID"));
        }
        if !self.items.contains_key(&self.root) {
            return Err(VersoError::consistency(format!(
                "root item {} is missing from the item graph",
                self.root
            )));
        }

        let mut composite_parent: HashMap<Uuid, Uuid> = HashMap::with_capacity(self.items.len());
        for (uuid, item) in &self.items {
            if *uuid != item.uuid {
                return Err(VersoError::consistency(format!(
                    "item keyed {} carries uuid {}",
                    uuid, item.uuid
                )));
            }
            for child in item.composite_children() {
                if !self.items.contains_key(&child) {
                    return Err(VersoError::consistency(format!(
                        "item {} owns missing item {}",
                        uuid, child
                    )));
                }
                if child == self.root {
                    return Err(VersoError::consistency(format!(
                        "root item {} is owned by {}",
                        self.root, uuid
                    )));
                }
                if let Some(previous) = composite_parent.insert(child, *uuid) {
                    if previous != *uuid {
                        return Err(VersoError::consistency(format!(
                            "item {} has two composite parents ({} and {})",
                            child, previous, uuid
                        )));
                    }
                }
            }
        }

        // With at most one parent per item, a cycle shows up as a parent
        // chain that never reaches an item without a parent.
        let mut settled: HashSet<Uuid> = HashSet::with_capacity(self.items.len());
        for start in composite_parent.keys() {
            let mut chain = HashSet::new();
            let mut cursor = *start;
            while let Some(parent) = composite_parent.get(&cursor) {
                if settled.contains(&cursor) {
                    break;
                }
                if !chain.insert(cursor) {
                    return Err(VersoError::consistency(format!(
                        "composite edges form a cycle through item {}",
                        cursor
                    )));
                }
                cursor = *parent;
            }
            settled.extend(chain);
        }
        Ok(())
    }

    /// Persistent roots referenced from this graph
    pub fn referenced_persistent_roots(&self) -> BTreeSet<Uuid> {
        let mut roots = BTreeSet::new();
        for item in self.items.values() {
            for value in item.values() {
                match value {
                    Value::PersistentRootRef(root) => {
                        roots.insert(*root);
                    }
                    Value::BranchRef { persistent_root, .. } => {
                        roots.insert(*persistent_root);
                    }
                    _ => {}
                }
            }
        }
        roots
    }

    /// Attachments referenced from this graph
    pub fn attachments(&self) -> BTreeSet<AttachmentId> {
        let mut ids = BTreeSet::new();
        for item in self.items.values() {
            for value in item.values() {
                if let Value::Attachment(id) = value {
                    ids.insert(id.clone());
                }
            }
        }
        ids
    }

    /// String values of `item`, for the search index
    pub fn text_fragments(&self, item: &Uuid) -> Vec<String> {
        self.items
            .get(item)
            .map(|item| {
                item.values()
                    .filter_map(|v| match v {
                        Value::String(s) if !s.is_empty() => Some(s.clone()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Restrict the graph to `items` (the root UUID is kept)
    pub fn subgraph<'a>(&self, items: impl IntoIterator<Item = &'a Uuid>) -> ItemGraph {
        let mut partial = ItemGraph::with_root(self.root);
        for uuid in items {
            if let Some(item) = self.items.get(uuid) {
                partial.insert(item.clone());
            }
        }
        partial
    }

    /// Schema version of each package present in the graph (lowest if mixed)
    pub fn package_versions(&self) -> BTreeMap<String, u32> {
        let mut versions: BTreeMap<String, u32> = BTreeMap::new();
        for item in self.items.values() {
            versions
                .entry(item.package.clone())
                .and_modify(|v| *v = (*v).min(item.version))
                .or_insert(item.version);
        }
        versions
    }
}
