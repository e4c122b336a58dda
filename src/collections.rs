//! Hash collections keyed by UUID.
//!
//! The in-memory graph walks (reachability, ancestor sets, visited sets)
//! hash millions of UUIDs on large stores. With the `gxhash` feature they use
//! gxhash, which needs AES-NI/SSE2; without it they fall back to the std
//! hasher so the crate still builds everywhere.

use dashmap::DashMap;
use uuid::Uuid;

#[cfg(feature = "gxhash")]
pub use gxhash::{GxBuildHasher, HashMap, HashMapExt, HashSet, HashSetExt};

#[cfg(not(feature = "gxhash"))]
pub use std::collections::{HashMap, HashSet};

/// Hasher used by the concurrent caches
#[cfg(not(feature = "gxhash"))]
pub type GxBuildHasher = std::hash::RandomState;

/// Constructors shared by both hash map flavours
#[cfg(not(feature = "gxhash"))]
pub trait HashMapExt {
    /// Creates an empty map
    fn new() -> Self;
    /// Creates an empty map with room for `capacity` entries
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<K, V> HashMapExt for HashMap<K, V> {
    fn new() -> Self {
        HashMap::default()
    }

    fn with_capacity(capacity: usize) -> Self {
        HashMap::with_capacity_and_hasher(capacity, Default::default())
    }
}

/// Constructors shared by both hash set flavours
#[cfg(not(feature = "gxhash"))]
pub trait HashSetExt {
    /// Creates an empty set
    fn new() -> Self;
    /// Creates an empty set with room for `capacity` entries
    fn with_capacity(capacity: usize) -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<T> HashSetExt for HashSet<T> {
    fn new() -> Self {
        HashSet::default()
    }

    fn with_capacity(capacity: usize) -> Self {
        HashSet::with_capacity_and_hasher(capacity, Default::default())
    }
}

/// Set of revision, branch or item UUIDs
pub type UuidSet = HashSet<Uuid>;

/// Concurrent map used for caches shared across threads
pub type ConcurrentUuidMap<V> = DashMap<Uuid, V, GxBuildHasher>;

/// Create an empty concurrent cache with room for `capacity` entries
pub fn concurrent_map<V>(capacity: usize) -> ConcurrentUuidMap<V> {
    DashMap::with_capacity_and_hasher(capacity, GxBuildHasher::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_set_dedup() {
        let mut set = UuidSet::new();
        let id = Uuid::new_v4();
        assert!(set.insert(id));
        assert!(!set.insert(id));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_concurrent_map() {
        let map: ConcurrentUuidMap<u32> = concurrent_map(4);
        let id = Uuid::new_v4();
        map.insert(id, 7);
        assert_eq!(map.get(&id).map(|v| *v), Some(7));
    }
}
