//! Register cache with invalidator tracking.
//!
//! Each cachable register keeps the bytes of its last transfer tagged with a
//! snapshot of the change counters of its invalidator nodes. A lookup hits
//! only while every invalidator counter is unchanged; any write observed
//! through one of them flushes the entry on the next lookup.

use std::collections::HashMap;
use std::sync::RwLock;

use genapi_xml::NodeId;

/// Per-node caching behaviour declared by the `Cachable` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cachable {
    /// Every access reaches the device.
    NoCache,
    /// Writes update both the cache and the device.
    #[default]
    WriteThrough,
    /// Writes reach the device only; the cached bytes are dropped.
    WriteAround,
}

impl Cachable {
    /// Parse the `Cachable` property value.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "NoCache" => Some(Cachable::NoCache),
            "WriteThrough" => Some(Cachable::WriteThrough),
            "WriteAround" => Some(Cachable::WriteAround),
            _ => None,
        }
    }
}

/// Global cache policy overriding the per-node flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterCachePolicy {
    /// Per-node flags are ignored; every access reaches the device.
    Disable,
    /// Per-node flags are honoured.
    #[default]
    Enable,
    /// As `Enable`, but every cached read is checked against the device and
    /// mismatches are reported.
    Debug,
}

#[derive(Debug, Clone)]
struct Entry {
    bytes: Vec<u8>,
    /// Change counters of the invalidators at population time.
    invalidators: Vec<(NodeId, u64)>,
}

/// Cache of register transfers keyed by node id.
#[derive(Debug, Default)]
pub struct RegisterCache {
    entries: RwLock<HashMap<NodeId, Entry>>,
}

impl RegisterCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the cached bytes for `id`.
    ///
    /// `counters` must yield the current change counter for a node id; the
    /// lookup hits only if every recorded invalidator is unchanged.
    pub fn lookup(&self, id: NodeId, counters: &dyn Fn(NodeId) -> u64) -> Option<Vec<u8>> {
        let entries = self.entries.read().expect("cache lock poisoned");
        let entry = entries.get(&id)?;
        if entry
            .invalidators
            .iter()
            .all(|&(node, count)| counters(node) == count)
        {
            Some(entry.bytes.clone())
        } else {
            None
        }
    }

    /// Store the bytes of a transfer together with the current counters of
    /// the node's invalidators.
    pub fn store(&self, id: NodeId, bytes: &[u8], invalidators: Vec<(NodeId, u64)>) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.insert(
            id,
            Entry {
                bytes: bytes.to_vec(),
                invalidators,
            },
        );
    }

    /// Drop the entry for one node.
    pub fn invalidate(&self, id: NodeId) {
        self.entries.write().expect("cache lock poisoned").remove(&id);
    }

    /// Drop every entry.
    pub fn invalidate_all(&self) {
        self.entries.write().expect("cache lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cachable_parse() {
        assert_eq!(Cachable::parse("NoCache"), Some(Cachable::NoCache));
        assert_eq!(Cachable::parse(" WriteThrough "), Some(Cachable::WriteThrough));
        assert_eq!(Cachable::parse("WriteAround"), Some(Cachable::WriteAround));
        assert_eq!(Cachable::parse("sometimes"), None);
    }

    #[test]
    fn lookup_hits_while_invalidators_hold() {
        let cache = RegisterCache::new();
        cache.store(3, &[1, 2, 3, 4], vec![(7, 5)]);
        assert_eq!(cache.lookup(3, &|_| 5), Some(vec![1, 2, 3, 4]));
        // Invalidator advanced: entry is stale.
        assert_eq!(cache.lookup(3, &|_| 6), None);
    }

    #[test]
    fn invalidate_drops_entries() {
        let cache = RegisterCache::new();
        cache.store(1, &[0xAA], Vec::new());
        cache.store(2, &[0xBB], Vec::new());
        cache.invalidate(1);
        assert_eq!(cache.lookup(1, &|_| 0), None);
        assert_eq!(cache.lookup(2, &|_| 0), Some(vec![0xBB]));
        cache.invalidate_all();
        assert_eq!(cache.lookup(2, &|_| 0), None);
    }
}
