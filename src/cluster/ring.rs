//! Consistent hash ring mapping partition keys to member names
//!
//! A ring is immutable once built. Membership changes produce a new ring via
//! [`HashRing::rebuild`]; the coordinator swaps its reference so lookups only
//! ever see a complete ring.

use std::collections::BTreeMap;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

/// Number of virtual points per physical node
pub const VIRTUAL_NODES: usize = 100;

/// Consistent hash ring implementation
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// Virtual points (hash -> node name)
    ring: BTreeMap<u64, Arc<str>>,
    /// Distinct node names, sorted
    nodes: Vec<Arc<str>>,
}

impl HashRing {
    /// Build a ring over `nodes`. Duplicate names are ignored.
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: Vec<Arc<str>> = nodes.into_iter().map(|n| Arc::from(n.as_ref())).collect();
        names.sort();
        names.dedup();

        let mut ring = BTreeMap::new();
        for name in &names {
            for i in 0..VIRTUAL_NODES {
                let point = Self::hash_key(&format!("{}:{}", name, i));
                // On collision the smallest name wins, independent of build order
                ring.entry(point)
                    .and_modify(|owner: &mut Arc<str>| {
                        if &**name < &**owner {
                            *owner = name.clone();
                        }
                    })
                    .or_insert_with(|| name.clone());
            }
        }

        Self { ring, nodes: names }
    }

    /// Build a fresh ring for a new member set
    pub fn rebuild<I, S>(&self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(nodes)
    }

    /// Owner of `key`, or `None` when the ring is empty
    pub fn lookup(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }

        let hash = Self::hash_key(key);

        // First point clockwise from the key, wrapping around to the start
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| &**node)
    }

    /// Node names on the ring, sorted
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| &**n)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn hash_key(key: &str) -> u64 {
        xxh3_64(key.as_bytes())
    }
}
