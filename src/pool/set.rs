//! Ordered tunnel sets
//!
//! The pool keeps two of these: the *cache* (every known tunnel, persisted
//! across runs) and the *active* set (tunnels currently usable for
//! forwarding). At the steady-state tunnel count (single digits) a linear
//! scan beats any map, and stable iteration order keeps the weighted
//! selector's cumulative walk deterministic.
//!
//! Callers must hold the pool lock for every operation, and are responsible
//! for URL uniqueness: `insert` does not check.

use super::record::TunnelRef;

/// Initial capacity of a tunnel set
const INIT_CAPACITY: usize = 16;

/// Growable ordered collection of tunnel records keyed by URL
pub(crate) struct TunnelSet {
    tunnels: Vec<TunnelRef>,
}

impl TunnelSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self {
            tunnels: Vec::with_capacity(INIT_CAPACITY),
        }
    }

    /// Number of records in the set
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Append a record. Callers check uniqueness first.
    pub fn insert(&mut self, tunnel: TunnelRef) {
        self.tunnels.push(tunnel);
    }

    /// Find a record's index by URL
    pub fn lookup(&self, url: &str) -> Option<usize> {
        self.tunnels.iter().position(|t| t.url() == url)
    }

    /// Record at `index`
    pub fn get(&self, index: usize) -> &TunnelRef {
        &self.tunnels[index]
    }

    /// Swap in a record for the existing one with the same URL, returning
    /// the previous record. `None` if the URL is not present (the set is
    /// unchanged).
    pub fn replace(&mut self, tunnel: TunnelRef) -> Option<TunnelRef> {
        let idx = self.lookup(tunnel.url())?;
        Some(std::mem::replace(&mut self.tunnels[idx], tunnel))
    }

    /// Remove the record with the given URL, preserving the order of the
    /// remaining records.
    pub fn delete(&mut self, url: &str) -> Option<TunnelRef> {
        let idx = self.lookup(url)?;
        Some(self.tunnels.remove(idx))
    }

    /// Iterate over the records in insertion order
    pub fn iter(&self) -> std::slice::Iter<'_, TunnelRef> {
        self.tunnels.iter()
    }
}
