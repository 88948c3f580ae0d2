//! Concurrent id-to-value table for open handles.
//!
//! Backed by `DashMap`, so lookups on different handles never contend on a
//! single mutex and no shard lock is held across calls.
//!
//! # Handle Lifecycle
//!
//! 1. **Insert**: the table generates a fresh id (never 0, never a live id)
//! 2. **Get**: every read/write/flush call looks the id up again
//! 3. **Remove**: release takes the value out; later lookups miss

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identifier handed to the FUSE binding as its `fh`.
pub type HandleId = u64;

/// Thread-safe table with generated [`HandleId`] keys.
///
/// ```
/// use oxnio_adapter::HandleTable;
///
/// let table: HandleTable<&str> = HandleTable::new();
/// let id = table.insert("resource");
/// assert_ne!(id, 0);
/// assert_eq!(table.get(id), Some("resource"));
/// assert_eq!(table.remove(id), Some("resource"));
/// assert_eq!(table.get(id), None);
/// ```
#[derive(Debug)]
pub struct HandleTable<V> {
    entries: DashMap<HandleId, V>,
    /// Next id to try; starts at 1 because 0 is the null handle.
    next_id: AtomicU64,
}

impl<V> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> HandleTable<V> {
    /// Create an empty table. The first id issued is 1.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert a value under a freshly generated id.
    ///
    /// The counter wraps past `u64::MAX` back to 1 and skips ids that are
    /// still live, so an id is never reused while its entry exists.
    pub fn insert(&self, value: V) -> HandleId {
        self.insert_with(|_| value)
    }

    /// Insert a value built from its own id.
    pub fn insert_with(&self, make: impl FnOnce(HandleId) -> V) -> HandleId {
        let mut make = Some(make);
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.entries.entry(id)
                && let Some(make) = make.take()
            {
                slot.insert(make(id));
                return id;
            }
        }
    }

    /// Remove and return the value for `id`.
    pub fn remove(&self, id: HandleId) -> Option<V> {
        self.entries.remove(&id).map(|(_, v)| v)
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: HandleId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Currently live ids, in no particular order.
    pub fn ids(&self) -> Vec<HandleId> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    /// Visit every entry while holding each shard lock only briefly.
    pub fn for_each(&self, mut f: impl FnMut(HandleId, &V)) {
        for entry in &self.entries {
            f(*entry.key(), entry.value());
        }
    }
}

impl<V: Clone> HandleTable<V> {
    /// Clone the value for `id` out of the table.
    ///
    /// Returning an owned value keeps the shard unlocked while the caller
    /// performs I/O on it.
    pub fn get(&self, id: HandleId) -> Option<V> {
        self.entries.get(&id).map(|e| e.value().clone())
    }
}
