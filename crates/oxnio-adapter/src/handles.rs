//! Open-handle registry.
//!
//! Maps generated [`HandleId`]s to the backing store's open resources. The
//! resource is bound once at open time and never re-derived from a path, so
//! a handle keeps working after its file is renamed or unlinked.
//!
//! # Deferred deletion
//!
//! Stores that cannot keep an unlinked file readable need help: the adapter
//! moves such a file to a hidden orphan name and calls
//! [`OpenHandleRegistry::defer_removal`]. When the last handle for that
//! resource closes, [`OpenHandleRegistry::close`] hands the orphan path back
//! so the adapter can delete it.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{AdapterError, AdapterResult};
use crate::handle_table::{HandleId, HandleTable};
use crate::lock_metrics::LockMetrics;
use crate::path::FsPath;

/// Store-assigned identity of an underlying file (an inode number or
/// equivalent). Stable across renames.
pub type ResourceId = u64;

/// One open resource.
#[derive(Debug)]
pub struct HandleEntry<R> {
    id: HandleId,
    resource: R,
    resource_id: ResourceId,
    writable: bool,
    /// Last known path. Diagnostics and lock targeting only.
    path: RwLock<FsPath>,
}

impl<R> HandleEntry<R> {
    /// The handle id.
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// The backing store's open resource.
    pub fn resource(&self) -> &R {
        &self.resource
    }

    /// Identity of the underlying file.
    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    /// Whether the handle was opened for writing.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Last known path of the file. May be stale or no longer exist.
    pub fn path(&self) -> FsPath {
        self.path.read().clone()
    }
}

/// Result of closing a handle.
#[derive(Debug)]
pub struct Closed<R> {
    /// The removed entry.
    pub entry: Arc<HandleEntry<R>>,
    /// Set when this was the last handle of an orphaned resource; the
    /// caller must delete this path once `entry` is dropped.
    pub orphan: Option<FsPath>,
}

#[derive(Debug, Default)]
struct ResourceState {
    open: usize,
    orphan: Option<FsPath>,
}

/// Registry of open handles.
#[derive(Debug)]
pub struct OpenHandleRegistry<R> {
    table: HandleTable<Arc<HandleEntry<R>>>,
    resources: Mutex<HashMap<ResourceId, ResourceState>>,
    metrics: Arc<LockMetrics>,
}

impl<R> Default for OpenHandleRegistry<R> {
    fn default() -> Self {
        Self::new(Arc::new(LockMetrics::new()))
    }
}

impl<R> OpenHandleRegistry<R> {
    /// Create an empty registry recording into `metrics`.
    pub fn new(metrics: Arc<LockMetrics>) -> Self {
        Self {
            table: HandleTable::new(),
            resources: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Register an opened resource and return its handle id.
    pub fn open(&self, resource: R, resource_id: ResourceId, path: FsPath, writable: bool) -> HandleId {
        self.resources.lock().entry(resource_id).or_default().open += 1;

        let id = self.table.insert_with(|id| {
            Arc::new(HandleEntry {
                id,
                resource,
                resource_id,
                writable,
                path: RwLock::new(path),
            })
        });
        self.metrics.record_handle_open();
        trace!(fh = id, resource_id, "handle opened");
        id
    }

    /// Look up a live handle.
    pub fn lookup(&self, id: HandleId) -> AdapterResult<Arc<HandleEntry<R>>> {
        self.table.get(id).ok_or(AdapterError::InvalidHandle(id))
    }

    /// Close a handle.
    ///
    /// Fails with [`AdapterError::InvalidHandle`] if `id` is not live.
    pub fn close(&self, id: HandleId) -> AdapterResult<Closed<R>> {
        let entry = self.table.remove(id).ok_or(AdapterError::InvalidHandle(id))?;
        self.metrics.record_handle_close();

        let mut resources = self.resources.lock();
        let mut orphan = None;
        if let Some(state) = resources.get_mut(&entry.resource_id) {
            state.open -= 1;
            if state.open == 0 {
                orphan = resources
                    .remove(&entry.resource_id)
                    .and_then(|state| state.orphan);
            }
        }
        drop(resources);

        if let Some(path) = &orphan {
            debug!(fh = id, resource_id = entry.resource_id, orphan = %path, "last handle of orphaned file closed");
        } else {
            trace!(fh = id, "handle closed");
        }
        Ok(Closed { entry, orphan })
    }

    /// Whether any handle references `resource_id`.
    pub fn is_open(&self, resource_id: ResourceId) -> bool {
        self.open_count(resource_id) > 0
    }

    /// Number of handles referencing `resource_id`.
    pub fn open_count(&self, resource_id: ResourceId) -> usize {
        self.resources.lock().get(&resource_id).map_or(0, |s| s.open)
    }

    /// Record that `resource_id` now lives at `orphan` and must be deleted
    /// when its last handle closes.
    ///
    /// Returns false if no handle is open any more; the caller then deletes
    /// the orphan itself.
    pub fn defer_removal(&self, resource_id: ResourceId, orphan: FsPath) -> bool {
        let mut resources = self.resources.lock();
        match resources.get_mut(&resource_id) {
            Some(state) if state.open > 0 => {
                debug!(resource_id, orphan = %orphan, open = state.open, "deferring removal until last close");
                state.orphan = Some(orphan);
                self.metrics.record_deferred_deletion();
                true
            }
            _ => false,
        }
    }

    /// Rewrite the path hints of handles at or under `from`.
    pub fn rename_hints(&self, from: &FsPath, to: &FsPath) {
        self.table.for_each(|_, entry| {
            let mut path = entry.path.write();
            if let Some(rebased) = path.rebase(from, to) {
                *path = rebased;
            }
        });
    }

    /// Close every handle, returning the close results.
    pub fn drain(&self) -> Vec<Closed<R>> {
        self.table
            .ids()
            .into_iter()
            .filter_map(|id| self.close(id).ok())
            .collect()
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no handles are open.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
