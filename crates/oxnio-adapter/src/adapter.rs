//! Operation dispatcher.
//!
//! [`NioAdapter`] sits between a FUSE protocol binding and a
//! [`BackingStore`]. Every call resolves its path, takes the hierarchical
//! path locks the operation needs, performs the store call, and releases the
//! locks on every exit path. Worker threads belong to the caller; the only
//! place a call blocks is lock acquisition.
//!
//! | Operation | Locks |
//! |---|---|
//! | `create`, `mkdir`, `unlink`, `rmdir` | WRITE on the path |
//! | `open`, `getattr`, `readdir`, `truncate` | READ on the path |
//! | `read`, `write`, `flush`, `fsync`, `ftruncate` | READ on the handle's path |
//! | `rename` | WRITE on both paths, granted together |
//! | `release` | none |
//!
//! Handle-based calls lock the handle's last known path, which follows
//! renames. The open resource itself is bound at open time, so a handle keeps
//! working after its file is renamed or unlinked.
//!
//! A call that looked up its handle just before a concurrent `release` still
//! holds the resource until it returns. Stores without unlink-while-open see
//! that reference as an open file, so orphan deletion is retried until the
//! last in-flight call has finished.

use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

use crate::backend::{
    BackingStore, DirEntry, EntryAttr, OpenFlags, OpenResource, read_fully, write_fully,
};
use crate::config::{AdapterConfig, DEFAULT_ORPHAN_DIR};
use crate::error::{AdapterError, AdapterResult};
use crate::handle_table::HandleId;
use crate::handles::{Closed, HandleEntry, OpenHandleRegistry, ResourceId};
use crate::lock_metrics::LockMetrics;
use crate::locks::{Cancellation, PathLock, PathLockRegistry};
use crate::path::FsPath;

/// Mode of the lazily created orphan directory.
const ORPHAN_DIR_MODE: u32 = 0o700;

/// Path-locking adapter over a backing store.
///
/// All methods take `&self`; share the adapter between worker threads with
/// an [`Arc`].
///
/// ```
/// use oxnio_adapter::{MemoryStore, NioAdapter};
///
/// let adapter = NioAdapter::new(MemoryStore::new());
/// let fh = adapter.create("/notes.txt", 0o644)?;
/// adapter.write(fh, b"hello", 0)?;
///
/// let mut buf = [0u8; 16];
/// let n = adapter.read(fh, &mut buf, 0)?;
/// assert_eq!(&buf[..n], b"hello");
/// adapter.release(fh)?;
/// # Ok::<(), oxnio_adapter::AdapterError>(())
/// ```
pub struct NioAdapter<B: BackingStore> {
    store: B,
    config: AdapterConfig,
    locks: PathLockRegistry,
    handles: OpenHandleRegistry<B::Resource>,
    metrics: Arc<LockMetrics>,
    orphan_root: FsPath,
    orphan_seq: AtomicU64,
    /// Orphans whose deletion the store refused as busy.
    pending_orphans: Mutex<Vec<FsPath>>,
}

impl<B: BackingStore> NioAdapter<B> {
    /// Create an adapter with the default configuration.
    pub fn new(store: B) -> Self {
        Self::with_config(store, AdapterConfig::default())
    }

    /// Create an adapter with a custom configuration.
    pub fn with_config(store: B, config: AdapterConfig) -> Self {
        let orphan_root = match FsPath::root().join(&config.orphan_dir) {
            Ok(path) if path.parent().is_some_and(|p| p.is_root()) => path,
            _ => {
                warn!(orphan_dir = %config.orphan_dir, "unusable orphan directory name, using default");
                FsPath::root()
                    .join(DEFAULT_ORPHAN_DIR)
                    .unwrap_or_else(|_| FsPath::root())
            }
        };
        let metrics = Arc::new(LockMetrics::new());
        debug!(
            read_only = config.read_only,
            lock_timeout = ?config.lock_timeout,
            orphan_root = %orphan_root,
            unlink_while_open = store.supports_unlink_while_open(),
            "adapter created"
        );
        Self {
            locks: PathLockRegistry::with_metrics(Arc::clone(&metrics), config.cancel_poll_interval),
            handles: OpenHandleRegistry::new(Arc::clone(&metrics)),
            store,
            config,
            metrics,
            orphan_root,
            orphan_seq: AtomicU64::new(1),
            pending_orphans: Mutex::new(Vec::new()),
        }
    }

    /// The backing store.
    pub fn store(&self) -> &B {
        &self.store
    }

    /// The active configuration.
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// The path lock registry shared by every operation.
    pub fn locks(&self) -> &PathLockRegistry {
        &self.locks
    }

    /// Lock and handle metrics.
    pub fn metrics(&self) -> &LockMetrics {
        &self.metrics
    }

    /// Number of open handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Whether `path` or anything beneath it is currently locked or awaited.
    pub fn is_locked(&self, path: &str) -> bool {
        FsPath::parse(path).is_ok_and(|path| self.locks.is_locked(&path))
    }

    // ---------------------------------------------------------------------
    // File operations
    // ---------------------------------------------------------------------

    /// Create a new file and open it read-write.
    ///
    /// Fails with `EEXIST` if the name is taken.
    pub fn create(&self, path: &str, mode: u32) -> AdapterResult<HandleId> {
        self.check_writable()?;
        let path = self.resolve(path)?;
        trace!(path = %path, mode, "create");
        if path.is_root() {
            return Err(errno(libc::EEXIST));
        }

        let _lock = self.write_lock(&path)?;
        let resource = self.store.create(&path, mode)?;
        let resource_id = resource.resource_id()?;
        Ok(self.handles.open(resource, resource_id, path, true))
    }

    /// Open an existing file read-write (read-only on a read-only adapter).
    pub fn open(&self, path: &str) -> AdapterResult<HandleId> {
        let flags = if self.config.read_only {
            OpenFlags::READ
        } else {
            OpenFlags::READ_WRITE
        };
        self.open_with_flags(path, flags)
    }

    /// Open an existing file with explicit access flags.
    pub fn open_with_flags(&self, path: &str, flags: OpenFlags) -> AdapterResult<HandleId> {
        if flags.write {
            self.check_writable()?;
        }
        let path = self.resolve(path)?;
        trace!(path = %path, ?flags, "open");

        let _lock = self.read_lock(&path)?;
        let resource = self.store.open(&path, flags)?;
        let resource_id = resource.resource_id()?;
        Ok(self.handles.open(resource, resource_id, path, flags.write))
    }

    /// Read into `buf` at `offset`.
    ///
    /// Returns fewer bytes than requested only at end of file.
    pub fn read(&self, fh: HandleId, buf: &mut [u8], offset: u64) -> AdapterResult<usize> {
        let entry = self.handles.lookup(fh)?;
        let path = entry.path();
        trace!(fh, path = %path, offset, size = buf.len(), "read");

        let result = self.locked_io(&path, || read_fully(entry.resource(), buf, offset));
        self.finish_call(entry);
        result
    }

    /// Write all of `data` at `offset`.
    ///
    /// Concurrent writers on one file only take READ locks; ordering of
    /// overlapping writes is the caller's business, as with `pwrite(2)`.
    pub fn write(&self, fh: HandleId, data: &[u8], offset: u64) -> AdapterResult<usize> {
        self.check_writable()?;
        let entry = self.writable_entry(fh)?;
        let path = entry.path();
        trace!(fh, path = %path, offset, size = data.len(), "write");

        let result = self.locked_io(&path, || write_fully(entry.resource(), data, offset));
        self.finish_call(entry);
        result
    }

    /// Set the length of an open file.
    pub fn ftruncate(&self, fh: HandleId, size: u64) -> AdapterResult<()> {
        self.check_writable()?;
        let entry = self.writable_entry(fh)?;
        let path = entry.path();
        trace!(fh, path = %path, size, "ftruncate");

        let result = self.locked_io(&path, || entry.resource().set_len(size));
        self.finish_call(entry);
        result
    }

    /// Push buffered data of an open file to the store.
    pub fn flush(&self, fh: HandleId) -> AdapterResult<()> {
        let entry = self.handles.lookup(fh)?;
        let path = entry.path();
        trace!(fh, path = %path, "flush");

        let result = self.locked_io(&path, || entry.resource().flush());
        self.finish_call(entry);
        result
    }

    /// Make an open file durable.
    pub fn fsync(&self, fh: HandleId, datasync: bool) -> AdapterResult<()> {
        let entry = self.handles.lookup(fh)?;
        let path = entry.path();
        trace!(fh, path = %path, datasync, "fsync");

        let result = self.locked_io(&path, || entry.resource().sync(datasync));
        self.finish_call(entry);
        result
    }

    /// Close a handle.
    ///
    /// Releasing an unknown or already released handle succeeds, so a
    /// duplicate release from the kernel is harmless. If this was the last
    /// handle of an orphaned file, the orphan is deleted.
    pub fn release(&self, fh: HandleId) -> AdapterResult<()> {
        trace!(fh, "release");
        match self.handles.close(fh) {
            Ok(closed) => {
                self.finish_close(closed);
                Ok(())
            }
            Err(AdapterError::InvalidHandle(_)) => {
                debug!(fh, "release of unknown handle ignored");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Close every open handle and delete pending orphans.
    ///
    /// Returns the number of handles closed.
    pub fn close_all(&self) -> usize {
        let closed = self.handles.drain();
        let count = closed.len();
        for closed in closed {
            self.finish_close(closed);
        }
        self.sweep_orphans();
        if count > 0 {
            debug!(count, "closed all handles");
        }
        count
    }

    // ---------------------------------------------------------------------
    // Namespace operations
    // ---------------------------------------------------------------------

    /// Create a directory.
    pub fn mkdir(&self, path: &str, mode: u32) -> AdapterResult<()> {
        self.check_writable()?;
        let path = self.resolve(path)?;
        trace!(path = %path, mode, "mkdir");
        if path.is_root() {
            return Err(errno(libc::EEXIST));
        }

        let _lock = self.write_lock(&path)?;
        Ok(self.store.mkdir(&path, mode)?)
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &str) -> AdapterResult<()> {
        self.check_writable()?;
        let path = self.resolve(path)?;
        trace!(path = %path, "rmdir");
        if path.is_root() {
            return Err(errno(libc::EBUSY));
        }

        let _lock = self.write_lock(&path)?;
        Ok(self.store.rmdir(&path)?)
    }

    /// Remove a file name.
    ///
    /// Open handles stay valid. On stores without unlink-while-open, a file
    /// that is still open is moved to the orphan directory and deleted when
    /// its last handle is released.
    pub fn unlink(&self, path: &str) -> AdapterResult<()> {
        self.check_writable()?;
        let path = self.resolve(path)?;
        trace!(path = %path, "unlink");

        let _lock = self.write_lock(&path)?;
        if self.store.supports_unlink_while_open() {
            return Ok(self.store.unlink(&path)?);
        }

        let attr = self.store.getattr(&path)?;
        if attr.is_dir() {
            return Err(errno(libc::EISDIR));
        }
        if self.handles.is_open(attr.resource_id) {
            return self.orphan(&path, attr.resource_id);
        }
        match self.store.unlink(&path) {
            // Released, but a call that looked up the handle is still running
            Err(e) if is_busy(&e) => self.orphan(&path, attr.resource_id),
            result => Ok(result?),
        }
    }

    /// Rename `old` to `new`, replacing `new` if it exists.
    ///
    /// Both paths are WRITE-locked in one atomic grant, so no observer ever
    /// sees one locked without the other. Handles follow the rename.
    pub fn rename(&self, old: &str, new: &str) -> AdapterResult<()> {
        self.check_writable()?;
        let old = self.resolve(old)?;
        let new = self.resolve(new)?;
        trace!(from = %old, to = %new, "rename");

        if old == new {
            let _lock = self.write_lock(&old)?;
            self.store.getattr(&old)?;
            return Ok(());
        }
        if old.is_ancestor_of(&new) {
            return Err(AdapterError::InvalidRename {
                from: old.to_string(),
                to: new.to_string(),
            });
        }
        if old.is_root() || new.is_root() {
            return Err(errno(libc::EBUSY));
        }

        let _lock = self.write_both(&old, &new)?;
        let source = self.store.getattr(&old)?;
        if !source.is_dir() && !self.store.supports_unlink_while_open() {
            match self.store.getattr(&new) {
                Ok(dest)
                    if !dest.is_dir()
                        && dest.resource_id != source.resource_id
                        && self.handles.is_open(dest.resource_id) =>
                {
                    self.orphan(&new, dest.resource_id)?;
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        match self.store.rename(&old, &new) {
            Err(e) if is_busy(&e) && !source.is_dir() && !self.store.supports_unlink_while_open() => {
                let dest = self.store.getattr(&new)?;
                if dest.is_dir() {
                    return Err(e.into());
                }
                self.orphan(&new, dest.resource_id)?;
                self.store.rename(&old, &new)?;
            }
            result => result?,
        }
        self.handles.rename_hints(&old, &new);
        Ok(())
    }

    /// Entry attributes.
    pub fn getattr(&self, path: &str) -> AdapterResult<EntryAttr> {
        let path = self.resolve(path)?;
        trace!(path = %path, "getattr");

        let _lock = self.read_lock(&path)?;
        Ok(self.store.getattr(&path)?)
    }

    /// List a directory, sorted by name. The orphan directory is hidden.
    pub fn readdir(&self, path: &str) -> AdapterResult<Vec<DirEntry>> {
        let path = self.resolve(path)?;
        trace!(path = %path, "readdir");

        let _lock = self.read_lock(&path)?;
        let mut entries = self.store.read_dir(&path)?;
        if path.is_root()
            && let Some(hidden) = self.orphan_root.file_name()
        {
            entries.retain(|e| e.name != hidden);
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Set a file's length by path.
    pub fn truncate(&self, path: &str, size: u64) -> AdapterResult<()> {
        self.check_writable()?;
        let path = self.resolve(path)?;
        trace!(path = %path, size, "truncate");

        let _lock = self.read_lock(&path)?;
        Ok(self.store.truncate(&path, size)?)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    /// Normalize a caller path. The orphan area does not exist for callers.
    fn resolve(&self, raw: &str) -> AdapterResult<FsPath> {
        let path = FsPath::parse(raw)?;
        if path.starts_with(&self.orphan_root) {
            return Err(AdapterError::NotFound(path.to_string()));
        }
        Ok(path)
    }

    fn check_writable(&self) -> AdapterResult<()> {
        if self.config.read_only {
            return Err(AdapterError::ReadOnly);
        }
        Ok(())
    }

    fn writable_entry(&self, fh: HandleId) -> AdapterResult<Arc<HandleEntry<B::Resource>>> {
        let entry = self.handles.lookup(fh)?;
        if !entry.is_writable() {
            return Err(errno(libc::EBADF));
        }
        Ok(entry)
    }

    fn cancellation(&self) -> Option<Cancellation> {
        self.config.lock_timeout.map(Cancellation::after)
    }

    fn read_lock(&self, path: &FsPath) -> AdapterResult<PathLock> {
        match self.cancellation() {
            Some(cancel) => Ok(self.locks.lock_for_reading_cancellable(path, &cancel)?),
            None => Ok(self.locks.lock_for_reading(path)),
        }
    }

    fn write_lock(&self, path: &FsPath) -> AdapterResult<PathLock> {
        match self.cancellation() {
            Some(cancel) => Ok(self.locks.lock_for_writing_cancellable(path, &cancel)?),
            None => Ok(self.locks.lock_for_writing(path)),
        }
    }

    /// Run handle I/O under a READ lock on `path`. The guard is gone on return.
    fn locked_io<T>(&self, path: &FsPath, op: impl FnOnce() -> io::Result<T>) -> AdapterResult<T> {
        let _lock = self.read_lock(path)?;
        Ok(op()?)
    }

    fn write_both(&self, first: &FsPath, second: &FsPath) -> AdapterResult<PathLock> {
        match self.cancellation() {
            Some(cancel) => Ok(self
                .locks
                .lock_both_for_writing_cancellable(first, second, &cancel)?),
            None => Ok(self.locks.lock_both_for_writing(first, second)),
        }
    }

    /// Move an open file's name into the orphan directory and defer its
    /// deletion to the last release. The caller holds WRITE on `path`.
    ///
    /// Orphan names are unique and unreachable through [`resolve`](Self::resolve),
    /// so moving into them needs no lock of its own.
    fn orphan(&self, path: &FsPath, resource_id: ResourceId) -> AdapterResult<()> {
        match self.store.mkdir(&self.orphan_root, ORPHAN_DIR_MODE) {
            Ok(()) => debug!(dir = %self.orphan_root, "created orphan directory"),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        let seq = self.orphan_seq.fetch_add(1, Ordering::Relaxed);
        let target = self.orphan_root.join(&format!("{resource_id}-{seq}"))?;
        self.store.rename(path, &target)?;
        self.handles.rename_hints(path, &target);

        if self.handles.defer_removal(resource_id, target.clone()) {
            debug!(path = %path, orphan = %target, resource_id, "open file orphaned");
        } else {
            // No handle is registered any more; only in-flight calls hold it.
            debug!(path = %path, orphan = %target, resource_id, "released file orphaned");
            self.pending_orphans.lock().push(target);
            self.sweep_orphans();
        }
        Ok(())
    }

    fn finish_close(&self, closed: Closed<B::Resource>) {
        let Closed { entry, orphan } = closed;
        let fh = entry.id();
        if let Err(e) = entry.resource().flush() {
            warn!(fh, path = %entry.path(), error = %e, "flush on release failed");
        }
        drop(entry);

        if let Some(orphan) = orphan {
            self.pending_orphans.lock().push(orphan);
            self.sweep_orphans();
        }
    }

    /// Drop a handle reference taken for a single call, then retry orphan
    /// deletions that the reference may have been blocking.
    fn finish_call(&self, entry: Arc<HandleEntry<B::Resource>>) {
        drop(entry);
        self.sweep_orphans();
    }

    /// Delete pending orphans. Names the store still reports busy stay
    /// pending for the next sweep.
    ///
    /// Orphan names are unreachable through [`resolve`](Self::resolve), so
    /// no path lock is taken.
    fn sweep_orphans(&self) {
        let mut pending = self.pending_orphans.lock();
        if pending.is_empty() {
            return;
        }
        pending.retain(|orphan| match self.store.unlink(orphan) {
            Ok(()) => {
                debug!(orphan = %orphan, "deleted orphan");
                false
            }
            Err(e) if is_busy(&e) => {
                trace!(orphan = %orphan, "orphan still in use");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(orphan = %orphan, error = %e, "failed to delete orphan");
                false
            }
        });
    }
}

impl<B: BackingStore> fmt::Debug for NioAdapter<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NioAdapter")
            .field("config", &self.config)
            .field("orphan_root", &self.orphan_root)
            .field("open_handles", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl<B: BackingStore> Drop for NioAdapter<B> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            debug!(open = self.handles.len(), "adapter dropped with open handles");
        }
        self.close_all();
    }
}

fn errno(code: i32) -> AdapterError {
    AdapterError::Io(io::Error::from_raw_os_error(code))
}

fn is_busy(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EBUSY) || e.kind() == io::ErrorKind::ResourceBusy
}
