//! Path-locking core for FUSE filesystem adapters.
//!
//! A FUSE binding delivers calls on many threads at once. This crate sits
//! between that binding and a backing store and makes sure concurrent calls
//! on related paths do not interleave badly: a mutation of `/a/b` never runs
//! while `/a` is being renamed, and open handles keep working after their
//! file is renamed or deleted.
//!
//! # Components
//!
//! ## Path locks
//!
//! - [`PathLockRegistry`] - Hierarchical READ/WRITE locks keyed by path
//! - [`PathLock`] - Scoped guard released exactly once, on drop
//! - [`Cancellation`] - Cooperative cancellation and deadlines for lock waits
//!
//! Locking a path also READ-locks every ancestor, root first. Rename locks
//! both paths in a single atomic grant, so two renames in opposite
//! directions cannot deadlock.
//!
//! ## Handles
//!
//! - [`HandleTable`] - Thread-safe id-to-value map with generated ids
//! - [`OpenHandleRegistry`] - Open resources, per-file open counts, deferred
//!   deletion of unlinked-but-open files
//!
//! ## Dispatch
//!
//! - [`NioAdapter`] - Resolves paths, takes locks, calls the store
//! - [`BackingStore`] / [`OpenResource`] - What a store has to provide
//! - [`LocalStore`] and [`MemoryStore`] - Bundled stores
//!
//! ## Errors
//!
//! [`AdapterError`] carries adapter conditions and passes store I/O errors
//! through; [`ToErrno`] maps both to the errno a FUSE reply needs.
//!
//! # Example
//!
//! ```
//! use oxnio_adapter::{AdapterConfig, MemoryStore, NioAdapter, ToErrno};
//! use std::time::Duration;
//!
//! let config = AdapterConfig::default().lock_timeout(Duration::from_secs(5));
//! let adapter = NioAdapter::with_config(MemoryStore::new(), config);
//!
//! adapter.mkdir("/docs", 0o755)?;
//! let fh = adapter.create("/docs/a.txt", 0o644)?;
//! adapter.rename("/docs/a.txt", "/docs/b.txt")?;
//!
//! // The handle follows the rename
//! adapter.write(fh, b"data", 0)?;
//! adapter.release(fh)?;
//!
//! let err = adapter.getattr("/docs/a.txt").unwrap_err();
//! assert_eq!(err.to_errno(), libc::ENOENT);
//! # Ok::<(), oxnio_adapter::AdapterError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod adapter;
pub mod backend;
mod config;
mod error;
mod handle_table;
mod handles;
mod lock_metrics;
mod locks;
mod path;

pub use adapter::NioAdapter;
#[cfg(unix)]
pub use backend::{LocalFile, LocalStore};
pub use backend::{
    BackingStore, DirEntry, EntryAttr, EntryKind, MemoryFile, MemoryStore, OpenFlags, OpenResource,
};
pub use config::{AdapterConfig, DEFAULT_CANCEL_POLL_INTERVAL, DEFAULT_ORPHAN_DIR};
pub use error::{AdapterError, AdapterResult, ToErrno, io_error_to_errno};
pub use handle_table::{HandleId, HandleTable};
pub use handles::{Closed, HandleEntry, OpenHandleRegistry, ResourceId};
pub use lock_metrics::{LockMetrics, LockMetricsSnapshot};
pub use locks::{Cancellation, Cancelled, LockMode, LockNodeState, PathLock, PathLockRegistry};
pub use path::FsPath;
