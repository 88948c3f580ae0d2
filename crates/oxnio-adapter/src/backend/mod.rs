//! Backing store abstraction.
//!
//! The adapter never performs I/O itself. It drives a [`BackingStore`] for
//! namespace operations and an [`OpenResource`] for byte-range access to
//! an opened file. Errors are plain [`io::Error`]s and are passed through to
//! the caller unchanged.
//!
//! Two stores ship with the crate:
//!
//! - [`LocalStore`] (unix) - passthrough to a host directory
//! - [`MemoryStore`] - in-memory tree, optionally without unlink-while-open

use std::io;
use std::time::SystemTime;

use crate::handles::ResourceId;
use crate::path::FsPath;

#[cfg(unix)]
mod local;
mod memory;

#[cfg(unix)]
pub use local::{LocalFile, LocalStore};
pub use memory::{MemoryFile, MemoryStore};

/// The kind of a namespace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// Anything else the store exposes (symlinks, devices, ...).
    Other,
}

/// Attributes of a namespace entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryAttr {
    /// Entry kind.
    pub kind: EntryKind,
    /// Size in bytes (0 for directories on stores that do not report one).
    pub size: u64,
    /// Identity of the underlying file, matching [`OpenResource::resource_id`].
    pub resource_id: ResourceId,
    /// Permission bits.
    pub mode: u32,
    /// Last modification time, if known.
    pub modified: Option<SystemTime>,
}

impl EntryAttr {
    /// Returns true for directories.
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name (a single path segment).
    pub name: String,
    /// Entry kind.
    pub kind: EntryKind,
}

/// Access requested when opening a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    /// Open for reading.
    pub read: bool,
    /// Open for writing.
    pub write: bool,
    /// Truncate to zero length on open (requires `write`).
    pub truncate: bool,
}

impl OpenFlags {
    /// Read-only access.
    pub const READ: Self = Self {
        read: true,
        write: false,
        truncate: false,
    };

    /// Write-only access.
    pub const WRITE: Self = Self {
        read: false,
        write: true,
        truncate: false,
    };

    /// Read and write access.
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
        truncate: false,
    };

    /// Also truncate on open.
    #[must_use]
    pub fn truncate(mut self) -> Self {
        self.truncate = true;
        self
    }

    /// Decode the access mode and `O_TRUNC` from `open(2)` flags.
    pub fn from_libc(flags: i32) -> Self {
        let mut decoded = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => Self::WRITE,
            libc::O_RDWR => Self::READ_WRITE,
            _ => Self::READ,
        };
        decoded.truncate = decoded.write && flags & libc::O_TRUNC != 0;
        decoded
    }
}

/// An opened file inside the backing store.
///
/// Methods take `&self` so concurrent reads and writes on one handle do not
/// serialize in the adapter; positional I/O keeps them independent.
pub trait OpenResource: Send + Sync + 'static {
    /// Read up to `buf.len()` bytes at `offset`. Returns 0 at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write `data` at `offset`, returning the bytes written.
    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize>;

    /// Set the file length.
    fn set_len(&self, size: u64) -> io::Result<()>;

    /// Push buffered data to the store.
    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Make data (and metadata unless `datasync`) durable.
    fn sync(&self, datasync: bool) -> io::Result<()> {
        let _ = datasync;
        Ok(())
    }

    /// Identity of the underlying file.
    fn resource_id(&self) -> io::Result<ResourceId>;
}

/// A path-addressed file store.
pub trait BackingStore: Send + Sync + 'static {
    /// The store's open-file type.
    type Resource: OpenResource;

    /// Create a new file and open it read-write. Fails if the name exists.
    fn create(&self, path: &FsPath, mode: u32) -> io::Result<Self::Resource>;

    /// Open an existing file.
    fn open(&self, path: &FsPath, flags: OpenFlags) -> io::Result<Self::Resource>;

    /// Create a directory.
    fn mkdir(&self, path: &FsPath, mode: u32) -> io::Result<()>;

    /// Remove an empty directory.
    fn rmdir(&self, path: &FsPath) -> io::Result<()>;

    /// Remove a file name.
    fn unlink(&self, path: &FsPath) -> io::Result<()>;

    /// Rename, replacing `to` if it exists (POSIX `rename(2)` semantics).
    fn rename(&self, from: &FsPath, to: &FsPath) -> io::Result<()>;

    /// Entry attributes.
    fn getattr(&self, path: &FsPath) -> io::Result<EntryAttr>;

    /// List a directory.
    fn read_dir(&self, path: &FsPath) -> io::Result<Vec<DirEntry>>;

    /// Set a file's length by path.
    fn truncate(&self, path: &FsPath, size: u64) -> io::Result<()>;

    /// Whether an open file stays readable and writable after its last name
    /// is removed. When false the adapter emulates it with orphan names.
    fn supports_unlink_while_open(&self) -> bool {
        true
    }
}

/// Read until `buf` is full or the resource reports end of file.
pub(crate) fn read_fully<R: OpenResource + ?Sized>(
    resource: &R,
    buf: &mut [u8],
    offset: u64,
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match resource.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Write all of `data`, retrying short writes.
pub(crate) fn write_fully<R: OpenResource + ?Sized>(
    resource: &R,
    data: &[u8],
    offset: u64,
) -> io::Result<usize> {
    let mut written = 0;
    while written < data.len() {
        match resource.write_at(&data[written..], offset + written as u64) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}
