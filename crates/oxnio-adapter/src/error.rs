//! Error handling and errno mapping for adapter operations.
//!
//! Backing-store failures are carried through unchanged as [`AdapterError::Io`];
//! everything else is an adapter-level condition. [`ToErrno`] turns any of
//! them into the negative-errno-style code a FUSE binding replies with.

use std::io;
use thiserror::Error;

use crate::locks::Cancelled;

/// Errors returned by [`NioAdapter`](crate::NioAdapter) operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The target path does not exist (or is hidden from callers).
    #[error("Path not found: {0}")]
    NotFound(String),

    /// Lookup against a closed or never-issued handle.
    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    /// A lock wait was cancelled before anything was applied.
    #[error("Operation cancelled while waiting for a path lock")]
    Cancelled,

    /// Mutating call on a read-only adapter.
    #[error("Adapter is read-only")]
    ReadOnly,

    /// The path could not be normalized.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Rename that would move a directory into its own subtree.
    #[error("Cannot rename {from} to {to}: target is inside the source")]
    InvalidRename {
        /// Source path.
        from: String,
        /// Destination path.
        to: String,
    },

    /// Backing store I/O error, passed through unchanged.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl AdapterError {
    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            AdapterError::NotFound(_) => libc::ENOENT,
            AdapterError::InvalidHandle(_) => libc::EBADF,
            AdapterError::Cancelled => libc::EINTR,
            AdapterError::ReadOnly => libc::EROFS,
            AdapterError::InvalidPath(_) | AdapterError::InvalidRename { .. } => libc::EINVAL,
            AdapterError::Io(e) => io_error_to_errno(e),
        }
    }

    /// Returns true if this is a not-found condition, from either layer.
    pub fn is_not_found(&self) -> bool {
        match self {
            AdapterError::NotFound(_) => true,
            AdapterError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<Cancelled> for AdapterError {
    fn from(_: Cancelled) -> Self {
        AdapterError::Cancelled
    }
}

/// Result type for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Maps an I/O error to an errno.
///
/// Prefers the raw OS error; errors synthesized by in-process stores fall
/// back to their [`io::ErrorKind`], and anything else becomes `EIO`.
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    if let Some(code) = e.raw_os_error() {
        return code;
    }
    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::NotADirectory => libc::ENOTDIR,
        io::ErrorKind::IsADirectory => libc::EISDIR,
        io::ErrorKind::DirectoryNotEmpty => libc::ENOTEMPTY,
        io::ErrorKind::ResourceBusy => libc::EBUSY,
        io::ErrorKind::ReadOnlyFilesystem => libc::EROFS,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        _ => libc::EIO,
    }
}

/// Extension trait to convert errors to errno.
pub trait ToErrno {
    /// Converts this error to a libc error code.
    fn to_errno(&self) -> i32;
}

impl ToErrno for AdapterError {
    fn to_errno(&self) -> i32 {
        AdapterError::to_errno(self)
    }
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> i32 {
        io_error_to_errno(self)
    }
}
