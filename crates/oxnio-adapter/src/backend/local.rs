//! Passthrough store over a host directory.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::{BackingStore, DirEntry, EntryAttr, EntryKind, OpenFlags, OpenResource};
use crate::handles::ResourceId;
use crate::path::FsPath;

/// Exposes a host directory through the adapter.
///
/// Resource identity is the inode number. Unix keeps unlinked files readable
/// through open descriptors, so no orphan emulation is needed.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Serve the directory at `root`.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        if !fs::metadata(&root)?.is_dir() {
            return Err(io::Error::from(io::ErrorKind::NotADirectory));
        }
        Ok(Self { root })
    }

    /// The host directory being served.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, path: &FsPath) -> PathBuf {
        self.root.join(path.relative())
    }
}

/// An open host file.
#[derive(Debug)]
pub struct LocalFile {
    file: File,
}

impl OpenResource for LocalFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        self.file.write_at(data, offset)
    }

    fn set_len(&self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    fn sync(&self, datasync: bool) -> io::Result<()> {
        if datasync {
            self.file.sync_data()
        } else {
            self.file.sync_all()
        }
    }

    fn resource_id(&self) -> io::Result<ResourceId> {
        Ok(self.file.metadata()?.ino())
    }
}

impl BackingStore for LocalStore {
    type Resource = LocalFile;

    fn create(&self, path: &FsPath, mode: u32) -> io::Result<LocalFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(self.host_path(path))?;
        Ok(LocalFile { file })
    }

    fn open(&self, path: &FsPath, flags: OpenFlags) -> io::Result<LocalFile> {
        let host = self.host_path(path);
        if fs::metadata(&host)?.is_dir() {
            return Err(io::Error::from_raw_os_error(libc::EISDIR));
        }
        let file = OpenOptions::new()
            .read(flags.read || !flags.write)
            .write(flags.write)
            .truncate(flags.truncate && flags.write)
            .open(host)?;
        Ok(LocalFile { file })
    }

    fn mkdir(&self, path: &FsPath, mode: u32) -> io::Result<()> {
        DirBuilder::new().mode(mode).create(self.host_path(path))
    }

    fn rmdir(&self, path: &FsPath) -> io::Result<()> {
        fs::remove_dir(self.host_path(path))
    }

    fn unlink(&self, path: &FsPath) -> io::Result<()> {
        fs::remove_file(self.host_path(path))
    }

    fn rename(&self, from: &FsPath, to: &FsPath) -> io::Result<()> {
        fs::rename(self.host_path(from), self.host_path(to))
    }

    fn getattr(&self, path: &FsPath) -> io::Result<EntryAttr> {
        let meta = fs::symlink_metadata(self.host_path(path))?;
        let kind = if meta.is_dir() {
            EntryKind::Directory
        } else if meta.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };
        Ok(EntryAttr {
            kind,
            size: meta.len(),
            resource_id: meta.ino(),
            mode: meta.mode() & 0o7777,
            modified: meta.modified().ok(),
        })
    }

    fn read_dir(&self, path: &FsPath) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.host_path(path))? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                warn!(dir = %path, name = ?entry.file_name(), "skipping non-UTF-8 entry");
                continue;
            };
            let file_type = entry.file_type()?;
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                EntryKind::Other
            };
            entries.push(DirEntry { name, kind });
        }
        Ok(entries)
    }

    fn truncate(&self, path: &FsPath, size: u64) -> io::Result<()> {
        OpenOptions::new()
            .write(true)
            .open(self.host_path(path))?
            .set_len(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn p(s: &str) -> FsPath {
        FsPath::parse(s).unwrap()
    }

    fn store() -> (TempDir, LocalStore) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_rejects_non_directory_root() {
        let (dir, _) = store();
        let file = dir.path().join("plain");
        fs::write(&file, b"x").unwrap();
        assert!(LocalStore::new(&file).is_err());
    }

    #[test]
    fn test_create_is_exclusive() {
        let (_dir, store) = store();
        store.create(&p("/a"), 0o644).unwrap();
        let err = store.create(&p("/a"), 0o644).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_resource_id_matches_getattr() {
        let (_dir, store) = store();
        let file = store.create(&p("/a"), 0o644).unwrap();
        assert_eq!(file.resource_id().unwrap(), store.getattr(&p("/a")).unwrap().resource_id);
    }

    #[test]
    fn test_unlinked_file_stays_readable() {
        let (_dir, store) = store();
        let file = store.create(&p("/a"), 0o644).unwrap();
        file.write_at(b"kept", 0).unwrap();
        store.unlink(&p("/a")).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 4);
        assert_eq!(&buf, b"kept");
    }

    #[test]
    fn test_open_directory_fails() {
        let (_dir, store) = store();
        store.mkdir(&p("/d"), 0o755).unwrap();
        let err = store.open(&p("/d"), OpenFlags::READ).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EISDIR));
    }

    #[test]
    fn test_read_dir_and_truncate() {
        let (_dir, store) = store();
        store.mkdir(&p("/d"), 0o755).unwrap();
        let f = store.create(&p("/d/f"), 0o644).unwrap();
        f.write_at(b"123456", 0).unwrap();
        store.truncate(&p("/d/f"), 2).unwrap();

        let entries = store.read_dir(&p("/d")).unwrap();
        assert_eq!(entries, vec![DirEntry { name: "f".to_string(), kind: EntryKind::File }]);
        assert_eq!(store.getattr(&p("/d/f")).unwrap().size, 2);
    }
}
