//! In-memory store.
//!
//! Entries live in a path-keyed map behind one mutex; file content is shared
//! between the tree and every open [`MemoryFile`], so an unlinked file stays
//! readable through its open resources.
//!
//! [`MemoryStore::without_unlink_while_open`] models platforms that refuse to
//! remove the name of a file that is still open: unlinking it, or renaming
//! another file over it, fails with `EBUSY`.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use super::{BackingStore, DirEntry, EntryAttr, EntryKind, OpenFlags, OpenResource};
use crate::handles::ResourceId;
use crate::path::FsPath;

type Content = Arc<RwLock<Vec<u8>>>;

#[derive(Debug, Clone)]
enum Node {
    Dir {
        id: ResourceId,
        mode: u32,
        modified: SystemTime,
    },
    File {
        id: ResourceId,
        mode: u32,
        modified: SystemTime,
        content: Content,
    },
}

impl Node {
    fn is_dir(&self) -> bool {
        matches!(self, Node::Dir { .. })
    }

    /// True while some `MemoryFile` still shares this file's content.
    fn is_open(&self) -> bool {
        match self {
            Node::Dir { .. } => false,
            Node::File { content, .. } => Arc::strong_count(content) > 1,
        }
    }
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<FsPath, Node>,
    next_id: ResourceId,
}

impl Tree {
    fn alloc_id(&mut self) -> ResourceId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn get(&self, path: &FsPath) -> io::Result<&Node> {
        self.nodes.get(path).ok_or_else(not_found)
    }

    fn has_children(&self, path: &FsPath) -> bool {
        self.nodes.keys().any(|k| k.parent().as_ref() == Some(path))
    }

    /// The parent must exist and be a directory; the name must be free.
    fn check_new_entry(&self, path: &FsPath) -> io::Result<()> {
        let parent = path.parent().ok_or_else(|| errno(libc::EEXIST))?;
        match self.nodes.get(&parent) {
            None => return Err(not_found()),
            Some(node) if !node.is_dir() => return Err(errno(libc::ENOTDIR)),
            Some(_) => {}
        }
        if self.nodes.contains_key(path) {
            return Err(errno(libc::EEXIST));
        }
        Ok(())
    }
}

/// In-memory [`BackingStore`].
#[derive(Debug)]
pub struct MemoryStore {
    tree: Mutex<Tree>,
    unlink_while_open: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// An empty store with POSIX unlink-while-open semantics.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            FsPath::root(),
            Node::Dir {
                id: 1,
                mode: 0o755,
                modified: SystemTime::now(),
            },
        );
        Self {
            tree: Mutex::new(Tree { nodes, next_id: 2 }),
            unlink_while_open: true,
        }
    }

    /// An empty store that refuses to drop the name of an open file.
    pub fn without_unlink_while_open() -> Self {
        Self {
            unlink_while_open: false,
            ..Self::new()
        }
    }

    /// Number of entries, root included.
    pub fn entry_count(&self) -> usize {
        self.tree.lock().nodes.len()
    }

    /// Whether `path` exists.
    pub fn exists(&self, path: &FsPath) -> bool {
        self.tree.lock().nodes.contains_key(path)
    }

    fn check_removable(&self, node: &Node) -> io::Result<()> {
        if !self.unlink_while_open && node.is_open() {
            return Err(errno(libc::EBUSY));
        }
        Ok(())
    }
}

/// An open in-memory file.
#[derive(Debug)]
pub struct MemoryFile {
    id: ResourceId,
    content: Content,
    writable: bool,
}

impl OpenResource for MemoryFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let content = self.content.read();
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= content.len() {
            return Ok(0);
        }
        let n = buf.len().min(content.len() - start);
        buf[..n].copy_from_slice(&content[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        if !self.writable {
            return Err(errno(libc::EBADF));
        }
        let start = usize::try_from(offset).map_err(|_| errno(libc::EFBIG))?;
        let end = start.checked_add(data.len()).ok_or_else(|| errno(libc::EFBIG))?;
        let mut content = self.content.write();
        if end > content.len() {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn set_len(&self, size: u64) -> io::Result<()> {
        if !self.writable {
            return Err(errno(libc::EBADF));
        }
        let size = usize::try_from(size).map_err(|_| errno(libc::EFBIG))?;
        self.content.write().resize(size, 0);
        Ok(())
    }

    fn resource_id(&self) -> io::Result<ResourceId> {
        Ok(self.id)
    }
}

impl BackingStore for MemoryStore {
    type Resource = MemoryFile;

    fn create(&self, path: &FsPath, mode: u32) -> io::Result<MemoryFile> {
        let mut tree = self.tree.lock();
        tree.check_new_entry(path)?;
        let id = tree.alloc_id();
        let content: Content = Arc::default();
        tree.nodes.insert(
            path.clone(),
            Node::File {
                id,
                mode,
                modified: SystemTime::now(),
                content: Arc::clone(&content),
            },
        );
        Ok(MemoryFile {
            id,
            content,
            writable: true,
        })
    }

    fn open(&self, path: &FsPath, flags: OpenFlags) -> io::Result<MemoryFile> {
        let tree = self.tree.lock();
        match tree.get(path)? {
            Node::Dir { .. } => Err(errno(libc::EISDIR)),
            Node::File { id, content, .. } => {
                if flags.truncate && flags.write {
                    content.write().clear();
                }
                Ok(MemoryFile {
                    id: *id,
                    content: Arc::clone(content),
                    writable: flags.write,
                })
            }
        }
    }

    fn mkdir(&self, path: &FsPath, mode: u32) -> io::Result<()> {
        let mut tree = self.tree.lock();
        tree.check_new_entry(path)?;
        let id = tree.alloc_id();
        tree.nodes.insert(
            path.clone(),
            Node::Dir {
                id,
                mode,
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn rmdir(&self, path: &FsPath) -> io::Result<()> {
        let mut tree = self.tree.lock();
        if path.is_root() {
            return Err(errno(libc::EBUSY));
        }
        if !tree.get(path)?.is_dir() {
            return Err(errno(libc::ENOTDIR));
        }
        if tree.has_children(path) {
            return Err(errno(libc::ENOTEMPTY));
        }
        tree.nodes.remove(path);
        Ok(())
    }

    fn unlink(&self, path: &FsPath) -> io::Result<()> {
        let mut tree = self.tree.lock();
        let node = tree.get(path)?;
        if node.is_dir() {
            return Err(errno(libc::EISDIR));
        }
        self.check_removable(node)?;
        tree.nodes.remove(path);
        Ok(())
    }

    fn rename(&self, from: &FsPath, to: &FsPath) -> io::Result<()> {
        let mut tree = self.tree.lock();
        let source_is_dir = tree.get(from)?.is_dir();
        if from == to {
            return Ok(());
        }
        if from.is_ancestor_of(to) || from.is_root() {
            return Err(errno(libc::EINVAL));
        }
        let parent = to.parent().ok_or_else(|| errno(libc::EBUSY))?;
        match tree.nodes.get(&parent) {
            None => return Err(not_found()),
            Some(node) if !node.is_dir() => return Err(errno(libc::ENOTDIR)),
            Some(_) => {}
        }

        if let Some(existing) = tree.nodes.get(to) {
            match (source_is_dir, existing.is_dir()) {
                (true, false) => return Err(errno(libc::ENOTDIR)),
                (false, true) => return Err(errno(libc::EISDIR)),
                (true, true) if tree.has_children(to) => return Err(errno(libc::ENOTEMPTY)),
                _ => {}
            }
            self.check_removable(existing)?;
            tree.nodes.remove(to);
        }

        let moved: Vec<FsPath> = tree.nodes.keys().filter(|k| k.starts_with(from)).cloned().collect();
        for old in moved {
            if let (Some(node), Some(new)) = (tree.nodes.remove(&old), old.rebase(from, to)) {
                tree.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    fn getattr(&self, path: &FsPath) -> io::Result<EntryAttr> {
        let tree = self.tree.lock();
        Ok(match tree.get(path)? {
            Node::Dir { id, mode, modified } => EntryAttr {
                kind: EntryKind::Directory,
                size: 0,
                resource_id: *id,
                mode: *mode,
                modified: Some(*modified),
            },
            Node::File {
                id,
                mode,
                modified,
                content,
            } => EntryAttr {
                kind: EntryKind::File,
                size: content.read().len() as u64,
                resource_id: *id,
                mode: *mode,
                modified: Some(*modified),
            },
        })
    }

    fn read_dir(&self, path: &FsPath) -> io::Result<Vec<DirEntry>> {
        let tree = self.tree.lock();
        if !tree.get(path)?.is_dir() {
            return Err(errno(libc::ENOTDIR));
        }
        Ok(tree
            .nodes
            .iter()
            .filter(|(k, _)| k.parent().as_ref() == Some(path))
            .filter_map(|(k, node)| {
                k.file_name().map(|name| DirEntry {
                    name: name.to_string(),
                    kind: if node.is_dir() {
                        EntryKind::Directory
                    } else {
                        EntryKind::File
                    },
                })
            })
            .collect())
    }

    fn truncate(&self, path: &FsPath, size: u64) -> io::Result<()> {
        let tree = self.tree.lock();
        match tree.get(path)? {
            Node::Dir { .. } => Err(errno(libc::EISDIR)),
            Node::File { content, .. } => {
                let size = usize::try_from(size).map_err(|_| errno(libc::EFBIG))?;
                content.write().resize(size, 0);
                Ok(())
            }
        }
    }

    fn supports_unlink_while_open(&self) -> bool {
        self.unlink_while_open
    }
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn not_found() -> io::Error {
    errno(libc::ENOENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> FsPath {
        FsPath::parse(s).unwrap()
    }

    #[test]
    fn test_create_requires_parent() {
        let store = MemoryStore::new();
        let err = store.create(&p("/missing/f"), 0o644).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_create_existing_fails() {
        let store = MemoryStore::new();
        store.create(&p("/f"), 0o644).unwrap();
        assert_eq!(store.create(&p("/f"), 0o644).unwrap_err().raw_os_error(), Some(libc::EEXIST));
    }

    #[test]
    fn test_rmdir_requires_empty() {
        let store = MemoryStore::new();
        store.mkdir(&p("/d"), 0o755).unwrap();
        store.create(&p("/d/f"), 0o644).unwrap();
        assert_eq!(store.rmdir(&p("/d")).unwrap_err().raw_os_error(), Some(libc::ENOTEMPTY));
        store.unlink(&p("/d/f")).unwrap();
        store.rmdir(&p("/d")).unwrap();
        assert!(!store.exists(&p("/d")));
    }

    #[test]
    fn test_rename_moves_subtree() {
        let store = MemoryStore::new();
        store.mkdir(&p("/a"), 0o755).unwrap();
        store.mkdir(&p("/a/b"), 0o755).unwrap();
        store.create(&p("/a/b/f"), 0o644).unwrap();

        store.rename(&p("/a"), &p("/z")).unwrap();
        assert!(store.exists(&p("/z/b/f")));
        assert!(!store.exists(&p("/a")));
        assert_eq!(store.entry_count(), 4);
    }

    #[test]
    fn test_rename_into_own_subtree_fails() {
        let store = MemoryStore::new();
        store.mkdir(&p("/a"), 0o755).unwrap();
        assert_eq!(store.rename(&p("/a"), &p("/a/b")).unwrap_err().raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn test_rename_replaces_file_and_keeps_identity() {
        let store = MemoryStore::new();
        let src = store.create(&p("/src"), 0o644).unwrap();
        store.create(&p("/dst"), 0o644).unwrap();
        store.rename(&p("/src"), &p("/dst")).unwrap();
        assert_eq!(store.getattr(&p("/dst")).unwrap().resource_id, src.resource_id().unwrap());
    }

    #[test]
    fn test_unlinked_content_survives_in_posix_mode() {
        let store = MemoryStore::new();
        let file = store.create(&p("/f"), 0o644).unwrap();
        file.write_at(b"data", 0).unwrap();
        store.unlink(&p("/f")).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 4);
        assert_eq!(&buf, b"data");
    }

    #[test]
    fn test_strict_mode_refuses_removing_open_files() {
        let store = MemoryStore::without_unlink_while_open();
        assert!(!store.supports_unlink_while_open());
        let file = store.create(&p("/f"), 0o644).unwrap();
        store.create(&p("/g"), 0o644).unwrap();

        assert_eq!(store.unlink(&p("/f")).unwrap_err().raw_os_error(), Some(libc::EBUSY));
        assert_eq!(store.rename(&p("/g"), &p("/f")).unwrap_err().raw_os_error(), Some(libc::EBUSY));
        // Renaming the open file itself is allowed
        store.rename(&p("/f"), &p("/h")).unwrap();

        drop(file);
        store.unlink(&p("/h")).unwrap();
    }

    #[test]
    fn test_read_only_resource_rejects_writes() {
        let store = MemoryStore::new();
        store.create(&p("/f"), 0o644).unwrap();
        let file = store.open(&p("/f"), OpenFlags::READ).unwrap();
        assert_eq!(file.write_at(b"x", 0).unwrap_err().raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn test_open_with_truncate() {
        let store = MemoryStore::new();
        let file = store.create(&p("/f"), 0o644).unwrap();
        file.write_at(b"abc", 0).unwrap();
        store.open(&p("/f"), OpenFlags::READ_WRITE.truncate()).unwrap();
        assert_eq!(store.getattr(&p("/f")).unwrap().size, 0);
    }
}
