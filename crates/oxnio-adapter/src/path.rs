//! Normalized absolute paths.
//!
//! Every path that crosses the adapter boundary is normalized into an
//! [`FsPath`] first: leading slash, no empty segments, no `.` segments and
//! `..` resolved (clamped at the root). Lock nodes are keyed by `FsPath`, so
//! two spellings of the same name always contend on the same node.
//!
//! # Ordering
//!
//! `FsPath` orders lexicographically by segment sequence, not by raw string.
//! An ancestor therefore always sorts before its descendants (`/a` <
//! `/a/b` < `/a-b`), which is the order the lock registry acquires claims in.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{AdapterError, AdapterResult};

/// A normalized, absolute, slash-delimited path.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FsPath {
    inner: String,
}

impl FsPath {
    /// The root path `/`.
    pub fn root() -> Self {
        Self {
            inner: "/".to_string(),
        }
    }

    /// Normalize `raw` into an absolute path.
    ///
    /// Relative input is interpreted from the root, so `foo/bar` and
    /// `/foo//bar/` both become `/foo/bar`. Fails on embedded NUL bytes.
    pub fn parse(raw: &str) -> AdapterResult<Self> {
        if raw.contains('\0') {
            return Err(AdapterError::InvalidPath(raw.replace('\0', "\\0")));
        }

        let mut segments: Vec<&str> = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                name => segments.push(name),
            }
        }

        if segments.is_empty() {
            return Ok(Self::root());
        }

        let mut inner = String::with_capacity(raw.len() + 1);
        for segment in segments {
            inner.push('/');
            inner.push_str(segment);
        }
        Ok(Self { inner })
    }

    /// Returns true for `/`.
    pub fn is_root(&self) -> bool {
        self.inner == "/"
    }

    /// The normalized string form, always starting with `/`.
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// The path without its leading slash (empty for the root).
    ///
    /// Suitable for joining onto a host directory.
    pub fn relative(&self) -> &str {
        &self.inner[1..]
    }

    /// Iterate over the path's segments (none for the root).
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.inner.split('/').filter(|s| !s.is_empty())
    }

    /// The final segment, or `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            self.inner.rsplit('/').next()
        }
    }

    /// The parent directory, or `None` for the root.
    pub fn parent(&self) -> Option<FsPath> {
        if self.is_root() {
            return None;
        }
        match self.inner.rfind('/') {
            Some(0) | None => Some(Self::root()),
            Some(idx) => Some(Self {
                inner: self.inner[..idx].to_string(),
            }),
        }
    }

    /// Append one or more segments.
    pub fn join(&self, name: &str) -> AdapterResult<FsPath> {
        Self::parse(&format!("{}/{}", self.inner, name))
    }

    /// All strict ancestors, root first.
    ///
    /// `/a/b/c` yields `/`, `/a`, `/a/b`. The root has no ancestors.
    pub fn ancestors(&self) -> Vec<FsPath> {
        let mut ancestors = Vec::new();
        let mut current = self.parent();
        while let Some(path) = current {
            current = path.parent();
            ancestors.push(path);
        }
        ancestors.reverse();
        ancestors
    }

    /// Returns true if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &FsPath) -> bool {
        if self.inner.len() >= other.inner.len() {
            return false;
        }
        if self.is_root() {
            return true;
        }
        other.inner.starts_with(&self.inner) && other.inner.as_bytes()[self.inner.len()] == b'/'
    }

    /// Returns true if `self` equals `base` or lies beneath it.
    pub fn starts_with(&self, base: &FsPath) -> bool {
        self == base || base.is_ancestor_of(self)
    }

    /// Replace the `from` prefix of this path with `to`.
    ///
    /// Returns `None` when `self` is not `from` or one of its descendants.
    pub fn rebase(&self, from: &FsPath, to: &FsPath) -> Option<FsPath> {
        if self == from {
            return Some(to.clone());
        }
        if !from.is_ancestor_of(self) {
            return None;
        }
        let suffix = if from.is_root() {
            &self.inner[1..]
        } else {
            &self.inner[from.inner.len() + 1..]
        };
        let mut inner = to.inner.clone();
        if !to.is_root() {
            inner.push('/');
        }
        inner.push_str(suffix);
        Some(Self { inner })
    }
}

impl Ord for FsPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments().cmp(other.segments())
    }
}

impl PartialOrd for FsPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner)
    }
}

impl fmt::Debug for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.inner)
    }
}

impl FromStr for FsPath {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for FsPath {
    type Error = AdapterError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl AsRef<str> for FsPath {
    fn as_ref(&self) -> &str {
        &self.inner
    }
}


/// Property-based tests using proptest.
#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    fn segment() -> impl Strategy<Value = String> {
        "[a-z.\\-]{1,4}"
    }

    proptest! {
        /// Normalizing an already-normalized path is the identity.
        #[test]
        fn parse_is_idempotent(raw in "[a-z/.]{0,24}") {
            let once = FsPath::parse(&raw).unwrap();
            let twice = FsPath::parse(once.as_str()).unwrap();
            prop_assert_eq!(once, twice);
        }

        /// Every ancestor orders strictly before its descendant.
        #[test]
        fn ancestors_order_first(segs in prop::collection::vec(segment(), 1..6)) {
            let path = FsPath::parse(&segs.join("/")).unwrap();
            for ancestor in path.ancestors() {
                prop_assert!(ancestor < path);
                prop_assert!(ancestor.is_ancestor_of(&path));
            }
        }

        /// The order is consistent with equality.
        #[test]
        fn order_matches_equality(a in "[a-c/]{0,8}", b in "[a-c/]{0,8}") {
            let a = FsPath::parse(&a).unwrap();
            let b = FsPath::parse(&b).unwrap();
            prop_assert_eq!(a.cmp(&b) == Ordering::Equal, a == b);
        }
    }
}
