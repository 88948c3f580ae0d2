//! Hierarchical path locks.
//!
//! [`PathLockRegistry`] hands out [`PathLock`] guards for normalized paths in
//! READ or WRITE mode. Locking a path also READ-locks every strict ancestor
//! for the same duration, so a rename or rmdir of `/a` cannot run while an
//! operation on `/a/b/c` is in flight, yet `/a/x` and `/a/y` proceed in
//! parallel.
//!
//! # Granting
//!
//! A request is a set of *claims*, one per path, sorted in [`FsPath`] order
//! (root first). A path claimed both as a target and as an ancestor of the
//! other target (rename `/a/b` -> `/a`) is claimed once, in WRITE mode.
//! The whole set is granted atomically under the table mutex, so a two-path
//! request is never visible with only one of its paths held and never holds
//! one path while blocking on the other.
//!
//! - READ is compatible with READ.
//! - WRITE is compatible with nothing, including the same thread.
//!
//! # Fairness
//!
//! Waiting requests are queued with a ticket. A request is granted only if it
//! is compatible with the current holders *and* no earlier queued request
//! conflicts with it on a shared path. A steady stream of readers therefore
//! cannot starve a queued writer.
//!
//! A thread that already holds a lock skips the queue check and only has to
//! be compatible with the current holders. Otherwise a nested request could
//! wait behind a writer that is itself waiting for this thread to release,
//! and two threads nesting across each other's paths (`/x` then `/y`, `/y`
//! then `/x`) would deadlock on the writers queued between them.
//!
//! # Cancellation
//!
//! The `*_cancellable` variants take a [`Cancellation`]. A cancelled waiter
//! leaves the queue and every node counter exactly as it found them.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::DEFAULT_CANCEL_POLL_INTERVAL;
use crate::lock_metrics::LockMetrics;
use crate::path::FsPath;

/// Lock mode requested for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared access; excludes writers only.
    Read,
    /// Exclusive access.
    Write,
}

/// A lock wait was cancelled before the lock was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("lock wait cancelled")]
pub struct Cancelled;

/// Cooperative cancellation token for lock waits.
///
/// Cloning shares the token. A token created with [`Cancellation::after`]
/// also counts as cancelled once its deadline has passed.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// A token that is cancelled only by calling [`cancel`](Self::cancel).
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that cancels itself once `timeout` has elapsed.
    pub fn after(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                deadline: Instant::now().checked_add(timeout),
            }),
        }
    }

    /// Cancel every wait observing this token.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once cancelled or past the deadline.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
            || self.inner.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Point-in-time view of one lock node, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockNodeState {
    /// Current READ holds (explicit and implicit).
    pub readers: usize,
    /// Whether a WRITE hold is active.
    pub writer: bool,
    /// Queued requests that include this path.
    pub waiting: usize,
}

/// Per-path contention state. Exists only while something holds or waits.
#[derive(Debug, Default)]
struct LockNode {
    readers: usize,
    writer: Option<ThreadId>,
    waiting: usize,
}

impl LockNode {
    fn is_idle(&self) -> bool {
        self.readers == 0 && self.writer.is_none() && self.waiting == 0
    }

    fn admits(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => self.writer.is_none(),
            LockMode::Write => self.writer.is_none() && self.readers == 0,
        }
    }
}

type Claims = Vec<(FsPath, LockMode)>;

#[derive(Debug, Default)]
struct LockTable {
    nodes: HashMap<FsPath, LockNode>,
    queue: BTreeMap<u64, Claims>,
    next_ticket: u64,
    /// Granted locks per thread.
    holders: HashMap<ThreadId, usize>,
}

impl LockTable {
    /// Whether `claims` can be granted now to `thread`.
    ///
    /// `ticket` is the caller's queue position; `None` means not yet queued,
    /// so every queued request counts as earlier.
    fn can_grant(&self, ticket: Option<u64>, claims: &Claims, thread: ThreadId) -> bool {
        let nested = self.holders.contains_key(&thread);
        claims.iter().all(|(path, mode)| {
            if !self.nodes.get(path).is_none_or(|n| n.admits(*mode)) {
                return false;
            }
            if nested {
                return true;
            }
            let earlier = match ticket {
                Some(t) => self.queue.range(..t),
                None => self.queue.range(..),
            };
            !earlier
                .flat_map(|(_, other)| other.iter())
                .any(|(p, m)| p == path && (*m == LockMode::Write || *mode == LockMode::Write))
        })
    }

    fn grant(&mut self, claims: &Claims, thread: ThreadId) {
        for (path, mode) in claims {
            let node = self.nodes.entry(path.clone()).or_default();
            match mode {
                LockMode::Read => node.readers += 1,
                LockMode::Write => node.writer = Some(thread),
            }
        }
        *self.holders.entry(thread).or_insert(0) += 1;
    }

    fn release(&mut self, claims: &Claims, thread: ThreadId) {
        if let Some(count) = self.holders.get_mut(&thread) {
            *count -= 1;
            if *count == 0 {
                self.holders.remove(&thread);
            }
        }
        for (path, mode) in claims {
            let Some(node) = self.nodes.get_mut(path) else {
                warn!(%path, "released a lock that has no node");
                continue;
            };
            match mode {
                LockMode::Read => node.readers = node.readers.saturating_sub(1),
                LockMode::Write => node.writer = None,
            }
            if node.is_idle() {
                self.nodes.remove(path);
            }
        }
    }

    fn enqueue(&mut self, claims: &Claims) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        for (path, _) in claims {
            self.nodes.entry(path.clone()).or_default().waiting += 1;
        }
        self.queue.insert(ticket, claims.clone());
        ticket
    }

    fn dequeue(&mut self, ticket: u64, claims: &Claims) {
        self.queue.remove(&ticket);
        for (path, _) in claims {
            if let Some(node) = self.nodes.get_mut(path) {
                node.waiting -= 1;
                if node.is_idle() {
                    self.nodes.remove(path);
                }
            }
        }
    }
}

#[derive(Debug)]
struct Shared {
    table: Mutex<LockTable>,
    changed: Condvar,
    metrics: Arc<LockMetrics>,
    poll_interval: Duration,
}

/// Process-wide registry of hierarchical path locks.
///
/// Cheap to clone; clones share the same lock table.
///
/// A thread may nest locks. Nested requests are not queued behind waiting
/// writers, but WRITE is never reentrant: a thread that requests WRITE on a
/// path it already holds, or READ on a path it holds for WRITE, blocks
/// forever.
///
/// # Example
///
/// ```
/// use oxnio_adapter::{FsPath, PathLockRegistry};
///
/// let locks = PathLockRegistry::new();
/// let path = FsPath::parse("/foo/bar").unwrap();
///
/// let outer = locks.lock_for_reading(&path);
/// let nested = locks.lock_for_reading(&path);
/// assert!(locks.is_locked(&FsPath::parse("/foo").unwrap()));
///
/// drop(nested);
/// drop(outer);
/// assert!(!locks.is_locked(&path));
/// ```
#[derive(Debug, Clone)]
pub struct PathLockRegistry {
    shared: Arc<Shared>,
}

impl Default for PathLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PathLockRegistry {
    /// Create an empty registry with its own metrics.
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(LockMetrics::new()), DEFAULT_CANCEL_POLL_INTERVAL)
    }

    /// Create a registry that records into `metrics` and polls cancellation
    /// tokens every `poll_interval` while blocked.
    pub fn with_metrics(metrics: Arc<LockMetrics>, poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: Mutex::new(LockTable::default()),
                changed: Condvar::new(),
                metrics,
                poll_interval,
            }),
        }
    }

    /// Block until `path` is READ-locked.
    pub fn lock_for_reading(&self, path: &FsPath) -> PathLock {
        self.acquire(&[(path.clone(), LockMode::Read)], None)
            .expect("uncancellable lock waits never fail")
    }

    /// Block until `path` is WRITE-locked.
    pub fn lock_for_writing(&self, path: &FsPath) -> PathLock {
        self.acquire(&[(path.clone(), LockMode::Write)], None)
            .expect("uncancellable lock waits never fail")
    }

    /// Block until both paths are WRITE-locked together.
    pub fn lock_both_for_writing(&self, first: &FsPath, second: &FsPath) -> PathLock {
        self.acquire(
            &[(first.clone(), LockMode::Write), (second.clone(), LockMode::Write)],
            None,
        )
        .expect("uncancellable lock waits never fail")
    }

    /// READ-lock `path`, giving up if `cancel` fires first.
    pub fn lock_for_reading_cancellable(
        &self,
        path: &FsPath,
        cancel: &Cancellation,
    ) -> Result<PathLock, Cancelled> {
        self.acquire(&[(path.clone(), LockMode::Read)], Some(cancel))
    }

    /// WRITE-lock `path`, giving up if `cancel` fires first.
    pub fn lock_for_writing_cancellable(
        &self,
        path: &FsPath,
        cancel: &Cancellation,
    ) -> Result<PathLock, Cancelled> {
        self.acquire(&[(path.clone(), LockMode::Write)], Some(cancel))
    }

    /// WRITE-lock both paths together, giving up if `cancel` fires first.
    pub fn lock_both_for_writing_cancellable(
        &self,
        first: &FsPath,
        second: &FsPath,
        cancel: &Cancellation,
    ) -> Result<PathLock, Cancelled> {
        self.acquire(
            &[(first.clone(), LockMode::Write), (second.clone(), LockMode::Write)],
            Some(cancel),
        )
    }

    /// Returns true if `path` or any descendant is held or being waited for.
    ///
    /// Every claim includes all ancestors, so a descendant's node implies a
    /// node on `path` itself.
    pub fn is_locked(&self, path: &FsPath) -> bool {
        self.shared.table.lock().nodes.contains_key(path)
    }

    /// Snapshot of the node for `path`, if it exists.
    pub fn node_state(&self, path: &FsPath) -> Option<LockNodeState> {
        self.shared.table.lock().nodes.get(path).map(|n| LockNodeState {
            readers: n.readers,
            writer: n.writer.is_some(),
            waiting: n.waiting,
        })
    }

    /// Number of live lock nodes.
    pub fn live_nodes(&self) -> usize {
        self.shared.table.lock().nodes.len()
    }

    /// Metrics shared with this registry.
    pub fn metrics(&self) -> &Arc<LockMetrics> {
        &self.shared.metrics
    }

    fn acquire(
        &self,
        targets: &[(FsPath, LockMode)],
        cancel: Option<&Cancellation>,
    ) -> Result<PathLock, Cancelled> {
        let claims = claims_for(targets);
        let thread = thread::current().id();

        if cancel.is_some_and(Cancellation::is_cancelled) {
            self.shared.metrics.record_cancelled();
            return Err(Cancelled);
        }

        let mut table = self.shared.table.lock();
        if table.can_grant(None, &claims, thread) {
            table.grant(&claims, thread);
            drop(table);
            self.record_grant(targets);
            return Ok(self.guard(targets, claims, thread));
        }

        let ticket = table.enqueue(&claims);
        let started = Instant::now();
        trace!(ticket, ?targets, "waiting for path lock");

        loop {
            match cancel {
                Some(token) => {
                    if token.is_cancelled() {
                        table.dequeue(ticket, &claims);
                        drop(table);
                        self.shared.changed.notify_all();
                        self.shared.metrics.record_cancelled();
                        debug!(ticket, ?targets, waited = ?started.elapsed(), "path lock wait cancelled");
                        return Err(Cancelled);
                    }
                    let timeout = token
                        .remaining()
                        .map_or(self.shared.poll_interval, |r| r.min(self.shared.poll_interval));
                    self.shared.changed.wait_for(&mut table, timeout);
                }
                None => self.shared.changed.wait(&mut table),
            }

            if table.can_grant(Some(ticket), &claims, thread) {
                table.dequeue(ticket, &claims);
                table.grant(&claims, thread);
                drop(table);
                self.shared.changed.notify_all();
                let waited = started.elapsed();
                self.shared.metrics.record_contended(waited);
                self.record_grant(targets);
                trace!(ticket, ?targets, ?waited, "path lock granted after wait");
                return Ok(self.guard(targets, claims, thread));
            }
        }
    }

    fn record_grant(&self, targets: &[(FsPath, LockMode)]) {
        if targets.iter().any(|(_, m)| *m == LockMode::Write) {
            self.shared.metrics.record_write_grant();
        } else {
            self.shared.metrics.record_read_grant();
        }
    }

    fn guard(&self, targets: &[(FsPath, LockMode)], claims: Claims, owner: ThreadId) -> PathLock {
        PathLock {
            shared: Arc::clone(&self.shared),
            targets: targets.to_vec(),
            claims,
            owner,
            released: false,
        }
    }
}

/// Expand targets into per-path claims, ancestors included, in path order.
fn claims_for(targets: &[(FsPath, LockMode)]) -> Claims {
    let mut claims: BTreeMap<FsPath, LockMode> = BTreeMap::new();
    for (path, mode) in targets {
        for ancestor in path.ancestors() {
            claims.entry(ancestor).or_insert(LockMode::Read);
        }
        let entry = claims.entry(path.clone()).or_insert(*mode);
        if *mode == LockMode::Write {
            *entry = LockMode::Write;
        }
    }
    claims.into_iter().collect()
}

/// A granted hierarchical lock.
///
/// Released exactly once, either by [`release`](Self::release) or on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct PathLock {
    shared: Arc<Shared>,
    targets: Vec<(FsPath, LockMode)>,
    claims: Claims,
    owner: ThreadId,
    released: bool,
}

impl PathLock {
    /// The explicitly requested paths and modes (ancestors excluded).
    pub fn targets(&self) -> &[(FsPath, LockMode)] {
        &self.targets
    }

    /// Release the lock now.
    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.shared.table.lock().release(&self.claims, self.owner);
        self.shared.changed.notify_all();
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        self.unlock();
    }
}
