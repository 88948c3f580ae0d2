//! Concurrency tests for the hierarchical path lock registry.
//!
//! Focus areas:
//! - Nested reads on one path and `is_locked` lifetime
//! - Shared READ vs exclusive WRITE residency under contention
//! - Rename's two-path grant is never half visible
//! - Cancelled waits leave no trace in the lock table

mod common;

use common::{Occupancy, init_tracing};
use oxnio_adapter::{Cancellation, FsPath, LockNodeState, PathLockRegistry};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn p(s: &str) -> FsPath {
    FsPath::parse(s).unwrap()
}

fn assert_chain_locked(locks: &PathLockRegistry, expected: bool) {
    for path in ["/foo", "/foo/bar", "/foo/bar/baz"] {
        assert_eq!(locks.is_locked(&p(path)), expected, "is_locked({path})");
    }
}

#[test]
fn test_nested_reads_keep_chain_locked() {
    init_tracing();
    let locks = PathLockRegistry::new();
    let path = p("/foo/bar/baz");

    let outer = locks.lock_for_reading(&path);
    assert_chain_locked(&locks, true);
    let middle = locks.lock_for_reading(&path);
    assert_chain_locked(&locks, true);
    let inner = locks.lock_for_reading(&path);
    assert_chain_locked(&locks, true);
    assert_eq!(
        locks.node_state(&p("/foo")),
        Some(LockNodeState {
            readers: 3,
            writer: false,
            waiting: 0
        })
    );

    inner.release();
    assert_chain_locked(&locks, true);
    middle.release();
    assert_chain_locked(&locks, true);
    outer.release();
    assert_chain_locked(&locks, false);
    assert_eq!(locks.live_nodes(), 0);
}

#[test]
fn test_nested_reads_released_out_of_order() {
    let locks = PathLockRegistry::new();
    let path = p("/foo/bar/baz");

    let outer = locks.lock_for_reading(&path);
    let middle = locks.lock_for_reading(&path);
    let inner = locks.lock_for_reading(&path);

    drop(outer);
    assert_chain_locked(&locks, true);
    drop(inner);
    assert_chain_locked(&locks, true);
    drop(middle);
    assert_chain_locked(&locks, false);
}

#[test]
fn test_eight_readers_are_resident_together() {
    init_tracing();
    let locks = PathLockRegistry::new();
    let occupancy = Arc::new(Occupancy::default());
    let barrier = Arc::new(Barrier::new(8));
    let path = p("/shared/file");

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let locks = locks.clone();
            let occupancy = Arc::clone(&occupancy);
            let barrier = Arc::clone(&barrier);
            let path = path.clone();
            thread::spawn(move || {
                let _lock = locks.lock_for_reading(&path);
                occupancy.enter();
                // Every reader must be inside before any leaves
                barrier.wait();
                occupancy.leave();
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("reader panicked");
    }
    assert_eq!(occupancy.peak(), 8);
    assert!(!locks.is_locked(&path));
}

#[test]
fn test_eight_writers_are_resident_one_at_a_time() {
    init_tracing();
    let locks = PathLockRegistry::new();
    let occupancy = Arc::new(Occupancy::default());
    let start = Arc::new(Barrier::new(8));
    let path = p("/shared/file");

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let locks = locks.clone();
            let occupancy = Arc::clone(&occupancy);
            let start = Arc::clone(&start);
            let path = path.clone();
            thread::spawn(move || {
                start.wait();
                let _lock = locks.lock_for_writing(&path);
                occupancy.enter();
                thread::sleep(Duration::from_millis(5));
                occupancy.leave();
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("writer panicked");
    }
    assert_eq!(occupancy.peak(), 1);
    assert_eq!(locks.metrics().snapshot().write_grants, 8);
    assert_eq!(locks.live_nodes(), 0);
}

#[test]
fn test_writer_on_ancestor_excludes_writers_below() {
    let locks = PathLockRegistry::new();
    let occupancy = Arc::new(Occupancy::default());
    let start = Arc::new(Barrier::new(4));

    let workers: Vec<_> = ["/a", "/a/b", "/a/b/c", "/a/b/c/d"]
        .into_iter()
        .map(|path| {
            let locks = locks.clone();
            let occupancy = Arc::clone(&occupancy);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let _lock = locks.lock_for_writing(&p(path));
                occupancy.enter();
                thread::sleep(Duration::from_millis(5));
                occupancy.leave();
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(occupancy.peak(), 1);
}

#[test]
fn test_rename_lock_is_never_half_visible() {
    init_tracing();
    let locks = PathLockRegistry::new();
    let from = p("/src/file");
    let to = p("/dst/file");

    // A reader on the destination keeps the rename waiting
    let reader = locks.lock_for_reading(&to);

    let (granted_tx, granted_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let renamer = {
        let locks = locks.clone();
        let (from, to) = (from.clone(), to.clone());
        thread::spawn(move || {
            let lock = locks.lock_both_for_writing(&from, &to);
            granted_tx.send(()).unwrap();
            done_rx.recv().unwrap();
            drop(lock);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(granted_rx.try_recv().is_err(), "rename granted while destination was read");
    let src = locks.node_state(&from).expect("queued claim keeps a node");
    assert!(!src.writer, "source locked before destination was available");
    assert_eq!(src.waiting, 1);

    reader.release();
    granted_rx.recv_timeout(Duration::from_secs(5)).expect("rename never granted");
    assert!(locks.node_state(&from).unwrap().writer);
    assert!(locks.node_state(&to).unwrap().writer);

    done_tx.send(()).unwrap();
    renamer.join().unwrap();
    assert!(!locks.is_locked(&from));
    assert!(!locks.is_locked(&to));
}

#[test]
fn test_crossing_renames_complete() {
    let locks = PathLockRegistry::new();
    let start = Arc::new(Barrier::new(2));

    let workers: Vec<_> = [("/x/one", "/y/two"), ("/y/two", "/x/one")]
        .into_iter()
        .map(|(a, b)| {
            let locks = locks.clone();
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..200 {
                    let _lock = locks.lock_both_for_writing(&p(a), &p(b));
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(locks.live_nodes(), 0);
}

#[test]
fn test_cancelled_wait_leaves_counters_unchanged() {
    init_tracing();
    let locks = PathLockRegistry::new();
    let holder = locks.lock_for_writing(&p("/x"));

    let before_root = locks.node_state(&FsPath::root());
    let before_x = locks.node_state(&p("/x"));
    let before_nodes = locks.live_nodes();

    let token = Cancellation::new();
    let waiter = {
        let locks = locks.clone();
        let token = token.clone();
        thread::spawn(move || locks.lock_for_reading_cancellable(&p("/x/y/z"), &token).map(drop))
    };

    thread::sleep(Duration::from_millis(30));
    assert_eq!(locks.node_state(&p("/x")).unwrap().waiting, 1);
    token.cancel();
    assert!(waiter.join().unwrap().is_err());

    assert_eq!(locks.node_state(&FsPath::root()), before_root);
    assert_eq!(locks.node_state(&p("/x")), before_x);
    assert_eq!(locks.node_state(&p("/x/y")), None);
    assert_eq!(locks.live_nodes(), before_nodes);
    assert_eq!(locks.metrics().snapshot().cancelled, 1);

    holder.release();
    assert_eq!(locks.live_nodes(), 0);
}

#[test]
fn test_cancelled_writer_unblocks_readers_behind_it() {
    let locks = PathLockRegistry::new();
    let reader = locks.lock_for_reading(&p("/d"));

    let token = Cancellation::after(Duration::from_millis(40));
    let writer = {
        let locks = locks.clone();
        thread::spawn(move || locks.lock_for_writing_cancellable(&p("/d"), &token).map(drop))
    };

    // Queued behind the writer until it gives up
    let late_reader = {
        let locks = locks.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            drop(locks.lock_for_reading(&p("/d/e")));
        })
    };

    assert!(writer.join().unwrap().is_err());
    late_reader.join().unwrap();
    reader.release();
    assert_eq!(locks.live_nodes(), 0);
}
