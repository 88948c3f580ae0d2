//! Shared helpers for adapter integration tests.

// Not every test file uses every helper
#![allow(dead_code)]

use oxnio_adapter::{AdapterConfig, MemoryStore, NioAdapter};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::EnvFilter;

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Adapter over a POSIX-style in-memory store.
pub fn memory_adapter() -> NioAdapter<MemoryStore> {
    init_tracing();
    NioAdapter::new(MemoryStore::new())
}

/// Adapter over an in-memory store that refuses to unlink open files.
pub fn strict_adapter() -> NioAdapter<MemoryStore> {
    init_tracing();
    NioAdapter::new(MemoryStore::without_unlink_while_open())
}

/// Adapter over a fresh temporary directory.
#[cfg(unix)]
pub fn local_adapter() -> (tempfile::TempDir, NioAdapter<oxnio_adapter::LocalStore>) {
    init_tracing();
    let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
    let store = oxnio_adapter::LocalStore::new(dir.path()).expect("Failed to open local store");
    (dir, NioAdapter::with_config(store, AdapterConfig::default()))
}

/// Tracks how many threads are inside a section and the peak seen.
#[derive(Debug, Default)]
pub struct Occupancy {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Occupancy {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}
