//! Adapter configuration.
//!
//! Controls read-only mode, how long an operation may wait for a path lock,
//! and where open-but-unlinked files are parked on stores that cannot keep
//! an unlinked file readable.

use std::time::Duration;

/// Default name of the hidden orphan directory at the root of the store.
pub const DEFAULT_ORPHAN_DIR: &str = ".oxnio-orphans";

/// Default interval at which lock waiters re-check their cancellation token.
pub const DEFAULT_CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Configuration options for [`NioAdapter`](crate::NioAdapter).
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Reject every mutating operation with `EROFS`.
    ///
    /// Default: false.
    pub read_only: bool,

    /// Upper bound on how long a single operation waits for its path locks.
    ///
    /// When exceeded the operation fails with `EINTR` without having touched
    /// the store. `None` waits indefinitely. Default: `None`.
    pub lock_timeout: Option<Duration>,

    /// How often a blocked lock waiter checks whether it was cancelled.
    ///
    /// Default: 20ms.
    pub cancel_poll_interval: Duration,

    /// Root-level directory name used to park unlinked files that still have
    /// open handles. Hidden from directory listings.
    ///
    /// Default: `.oxnio-orphans`.
    pub orphan_dir: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            lock_timeout: None,
            cancel_poll_interval: DEFAULT_CANCEL_POLL_INTERVAL,
            orphan_dir: DEFAULT_ORPHAN_DIR.to_string(),
        }
    }
}

impl AdapterConfig {
    /// Creates a configuration for a read-only adapter.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Sets read-only mode.
    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Sets the maximum lock wait per operation.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Sets the cancellation poll interval for blocked lock waiters.
    #[must_use]
    pub fn cancel_poll_interval(mut self, interval: Duration) -> Self {
        self.cancel_poll_interval = interval;
        self
    }

    /// Sets the orphan directory name.
    #[must_use]
    pub fn orphan_dir(mut self, name: impl Into<String>) -> Self {
        self.orphan_dir = name.into();
        self
    }
}
