//! Engine construction options (spec §5 "Configuration"), built the way the
//! teacher's `PgStoreBuilder`/`SqliteStore::new` assemble their store handles.

use std::time::Duration;

use crate::polling::{BACKOFF_BASE_MS, MAX_RETRY};
use crate::store::StoreLocation;

/// Where the queue's own table lives, relative to the model store.
#[derive(Debug, Clone)]
pub enum QueueLocation {
    /// The queue shares the model store's file (or `:memory:` database).
    SameAsStore,
    /// The queue lives in its own file, independent of the model store.
    File(String),
}

/// Builder for [`crate::Engine`] (spec §5 "Shared resources", §4.6 tunables).
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub(crate) store: StoreLocation,
    pub(crate) queue: QueueLocation,
    pub(crate) poll_interval: Duration,
    pub(crate) max_retry: u32,
    pub(crate) backoff_base_ms: u64,
    pub(crate) recursion_limit: u32,
}

impl EngineOptions {
    /// A file-backed store at `path`, with the queue sharing the same file.
    pub fn file(path: impl Into<String>) -> Self {
        EngineOptions {
            store: StoreLocation::File(path.into()),
            queue: QueueLocation::SameAsStore,
            ..Self::defaults()
        }
    }

    /// An ephemeral, process-local store (spec §4.2 test tooling). Every
    /// handle the engine opens shares one pool, since `:memory:` connections
    /// are otherwise independent empty databases.
    pub fn memory() -> Self {
        EngineOptions {
            store: StoreLocation::Memory,
            queue: QueueLocation::SameAsStore,
            ..Self::defaults()
        }
    }

    fn defaults() -> Self {
        EngineOptions {
            store: StoreLocation::Memory,
            queue: QueueLocation::SameAsStore,
            poll_interval: Duration::from_secs(1),
            max_retry: MAX_RETRY,
            backoff_base_ms: BACKOFF_BASE_MS,
            recursion_limit: crate::event::MAX_RECURSION_DEPTH,
        }
    }

    /// Points the queue at its own file, independent of the model store.
    pub fn queue_file(mut self, path: impl Into<String>) -> Self {
        self.queue = QueueLocation::File(path.into());
        self
    }

    /// How often `get_next`'s blocking poll re-checks the store (spec §4.1).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Consecutive transient-failure ceiling before the polling loop resets
    /// its connection (spec §4.6). Defaults to 38.
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Backoff unit in milliseconds; the loop sleeps `backoff_base_ms * errs`
    /// after each transient failure. Defaults to 5000.
    pub fn backoff_base_ms(mut self, backoff_base_ms: u64) -> Self {
        self.backoff_base_ms = backoff_base_ms;
        self
    }

    /// Overrides the sub-event recursion ceiling (spec §4.4). Defaults to 100.
    pub fn recursion_limit(mut self, recursion_limit: u32) -> Self {
        self.recursion_limit = recursion_limit;
        self
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::defaults()
    }
}
