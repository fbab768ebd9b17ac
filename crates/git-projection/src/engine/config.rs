use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::index::DEFAULT_PAGE_SIZE;
use crate::placeholders::SyncOptions;

/// Delay before a rebuild that failed on a transient error is retried.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Sleep between checks of the external repository lock.
pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to keep polling a lock whose holder announced its release.
pub const DEFAULT_RELEASE_WAIT: Duration = Duration::from_secs(5);

const SNAPSHOT_FILE: &str = "index.snapshot";
const MARKER_FILE: &str = "projection.pending";
const PLACEHOLDER_LOG_FILE: &str = "placeholders.log";

/// Settings for a [`GitIndexProjection`](super::GitIndexProjection).
#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    /// The repository's index file, usually `.git/index`.
    pub index_path: PathBuf,
    /// Directory owned by the engine for its snapshot and marker files.
    pub state_dir: PathBuf,
    pub retry_interval: Duration,
    pub lock_poll_interval: Duration,
    pub release_wait: Duration,
    pub page_size: usize,
    pub sync: SyncOptions,
}

impl ProjectionConfig {
    pub fn new(index_path: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            index_path: index_path.into(),
            state_dir: state_dir.into(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
            release_wait: DEFAULT_RELEASE_WAIT,
            page_size: DEFAULT_PAGE_SIZE,
            sync: SyncOptions::default(),
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    pub fn with_release_wait(mut self, wait: Duration) -> Self {
        self.release_wait = wait;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_sync_options(mut self, sync: SyncOptions) -> Self {
        self.sync = sync;
        self
    }

    /// Private copy of the index parsed by rebuilds.
    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir.join(SNAPSHOT_FILE)
    }

    /// File recording work that must be redone after a restart.
    pub fn marker_path(&self) -> PathBuf {
        self.state_dir.join(MARKER_FILE)
    }

    /// Default location for a [`FilePlaceholderStore`](crate::FilePlaceholderStore).
    pub fn placeholder_log_path(&self) -> PathBuf {
        self.state_dir.join(PLACEHOLDER_LOG_FILE)
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }
}
