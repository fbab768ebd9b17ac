//! GitIndexProjection - the public face of the crate.
//!
//! The engine keeps the projection tree behind a single `RwLock` that is only
//! taken exclusively to swap in a freshly parsed generation. Readers that need
//! a current projection wait on a separate parse-complete condition instead of
//! the tree lock, so "a rebuild is outstanding" and "the tree is briefly
//! locked" stay distinct.
//!
//! ## Lifecycle
//!
//! ```text
//! new() -> initialize() -> [invalidate_* / queries]* -> shutdown()
//! ```
//!
//! `initialize` spawns the background thread and always schedules a build,
//! since the tree lives only in memory. Placeholder reconciliation runs on
//! that first build only if the previous run left it pending.

mod config;
mod external_lock;
mod snapshot;
mod state;
mod worker;

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

pub use config::{
    ProjectionConfig, DEFAULT_LOCK_POLL_INTERVAL, DEFAULT_RELEASE_WAIT, DEFAULT_RETRY_INTERVAL,
};
pub use external_lock::{wait_for_external_lock, LockWait};
pub use snapshot::snapshot_index;
pub use state::{load_marker, store_marker, PendingWork, ProjectionState};

use crate::cancel::ShutdownSignal;
use crate::collaborators::Collaborators;
use crate::error::{ProjectionError, Result};
use crate::object_id::ObjectId;
use crate::placeholders::{PlaceholderRecord, PlaceholderSynchronizer, ResultPolicy, SizeResolver};
use crate::projection::{ProjectedEntry, ProjectionTree};
use worker::Worker;

/// Called with the error that stopped the background thread.
pub type FatalHandler = Arc<dyn Fn(&ProjectionError) + Send + Sync>;

/// Default fatal handler: serving a projection that may be inconsistent is
/// worse than stopping, so the process is aborted.
pub fn abort_on_fatal(error: &ProjectionError) {
    log::error!("projection is unrecoverable, aborting error={error}");
    std::process::abort();
}

/// Answer to [`GitIndexProjection::is_path_projected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedPath {
    /// Name with the casing recorded in the index.
    pub name: String,
    pub is_folder: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectedFileInfo {
    pub hash: ObjectId,
    pub size: u64,
}

#[derive(Debug)]
struct Status {
    state: ProjectionState,
    /// Number of projection invalidations so far.
    requested: u64,
    pending: PendingWork,
    /// Work taken by the running iteration. Stays in the marker until the
    /// iteration completes.
    in_flight: PendingWork,
    /// Set until the first successful build, and again after a failed one.
    tree_missing: bool,
    retry_at: Option<Instant>,
}

impl Status {
    /// Everything a restart would still have to do.
    fn unfinished(&self) -> PendingWork {
        self.pending | self.in_flight
    }
}

pub(crate) struct Shared {
    config: ProjectionConfig,
    collaborators: Collaborators,
    tree: RwLock<ProjectionTree>,
    status: Mutex<Status>,
    /// Signalled whenever an iteration finishes or the engine stops.
    parse_complete: Condvar,
    /// Signalled when there is new work for the background thread.
    wake: Condvar,
    shutdown: ShutdownSignal,
    synchronizer: Mutex<PlaceholderSynchronizer>,
    last_sync_failures: Mutex<BTreeSet<String>>,
    fatal_handler: Mutex<FatalHandler>,
}

impl Shared {
    fn wait_until_valid(&self, deadline: Option<Instant>) -> Result<bool> {
        let mut status = self.status.lock();
        loop {
            if self.shutdown.is_triggered() {
                return Err(ProjectionError::ShutDown);
            }
            if status.state == ProjectionState::Valid {
                return Ok(true);
            }
            match deadline {
                Some(deadline) => {
                    if self.parse_complete.wait_until(&mut status, deadline).timed_out() {
                        return Ok(status.state == ProjectionState::Valid);
                    }
                }
                None => self.parse_complete.wait(&mut status),
            }
        }
    }

    fn request(&self, work: PendingWork) -> Result<()> {
        let mut status = self.status.lock();
        if self.shutdown.is_triggered() {
            return Err(ProjectionError::ShutDown);
        }
        if work.contains(PendingWork::PROJECTION) {
            status.requested += 1;
            status.state = ProjectionState::Invalid;
        }
        status.pending |= work;
        let stored = store_marker(&self.config.marker_path(), status.unfinished());
        self.wake.notify_one();
        if let Err(error) = &stored {
            log::warn!("failed to persist projection invalidation error={error}");
        }
        stored
    }
}

/// Serves a virtual folder hierarchy built from git's index.
pub struct GitIndexProjection {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for GitIndexProjection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitIndexProjection")
            .field("index_path", &self.shared.config.index_path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl GitIndexProjection {
    /// Creates an engine. Nothing is parsed until [`Self::initialize`].
    pub fn new(config: ProjectionConfig, collaborators: Collaborators) -> Result<Self> {
        fs::create_dir_all(&config.state_dir)?;
        let synchronizer = PlaceholderSynchronizer::new(config.sync.clone())?;
        let fatal_handler: FatalHandler = Arc::new(abort_on_fatal);
        let shared = Arc::new(Shared {
            config,
            collaborators,
            tree: RwLock::new(ProjectionTree::new()),
            status: Mutex::new(Status {
                state: ProjectionState::Invalid,
                requested: 0,
                pending: PendingWork::empty(),
                in_flight: PendingWork::empty(),
                tree_missing: true,
                retry_at: None,
            }),
            parse_complete: Condvar::new(),
            wake: Condvar::new(),
            shutdown: ShutdownSignal::new(),
            synchronizer: Mutex::new(synchronizer),
            last_sync_failures: Mutex::new(BTreeSet::new()),
            fatal_handler: Mutex::new(fatal_handler),
        });
        Ok(Self {
            shared,
            worker: Mutex::new(None),
        })
    }

    /// Replaces the handler run when the background thread hits a
    /// non-recoverable error.
    pub fn set_fatal_handler(&self, handler: impl Fn(&ProjectionError) + Send + Sync + 'static) {
        *self.shared.fatal_handler.lock() = Arc::new(handler);
    }

    /// Replaces the provider result mapping used by placeholder sync.
    pub fn set_result_policy(&self, policy: Arc<dyn ResultPolicy>) {
        self.shared.synchronizer.lock().set_policy(policy);
    }

    /// Loads work left pending by a previous run and starts the background
    /// thread. Calling it again is a no-op.
    pub fn initialize(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        if self.shared.shutdown.is_triggered() {
            return Err(ProjectionError::ShutDown);
        }

        let persisted = load_marker(&self.shared.config.marker_path())?;
        {
            let mut status = self.shared.status.lock();
            status.pending |= persisted;
            status.tree_missing = true;
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("git-projection".to_string())
            .spawn(move || Worker::new(shared).run())?;
        *worker = Some(handle);

        log::info!(
            "git index projection started index={} pending={:?}",
            self.shared.config.index_path.display(),
            persisted
        );
        Ok(())
    }

    /// Marks the projection stale. Readers block until it is rebuilt and the
    /// placeholders are reconciled.
    pub fn invalidate_projection(&self) -> Result<()> {
        self.shared.request(PendingWork::PROJECTION)
    }

    /// Schedules a pass recording entries git materialized as modified paths.
    pub fn invalidate_modified_files(&self) -> Result<()> {
        self.shared.request(PendingWork::MODIFIED_PATHS)
    }

    /// Blocks until the projection is valid.
    pub fn wait_for_projection_update(&self) -> Result<()> {
        self.shared.wait_until_valid(None).map(|_| ())
    }

    /// Like [`Self::wait_for_projection_update`] but gives up after `timeout`.
    /// Returns whether the projection is valid.
    pub fn wait_for_projection_update_timeout(&self, timeout: Duration) -> Result<bool> {
        self.shared.wait_until_valid(Some(Instant::now() + timeout))
    }

    pub fn state(&self) -> ProjectionState {
        self.shared.status.lock().state
    }

    /// Generation of the published tree, 0 before the first build.
    pub fn generation(&self) -> u64 {
        self.shared.tree.read().generation()
    }

    /// Children of `folder` with their sizes. Waits for a valid projection.
    /// Returns `None` if `folder` is not a projected folder.
    pub fn get_projected_items(&self, folder: &str) -> Result<Option<Vec<ProjectedEntry>>> {
        self.wait_for_projection_update()?;
        let tree = self.shared.tree.read();
        let sizes = self.size_resolver();
        tree.enumerate(folder.as_bytes(), &sizes)
    }

    /// Non-blocking variant of [`Self::get_projected_items`]. Answers only
    /// when the projection is valid, the tree is not being swapped, and every
    /// size under `folder` is already known.
    pub fn try_get_projected_items_from_memory(
        &self,
        folder: &str,
    ) -> Result<Option<Vec<ProjectedEntry>>> {
        if self.state() != ProjectionState::Valid {
            return Ok(None);
        }
        let Some(tree) = self.shared.tree.try_read() else {
            return Ok(None);
        };
        tree.enumerate_from_memory(folder.as_bytes())
    }

    /// Whether `path` names a projected file or folder.
    pub fn is_path_projected(&self, path: &str) -> Result<Option<ProjectedPath>> {
        self.wait_for_projection_update()?;
        let tree = self.shared.tree.read();
        Ok(tree.lookup(path.as_bytes())?.map(|index| ProjectedPath {
            name: String::from_utf8_lossy(tree.name(index)).into_owned(),
            is_folder: tree.node(index).is_folder(),
        }))
    }

    /// Blob id and size of a projected file. `None` for folders and paths
    /// not in the projection.
    pub fn get_projected_file_info(&self, path: &str) -> Result<Option<ProjectedFileInfo>> {
        self.wait_for_projection_update()?;
        let tree = self.shared.tree.read();
        let Some(index) = tree.lookup(path.as_bytes())? else {
            return Ok(None);
        };
        let Some(hash) = tree.node(index).hash() else {
            return Ok(None);
        };
        let size = tree.file_size(index, &self.size_resolver())?;
        Ok(Some(ProjectedFileInfo { hash, size }))
    }

    pub fn on_placeholder_file_created(&self, path: &str, hash: ObjectId) -> Result<()> {
        self.shared
            .collaborators
            .placeholders
            .add_and_flush(PlaceholderRecord::file(path, hash))
    }

    pub fn on_placeholder_folder_created(&self, path: &str) -> Result<()> {
        self.shared
            .collaborators
            .placeholders
            .add_and_flush(PlaceholderRecord::folder(path))
    }

    pub fn on_placeholder_removed(&self, path: &str) -> Result<()> {
        self.shared.collaborators.placeholders.remove_and_flush(path)
    }

    pub fn placeholder_count(&self) -> Result<usize> {
        self.shared.collaborators.placeholders.count()
    }

    /// Paths the last placeholder sync could not reconcile.
    pub fn last_sync_failures(&self) -> BTreeSet<String> {
        self.shared.last_sync_failures.lock().clone()
    }

    /// Stops the background thread and waits for it. Pending work stays
    /// recorded for the next run.
    pub fn shutdown(&self) {
        self.shared.shutdown.trigger();
        {
            let _status = self.shared.status.lock();
            self.shared.wake.notify_all();
            self.shared.parse_complete.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                log::warn!("projection worker exited with a panic");
            }
        }
    }

    fn size_resolver(&self) -> SizeResolver<'_> {
        SizeResolver::new(
            self.shared.collaborators.sizes.as_ref(),
            self.shared.config.sync.size_batch,
        )
    }
}

impl Drop for GitIndexProjection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests;
