//! The background rebuild loop.
//!
//! One thread owns every mutation of the projection. Each iteration takes all
//! outstanding work at once, so invalidations that arrive while it runs
//! coalesce into a single follow-up iteration.

use std::fs::File;
use std::path::Path;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use super::external_lock::{wait_for_external_lock, LockWait};
use super::snapshot::snapshot_index;
use super::state::{store_marker, PendingWork, ProjectionState};
use super::Shared;
use crate::cancel::CancellationToken;
use crate::error::{ProjectionError, Result};
use crate::index::IndexParser;
use crate::placeholders::SyncContext;
use crate::projection::ProjectionTree;

/// Node slack tolerated before a spare tree is compacted.
const COMPACT_SLACK: usize = 64 * 1024;

/// Work taken for one iteration.
#[derive(Debug, Clone, Copy)]
pub(super) struct Iteration {
    /// Invalidation count this iteration catches up to.
    pub target: u64,
    pub pending: PendingWork,
    pub rebuild_tree: bool,
}

enum Outcome {
    Done,
    Cancelled,
}

pub(super) struct Worker {
    shared: Arc<Shared>,
    spare: ProjectionTree,
    parser: IndexParser,
}

impl Worker {
    pub fn new(shared: Arc<Shared>) -> Self {
        let parser = IndexParser::with_page_size(shared.config.page_size);
        Self {
            shared,
            spare: ProjectionTree::new(),
            parser,
        }
    }

    pub fn run(mut self) {
        log::debug!("projection worker started");
        while let Some(work) = self.shared.next_work() {
            let result = catch_unwind(AssertUnwindSafe(|| self.run_iteration(work)));
            match result {
                Ok(Ok(Outcome::Done)) => self.shared.complete(work),
                Ok(Ok(Outcome::Cancelled)) => break,
                Ok(Err(error)) if error.is_transient() => {
                    log::warn!(
                        "projection rebuild failed, will retry retry_ms={} error={}",
                        self.shared.config.retry_interval.as_millis(),
                        error
                    );
                    self.shared.retry(work);
                }
                Ok(Err(error)) => {
                    self.shared.fail(&error);
                    break;
                }
                Err(panic) => {
                    let message = if let Some(s) = panic.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "projection worker panicked".to_string()
                    };
                    self.shared
                        .fail(&ProjectionError::Internal(format!("panic during rebuild: {message}")));
                    break;
                }
            }
        }
        log::debug!("projection worker stopped");
    }

    fn run_iteration(&mut self, work: Iteration) -> Result<Outcome> {
        let shared = Arc::clone(&self.shared);
        let config = &shared.config;
        let cancel = shared.shutdown.token();

        let wait = wait_for_external_lock(
            shared.collaborators.repository_lock.as_ref(),
            config.lock_poll_interval,
            config.release_wait,
            &cancel,
        );
        if wait == LockWait::Cancelled {
            return Ok(Outcome::Cancelled);
        }

        let snapshot = config.snapshot_path();
        snapshot_index(&config.index_path, &snapshot)?;

        if work.pending.contains(PendingWork::MODIFIED_PATHS) {
            let started = Instant::now();
            let Some(stats) = self.parser.parse_modified_paths(
                File::open(&snapshot)?,
                shared.collaborators.modified_paths.as_ref(),
                &cancel,
            )?
            else {
                return Ok(Outcome::Cancelled);
            };
            log::info!(
                "modified paths updated entries={} added={} elapsed_ms={}",
                stats.entries,
                stats.accepted,
                started.elapsed().as_millis()
            );
        }

        if work.rebuild_tree && !self.rebuild(&snapshot, &cancel)? {
            return Ok(Outcome::Cancelled);
        }

        if cancel.cancelled() {
            return Ok(Outcome::Cancelled);
        }

        if work.pending.contains(PendingWork::PROJECTION) {
            let tree = shared.tree.read();
            let ctx = SyncContext {
                tree: &*tree,
                provider: shared.collaborators.provider.as_ref(),
                sizes: shared.collaborators.sizes.as_ref(),
                remediation: shared.collaborators.remediation.as_ref(),
            };
            let report = shared.synchronizer.lock().sync_store(
                ctx,
                shared.collaborators.placeholders.as_ref(),
                &cancel,
            )?;
            *shared.last_sync_failures.lock() = report.failed;
            if report.cancelled {
                return Ok(Outcome::Cancelled);
            }
        }

        Ok(Outcome::Done)
    }

    /// Parses the snapshot into the spare tree and publishes it. Returns false
    /// if shutdown interrupted the parse.
    fn rebuild(&mut self, snapshot: &Path, cancel: &CancellationToken) -> Result<bool> {
        let started = Instant::now();
        self.spare.recycle();
        let Some(stats) = self
            .parser
            .parse_projection(File::open(snapshot)?, &mut self.spare, cancel)?
        else {
            return Ok(false);
        };
        if self.spare.node_capacity() > self.spare.len() * 2 + COMPACT_SLACK {
            self.spare.compact();
        }

        let (files, folders) = (self.spare.file_count(), self.spare.folder_count());

        let generation = {
            let mut tree = self.shared.tree.write();
            let generation = tree.generation() + 1;
            self.spare.set_generation(generation);
            std::mem::swap(&mut *tree, &mut self.spare);
            generation
        };
        log::info!(
            "projection rebuilt generation={} entries={} projected={} files={} folders={} elapsed_ms={}",
            generation,
            stats.entries,
            stats.accepted,
            files,
            folders,
            started.elapsed().as_millis()
        );

        match self.shared.collaborators.provider.clear_negative_path_cache() {
            Ok(cleared) => log::debug!("negative path cache cleared entries={cleared}"),
            Err(error) => log::warn!("failed to clear negative path cache error={error}"),
        }
        Ok(true)
    }
}

impl Shared {
    /// Blocks until there is work or shutdown. Returns `None` on shutdown.
    pub(super) fn next_work(&self) -> Option<Iteration> {
        let mut status = self.status.lock();
        loop {
            if self.shutdown.is_triggered() {
                return None;
            }
            if let Some(retry_at) = status.retry_at.take() {
                // A new invalidation cuts the retry delay short.
                self.wake.wait_until(&mut status, retry_at);
                continue;
            }
            if status.pending.is_empty() && !status.tree_missing {
                self.wake.wait(&mut status);
                continue;
            }

            let pending = std::mem::take(&mut status.pending);
            status.in_flight = pending;
            let rebuild_tree = status.tree_missing || pending.contains(PendingWork::PROJECTION);
            status.tree_missing = false;
            if rebuild_tree {
                status.state = ProjectionState::Rebuilding;
            }
            return Some(Iteration {
                target: status.requested,
                pending,
                rebuild_tree,
            });
        }
    }

    pub(super) fn complete(&self, work: Iteration) {
        let mut status = self.status.lock();
        if work.rebuild_tree {
            status.state = if status.requested == work.target {
                ProjectionState::Valid
            } else {
                ProjectionState::Invalid
            };
        }
        status.in_flight = PendingWork::empty();
        if let Err(error) = store_marker(&self.config.marker_path(), status.unfinished()) {
            log::warn!("failed to update projection marker error={error}");
        }
        log::debug!(
            "projection iteration complete state={} pending={:?}",
            status.state.as_str(),
            status.pending
        );
        self.parse_complete.notify_all();
    }

    pub(super) fn retry(&self, work: Iteration) {
        let mut status = self.status.lock();
        status.pending |= work.pending;
        status.in_flight = PendingWork::empty();
        if work.rebuild_tree {
            status.tree_missing = true;
            status.state = ProjectionState::Invalid;
        }
        status.retry_at = Some(Instant::now() + self.config.retry_interval);
    }

    /// Hands a non-recoverable error to the fatal handler and stops serving.
    pub(super) fn fail(&self, error: &ProjectionError) {
        log::error!("projection background thread failed error={error}");
        let handler = self.fatal_handler.lock().clone();
        handler(error);

        self.shutdown.trigger();
        let _status = self.status.lock();
        self.parse_complete.notify_all();
        self.wake.notify_all();
    }
}
