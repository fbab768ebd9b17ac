//! Placeholder reconciliation.
//!
//! After a rebuild the persisted placeholder records describe what the
//! virtualization layer put on disk for the previous projection. Every record
//! is compared with the new tree and the provider is asked to update or delete
//! the placeholder accordingly. Decisions come only from the records and the
//! tree; the working directory is never scanned.
//!
//! Files are reconciled in parallel on a dedicated rayon pool. Folders follow
//! on the calling thread, deepest first, so a folder is only deleted when no
//! surviving file or folder beneath it asked for it to be kept.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::available_parallelism;

use chrono::Utc;
use fnv::FnvHashSet;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::record::{file_name, parent_path, path_key, PlaceholderRecord};
use super::sizes::{SizeResolver, DEFAULT_SIZE_BATCH};
use crate::cancel::CancellationToken;
use crate::collaborators::{
    BlobSizeLookup, FileAttributes, PlaceholderStore, PlaceholderTimes, PlaceholderUpdate,
    ProviderResult, RemediationQueue, RemediationTask, UpdateConditions, VirtualizationProvider,
};
use crate::error::{ProjectionError, Result};
use crate::object_id::ObjectId;
use crate::projection::ProjectionTree;

/// Fewest file records handed to one worker.
pub const MIN_ITEMS_PER_WORKER: usize = 64;

/// Default worker count: at least 8, more on larger machines.
pub fn default_worker_threads() -> usize {
    available_parallelism().map(|n| n.get()).unwrap_or(4).max(8)
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub worker_threads: usize,
    pub min_items_per_worker: usize,
    pub size_batch: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            min_items_per_worker: MIN_ITEMS_PER_WORKER,
            size_batch: DEFAULT_SIZE_BATCH,
        }
    }
}

/// Provider call a result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncOperation {
    UpdateFile,
    DeleteFile,
    DeleteFolder,
}

/// What reconciliation does with a provider result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncAction {
    /// The request succeeded; record the new state.
    Accept,
    /// Nothing is on disk any more; forget the record.
    Drop,
    /// Leave the placeholder and its record untouched.
    Keep,
    /// The path is no longer a placeholder. Forget the record, keep its
    /// parent folders and queue remediation so the path is tracked as
    /// modified.
    KeepParentsAndRemediate,
    /// Record the path in the failure set and queue remediation.
    Fail,
}

/// Maps provider results to reconciliation actions.
pub trait ResultPolicy: Send + Sync {
    fn action(&self, operation: SyncOperation, result: ProviderResult) -> SyncAction;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResultPolicy;

impl ResultPolicy for DefaultResultPolicy {
    fn action(&self, _operation: SyncOperation, result: ProviderResult) -> SyncAction {
        match result {
            ProviderResult::Ok => SyncAction::Accept,
            ProviderResult::NotFound => SyncAction::Drop,
            ProviderResult::DirectoryNotEmpty => SyncAction::Keep,
            ProviderResult::ReparseNotHandled | ProviderResult::InvalidOperation => {
                SyncAction::KeepParentsAndRemediate
            }
            ProviderResult::Other(_) => SyncAction::Fail,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub unchanged: usize,
    pub updated: usize,
    pub deleted: usize,
    pub kept: usize,
    pub remediated: usize,
    pub failed: usize,
    /// Records left as they were because shutdown interrupted the pass.
    pub skipped: usize,
}

impl SyncCounts {
    fn merge(&mut self, other: &Self) {
        self.unchanged += other.unchanged;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.kept += other.kept;
        self.remediated += other.remediated;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Default)]
pub struct SyncReport {
    /// The rewritten placeholder list, ordered by case-folded path.
    pub records: Vec<PlaceholderRecord>,
    /// Paths the provider could not reconcile.
    pub failed: BTreeSet<String>,
    pub counts: SyncCounts,
    pub cancelled: bool,
}

/// Collaborators one pass talks to.
#[derive(Clone, Copy)]
pub struct SyncContext<'a> {
    pub tree: &'a ProjectionTree,
    pub provider: &'a dyn VirtualizationProvider,
    pub sizes: &'a dyn BlobSizeLookup,
    pub remediation: &'a dyn RemediationQueue,
}

pub struct PlaceholderSynchronizer {
    pool: ThreadPool,
    options: SyncOptions,
    policy: Arc<dyn ResultPolicy>,
}

impl std::fmt::Debug for PlaceholderSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaceholderSynchronizer")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl PlaceholderSynchronizer {
    pub fn new(options: SyncOptions) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(options.worker_threads.max(1))
            .thread_name(|i| format!("placeholder-sync-{i}"))
            .build()
            .map_err(|error| {
                ProjectionError::Internal(format!("failed to start placeholder sync pool: {error}"))
            })?;
        Ok(Self {
            pool,
            options,
            policy: Arc::new(DefaultResultPolicy),
        })
    }

    pub fn with_policy(mut self, policy: Arc<dyn ResultPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn set_policy(&mut self, policy: Arc<dyn ResultPolicy>) {
        self.policy = policy;
    }

    /// Reconciles the store's records and writes the rewritten list back.
    pub fn sync_store(
        &self,
        ctx: SyncContext<'_>,
        store: &dyn PlaceholderStore,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let records = store.get_all()?;
        let report = self.sync(ctx, records, cancel);
        store.write_all_and_flush(&report.records)?;
        log::info!(
            "placeholder sync finished records={} updated={} deleted={} failed={} cancelled={}",
            report.records.len(),
            report.counts.updated,
            report.counts.deleted,
            report.counts.failed,
            report.cancelled
        );
        Ok(report)
    }

    /// Reconciles `records` against `ctx.tree` and returns the rewritten list.
    pub fn sync(
        &self,
        ctx: SyncContext<'_>,
        records: Vec<PlaceholderRecord>,
        cancel: &CancellationToken,
    ) -> SyncReport {
        let (folders, files): (Vec<_>, Vec<_>) =
            records.into_iter().partition(PlaceholderRecord::is_folder);
        let times = PlaceholderTimes::uniform(Utc::now());

        let mut pass = Pass::default();
        if !files.is_empty() {
            let chunk = self.chunk_size(files.len());
            let outcomes: Vec<Pass> = self.pool.install(|| {
                files
                    .par_chunks(chunk)
                    .map(|chunk| self.sync_files(ctx, chunk, times, cancel))
                    .collect()
            });
            for outcome in outcomes {
                pass.absorb(outcome);
            }
        }

        self.sync_folders(ctx, folders, &mut pass, cancel);

        let mut records = pass.records;
        records.sort_by_cached_key(PlaceholderRecord::key);
        SyncReport {
            records,
            failed: pass.failed.into_iter().collect(),
            counts: pass.counts,
            cancelled: pass.cancelled,
        }
    }

    fn chunk_size(&self, items: usize) -> usize {
        let workers = (items / self.options.min_items_per_worker.max(1))
            .clamp(1, self.options.worker_threads.max(1));
        items.div_ceil(workers)
    }

    fn sync_files(
        &self,
        ctx: SyncContext<'_>,
        files: &[PlaceholderRecord],
        times: PlaceholderTimes,
        cancel: &CancellationToken,
    ) -> Pass {
        let mut pass = Pass::default();
        if cancel.cancelled() {
            pass.skip(files);
            return pass;
        }

        let plans: Vec<FilePlan> = files.iter().map(|record| plan_file(ctx.tree, record)).collect();
        let wanted: Vec<ObjectId> = plans
            .iter()
            .filter_map(|plan| match plan {
                FilePlan::Update(hash) => Some(*hash),
                _ => None,
            })
            .collect();
        let sizes = SizeResolver::new(ctx.sizes, self.options.size_batch).resolve(&wanted);

        for (i, (record, plan)) in files.iter().zip(plans).enumerate() {
            if cancel.cancelled() {
                pass.skip(&files[i..]);
                break;
            }

            match plan {
                FilePlan::Unchanged => {
                    pass.keep_record(record.clone());
                    pass.counts.unchanged += 1;
                }
                FilePlan::Update(hash) => {
                    let Some(size) = sizes.get(&hash) else {
                        pass.fail(
                            ctx,
                            &record.path,
                            RemediationTask::FailedPlaceholderUpdate {
                                path: record.path.clone(),
                            },
                            "blob size unavailable",
                        );
                        continue;
                    };
                    let update = PlaceholderUpdate {
                        path: record.path.clone(),
                        name: file_name(&record.path).to_string(),
                        is_folder: false,
                        size,
                        hash,
                        attributes: FileAttributes::ARCHIVE,
                        times,
                        conditions: UpdateConditions::background_sync(),
                    };
                    let result = ctx.provider.update_placeholder(&update);
                    let action = self.policy.action(SyncOperation::UpdateFile, result);
                    pass.apply(ctx, record, action, result, Some(hash));
                }
                FilePlan::Delete => {
                    let result = ctx
                        .provider
                        .delete_placeholder(&record.path, UpdateConditions::background_sync());
                    let action = self.policy.action(SyncOperation::DeleteFile, result);
                    pass.apply(ctx, record, action, result, None);
                }
            }
        }

        pass
    }

    fn sync_folders(
        &self,
        ctx: SyncContext<'_>,
        mut folders: Vec<PlaceholderRecord>,
        pass: &mut Pass,
        cancel: &CancellationToken,
    ) {
        // Descending folded order puts every folder before its ancestors.
        folders.sort_by_cached_key(|record| std::cmp::Reverse(record.key()));

        for (i, folder) in folders.iter().enumerate() {
            if cancel.cancelled() {
                pass.skip(&folders[i..]);
                break;
            }

            let projected = matches!(ctx.tree.find_folder(folder.path.as_bytes()), Ok(Some(_)));
            if projected {
                pass.keep_record(folder.clone());
                pass.counts.unchanged += 1;
                continue;
            }
            if pass.must_keep.contains(&folder.key()) {
                pass.keep_record(folder.clone());
                pass.counts.kept += 1;
                continue;
            }

            let result = ctx
                .provider
                .delete_placeholder(&folder.path, UpdateConditions::background_sync());
            let action = self.policy.action(SyncOperation::DeleteFolder, result);
            pass.apply(ctx, folder, action, result, None);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilePlan {
    Unchanged,
    Update(ObjectId),
    Delete,
}

fn plan_file(tree: &ProjectionTree, record: &PlaceholderRecord) -> FilePlan {
    match tree.lookup(record.path.as_bytes()) {
        Ok(Some(index)) => match tree.node(index).hash() {
            Some(hash) if Some(hash) == record.hash => FilePlan::Unchanged,
            Some(hash) => FilePlan::Update(hash),
            // Replaced by a folder.
            None => FilePlan::Delete,
        },
        Ok(None) => FilePlan::Delete,
        Err(error) => {
            log::debug!(
                "placeholder path no longer projected path={} error={}",
                record.path,
                error
            );
            FilePlan::Delete
        }
    }
}

/// Accumulated outcome of one worker, or of the whole pass once merged.
#[derive(Debug, Default)]
struct Pass {
    records: Vec<PlaceholderRecord>,
    /// Case-folded folder paths that must survive.
    must_keep: FnvHashSet<String>,
    failed: Vec<String>,
    counts: SyncCounts,
    cancelled: bool,
}

impl Pass {
    fn absorb(&mut self, other: Pass) {
        self.records.extend(other.records);
        self.must_keep.extend(other.must_keep);
        self.failed.extend(other.failed);
        self.counts.merge(&other.counts);
        self.cancelled |= other.cancelled;
    }

    fn keep_record(&mut self, record: PlaceholderRecord) {
        self.keep_parents(&record.path);
        self.records.push(record);
    }

    fn keep_parents(&mut self, path: &str) {
        let mut current = parent_path(path);
        while let Some(parent) = current {
            // Ancestors were inserted along with the first descendant.
            if !self.must_keep.insert(path_key(parent)) {
                break;
            }
            current = parent_path(parent);
        }
    }

    fn skip(&mut self, records: &[PlaceholderRecord]) {
        for record in records {
            self.keep_record(record.clone());
        }
        self.counts.skipped += records.len();
        self.cancelled = true;
    }

    fn fail(&mut self, ctx: SyncContext<'_>, path: &str, task: RemediationTask, reason: &str) {
        log::warn!("placeholder reconciliation failed path={path} reason={reason}");
        self.keep_parents(path);
        self.failed.push(path.to_string());
        self.counts.failed += 1;
        ctx.remediation.enqueue(task);
    }

    fn apply(
        &mut self,
        ctx: SyncContext<'_>,
        record: &PlaceholderRecord,
        action: SyncAction,
        result: ProviderResult,
        new_hash: Option<ObjectId>,
    ) {
        let path = record.path.clone();
        let task = if new_hash.is_some() {
            RemediationTask::FailedPlaceholderUpdate { path }
        } else {
            RemediationTask::FailedPlaceholderDelete { path }
        };

        match action {
            SyncAction::Accept => match new_hash {
                Some(hash) => {
                    self.keep_record(PlaceholderRecord::file(record.path.clone(), hash));
                    self.counts.updated += 1;
                }
                None => self.counts.deleted += 1,
            },
            SyncAction::Drop => self.counts.deleted += 1,
            SyncAction::Keep => {
                self.keep_record(record.clone());
                self.counts.kept += 1;
            }
            SyncAction::KeepParentsAndRemediate => {
                log::debug!(
                    "path is no longer a placeholder path={} result={:?}",
                    record.path,
                    result
                );
                self.keep_parents(&record.path);
                self.counts.remediated += 1;
                ctx.remediation.enqueue(task);
            }
            SyncAction::Fail => {
                self.fail(ctx, &record.path, task, &format!("{result:?}"));
            }
        }
    }
}
