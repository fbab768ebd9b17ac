//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use fnv::{FnvHashMap, FnvHashSet};
use parking_lot::Mutex;

use crate::collaborators::{
    BlobSizeLookup, Collaborators, ExternalRepositoryLock, ModifiedPathsStore, PlaceholderStore,
    PlaceholderUpdate, ProviderResult, RemediationQueue, RemediationTask, UpdateConditions,
    VirtualizationProvider,
};
use crate::error::{ProjectionError, Result};
use crate::object_id::ObjectId;
use crate::placeholders::{path_key, PlaceholderRecord};

#[derive(Debug, Default)]
pub struct MemoryModifiedPaths {
    paths: Mutex<BTreeSet<String>>,
}

impl MemoryModifiedPaths {
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().iter().cloned().collect()
    }
}

impl ModifiedPathsStore for MemoryModifiedPaths {
    fn try_add(&self, path: &str, _is_folder: bool) -> bool {
        self.paths.lock().insert(path.to_string())
    }
}

#[derive(Debug, Default)]
pub struct FakeSizes {
    cached: Mutex<FnvHashMap<ObjectId, u64>>,
    object_store: Mutex<FnvHashMap<ObjectId, u64>>,
    remote: Mutex<FnvHashMap<ObjectId, u64>>,
    failing: Mutex<FnvHashSet<ObjectId>>,
    remote_calls: Mutex<Vec<Vec<ObjectId>>>,
}

impl FakeSizes {
    /// Size reported for ids registered through [`Self::all_known`].
    pub fn known_size(id: &ObjectId) -> u64 {
        id.as_bytes()[0] as u64 * 100 + 7
    }

    /// Caches sizes for ids `[1; 20]` through `[n; 20]`.
    pub fn all_known(n: u8) -> Self {
        let sizes = Self::default();
        for byte in 1..=n {
            let id = ObjectId::from_bytes([byte; 20]);
            sizes.set_cached(id, Self::known_size(&id));
        }
        sizes
    }

    pub fn set_cached(&self, id: ObjectId, size: u64) {
        self.cached.lock().insert(id, size);
    }

    pub fn set_object_store(&self, id: ObjectId, size: u64) {
        self.object_store.lock().insert(id, size);
    }

    pub fn set_remote(&self, id: ObjectId, size: u64) {
        self.remote.lock().insert(id, size);
    }

    /// Makes every remote batch containing `id` fail.
    pub fn fail_remote_for(&self, id: ObjectId) {
        self.failing.lock().insert(id);
    }

    pub fn remote_calls(&self) -> Vec<Vec<ObjectId>> {
        self.remote_calls.lock().clone()
    }

    pub fn cached(&self, id: &ObjectId) -> Option<u64> {
        self.cached.lock().get(id).copied()
    }
}

impl BlobSizeLookup for FakeSizes {
    fn cached_size(&self, id: &ObjectId) -> Option<u64> {
        self.cached(id)
    }

    fn object_store_size(&self, id: &ObjectId) -> Option<u64> {
        self.object_store.lock().get(id).copied()
    }

    fn fetch_remote_sizes(&self, ids: &[ObjectId]) -> Result<Vec<(ObjectId, u64)>> {
        self.remote_calls.lock().push(ids.to_vec());
        let failing = self.failing.lock();
        if ids.iter().any(|id| failing.contains(id)) {
            return Err(ProjectionError::SizesUnavailable("remote lookup failed".to_string()));
        }
        let remote = self.remote.lock();
        Ok(ids
            .iter()
            .filter_map(|id| remote.get(id).map(|size| (*id, *size)))
            .collect())
    }

    fn record_size(&self, id: &ObjectId, size: u64) {
        self.set_cached(*id, size);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Update { path: String, hash: ObjectId, size: u64 },
    Delete { path: String },
}

/// Records provider calls and answers `Ok` unless told otherwise.
#[derive(Debug, Default)]
pub struct FakeProvider {
    calls: Mutex<Vec<ProviderCall>>,
    responses: Mutex<FnvHashMap<String, ProviderResult>>,
    cache_clears: AtomicUsize,
}

impl FakeProvider {
    pub fn respond(&self, path: &str, result: ProviderResult) {
        self.responses.lock().insert(path_key(path), result);
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().clone()
    }

    pub fn cache_clears(&self) -> usize {
        self.cache_clears.load(Ordering::SeqCst)
    }

    fn response(&self, path: &str) -> ProviderResult {
        self.responses
            .lock()
            .get(&path_key(path))
            .copied()
            .unwrap_or(ProviderResult::Ok)
    }
}

impl VirtualizationProvider for FakeProvider {
    fn update_placeholder(&self, update: &PlaceholderUpdate) -> ProviderResult {
        self.calls.lock().push(ProviderCall::Update {
            path: update.path.clone(),
            hash: update.hash,
            size: update.size,
        });
        self.response(&update.path)
    }

    fn delete_placeholder(&self, path: &str, _conditions: UpdateConditions) -> ProviderResult {
        self.calls.lock().push(ProviderCall::Delete {
            path: path.to_string(),
        });
        self.response(path)
    }

    fn clear_negative_path_cache(&self) -> io::Result<u32> {
        self.cache_clears.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }
}

#[derive(Debug, Default)]
pub struct MemoryPlaceholderStore {
    records: Mutex<BTreeMap<String, PlaceholderRecord>>,
    rewrites: AtomicUsize,
}

impl MemoryPlaceholderStore {
    pub fn with_records(records: Vec<PlaceholderRecord>) -> Self {
        let store = Self::default();
        store
            .records
            .lock()
            .extend(records.into_iter().map(|record| (record.key(), record)));
        store
    }

    pub fn rewrites(&self) -> usize {
        self.rewrites.load(Ordering::SeqCst)
    }
}

impl PlaceholderStore for MemoryPlaceholderStore {
    fn get_all(&self) -> Result<Vec<PlaceholderRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn write_all_and_flush(&self, records: &[PlaceholderRecord]) -> Result<()> {
        self.rewrites.fetch_add(1, Ordering::SeqCst);
        *self.records.lock() = records
            .iter()
            .map(|record| (record.key(), record.clone()))
            .collect();
        Ok(())
    }

    fn add_and_flush(&self, record: PlaceholderRecord) -> Result<()> {
        self.records.lock().insert(record.key(), record);
        Ok(())
    }

    fn remove_and_flush(&self, path: &str) -> Result<()> {
        self.records.lock().remove(&path_key(path));
        Ok(())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.records.lock().len())
    }
}

/// An external lock that tests hold and release by hand.
#[derive(Debug, Default)]
pub struct FakeLock {
    held: AtomicBool,
    held_for_polls: AtomicUsize,
    release_requested: AtomicBool,
    polls: AtomicUsize,
}

impl FakeLock {
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
    }

    /// Reports the lock as held for the next `polls` checks.
    pub fn hold_for_polls(&self, polls: usize) {
        self.held_for_polls.store(polls, Ordering::SeqCst);
    }

    pub fn request_release(&self) {
        self.release_requested.store(true, Ordering::SeqCst);
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl ExternalRepositoryLock for FakeLock {
    fn is_held_by_other(&self) -> bool {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let counted = self
            .held_for_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        counted || self.held.load(Ordering::SeqCst)
    }

    fn release_requested(&self) -> bool {
        self.release_requested.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct RecordingRemediation {
    tasks: Mutex<Vec<RemediationTask>>,
}

impl RecordingRemediation {
    pub fn tasks(&self) -> Vec<RemediationTask> {
        self.tasks.lock().clone()
    }
}

impl RemediationQueue for RecordingRemediation {
    fn enqueue(&self, task: RemediationTask) {
        self.tasks.lock().push(task);
    }
}

/// A full set of fakes, kept as concrete types for assertions.
#[derive(Clone, Default)]
pub struct Fakes {
    pub provider: Arc<FakeProvider>,
    pub sizes: Arc<FakeSizes>,
    pub placeholders: Arc<MemoryPlaceholderStore>,
    pub lock: Arc<FakeLock>,
    pub remediation: Arc<RecordingRemediation>,
    pub modified_paths: Arc<MemoryModifiedPaths>,
}

impl Fakes {
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            provider: self.provider.clone(),
            sizes: self.sizes.clone(),
            placeholders: self.placeholders.clone(),
            repository_lock: self.lock.clone(),
            remediation: self.remediation.clone(),
            modified_paths: self.modified_paths.clone(),
        }
    }
}
