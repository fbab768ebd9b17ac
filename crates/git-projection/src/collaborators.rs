//! Contracts of the components the projection engine drives but does not own.
//!
//! Implementations live with the virtualization layer; this crate only calls
//! through these traits.

use std::io;
use std::sync::Arc;

use bitflags::bitflags;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::object_id::ObjectId;
use crate::placeholders::PlaceholderRecord;

/// Outcome of a provider call on a single placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderResult {
    Ok,
    NotFound,
    DirectoryNotEmpty,
    /// The path is no longer a placeholder (it was hydrated into a full file
    /// or folder) so the provider refuses to touch it.
    ReparseNotHandled,
    InvalidOperation,
    Other(i32),
}

bitflags! {
    /// States in which the provider is allowed to replace or delete a
    /// placeholder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UpdateConditions: u32 {
        const ALLOW_DIRTY_METADATA = 0x01;
        const ALLOW_DIRTY_DATA = 0x02;
        const ALLOW_TOMBSTONE = 0x04;
        const ALLOW_READ_ONLY = 0x20;
    }
}

impl UpdateConditions {
    /// Conditions used for placeholders whose contents were never read
    /// through, matching what background sync may safely replace.
    pub fn background_sync() -> Self {
        Self::ALLOW_DIRTY_METADATA | Self::ALLOW_READ_ONLY
    }
}

bitflags! {
    /// File attributes set on created or updated placeholders.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileAttributes: u32 {
        const READ_ONLY = 0x01;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
        const NORMAL = 0x80;
    }
}

/// Timestamps stamped on an updated placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaceholderTimes {
    pub created: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub last_write: DateTime<Utc>,
    pub changed: DateTime<Utc>,
}

impl PlaceholderTimes {
    /// All four timestamps set to `at`.
    pub fn uniform(at: DateTime<Utc>) -> Self {
        Self {
            created: at,
            last_access: at,
            last_write: at,
            changed: at,
        }
    }
}

/// A create-or-update request for one placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderUpdate {
    pub path: String,
    pub name: String,
    pub is_folder: bool,
    pub size: u64,
    pub hash: ObjectId,
    pub attributes: FileAttributes,
    pub times: PlaceholderTimes,
    pub conditions: UpdateConditions,
}

/// The OS virtualization layer.
pub trait VirtualizationProvider: Send + Sync {
    fn update_placeholder(&self, update: &PlaceholderUpdate) -> ProviderResult;

    fn delete_placeholder(&self, path: &str, conditions: UpdateConditions) -> ProviderResult;

    /// Drops the provider's cache of paths known not to exist and returns how
    /// many entries were cleared.
    fn clear_negative_path_cache(&self) -> io::Result<u32>;
}

/// Blob size resolution, from cheapest to most expensive source.
pub trait BlobSizeLookup: Send + Sync {
    /// Sizes remembered from earlier lookups.
    fn cached_size(&self, id: &ObjectId) -> Option<u64>;

    /// Sizes readable from the local object store.
    fn object_store_size(&self, id: &ObjectId) -> Option<u64>;

    /// Batched remote query. An error applies to the whole batch and is
    /// reported as [`ProjectionError::SizesUnavailable`](crate::ProjectionError).
    fn fetch_remote_sizes(&self, ids: &[ObjectId]) -> Result<Vec<(ObjectId, u64)>>;

    /// Remembers a size resolved from a slower source.
    fn record_size(&self, _id: &ObjectId, _size: u64) {}
}

/// Durable list of placeholders created on disk.
pub trait PlaceholderStore: Send + Sync {
    fn get_all(&self) -> Result<Vec<PlaceholderRecord>>;

    /// Replaces the whole list and flushes it to disk.
    fn write_all_and_flush(&self, records: &[PlaceholderRecord]) -> Result<()>;

    /// Adds or replaces one record and flushes immediately.
    fn add_and_flush(&self, record: PlaceholderRecord) -> Result<()>;

    /// Removes one record and flushes immediately.
    fn remove_and_flush(&self, path: &str) -> Result<()>;

    fn count(&self) -> Result<usize>;
}

/// The repository-wide lock git commands take while they run.
pub trait ExternalRepositoryLock: Send + Sync {
    /// True while another process holds the lock.
    fn is_held_by_other(&self) -> bool;

    /// True once the holder announced it is about to release the lock.
    fn release_requested(&self) -> bool;
}

/// Follow-up work for placeholders that could not be reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemediationTask {
    FailedPlaceholderUpdate { path: String },
    FailedPlaceholderDelete { path: String },
}

impl RemediationTask {
    pub fn path(&self) -> &str {
        match self {
            Self::FailedPlaceholderUpdate { path } | Self::FailedPlaceholderDelete { path } => path,
        }
    }
}

/// Fire-and-forget queue of background remediation tasks.
pub trait RemediationQueue: Send + Sync {
    fn enqueue(&self, task: RemediationTask);
}

/// Paths that diverged from the projection and must be treated as full files.
pub trait ModifiedPathsStore: Send + Sync {
    /// Returns true if the path was newly added.
    fn try_add(&self, path: &str, is_folder: bool) -> bool;
}

/// Everything the engine calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn VirtualizationProvider>,
    pub sizes: Arc<dyn BlobSizeLookup>,
    pub placeholders: Arc<dyn PlaceholderStore>,
    pub repository_lock: Arc<dyn ExternalRepositoryLock>,
    pub remediation: Arc<dyn RemediationQueue>,
    pub modified_paths: Arc<dyn ModifiedPathsStore>,
}
