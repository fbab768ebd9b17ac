//! Git index projection engine.
//!
//! This crate turns a repository's index into an in-memory folder hierarchy
//! that a virtualization layer serves to the OS on demand:
//! - Streaming decoder for index version 4 with prefix-compressed paths
//! - Arena-backed projection tree with case-insensitive child ordering
//! - Background rebuild loop coordinated with git's repository lock
//! - Reconciliation of on-disk placeholders after every rebuild

pub mod cancel;
pub mod collaborators;
pub mod engine;
pub mod error;
pub mod index;
pub mod object_id;
pub mod placeholders;
pub mod projection;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types
pub use cancel::{CancellationToken, ShutdownSignal};
pub use collaborators::{
    BlobSizeLookup, Collaborators, ExternalRepositoryLock, FileAttributes, ModifiedPathsStore,
    PlaceholderStore, PlaceholderTimes, PlaceholderUpdate, ProviderResult, RemediationQueue,
    RemediationTask, UpdateConditions, VirtualizationProvider,
};
pub use engine::{
    GitIndexProjection, ProjectedFileInfo, ProjectedPath, ProjectionConfig, ProjectionState,
};
pub use error::{ProjectionError, Result};
pub use index::{IndexParser, IndexWriter, WriterEntry};
pub use object_id::ObjectId;
pub use placeholders::{
    DefaultResultPolicy, FilePlaceholderStore, PlaceholderRecord, PlaceholderSynchronizer,
    ResultPolicy, SyncAction, SyncOperation, SyncOptions, SyncReport,
};
pub use projection::{ProjectedEntry, ProjectionTree};
