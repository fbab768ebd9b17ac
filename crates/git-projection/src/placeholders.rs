//! Placeholder bookkeeping: the persisted list of placeholders on disk, blob
//! size resolution, and reconciliation of that list after a rebuild.

mod record;
mod sizes;
mod store;
mod sync;

pub use record::PlaceholderRecord;
pub use sizes::{ResolvedSizes, SizeResolver, DEFAULT_SIZE_BATCH};
pub use store::{FilePlaceholderStore, PLACEHOLDER_LOG_VERSION};
pub use sync::{
    default_worker_threads, DefaultResultPolicy, PlaceholderSynchronizer, ResultPolicy,
    SyncAction, SyncContext, SyncCounts, SyncOperation, SyncOptions, SyncReport,
    MIN_ITEMS_PER_WORKER,
};

pub(crate) use record::path_key;
