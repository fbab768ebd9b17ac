//! Batched blob size resolution.
//!
//! Sizes are looked up in the local cache first, then the local object store,
//! and only the remaining misses go to the remote lookup, one request per
//! batch. A failed remote request marks only its own batch as unavailable.

use fnv::{FnvHashMap, FnvHashSet};

use crate::collaborators::BlobSizeLookup;
use crate::object_id::ObjectId;

/// Default number of ids per remote request.
pub const DEFAULT_SIZE_BATCH: usize = 4000;

/// Result of resolving a set of blob sizes.
#[derive(Debug, Default)]
pub struct ResolvedSizes {
    sizes: FnvHashMap<ObjectId, u64>,
    /// Ids whose remote batch failed.
    pub unavailable: Vec<ObjectId>,
}

impl ResolvedSizes {
    #[inline]
    pub fn get(&self, id: &ObjectId) -> Option<u64> {
        self.sizes.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

pub struct SizeResolver<'a> {
    lookup: &'a dyn BlobSizeLookup,
    batch_size: usize,
}

impl<'a> SizeResolver<'a> {
    pub fn new(lookup: &'a dyn BlobSizeLookup, batch_size: usize) -> Self {
        Self {
            lookup,
            batch_size: batch_size.max(1),
        }
    }

    pub fn resolve(&self, ids: &[ObjectId]) -> ResolvedSizes {
        let mut resolved = ResolvedSizes::default();
        let mut seen = FnvHashSet::default();
        let unique: Vec<ObjectId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();

        for batch in unique.chunks(self.batch_size) {
            let mut misses = Vec::new();
            for id in batch {
                if let Some(size) = self.lookup.cached_size(id) {
                    resolved.sizes.insert(*id, size);
                } else if let Some(size) = self.lookup.object_store_size(id) {
                    self.lookup.record_size(id, size);
                    resolved.sizes.insert(*id, size);
                } else {
                    misses.push(*id);
                }
            }
            if misses.is_empty() {
                continue;
            }

            match self.lookup.fetch_remote_sizes(&misses) {
                Ok(sizes) => {
                    for (id, size) in sizes {
                        self.lookup.record_size(&id, size);
                        resolved.sizes.insert(id, size);
                    }
                    // Ids the remote did not answer for are as good as failed.
                    resolved
                        .unavailable
                        .extend(misses.into_iter().filter(|id| !resolved.sizes.contains_key(id)));
                }
                Err(error) => {
                    log::warn!(
                        "blob size lookup failed batch_len={} error={}",
                        misses.len(),
                        error
                    );
                    resolved.unavailable.extend(misses);
                }
            }
        }

        resolved
    }
}
