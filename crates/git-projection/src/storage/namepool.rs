//! Interning pool for projected entry names.
//!
//! Every generation of the projection owns one `NamePool`. Names are appended
//! to a single byte buffer and addressed by a compact [`NameId`], so a tree of
//! millions of entries stores each distinct name ("README.md", "mod.rs", ...)
//! exactly once and never hands out raw pointers.
//!
//! The pool is reset when a generation is recycled and can be compacted after
//! an unusually large rebuild.

use std::hash::Hasher;

use fnv::{FnvHashMap, FnvHasher};
use thin_vec::ThinVec;

/// Handle to a name stored in a [`NamePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NameId {
    offset: u32,
    len: u32,
}

impl NameId {
    /// Returns the length of the name in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A pool that interns byte strings, storing each unique string exactly once.
#[derive(Default)]
pub struct NamePool {
    bytes: Vec<u8>,
    buckets: FnvHashMap<u64, ThinVec<NameId>>,
    names: usize,
}

impl std::fmt::Debug for NamePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamePool")
            .field("len", &self.names)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl NamePool {
    /// Creates a new empty name pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a name, returning the handle of the stored copy.
    ///
    /// Duplicate names return the same handle.
    pub fn intern(&mut self, name: &[u8]) -> NameId {
        let hash = hash_name(name);
        let bytes = &self.bytes;
        let bucket = self.buckets.entry(hash).or_default();
        if let Some(existing) = bucket
            .iter()
            .find(|id| slice(bytes, **id) == name)
        {
            return *existing;
        }

        let id = NameId {
            offset: u32::try_from(self.bytes.len()).expect("name pool exceeds 4 GiB"),
            len: name.len() as u32,
        };
        self.bytes.extend_from_slice(name);
        bucket.push(id);
        self.names += 1;
        id
    }

    /// Returns the bytes of an interned name.
    #[inline]
    pub fn get(&self, id: NameId) -> &[u8] {
        slice(&self.bytes, id)
    }

    /// Number of distinct names.
    pub fn len(&self) -> usize {
        self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names == 0
    }

    /// Bytes used by name payloads.
    pub fn bytes_used(&self) -> usize {
        self.bytes.len()
    }

    /// Forgets every name while keeping allocated capacity for the next
    /// generation. All previously issued handles become invalid.
    pub fn reset(&mut self) {
        self.bytes.clear();
        self.buckets.clear();
        self.names = 0;
    }

    /// Releases spare capacity.
    pub fn compact(&mut self) {
        self.bytes.shrink_to_fit();
        self.buckets.shrink_to_fit();
    }

    /// Allocated capacity of the payload buffer.
    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }
}

#[inline]
fn slice(bytes: &[u8], id: NameId) -> &[u8] {
    let start = id.offset as usize;
    &bytes[start..start + id.len as usize]
}

#[inline]
fn hash_name(name: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(name);
    hasher.finish()
}
