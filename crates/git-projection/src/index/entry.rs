//! Reusable per-entry decoding state.

use std::borrow::Cow;

use super::format::{EntryFlags, ExtendedFlags, MergeStage};
use crate::object_id::ObjectId;
use crate::storage::NodeIndex;

/// The entry currently being decoded.
///
/// One instance is reused for the whole parse: the path buffer keeps the
/// previous path so prefix-compressed suffixes are written in place, and the
/// parent folder resolved for the previous entry is cached for siblings.
#[derive(Debug, Default)]
pub struct IndexEntry {
    path: Vec<u8>,
    /// Bytes of the previous path kept as the prefix of this one.
    kept_prefix: usize,
    /// Length of the parent portion including its trailing '/', 0 for
    /// top-level entries.
    parent_len: usize,
    same_parent: bool,
    cached_parent: Option<NodeIndex>,
    pub(super) hash: ObjectId,
    pub(super) flags: EntryFlags,
    pub(super) extended: ExtendedFlags,
    pub(super) stage: MergeStage,
}

impl IndexEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Truncates the previous path to `kept_prefix` bytes ahead of reading the
    /// suffix. Returns the previous parent length for the same-parent check.
    pub(super) fn begin_path(&mut self, kept_prefix: usize) -> usize {
        self.kept_prefix = kept_prefix;
        self.path.truncate(kept_prefix);
        self.parent_len
    }

    /// Buffer the parser appends the path suffix to.
    #[inline]
    pub(super) fn path_buffer(&mut self) -> &mut Vec<u8> {
        &mut self.path
    }

    /// Finishes decoding the path: decides whether this entry shares its
    /// parent with the previous one and recomputes the parent boundary.
    pub(super) fn finish_path(&mut self, previous_parent_len: usize, first: bool) {
        let suffix = &self.path[self.kept_prefix..];
        let suffix_has_separator = memchr::memchr(b'/', suffix).is_some();
        self.same_parent =
            !first && self.kept_prefix >= previous_parent_len && !suffix_has_separator;

        if self.same_parent {
            self.parent_len = previous_parent_len;
        } else {
            self.parent_len = memchr::memrchr(b'/', &self.path).map_or(0, |sep| sep + 1);
            self.cached_parent = None;
        }
    }

    /// Full path of the entry, '/'-separated.
    #[inline]
    pub fn path(&self) -> &[u8] {
        &self.path
    }

    #[inline]
    pub fn path_len(&self) -> usize {
        self.path.len()
    }

    pub fn path_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.path)
    }

    /// Bytes reused from the previous entry's path.
    #[inline]
    pub fn kept_prefix(&self) -> usize {
        self.kept_prefix
    }

    /// Parent folder path without trailing separator; empty at the root.
    #[inline]
    pub fn parent_path(&self) -> &[u8] {
        &self.path[..self.parent_len.saturating_sub(1)]
    }

    /// Final path component.
    #[inline]
    pub fn file_name(&self) -> &[u8] {
        &self.path[self.parent_len..]
    }

    #[inline]
    pub fn hash(&self) -> ObjectId {
        self.hash
    }

    #[inline]
    pub fn flags(&self) -> EntryFlags {
        self.flags
    }

    #[inline]
    pub fn skip_worktree(&self) -> bool {
        self.extended.contains(ExtendedFlags::SKIP_WORKTREE)
    }

    #[inline]
    pub fn merge_stage(&self) -> MergeStage {
        self.stage
    }

    /// True when the previous entry has the same parent folder.
    #[inline]
    pub fn same_parent_as_previous(&self) -> bool {
        self.same_parent
    }

    /// Parent folder resolved for an earlier sibling, if still valid.
    #[inline]
    pub fn cached_parent(&self) -> Option<NodeIndex> {
        if self.same_parent {
            self.cached_parent
        } else {
            None
        }
    }

    #[inline]
    pub fn set_cached_parent(&mut self, parent: NodeIndex) {
        self.cached_parent = Some(parent);
    }
}
