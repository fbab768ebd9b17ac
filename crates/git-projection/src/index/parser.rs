//! Streaming decoder for index version 4.
//!
//! The parser walks the entries in file order and hands each one to a
//! caller-supplied action. Two actions are provided: building the projection
//! tree, and recording entries that git considers materialized as modified
//! paths.

use std::io::Read;

use super::entry::IndexEntry;
use super::format::{
    EntryFlags, ExtendedFlags, MergeStage, INDEX_SIGNATURE, INDEX_VERSION, PATH_LENGTH_MASK,
    STAT_BLOCK_LEN,
};
use super::reader::{PagedReader, DEFAULT_PAGE_SIZE};
use crate::cancel::CancellationToken;
use crate::collaborators::ModifiedPathsStore;
use crate::error::{format_error, Result};
use crate::object_id::ObjectId;
use crate::projection::ProjectionTree;

/// Counters from one parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    /// Entries declared in the header and decoded.
    pub entries: u32,
    /// Entries the action accepted.
    pub accepted: u32,
}

#[derive(Debug)]
pub struct IndexParser {
    page_size: usize,
    entry: IndexEntry,
}

impl Default for IndexParser {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexParser {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            entry: IndexEntry::new(),
        }
    }

    /// Decodes `source`, invoking `action` for every entry in file order.
    ///
    /// The action returns whether it accepted the entry. Returns `None` if
    /// the token was cancelled part way through.
    pub fn parse<R, F>(
        &mut self,
        source: R,
        cancel: &CancellationToken,
        mut action: F,
    ) -> Result<Option<ParseStats>>
    where
        R: Read,
        F: FnMut(&mut IndexEntry) -> Result<bool>,
    {
        let mut reader = PagedReader::with_page_size(source, self.page_size);

        let mut signature = [0u8; 4];
        reader.read_exact(&mut signature)?;
        if signature != INDEX_SIGNATURE {
            return Err(format_error(format!(
                "bad signature {signature:02x?}, expected \"DIRC\""
            )));
        }
        let version = reader.read_u32_be()?;
        if version != INDEX_VERSION {
            return Err(format_error(format!(
                "unsupported index version {version}, only {INDEX_VERSION} is supported"
            )));
        }
        let count = reader.read_u32_be()?;

        self.entry = IndexEntry::new();
        let entry = &mut self.entry;
        let mut stats = ParseStats::default();

        for i in 0..count {
            if cancel.is_cancelled_sparse(i as usize).is_none() {
                return Ok(None);
            }

            reader.skip(STAT_BLOCK_LEN)?;
            let mut hash = [0u8; ObjectId::LEN];
            reader.read_exact(&mut hash)?;

            let flags_word = reader.read_u16_be()?;
            if flags_word == 0 {
                return Err(format_error(format!(
                    "entry {i} has an empty flags word at offset {}",
                    reader.offset()
                )));
            }
            let path_len_field = flags_word & PATH_LENGTH_MASK;
            if path_len_field == 0 {
                return Err(format_error(format!("entry {i} has a zero-length path")));
            }
            let flags = EntryFlags::from_bits_truncate(flags_word);
            let extended = if flags.contains(EntryFlags::EXTENDED) {
                ExtendedFlags::from_bits_truncate(reader.read_u16_be()?)
            } else {
                ExtendedFlags::empty()
            };

            let strip = reader.read_offset_varint()?;
            let previous_len = entry.path_len();
            let kept = usize::try_from(strip)
                .ok()
                .and_then(|strip| previous_len.checked_sub(strip))
                .ok_or_else(|| {
                    format_error(format!(
                        "entry {i} strips {strip} bytes from a {previous_len} byte path"
                    ))
                })?;
            let previous_parent_len = entry.begin_path(kept);

            if path_len_field < PATH_LENGTH_MASK {
                let suffix_len = (path_len_field as usize).checked_sub(kept).ok_or_else(|| {
                    format_error(format!(
                        "entry {i} path length {path_len_field} is shorter than its reused prefix {kept}"
                    ))
                })?;
                let buffer = entry.path_buffer();
                let start = buffer.len();
                buffer.resize(start + suffix_len, 0);
                reader.read_exact(&mut buffer[start..])?;
                if reader.read_u8()? != 0 {
                    return Err(format_error(format!(
                        "entry {i} path is not NUL-terminated"
                    )));
                }
            } else {
                reader.read_until_nul(entry.path_buffer())?;
            }

            entry.finish_path(previous_parent_len, i == 0);
            if entry.file_name().is_empty() {
                return Err(format_error(format!(
                    "entry {i} path {:?} has an empty final component",
                    entry.path_lossy()
                )));
            }

            entry.hash = ObjectId::from_bytes(hash);
            entry.flags = flags;
            entry.extended = extended;
            entry.stage = MergeStage::from_flags(flags_word);

            stats.entries += 1;
            if action(entry)? {
                stats.accepted += 1;
            }
        }

        Ok(Some(stats))
    }

    /// Builds `tree` from every entry that belongs in the projection.
    pub fn parse_projection<R: Read>(
        &mut self,
        source: R,
        tree: &mut ProjectionTree,
        cancel: &CancellationToken,
    ) -> Result<Option<ParseStats>> {
        self.parse(source, cancel, |entry| {
            if is_projected(entry) {
                tree.add_index_entry(entry)
            } else {
                Ok(false)
            }
        })
    }

    /// Records every entry whose skip-worktree bit is clear as modified.
    pub fn parse_modified_paths<R: Read>(
        &mut self,
        source: R,
        modified_paths: &dyn ModifiedPathsStore,
        cancel: &CancellationToken,
    ) -> Result<Option<ParseStats>> {
        self.parse(source, cancel, |entry| {
            if entry.skip_worktree() {
                Ok(false)
            } else {
                Ok(modified_paths.try_add(&entry.path_lossy(), false))
            }
        })
    }
}

/// Entries git leaves to the virtualization layer: skip-worktree entries, and
/// the "theirs" side of an unresolved merge.
#[inline]
pub fn is_projected(entry: &IndexEntry) -> bool {
    entry.skip_worktree() || entry.merge_stage() == MergeStage::Theirs
}
