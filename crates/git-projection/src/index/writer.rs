//! Version 4 index encoder.
//!
//! Produces index bytes with prefix-compressed paths so tests and tooling can
//! hand the parser realistic input. Stat data is zeroed and the trailing
//! checksum is left blank; the parser ignores both.

use std::fs;
use std::path::Path;

use super::format::{
    EntryFlags, ExtendedFlags, MergeStage, INDEX_SIGNATURE, INDEX_VERSION, PATH_LENGTH_MASK,
    STAT_BLOCK_LEN,
};
use crate::error::Result;
use crate::object_id::ObjectId;

#[derive(Debug, Clone)]
pub struct WriterEntry {
    pub path: Vec<u8>,
    pub hash: ObjectId,
    pub skip_worktree: bool,
    pub stage: MergeStage,
}

impl WriterEntry {
    /// A normal, skip-worktree entry: the common case in a virtualized repo.
    pub fn new(path: impl Into<Vec<u8>>, hash: ObjectId) -> Self {
        Self {
            path: path.into(),
            hash,
            skip_worktree: true,
            stage: MergeStage::Normal,
        }
    }

    pub fn with_skip_worktree(mut self, skip_worktree: bool) -> Self {
        self.skip_worktree = skip_worktree;
        self
    }

    pub fn with_stage(mut self, stage: MergeStage) -> Self {
        self.stage = stage;
        self
    }
}

#[derive(Debug, Default)]
pub struct IndexWriter {
    entries: Vec<WriterEntry>,
}

impl IndexWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry. Entries must be pushed in git's path order.
    pub fn push(&mut self, entry: WriterEntry) -> &mut Self {
        self.entries.push(entry);
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.entries.len() * 80);
        out.extend_from_slice(&INDEX_SIGNATURE);
        out.extend_from_slice(&INDEX_VERSION.to_be_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());

        let mut previous: &[u8] = &[];
        for entry in &self.entries {
            out.extend_from_slice(&[0u8; STAT_BLOCK_LEN]);
            out.extend_from_slice(entry.hash.as_bytes());

            let mut extended = ExtendedFlags::empty();
            extended.set(ExtendedFlags::SKIP_WORKTREE, entry.skip_worktree);

            let mut flags = EntryFlags::empty();
            flags.set(EntryFlags::EXTENDED, !extended.is_empty());
            let length = entry.path.len().min(PATH_LENGTH_MASK as usize) as u16;
            let word = flags.bits() | entry.stage.to_flags() | length;
            out.extend_from_slice(&word.to_be_bytes());
            if !extended.is_empty() {
                out.extend_from_slice(&extended.bits().to_be_bytes());
            }

            let common = previous
                .iter()
                .zip(entry.path.iter())
                .take_while(|(a, b)| a == b)
                .count();
            out.extend_from_slice(&encode_offset_varint((previous.len() - common) as u64));
            out.extend_from_slice(&entry.path[common..]);
            out.push(0);

            previous = &entry.path;
        }

        out.extend_from_slice(&[0u8; 20]);
        out
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_bytes())?;
        Ok(())
    }
}

/// Encodes a value with git's offset varint scheme.
pub fn encode_offset_varint(mut value: u64) -> Vec<u8> {
    let mut buf = [0u8; 16];
    let mut pos = buf.len() - 1;
    buf[pos] = (value & 0x7F) as u8;
    value >>= 7;
    while value != 0 {
        value -= 1;
        pos -= 1;
        buf[pos] = 0x80 | (value & 0x7F) as u8;
        value >>= 7;
    }
    buf[pos..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_prefix_compression() {
        let hash = ObjectId::from_bytes([1; 20]);
        let mut writer = IndexWriter::new();
        writer
            .push(WriterEntry::new("src/lib.rs", hash))
            .push(WriterEntry::new("src/main.rs", hash).with_skip_worktree(false));
        let bytes = writer.to_bytes();

        assert_eq!(&bytes[0..4], b"DIRC");
        assert_eq!(u32::from_be_bytes(bytes[4..8].try_into().unwrap()), 4);
        assert_eq!(u32::from_be_bytes(bytes[8..12].try_into().unwrap()), 2);

        // First entry: stat, hash, flags, extended flags, varint 0, "src/lib.rs\0".
        let first = 12 + STAT_BLOCK_LEN + 20;
        let flags = u16::from_be_bytes([bytes[first], bytes[first + 1]]);
        assert_eq!(flags, 0x4000 | 10);
        assert_eq!(bytes[first + 4], 0);
        assert_eq!(&bytes[first + 5..first + 15], b"src/lib.rs");

        // Second entry strips "lib.rs" (6 bytes) and appends "main.rs".
        let second = first + 16 + STAT_BLOCK_LEN + 20;
        let flags = u16::from_be_bytes([bytes[second], bytes[second + 1]]);
        assert_eq!(flags, 11);
        assert_eq!(bytes[second + 2], 6);
        assert_eq!(&bytes[second + 3..second + 10], b"main.rs");
    }
}
