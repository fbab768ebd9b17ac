//! On-disk layout of git index version 4.
//!
//! ```text
//! header:  "DIRC" | version u32 | entry count u32
//! entry:   stat block (40 bytes, ignored)
//!          object id (20 bytes)
//!          flags u16  (assume-valid 0x8000, extended 0x4000, stage 0x3000, length 0x0FFF)
//!          [extended flags u16 when extended] (skip-worktree 0x4000, intent-to-add 0x2000)
//!          varint N: bytes to strip from the end of the previous path
//!          NUL-terminated path suffix
//! ```

use bitflags::bitflags;

pub const INDEX_SIGNATURE: [u8; 4] = *b"DIRC";
pub const INDEX_VERSION: u32 = 4;

/// ctime, mtime (8 bytes each), dev, ino, mode, uid, gid, size (4 bytes each).
pub const STAT_BLOCK_LEN: usize = 40;

pub const PATH_LENGTH_MASK: u16 = 0x0FFF;
pub const STAGE_MASK: u16 = 0x3000;
pub const STAGE_SHIFT: u16 = 12;

bitflags! {
    /// Flag bits of the primary 16-bit flags word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u16 {
        const ASSUME_VALID = 0x8000;
        const EXTENDED = 0x4000;
    }
}

bitflags! {
    /// Flag bits of the extended flags word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExtendedFlags: u16 {
        const SKIP_WORKTREE = 0x4000;
        const INTENT_TO_ADD = 0x2000;
    }
}

/// Merge stage of an entry. Stage 0 is a normal, unconflicted entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MergeStage {
    #[default]
    Normal = 0,
    CommonAncestor = 1,
    Ours = 2,
    Theirs = 3,
}

impl MergeStage {
    /// Extracts the stage from a flags word.
    #[inline]
    pub fn from_flags(flags: u16) -> Self {
        match (flags & STAGE_MASK) >> STAGE_SHIFT {
            0 => Self::Normal,
            1 => Self::CommonAncestor,
            2 => Self::Ours,
            _ => Self::Theirs,
        }
    }

    #[inline]
    pub fn to_flags(self) -> u16 {
        (self as u16) << STAGE_SHIFT
    }
}
