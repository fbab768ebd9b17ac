//! Git index decoding.
//!
//! - `format` - On-disk constants and flag types for index version 4
//! - `reader` - Page-buffered big-endian reader with boundary crossing
//! - `entry` - Reusable per-entry state (path buffer, flags, parent cache)
//! - `parser` - Streaming decoder and the two entry policies
//! - `writer` - Version 4 encoder used to produce fixtures

mod entry;
mod format;
mod parser;
mod reader;
mod writer;

pub use entry::IndexEntry;
pub use format::{EntryFlags, ExtendedFlags, MergeStage, INDEX_SIGNATURE, INDEX_VERSION};
pub use parser::{IndexParser, ParseStats};
pub use reader::{PagedReader, DEFAULT_PAGE_SIZE};
pub use writer::{IndexWriter, WriterEntry};
