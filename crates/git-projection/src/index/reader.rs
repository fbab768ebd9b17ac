//! Page-buffered reader for the index stream.
//!
//! The index is read through a single fixed-size page so that decoding one
//! entry never issues its own I/O call. Multi-byte fields that straddle a page
//! boundary are assembled transparently.

use std::io::{self, Read};

use crate::error::{ProjectionError, Result};

/// Default page size (512 KiB).
pub const DEFAULT_PAGE_SIZE: usize = 512 * 1024;

/// Smallest page that still holds a whole stat block plus hash.
const MIN_PAGE_SIZE: usize = 64;

pub struct PagedReader<R> {
    inner: R,
    page: Box<[u8]>,
    pos: usize,
    filled: usize,
    /// Bytes consumed before the current page.
    page_start: u64,
}

impl<R: Read> PagedReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_page_size(inner, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(inner: R, page_size: usize) -> Self {
        Self {
            inner,
            page: vec![0u8; page_size.max(MIN_PAGE_SIZE)].into_boxed_slice(),
            pos: 0,
            filled: 0,
            page_start: 0,
        }
    }

    /// Total bytes consumed from the stream.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.page_start + self.pos as u64
    }

    #[inline]
    fn available(&self) -> &[u8] {
        &self.page[self.pos..self.filled]
    }

    /// Loads the next page once the current one is exhausted.
    fn fill(&mut self) -> Result<()> {
        if self.pos < self.filled {
            return Ok(());
        }
        self.page_start += self.filled as u64;
        self.pos = 0;
        self.filled = 0;
        loop {
            match self.inner.read(&mut self.page) {
                Ok(0) => {
                    return Err(ProjectionError::UnexpectedEof {
                        offset: self.page_start,
                    })
                }
                Ok(read) => {
                    self.filled = read;
                    return Ok(());
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        self.fill()?;
        let byte = self.page[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    pub fn read_u32_be(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    /// Fills `out` completely, crossing page boundaries as needed.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        if self.available().len() >= out.len() {
            out.copy_from_slice(&self.page[self.pos..self.pos + out.len()]);
            self.pos += out.len();
            return Ok(());
        }

        let mut written = 0;
        while written < out.len() {
            self.fill()?;
            let take = self.available().len().min(out.len() - written);
            out[written..written + take].copy_from_slice(&self.page[self.pos..self.pos + take]);
            self.pos += take;
            written += take;
        }
        Ok(())
    }

    /// Skips `count` bytes.
    pub fn skip(&mut self, mut count: usize) -> Result<()> {
        while count > 0 {
            self.fill()?;
            let take = self.available().len().min(count);
            self.pos += take;
            count -= take;
        }
        Ok(())
    }

    /// Appends bytes up to (not including) the next NUL to `out` and consumes
    /// the NUL.
    pub fn read_until_nul(&mut self, out: &mut Vec<u8>) -> Result<()> {
        loop {
            self.fill()?;
            let available = self.available();
            match memchr::memchr(0, available) {
                Some(end) => {
                    out.extend_from_slice(&available[..end]);
                    self.pos += end + 1;
                    return Ok(());
                }
                None => {
                    out.extend_from_slice(available);
                    self.pos = self.filled;
                }
            }
        }
    }

    /// Decodes git's offset varint: big-endian groups of 7 bits where each
    /// continuation also adds one, so every value has a single encoding.
    pub fn read_offset_varint(&mut self) -> Result<u64> {
        let mut byte = self.read_u8()?;
        let mut value = u64::from(byte & 0x7F);
        while byte & 0x80 != 0 {
            value = value
                .checked_add(1)
                .and_then(|v| v.checked_mul(128))
                .ok_or_else(|| {
                    ProjectionError::Format(format!(
                        "varint overflow at offset {}",
                        self.offset()
                    ))
                })?;
            byte = self.read_u8()?;
            value |= u64::from(byte & 0x7F);
        }
        Ok(value)
    }
}
