//! Bounds-checked reader over an untrusted microcode blob.
//!
//! Every read first checks that enough bytes remain; nothing here can index
//! past the end of the buffer.

use zerocopy::FromBytes;
use zerocopy::little_endian::U32;

/// `type(4) | len(4)` in front of every section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SectionHeader {
    pub kind: u32,
    pub len: u32,
}

impl SectionHeader {
    pub const SIZE: usize = 8;
}

#[derive(Debug, Clone)]
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.offset)
    }

    pub fn is_exhausted(&self) -> bool {
        self.offset >= self.buf.len()
    }

    /// Little-endian `u32` at `offset + rel`, if it lies in the buffer.
    pub fn peek_u32(&self, rel: usize) -> Option<u32> {
        let start = self.offset.checked_add(rel)?;
        let bytes = self.buf.get(start..start.checked_add(4)?)?;
        U32::read_from_bytes(bytes).ok().map(U32::get)
    }

    pub fn peek_section_header(&self) -> Option<SectionHeader> {
        self.section_header_at(0)
    }

    pub fn section_header_at(&self, rel: usize) -> Option<SectionHeader> {
        Some(SectionHeader {
            kind: self.peek_u32(rel)?,
            len: self.peek_u32(rel.checked_add(4)?)?,
        })
    }

    /// `len` bytes at `offset + rel`, without moving the cursor.
    pub fn peek_bytes(&self, rel: usize, len: usize) -> Option<&'a [u8]> {
        let start = self.offset.checked_add(rel)?;
        self.buf.get(start..start.checked_add(len)?)
    }

    /// Move forward by `n` bytes. Fails without moving if fewer remain.
    pub fn advance(&mut self, n: usize) -> Option<()> {
        if n > self.remaining() {
            return None;
        }
        self.offset += n;
        Some(())
    }
}
