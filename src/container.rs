//! Container layout and the search for the sub-container that lists the
//! running processor.
//!
//! ```text
//! magic | 0 | len | equivalence table | 1 | len | patch | 1 | len | patch | ...
//! ```
//!
//! Vendor files may hold several such containers back to back.

use crate::cursor::{Cursor, SectionHeader};
use crate::equiv::{EquivBinding, TableLookup};
use crate::error::{Result, UcodeError};
use crate::patch::PATCH_HDR_SIZE;

/// `"DMA\0"` read as a little-endian `u32`.
pub const CONTAINER_MAGIC: u32 = 0x0041_4d44;
/// Section type of an equivalence table.
pub const EQUIV_TABLE_TYPE: u32 = 0x0000_0000;
/// Section type of a microcode patch.
pub const PATCH_TYPE: u32 = 0x0000_0001;
/// `type(4) | len(4)`.
pub const SECTION_HDR_SIZE: usize = SectionHeader::SIZE;

/// Magic plus the section header of the equivalence table.
const CONT_HDR_SIZE: usize = 4 + SECTION_HDR_SIZE;

/// Result of skipping the patches of a sub-container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FastForward {
    /// The cursor is at the magic of the next sub-container.
    NextContainer,
    /// The blob ended cleanly after the last patch.
    NoMoreData,
}

/// Parse the equivalence table of the sub-container at the cursor.
///
/// The cursor ends up past the table even when the table contents are
/// malformed, so the caller may skip to the next sub-container.
fn scan_equiv_table(cursor: &mut Cursor<'_>, sig: u32, equiv: &EquivBinding) -> Result<TableLookup> {
    if cursor.peek_u32(0) != Some(CONTAINER_MAGIC) {
        error!("[ucode] wrong microcode patch file magic");
        return Err(UcodeError::MalformedContainer("bad magic"));
    }

    let section = match cursor.section_header_at(4) {
        Some(section) if cursor.remaining() - CONT_HDR_SIZE >= section.len as usize => section,
        _ => {
            warn!("[ucode] no space for equivalent cpu table");
            return Err(UcodeError::MalformedContainer("no space for equivalence table"));
        }
    };

    let table = cursor
        .peek_bytes(CONT_HDR_SIZE, section.len as usize)
        .ok_or(UcodeError::MalformedContainer("no space for equivalence table"))?;
    cursor
        .advance(CONT_HDR_SIZE + table.len())
        .ok_or(UcodeError::MalformedContainer("no space for equivalence table"))?;

    if section.kind != EQUIV_TABLE_TYPE {
        error!("[ucode] wrong microcode equivalent cpu table type field");
        return Err(UcodeError::MalformedContainer("wrong equivalence table type"));
    }

    equiv.lookup(table, sig).inspect_err(|err| {
        if *err == UcodeError::MalformedEquivalenceTable {
            error!("[ucode] wrong microcode equivalent cpu table length");
        }
    })
}

/// Skip patch sections until the next sub-container or the end of the blob.
fn fast_forward(cursor: &mut Cursor<'_>) -> Result<FastForward> {
    if cursor.is_exhausted() {
        return Ok(FastForward::NoMoreData);
    }

    loop {
        let header = cursor
            .peek_section_header()
            .ok_or(UcodeError::MalformedContainer("truncated section header"))?;

        if header.kind == CONTAINER_MAGIC && header.len == EQUIV_TABLE_TYPE {
            return Ok(FastForward::NextContainer);
        }

        if header.kind != PATCH_TYPE {
            return Err(UcodeError::MalformedContainer("unexpected section type"));
        }

        let size = header.len as usize + SECTION_HDR_SIZE;
        if size < PATCH_HDR_SIZE || cursor.remaining() < size {
            return Err(UcodeError::MalformedContainer("truncated patch section"));
        }

        trace!(
            "[ucode] skipping patch section at {:#x} ({} bytes)",
            cursor.offset(),
            size
        );
        cursor
            .advance(size)
            .ok_or(UcodeError::MalformedContainer("truncated patch section"))?;

        if cursor.is_exhausted() {
            return Ok(FastForward::NoMoreData);
        }
    }
}

/// Position the cursor at the first patch of the sub-container whose
/// equivalence table lists `sig`, resolving the equivalence binding on the
/// way.
///
/// Returns the equivalent id, or the reason no sub-container matched:
/// [`UcodeError::NoApplicablePatch`] if the blob is well formed but does not
/// list this processor, [`UcodeError::MalformedEquivalenceTable`] if a table
/// was skipped as malformed and nothing later matched. Every other error
/// aborts the search immediately.
pub(crate) fn find_matching_container(
    cursor: &mut Cursor<'_>,
    sig: u32,
    equiv: &EquivBinding,
    cpu: usize,
) -> Result<u16> {
    let mut skipped = None;

    while !cursor.is_exhausted() {
        match scan_equiv_table(cursor, sig, equiv) {
            Ok(TableLookup::Resolved(id)) => {
                info!("[ucode] CPU{cpu} sig {sig:#x} uses equivalent id {id:#06x}");
                return Ok(id);
            }
            Ok(TableLookup::Confirmed(id)) => return Ok(id),
            Ok(TableLookup::NotFound) => {}
            Err(err @ UcodeError::MalformedEquivalenceTable) => skipped = Some(err),
            Err(err) => return Err(err),
        }

        match fast_forward(cursor) {
            Ok(FastForward::NextContainer) => {}
            Ok(FastForward::NoMoreData) => break,
            Err(err) => {
                error!("[ucode] CPU{cpu} incorrect or corrupt container file: {err}");
                return Err(err);
            }
        }
    }

    Err(skipped.unwrap_or(UcodeError::NoApplicablePatch))
}
