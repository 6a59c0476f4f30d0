use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use memory_addr::VirtAddr;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::container::PATCH_TYPE;
use crate::cursor::{Cursor, SectionHeader};
use crate::equiv::EquivBinding;
use crate::error::{Result, UcodeError};
use crate::signature::CpuSignature;

/// Size of the fixed part of [`PatchHeader`] that every patch must carry.
pub const PATCH_HDR_SIZE: usize = 32;

/// Header at the start of every microcode patch.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug)]
pub struct PatchHeader {
    pub data_code: U32,
    /// Revision the processor reports once this patch is loaded.
    pub patch_id: U32,
    pub mc_patch_data_id: [u8; 2],
    pub mc_patch_data_len: u8,
    pub init_flag: u8,
    pub mc_patch_data_checksum: U32,
    pub nb_dev_id: U32,
    pub sb_dev_id: U32,
    /// Equivalent CPU id this patch targets.
    pub processor_rev_id: U16,
    pub nb_rev_id: u8,
    pub sb_rev_id: u8,
    pub bios_api_rev: u8,
    pub reserved1: [u8; 3],
}

const _: () = assert!(size_of::<PatchHeader>() == PATCH_HDR_SIZE);

/// Length of a header followed by the eight match registers.
const MATCH_REG_END: usize = PATCH_HDR_SIZE + 8 * 4;

/// Largest patch accepted for a processor family (AMD "MPB max size").
pub const fn max_patch_size(family: u32) -> u32 {
    match family {
        0x14 => 1824,
        0x15 => 4096,
        0x16 => 3458,
        0x17 => 3200,
        _ => 2048,
    }
}

/// Fitness of a patch for the running processor, or of one patch relative
/// to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// Targets a different equivalent CPU id.
    NoMatch,
    /// Right processor, but not newer than what is loaded.
    TooOld,
    /// Right processor and newer.
    Applicable,
}

/// One microcode patch copied out of a container.
///
/// The buffer holds exactly the section payload: [`PatchHeader`] followed by
/// the patch body. It is released when the patch is dropped.
pub struct MicrocodePatch {
    header: PatchHeader,
    data: Box<[u8]>,
}

impl MicrocodePatch {
    /// Copy the patch section at the cursor and step over it.
    ///
    /// `family` selects the size limit.
    pub(crate) fn extract(cursor: &mut Cursor<'_>, family: u32) -> Result<Self> {
        if cursor.is_exhausted() {
            error!("[ucode] microcode buffer overrun");
            return Err(UcodeError::MalformedContainer("buffer overrun"));
        }

        let section = cursor
            .peek_section_header()
            .ok_or(UcodeError::MalformedContainer("truncated section header"))?;

        if section.kind != PATCH_TYPE {
            error!("[ucode] wrong microcode payload type field");
            return Err(UcodeError::MalformedContainer("wrong payload type"));
        }

        let payload = cursor
            .peek_bytes(SectionHeader::SIZE, section.len as usize)
            .ok_or_else(|| {
                error!("[ucode] bad data in microcode data file");
                UcodeError::MalformedContainer("bad data")
            })?;

        let max = max_patch_size(family);
        if section.len > max {
            error!("[ucode] patch size mismatch");
            return Err(UcodeError::PatchTooLarge {
                len: section.len,
                max,
            });
        }

        let patch = Self::from_bytes(payload)?;

        debug!(
            "[ucode] size {}, block size {} offset {} equivID {:#x} rev {:#x}",
            cursor.len(),
            section.len,
            cursor.offset(),
            patch.equiv_id(),
            patch.patch_id()
        );

        cursor
            .advance(SectionHeader::SIZE + payload.len())
            .ok_or(UcodeError::MalformedContainer("bad data"))?;

        Ok(patch)
    }

    /// Copy a patch out of `bytes`, which must start with a [`PatchHeader`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (header, _) = PatchHeader::read_from_prefix(bytes)
            .map_err(|_| UcodeError::MalformedContainer("truncated patch header"))?;

        let mut data = Vec::new();
        data.try_reserve_exact(bytes.len())
            .map_err(|_| UcodeError::AllocationFailure)?;
        data.extend_from_slice(bytes);

        #[cfg(test)]
        crate::tests::live::inc();

        Ok(Self {
            header,
            data: data.into_boxed_slice(),
        })
    }

    pub fn header(&self) -> &PatchHeader {
        &self.header
    }

    pub fn patch_id(&self) -> u32 {
        self.header().patch_id.get()
    }

    pub fn equiv_id(&self) -> u16 {
        self.header().processor_rev_id.get()
    }

    /// The eight match registers, if the patch is long enough to hold them.
    pub fn match_reg(&self) -> Option<[u32; 8]> {
        let bytes = self.data.get(PATCH_HDR_SIZE..MATCH_REG_END)?;
        let regs = <[U32; 8]>::read_from_bytes(bytes).ok()?;
        Some(regs.map(U32::get))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Linear address of the header, as written to `MSR_AMD_PATCHLOADER`.
    pub fn load_address(&self) -> VirtAddr {
        VirtAddr::from(self.data.as_ptr() as usize)
    }

    /// Fitness of this patch for the CPU described by `sig`.
    pub fn fits(&self, sig: &CpuSignature, equiv: &EquivBinding) -> MatchResult {
        if equiv.id_for(sig.sig) != Some(self.equiv_id()) {
            return MatchResult::NoMatch;
        }

        if self.patch_id() <= sig.rev {
            trace!("[ucode] patch is already at required level or greater");
            return MatchResult::TooOld;
        }

        MatchResult::Applicable
    }

    /// Compare two patches for the same processor by revision.
    pub fn compare(&self, old: &MicrocodePatch) -> MatchResult {
        if self.equiv_id() != old.equiv_id() {
            return MatchResult::NoMatch;
        }
        if self.patch_id() > old.patch_id() {
            MatchResult::Applicable
        } else {
            MatchResult::TooOld
        }
    }
}

impl fmt::Debug for MicrocodePatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicrocodePatch")
            .field("patch_id", &format_args!("{:#010x}", self.patch_id()))
            .field("equiv_id", &format_args!("{:#06x}", self.equiv_id()))
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for MicrocodePatch {
    fn drop(&mut self) {
        #[cfg(test)]
        crate::tests::live::dec();

        debug!(
            "[ucode] released patch {:#x} ({} bytes)",
            self.patch_id(),
            self.data.len()
        );
    }
}
