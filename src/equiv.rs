//! Equivalent CPU id resolution.
//!
//! Microcode patches do not name the processors they apply to by CPUID
//! signature but by an "equivalent CPU id" (the `processor_rev_id` of the
//! patch header), which denotes the format of the microcode engine
//! internals. Several signatures can map to one id when processor lines
//! share identical microcode facilities. The mapping cannot be computed, it
//! is only available from the equivalence table at the start of each
//! container.

use core::sync::atomic::{AtomicU64, Ordering};

use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{Result, UcodeError};

/// One row of a container's equivalence table.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug)]
pub struct EquivCpuEntry {
    pub installed_cpu: U32,
    pub fixed_errata_mask: U32,
    pub fixed_errata_compare: U32,
    pub equiv_cpu: U16,
    pub reserved: U16,
}

const _: () = assert!(size_of::<EquivCpuEntry>() == 16);

impl EquivCpuEntry {
    pub const SIZE: usize = size_of::<Self>();

    pub fn new(installed_cpu: u32, equiv_cpu: u16) -> Self {
        Self {
            installed_cpu: U32::new(installed_cpu),
            fixed_errata_mask: U32::ZERO,
            fixed_errata_compare: U32::ZERO,
            equiv_cpu: U16::new(equiv_cpu),
            reserved: U16::ZERO,
        }
    }

    /// The all-zero entry that terminates a table.
    pub fn terminator() -> Self {
        Self::new(0, 0)
    }

    fn is_terminator(&self) -> bool {
        self.installed_cpu.get() == 0
    }
}

/// The `(signature, equivalent id)` pair of the processors in this system.
///
/// Set at most once, by the first table that lists the running processor,
/// and never changed afterwards. Later tables that disagree are rejected.
///
/// This assumes a homogeneous system: exactly one signature/id pair is ever
/// cached. A machine mixing processors with different signatures fails to
/// parse on every CPU but the one that won the race to fill the binding.
#[derive(Debug, Default)]
pub struct EquivBinding {
    // `sig << 16 | id`, 0 while unset. A valid signature is never 0 since
    // 0 is the table terminator.
    packed: AtomicU64,
}

/// Outcome of looking the running processor up in one equivalence table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TableLookup {
    /// First successful lookup in this process; the binding was set.
    Resolved(u16),
    /// Found, and it agrees with the cached binding.
    Confirmed(u16),
    /// The table is well formed but does not list this processor.
    NotFound,
}

impl EquivBinding {
    pub const fn new() -> Self {
        Self {
            packed: AtomicU64::new(0),
        }
    }

    const fn pack(sig: u32, id: u16) -> u64 {
        ((sig as u64) << 16) | id as u64
    }

    /// The cached `(sig, equiv_id)`, if any.
    pub fn get(&self) -> Option<(u32, u16)> {
        match self.packed.load(Ordering::Acquire) {
            0 => None,
            packed => Some(((packed >> 16) as u32, packed as u16)),
        }
    }

    /// The cached equivalent id, if it was resolved for `sig`.
    pub fn id_for(&self, sig: u32) -> Option<u16> {
        self.get()
            .and_then(|(cached_sig, id)| (cached_sig == sig).then_some(id))
    }

    /// Record `sig -> id` unless something is already recorded.
    ///
    /// Returns the lookup result, or [`UcodeError::ConflictingEquivalence`]
    /// if a different pair won.
    fn bind(&self, sig: u32, id: u16) -> Result<TableLookup> {
        let new = Self::pack(sig, id);
        match self
            .packed
            .compare_exchange(0, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(TableLookup::Resolved(id)),
            Err(current) if current == new => Ok(TableLookup::Confirmed(id)),
            Err(current) => Err(UcodeError::ConflictingEquivalence {
                sig,
                table_id: id,
                cached_id: current as u16,
            }),
        }
    }

    /// Search the payload of an equivalence-table section for `sig`.
    ///
    /// The table is validated before the search: its length must be a
    /// non-zero multiple of the entry size and its last entry must be the
    /// terminator.
    pub(crate) fn lookup(&self, table: &[u8], sig: u32) -> Result<TableLookup> {
        let entries = <[EquivCpuEntry]>::ref_from_bytes(table)
            .map_err(|_| UcodeError::MalformedEquivalenceTable)?;

        match entries.last() {
            Some(last) if last.is_terminator() => {}
            _ => return Err(UcodeError::MalformedEquivalenceTable),
        }

        // First match wins if a signature is listed twice.
        let found = entries
            .iter()
            .take_while(|entry| !entry.is_terminator())
            .find(|entry| entry.installed_cpu.get() == sig);

        match found {
            Some(entry) => self.bind(sig, entry.equiv_cpu.get()).inspect_err(|err| {
                error!("[ucode] {err}");
            }),
            None => Ok(TableLookup::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn table(entries: &[EquivCpuEntry]) -> Vec<u8> {
        entries.iter().flat_map(|e| e.as_bytes().iter().copied()).collect()
    }

    #[test]
    fn test_lookup_resolves_then_confirms() {
        let binding = EquivBinding::new();
        let t = table(&[
            EquivCpuEntry::new(0x0010_0f22, 0x1020),
            EquivCpuEntry::new(0x0010_0f42, 0x1022),
            EquivCpuEntry::terminator(),
        ]);

        assert_eq!(binding.get(), None);
        assert_eq!(
            binding.lookup(&t, 0x0010_0f42),
            Ok(TableLookup::Resolved(0x1022))
        );
        assert_eq!(binding.get(), Some((0x0010_0f42, 0x1022)));
        assert_eq!(
            binding.lookup(&t, 0x0010_0f42),
            Ok(TableLookup::Confirmed(0x1022))
        );
        assert_eq!(binding.id_for(0x0010_0f42), Some(0x1022));
        assert_eq!(binding.id_for(0x0010_0f22), None);
    }

    #[test]
    fn test_lookup_conflict() {
        let binding = EquivBinding::new();
        let first = table(&[
            EquivCpuEntry::new(0x0010_0f42, 0x1022),
            EquivCpuEntry::terminator(),
        ]);
        let second = table(&[
            EquivCpuEntry::new(0x0010_0f42, 0x1041),
            EquivCpuEntry::terminator(),
        ]);

        binding.lookup(&first, 0x0010_0f42).unwrap();
        assert_eq!(
            binding.lookup(&second, 0x0010_0f42),
            Err(UcodeError::ConflictingEquivalence {
                sig: 0x0010_0f42,
                table_id: 0x1041,
                cached_id: 0x1022,
            })
        );
        assert_eq!(binding.get(), Some((0x0010_0f42, 0x1022)));
    }

    #[test]
    fn test_lookup_not_found_leaves_binding_unset() {
        let binding = EquivBinding::new();
        let t = table(&[
            EquivCpuEntry::new(0x0060_0f12, 0x6012),
            EquivCpuEntry::terminator(),
        ]);
        assert_eq!(binding.lookup(&t, 0x0010_0f42), Ok(TableLookup::NotFound));
        assert_eq!(binding.get(), None);
    }

    #[test]
    fn test_lookup_first_match_wins() {
        let binding = EquivBinding::new();
        let t = table(&[
            EquivCpuEntry::new(0x0010_0f42, 0x1022),
            EquivCpuEntry::new(0x0010_0f42, 0x1099),
            EquivCpuEntry::terminator(),
        ]);
        assert_eq!(
            binding.lookup(&t, 0x0010_0f42),
            Ok(TableLookup::Resolved(0x1022))
        );
    }

    #[test]
    fn test_lookup_stops_at_terminator() {
        let binding = EquivBinding::new();
        // Entries after an early terminator are not searched.
        let t = table(&[
            EquivCpuEntry::terminator(),
            EquivCpuEntry::new(0x0010_0f42, 0x1022),
            EquivCpuEntry::terminator(),
        ]);
        assert_eq!(binding.lookup(&t, 0x0010_0f42), Ok(TableLookup::NotFound));
    }

    #[test]
    fn test_lookup_rejects_malformed_tables() {
        let binding = EquivBinding::new();

        assert_eq!(
            binding.lookup(&[], 0x0010_0f42),
            Err(UcodeError::MalformedEquivalenceTable)
        );

        let mut misaligned = table(&[
            EquivCpuEntry::new(0x0010_0f42, 0x1022),
            EquivCpuEntry::terminator(),
        ]);
        misaligned.push(0);
        assert_eq!(
            binding.lookup(&misaligned, 0x0010_0f42),
            Err(UcodeError::MalformedEquivalenceTable)
        );

        // Terminator present, but not last.
        let unterminated = table(&[
            EquivCpuEntry::terminator(),
            EquivCpuEntry::new(0x0010_0f42, 0x1022),
        ]);
        assert_eq!(
            binding.lookup(&unterminated, 0x0010_0f42),
            Err(UcodeError::MalformedEquivalenceTable)
        );
        assert_eq!(binding.get(), None);
    }

    #[test]
    fn test_racing_binders_agree_on_one_winner() {
        use std::sync::Arc;
        use std::thread;

        let binding = Arc::new(EquivBinding::new());
        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let binding = Arc::clone(&binding);
                thread::spawn(move || {
                    let t = table(&[
                        EquivCpuEntry::new(0x0010_0f42, 0x1000 + i % 2),
                        EquivCpuEntry::terminator(),
                    ]);
                    binding.lookup(&t, 0x0010_0f42)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let (_, winner) = binding.get().unwrap();

        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Ok(TableLookup::Resolved(_))))
                .count(),
            1
        );
        for r in results {
            match r {
                Ok(TableLookup::Resolved(id)) | Ok(TableLookup::Confirmed(id)) => {
                    assert_eq!(id, winner)
                }
                Err(UcodeError::ConflictingEquivalence { cached_id, .. }) => {
                    assert_eq!(cached_id, winner)
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
