use core::fmt;

use bit_field::BitField;

use crate::error::{Result, UcodeError};
use crate::msr::{CpuAccess, Msr};

/// Identity and microcode revision of one logical CPU.
///
/// The per-CPU copy is owned by the caller; [`apply`](crate::MicrocodeOps::apply_microcode)
/// refreshes `rev` after every load attempt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuSignature {
    /// `CPUID.01H:EAX`.
    pub sig: u32,
    /// Value of `MSR_AMD_PATCHLEVEL`.
    pub rev: u32,
}

impl CpuSignature {
    pub const fn new(sig: u32, rev: u32) -> Self {
        Self { sig, rev }
    }

    /// Read the signature and patch level of the current CPU.
    pub fn collect<C: CpuAccess>(cpu: &C) -> Result<Self> {
        let sig = cpu.cpuid_signature();
        let rev = cpu
            .rdmsr_safe(Msr::AMD_PATCHLEVEL)
            .map_err(|fault| UcodeError::RegisterReadFailed { msr: fault.msr })?;

        debug!(
            "[ucode] CPU{} collect_cpu_info: sig={:#x}, patch_id={:#x}",
            cpu.cpu_id(),
            sig,
            rev as u32
        );

        Ok(Self {
            sig,
            rev: rev as u32,
        })
    }

    fn base_family(&self) -> u32 {
        self.sig.get_bits(8..12)
    }

    /// Family. The extended family field only counts when the base family is 0xf.
    pub fn family(&self) -> u32 {
        match self.base_family() {
            0xf => 0xf + self.sig.get_bits(20..28),
            base => base,
        }
    }

    /// Model. The extended model field only counts when the base family is 0xf.
    pub fn model(&self) -> u32 {
        match self.base_family() {
            0xf => self.sig.get_bits(4..8) + (self.sig.get_bits(16..20) << 4),
            _ => self.sig.get_bits(4..8),
        }
    }

    pub fn stepping(&self) -> u32 {
        self.sig.get_bits(0..4)
    }
}

impl fmt::Display for CpuSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Family={:#04x}, Model={:#04x}, Stepping={:#04x}, Patch={:#010x}",
            self.family(),
            self.model(),
            self.stepping(),
            self.rev
        )
    }
}
