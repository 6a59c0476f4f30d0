use core::fmt;

use memory_addr::VirtAddr;

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// MSRs used by the microcode loader (AMD BKDG, "MSRs - MSR0000_xxxx / MSRC001_xxxx").
pub enum Msr {
    /// Patch level of the currently loaded microcode.
    AMD_PATCHLEVEL = 0x0000_008b,
    /// Writing the linear address of a patch triggers the update.
    AMD_PATCHLOADER = 0xc001_0020,
}
}

#[cfg(target_arch = "x86_64")]
impl Msr {
    /// Read 64 bits msr register.
    #[inline(always)]
    pub fn read(self) -> u64 {
        unsafe { x86::msr::rdmsr(self as _) }
    }

    /// Write 64 bits to msr register.
    ///
    /// # Safety
    ///
    /// The caller must ensure that this write operation has no unsafe side
    /// effects.
    #[inline(always)]
    pub unsafe fn write(self, value: u64) {
        unsafe { x86::msr::wrmsr(self as _, value) }
    }
}

/// A `rdmsr`/`wrmsr` raised #GP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsrFault {
    pub msr: u32,
}

impl fmt::Display for MsrFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#GP on msr {:#x}", self.msr)
    }
}

/// Access to the state of the processor the loader is running on.
///
/// Every call acts on the current logical CPU only. Implementations backed
/// by real hardware should recover from #GP on MSR accesses and report it as
/// [`MsrFault`] instead of crashing.
pub trait CpuAccess {
    /// Number of the current logical CPU, used in log messages.
    fn cpu_id(&self) -> usize;

    /// `CPUID.01H:EAX`.
    fn cpuid_signature(&self) -> u32;

    fn rdmsr_safe(&self, msr: Msr) -> Result<u64, MsrFault>;

    fn wrmsr_safe(&self, msr: Msr, value: u64) -> Result<(), MsrFault>;

    /// Invalidate local TLB entries (including global ones) covering
    /// `[start, start + size)`.
    fn flush_local(&self, start: VirtAddr, size: usize);
}
