//! [`CpuAccess`] on the bare processor.

use memory_addr::{MemoryAddr, PAGE_SIZE_4K, VirtAddr};
use raw_cpuid::CpuId;
use x86_64::instructions::tlb;

use crate::msr::{CpuAccess, Msr, MsrFault};

/// The processor this code runs on.
///
/// `rdmsr`/`wrmsr` are executed directly; a #GP they raise is not
/// recovered. Hosts with an exception fixup table should implement
/// [`CpuAccess`] themselves to report faults as [`MsrFault`].
#[derive(Debug, Clone, Copy)]
pub struct NativeCpu {
    cpu_id: usize,
}

impl NativeCpu {
    pub const fn new(cpu_id: usize) -> Self {
        Self { cpu_id }
    }
}

impl CpuAccess for NativeCpu {
    fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    fn cpuid_signature(&self) -> u32 {
        match CpuId::new().get_feature_info() {
            Some(f) => {
                (f.stepping_id() as u32)
                    | (f.base_model_id() as u32) << 4
                    | (f.base_family_id() as u32) << 8
                    | (f.extended_model_id() as u32) << 16
                    | (f.extended_family_id() as u32) << 20
            }
            None => 0,
        }
    }

    fn rdmsr_safe(&self, msr: Msr) -> Result<u64, MsrFault> {
        Ok(msr.read())
    }

    fn wrmsr_safe(&self, msr: Msr, value: u64) -> Result<(), MsrFault> {
        unsafe { msr.write(value) };
        Ok(())
    }

    fn flush_local(&self, start: VirtAddr, size: usize) {
        let end = (start + size).align_up_4k();
        let mut page = start.align_down_4k();
        // `invlpg` drops global entries for the page as well.
        while page < end {
            tlb::flush(x86_64::VirtAddr::new(page.as_usize() as u64));
            page = page + PAGE_SIZE_4K;
        }
    }
}
