use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use memory_addr::VirtAddr;

use crate::msr::{CpuAccess, Msr, MsrFault};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    /// Behave like hardware: the patch level becomes the loaded patch id.
    Apply,
    /// Accept the write but keep the old patch level.
    Ignore,
    /// Raise #GP.
    Fault,
}

/// A single CPU whose MSR traffic is recorded.
#[derive(Debug)]
pub struct MockCpu {
    sig: u32,
    rev: Cell<u32>,
    load_mode: Cell<LoadMode>,
    fail_reads: Cell<bool>,
    loads: RefCell<Vec<u64>>,
    flushes: RefCell<Vec<(usize, usize)>>,
}

impl MockCpu {
    pub fn new(sig: u32, rev: u32) -> Self {
        Self {
            sig,
            rev: Cell::new(rev),
            load_mode: Cell::new(LoadMode::Apply),
            fail_reads: Cell::new(false),
            loads: RefCell::new(Vec::new()),
            flushes: RefCell::new(Vec::new()),
        }
    }

    pub fn ignore_loads(&self) {
        self.load_mode.set(LoadMode::Ignore);
    }

    pub fn fail_loads(&self) {
        self.load_mode.set(LoadMode::Fault);
    }

    pub fn fail_reads(&self) {
        self.fail_reads.set(true);
    }

    /// Values written to `MSR_AMD_PATCHLOADER`.
    pub fn loads(&self) -> Vec<u64> {
        self.loads.borrow().clone()
    }

    /// `(start, size)` of every TLB flush.
    pub fn flushes(&self) -> Vec<(usize, usize)> {
        self.flushes.borrow().clone()
    }

    pub fn patch_level(&self) -> u32 {
        self.rev.get()
    }
}

impl CpuAccess for MockCpu {
    fn cpu_id(&self) -> usize {
        0
    }

    fn cpuid_signature(&self) -> u32 {
        self.sig
    }

    fn rdmsr_safe(&self, msr: Msr) -> Result<u64, MsrFault> {
        match msr {
            Msr::AMD_PATCHLEVEL if !self.fail_reads.get() => Ok(self.rev.get() as u64),
            _ => Err(MsrFault { msr: msr as u32 }),
        }
    }

    fn wrmsr_safe(&self, msr: Msr, value: u64) -> Result<(), MsrFault> {
        if msr != Msr::AMD_PATCHLOADER {
            return Err(MsrFault { msr: msr as u32 });
        }
        self.loads.borrow_mut().push(value);

        match self.load_mode.get() {
            LoadMode::Apply => {
                // The loader only ever hands out addresses of live patches.
                let patch_id =
                    unsafe { core::ptr::read_unaligned((value as usize + 4) as *const u32) };
                self.rev.set(u32::from_le(patch_id));
                Ok(())
            }
            LoadMode::Ignore => Ok(()),
            LoadMode::Fault => Err(MsrFault { msr: msr as u32 }),
        }
    }

    fn flush_local(&self, start: VirtAddr, size: usize) {
        self.flushes.borrow_mut().push((start.as_usize(), size));
    }
}
