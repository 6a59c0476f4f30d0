use core::fmt;

use crate::equiv::EquivBinding;
use crate::error::{Result, UcodeError};
use crate::msr::{CpuAccess, Msr};
use crate::patch::{MatchResult, MicrocodePatch};
use crate::signature::CpuSignature;

/// Patch levels beyond which family 10h processors cannot reliably be
/// updated by an OS or hypervisor; updating them has been observed to hang
/// the system (SUSE bug 913996).
const FAM10H_FINAL_LEVELS: [u32; 3] = [0x0100_0098, 0x0100_009f, 0x0100_00af];

/// Returns `true` if the processor described by `sig` must not be updated.
pub fn is_unsafe_revision(sig: &CpuSignature) -> bool {
    sig.family() == 0x10 && FAM10H_FINAL_LEVELS.contains(&sig.rev)
}

/// A successful update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateReport {
    pub cpu: usize,
    pub old_rev: u32,
    pub new_rev: u32,
}

impl fmt::Display for UpdateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CPU{} updated from revision {:#x} to {:#x}",
            self.cpu, self.old_rev, self.new_rev
        )
    }
}

/// Load `patch` into the current processor.
///
/// Fitness is checked again against `sig`, the caller's per-CPU record, and
/// not taken from the time the patch was selected. `sig.rev` holds the patch
/// level read back from hardware once a load was attempted, whether or not it
/// succeeded.
pub(crate) fn apply_microcode<C: CpuAccess>(
    cpu: &C,
    equiv: &EquivBinding,
    sig: &mut CpuSignature,
    patch: Option<&MicrocodePatch>,
) -> Result<UpdateReport> {
    let cpu_id = cpu.cpu_id();
    let old_rev = sig.rev;

    let patch = match patch {
        Some(patch) if patch.fits(sig, equiv) == MatchResult::Applicable => patch,
        _ => return Err(UcodeError::NotApplicableAtApplyTime),
    };

    if is_unsafe_revision(sig) {
        error!("[ucode] CPU{cpu_id} current rev {old_rev:#x} unsafe to update");
        return Err(UcodeError::RejectedUnsafeRevision { rev: old_rev });
    }

    let addr = patch.load_address();
    let hw_err = cpu.wrmsr_safe(Msr::AMD_PATCHLOADER, addr.as_usize() as u64);

    // Get the patch id after patching.
    let reread = cpu.rdmsr_safe(Msr::AMD_PATCHLEVEL);

    // Some processors leave the patch mapping uncached after the update.
    // Flush it to regain normal cacheability.
    cpu.flush_local(addr, patch.len());

    let patch_rev = patch.patch_id();
    let new_rev = match (reread, &hw_err) {
        (Ok(rev), _) => rev as u32,
        (Err(fault), Err(_)) => {
            error!(
                "[ucode] CPU{cpu_id} update rev {old_rev:#x} to {patch_rev:#x} faulted, patch level unreadable: {fault}"
            );
            return Err(UcodeError::HardwareWriteFailed {
                old: old_rev,
                patch: patch_rev,
                new: old_rev,
            });
        }
        (Err(fault), Ok(())) => {
            error!(
                "[ucode] CPU{cpu_id} update rev {old_rev:#x} to {patch_rev:#x}, patch level unreadable: {fault}"
            );
            return Err(UcodeError::PatchLevelUnreadable {
                old: old_rev,
                patch: patch_rev,
                msr: fault.msr,
            });
        }
    };
    sig.rev = new_rev;

    let failure = if let Err(fault) = hw_err {
        debug!("[ucode] CPU{cpu_id} patch loader: {fault}");
        Some(UcodeError::HardwareWriteFailed {
            old: old_rev,
            patch: patch_rev,
            new: new_rev,
        })
    } else if new_rev != patch_rev {
        Some(UcodeError::RevisionMismatchAfterApply {
            old: old_rev,
            patch: patch_rev,
            new: new_rev,
        })
    } else {
        None
    };

    if let Some(err) = failure {
        error!(
            "[ucode] CPU{cpu_id} update rev {old_rev:#x} to {patch_rev:#x} failed, result {new_rev:#x}"
        );
        return Err(err);
    }

    let report = UpdateReport {
        cpu: cpu_id,
        old_rev,
        new_rev,
    };
    warn!("[ucode] {report}");
    Ok(report)
}
