use axerrno::AxResult;

use crate::apply::{self, UpdateReport};
use crate::equiv::EquivBinding;
use crate::error::Result;
use crate::msr::CpuAccess;
use crate::patch::{MatchResult, MicrocodePatch};
use crate::select;
use crate::signature::CpuSignature;

/// The equivalence binding shared by every CPU in the system.
static EQUIV: EquivBinding = EquivBinding::new();

/// Vendor hooks called by the generic microcode update layer.
///
/// Every method runs on the CPU it acts on. Freeing a patch is dropping it.
pub trait MicrocodeOps {
    /// Read the signature and current patch level of this CPU.
    fn collect_cpu_info(&self) -> Result<CpuSignature>;

    /// Find the newest patch in `blob` for the CPU described by `sig`.
    fn request_microcode(&self, sig: &CpuSignature, blob: &[u8]) -> Result<MicrocodePatch>;

    /// Load `patch` and update `sig.rev` to the level read back from hardware.
    fn apply_microcode(
        &self,
        sig: &mut CpuSignature,
        patch: Option<&MicrocodePatch>,
    ) -> Result<UpdateReport>;

    /// Compare two patches that both target this CPU.
    fn compare_patch(&self, new: &MicrocodePatch, old: &MicrocodePatch) -> MatchResult;

    /// Returns `true` if `patch` is present and newer than what `sig` runs.
    fn match_cpu(&self, sig: &CpuSignature, patch: Option<&MicrocodePatch>) -> bool;
}

/// Microcode loader for AMD family 10h and later.
pub struct AmdMicrocode<'a, C: CpuAccess> {
    cpu: C,
    equiv: &'a EquivBinding,
}

impl<C: CpuAccess> AmdMicrocode<'static, C> {
    /// A loader using the process-wide equivalence binding.
    pub fn global(cpu: C) -> Self {
        Self::new(cpu, &EQUIV)
    }
}

impl<'a, C: CpuAccess> AmdMicrocode<'a, C> {
    pub fn new(cpu: C, equiv: &'a EquivBinding) -> Self {
        Self { cpu, equiv }
    }

    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn equiv(&self) -> &EquivBinding {
        self.equiv
    }

    /// [`MicrocodeOps::request_microcode`] with the error mapped to [`axerrno`].
    ///
    /// `Ok(None)` means there is nothing to load.
    pub fn request_ax(&self, sig: &CpuSignature, blob: &[u8]) -> AxResult<Option<MicrocodePatch>> {
        match self.request_microcode(sig, blob) {
            Ok(patch) => Ok(Some(patch)),
            Err(err) if err.is_informational() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// [`MicrocodeOps::apply_microcode`] with the error mapped to [`axerrno`].
    pub fn apply_ax(
        &self,
        sig: &mut CpuSignature,
        patch: Option<&MicrocodePatch>,
    ) -> AxResult<UpdateReport> {
        self.apply_microcode(sig, patch).map_err(Into::into)
    }
}

impl<C: CpuAccess> MicrocodeOps for AmdMicrocode<'_, C> {
    fn collect_cpu_info(&self) -> Result<CpuSignature> {
        CpuSignature::collect(&self.cpu)
    }

    fn request_microcode(&self, sig: &CpuSignature, blob: &[u8]) -> Result<MicrocodePatch> {
        select::request_microcode(blob, sig, self.equiv, self.cpu.cpu_id())
    }

    fn apply_microcode(
        &self,
        sig: &mut CpuSignature,
        patch: Option<&MicrocodePatch>,
    ) -> Result<UpdateReport> {
        apply::apply_microcode(&self.cpu, self.equiv, sig, patch)
    }

    fn compare_patch(&self, new: &MicrocodePatch, old: &MicrocodePatch) -> MatchResult {
        new.compare(old)
    }

    fn match_cpu(&self, sig: &CpuSignature, patch: Option<&MicrocodePatch>) -> bool {
        patch.is_some_and(|patch| patch.fits(sig, self.equiv) == MatchResult::Applicable)
    }
}
