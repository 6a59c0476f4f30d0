use core::fmt;

use axerrno::{AxError, ax_err_type};

/// Errors reported while parsing a microcode container or loading a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UcodeError {
    /// Bad magic, bad section header, truncated section or out-of-range length.
    MalformedContainer(&'static str),
    /// Zero or misaligned table length, or the last entry is not the terminator.
    MalformedEquivalenceTable,
    /// Two equivalence tables disagree about the running processor.
    ConflictingEquivalence {
        sig: u32,
        table_id: u16,
        cached_id: u16,
    },
    /// The patch exceeds the size limit of the processor family.
    PatchTooLarge { len: u32, max: u32 },
    /// The patch buffer could not be allocated.
    AllocationFailure,
    /// The blob holds nothing newer for this processor.
    ///
    /// This is the expected outcome on an up-to-date processor and is not a
    /// failure.
    NoApplicablePatch,
    /// The current revision is known to hang when updated. Permanent.
    RejectedUnsafeRevision { rev: u32 },
    /// The patch no longer fits the processor at apply time.
    NotApplicableAtApplyTime,
    /// `wrmsr` to the patch loader faulted.
    HardwareWriteFailed { old: u32, patch: u32, new: u32 },
    /// The patch level read back does not match the patch that was loaded.
    RevisionMismatchAfterApply { old: u32, patch: u32, new: u32 },
    /// The patch level could not be read back after the patch was loaded.
    PatchLevelUnreadable { old: u32, patch: u32, msr: u32 },
    /// An MSR read faulted.
    RegisterReadFailed { msr: u32 },
}

/// A specialized [`Result`](core::result::Result) for microcode operations.
pub type Result<T = ()> = core::result::Result<T, UcodeError>;

impl UcodeError {
    /// Returns `true` for outcomes that only mean "nothing to do".
    pub fn is_informational(&self) -> bool {
        matches!(self, Self::NoApplicablePatch)
    }

    /// Returns `true` if retrying the update on this processor can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::RejectedUnsafeRevision { .. })
    }

    /// Returns `true` if the blob itself cannot be trusted.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedContainer(_)
                | Self::MalformedEquivalenceTable
                | Self::ConflictingEquivalence { .. }
                | Self::PatchTooLarge { .. }
        )
    }
}

impl fmt::Display for UcodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedContainer(what) => write!(f, "malformed microcode container: {what}"),
            Self::MalformedEquivalenceTable => {
                f.write_str("wrong microcode equivalent cpu table length")
            }
            Self::ConflictingEquivalence {
                sig,
                table_id,
                cached_id,
            } => write!(
                f,
                "equiv mismatch: cpu {sig:08x}, got {table_id:04x}, cached {cached_id:04x}"
            ),
            Self::PatchTooLarge { len, max } => {
                write!(f, "patch size mismatch: {len} bytes exceeds {max}")
            }
            Self::AllocationFailure => f.write_str("cannot allocate memory for microcode patch"),
            Self::NoApplicablePatch => f.write_str("no applicable microcode patch"),
            Self::RejectedUnsafeRevision { rev } => {
                write!(f, "current rev {rev:#x} unsafe to update")
            }
            Self::NotApplicableAtApplyTime => f.write_str("patch does not fit this cpu"),
            Self::HardwareWriteFailed { old, patch, new } => write!(
                f,
                "update rev {old:#x} to {patch:#x} faulted, result {new:#x}"
            ),
            Self::RevisionMismatchAfterApply { old, patch, new } => write!(
                f,
                "update rev {old:#x} to {patch:#x} failed, result {new:#x}"
            ),
            Self::PatchLevelUnreadable { old, patch, msr } => write!(
                f,
                "update rev {old:#x} to {patch:#x}: rdmsr {msr:#x} faulted"
            ),
            Self::RegisterReadFailed { msr } => write!(f, "rdmsr {msr:#x} faulted"),
        }
    }
}

impl From<UcodeError> for AxError {
    fn from(err: UcodeError) -> Self {
        match err {
            UcodeError::MalformedContainer(_)
            | UcodeError::MalformedEquivalenceTable
            | UcodeError::ConflictingEquivalence { .. }
            | UcodeError::PatchTooLarge { .. } => ax_err_type!(InvalidData).into(),
            UcodeError::AllocationFailure => ax_err_type!(NoMemory).into(),
            UcodeError::NoApplicablePatch => ax_err_type!(NotFound).into(),
            UcodeError::RejectedUnsafeRevision { .. } => ax_err_type!(PermissionDenied).into(),
            UcodeError::NotApplicableAtApplyTime => ax_err_type!(InvalidInput).into(),
            UcodeError::HardwareWriteFailed { .. }
            | UcodeError::RevisionMismatchAfterApply { .. }
            | UcodeError::PatchLevelUnreadable { .. }
            | UcodeError::RegisterReadFailed { .. } => ax_err_type!(Io).into(),
        }
    }
}
