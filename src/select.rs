use crate::container::{CONTAINER_MAGIC, SECTION_HDR_SIZE, find_matching_container};
use crate::cursor::Cursor;
use crate::equiv::EquivBinding;
use crate::error::{Result, UcodeError};
use crate::patch::{MatchResult, MicrocodePatch};
use crate::signature::CpuSignature;

/// Find the newest patch in `blob` that applies to the CPU described by `sig`.
///
/// Only the first sub-container whose equivalence table lists the processor
/// is searched. Patches that do not apply, and applicable patches that are
/// superseded by a newer one, are dropped as soon as they are seen.
///
/// Returns [`UcodeError::NoApplicablePatch`] if the blob is well formed but
/// holds nothing newer than `sig.rev`.
pub(crate) fn request_microcode(
    blob: &[u8],
    sig: &CpuSignature,
    equiv: &EquivBinding,
    cpu: usize,
) -> Result<MicrocodePatch> {
    let mut cursor = Cursor::new(blob);

    if blob.len() < 4 || cursor.peek_u32(0) != Some(CONTAINER_MAGIC) {
        error!("[ucode] wrong microcode patch file magic");
        return Err(UcodeError::MalformedContainer("bad magic"));
    }

    find_matching_container(&mut cursor, sig.sig, equiv, cpu)?;

    // The file may hold several patches for this processor; keep the newest.
    let mut saved: Option<MicrocodePatch> = None;
    let mut failure = None;

    while !cursor.is_exhausted() {
        let patch = match MicrocodePatch::extract(&mut cursor, sig.family()) {
            Ok(patch) => patch,
            Err(err) => {
                failure = Some(err);
                break;
            }
        };

        match patch.fits(sig, equiv) {
            MatchResult::Applicable => {
                let newer = saved
                    .as_ref()
                    .is_none_or(|old| patch.compare(old) == MatchResult::Applicable);
                if newer {
                    debug!(
                        "[ucode] CPU{cpu} found a matching microcode update with version {:#x} (current={:#x})",
                        patch.patch_id(),
                        sig.rev
                    );
                    // Replacing drops the previous candidate.
                    saved = Some(patch);
                }
            }
            MatchResult::TooOld | MatchResult::NoMatch => {}
        }

        // A correct patch can only live in one container, so the next
        // container is not parsed. Its table may resolve to a different id,
        // and its header would otherwise be reported as a bad patch section.
        if cursor.remaining() >= SECTION_HDR_SIZE && cursor.peek_u32(0) == Some(CONTAINER_MAGIC) {
            break;
        }
    }

    match (saved, failure) {
        (Some(patch), err) => {
            if let Some(err) = err {
                warn!(
                    "[ucode] CPU{cpu} stopped scanning after {err}, using patch {:#x}",
                    patch.patch_id()
                );
            }
            Ok(patch)
        }
        (None, Some(err)) => {
            error!(
                "[ucode] CPU{cpu} failed to update patch level. Current lvl:{:#x}",
                sig.rev
            );
            Err(err)
        }
        (None, None) => Err(UcodeError::NoApplicablePatch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::builder::Blob;
    use crate::tests::live;

    const SIG: u32 = 0x0010_0f42;

    fn request(blob: &[u8], rev: u32) -> Result<MicrocodePatch> {
        let equiv = EquivBinding::new();
        request_microcode(blob, &CpuSignature::new(SIG, rev), &equiv, 0)
    }

    #[test]
    fn test_picks_newest_applicable() {
        let blob = Blob::new()
            .container(&[(SIG, 0x1022)])
            .patch(0x1022, 0x0100_0064, 64)
            .patch(0x1041, 0x0100_00ff, 64)
            .patch(0x1022, 0x0100_0083, 64)
            .patch(0x1022, 0x0100_0070, 64)
            .build();

        let patch = request(&blob, 0x0100_0050).unwrap();
        assert_eq!(patch.patch_id(), 0x0100_0083);
        assert_eq!(live::count(), 1);
        drop(patch);
        assert_eq!(live::count(), 0);
    }

    #[test]
    fn test_equal_revisions_keep_first() {
        let first = Blob::patch_with_body(0x1022, 0x0100_0083, 64, 0xaa);
        let second = Blob::patch_with_body(0x1022, 0x0100_0083, 64, 0xbb);
        let blob = Blob::new()
            .container(&[(SIG, 0x1022)])
            .raw_section(crate::PATCH_TYPE, &first)
            .raw_section(crate::PATCH_TYPE, &second)
            .build();

        let patch = request(&blob, 0x0100_0050).unwrap();
        assert_eq!(patch.as_bytes(), &first[..]);
    }

    #[test]
    fn test_too_old_only() {
        let blob = Blob::new()
            .container(&[(SIG, 0x1022)])
            .patch(0x1022, 0x0100_0064, 64)
            .build();

        assert_eq!(
            request(&blob, 0x0100_0064).unwrap_err(),
            UcodeError::NoApplicablePatch
        );
        assert_eq!(live::count(), 0);
    }

    #[test]
    fn test_matching_container_without_patches() {
        let blob = Blob::new().container(&[(SIG, 0x1022)]).build();
        assert_eq!(
            request(&blob, 0x0100_0050).unwrap_err(),
            UcodeError::NoApplicablePatch
        );
    }

    #[test]
    fn test_bad_magic() {
        assert_eq!(
            request(&[0x44, 0x4d, 0x41], 0).unwrap_err(),
            UcodeError::MalformedContainer("bad magic")
        );
        assert_eq!(
            request(&[0u8; 64], 0).unwrap_err(),
            UcodeError::MalformedContainer("bad magic")
        );
    }

    #[test]
    fn test_stops_at_next_container() {
        // The second container would conflict with the first binding if it
        // were parsed.
        let blob = Blob::new()
            .container(&[(SIG, 0x1022)])
            .patch(0x1022, 0x0100_0064, 64)
            .container(&[(SIG, 0x1041)])
            .patch(0x1022, 0x0100_00ff, 64)
            .build();

        let patch = request(&blob, 0x0100_0050).unwrap();
        assert_eq!(patch.patch_id(), 0x0100_0064);
    }

    #[test]
    fn test_error_after_retained_patch_is_tolerated() {
        let blob = Blob::new()
            .container(&[(SIG, 0x1022)])
            .patch(0x1022, 0x0100_0064, 64)
            .patch(0x1022, 0x0100_00ff, 4000)
            .build();

        let patch = request(&blob, 0x0100_0050).unwrap();
        assert_eq!(patch.patch_id(), 0x0100_0064);
        drop(patch);
        assert_eq!(live::count(), 0);
    }

    #[test]
    fn test_error_without_retained_patch_frees_everything() {
        let blob = Blob::new()
            .container(&[(SIG, 0x1022)])
            .patch(0x1022, 0x0100_0040, 64)
            .patch(0x1041, 0x0100_00ff, 64)
            .patch(0x1022, 0x0100_00ff, 4000)
            .build();

        assert_eq!(
            request(&blob, 0x0100_0050).unwrap_err(),
            UcodeError::PatchTooLarge { len: 4000, max: 2048 }
        );
        assert_eq!(live::count(), 0);
    }
}
