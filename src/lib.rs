#![no_std]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

#[cfg(test)]
extern crate std;

pub(crate) mod msr;
mod apply;
mod container;
mod cursor;
mod equiv;
mod error;
mod ops;
mod patch;
mod select;
mod signature;

cfg_if::cfg_if! {
    if #[cfg(all(feature = "native", target_arch = "x86_64"))] {
        mod native;
        pub use native::NativeCpu;
    }
}

#[cfg(test)]
mod tests;

pub use apply::{UpdateReport, is_unsafe_revision};
pub use container::{CONTAINER_MAGIC, EQUIV_TABLE_TYPE, PATCH_TYPE, SECTION_HDR_SIZE};
pub use equiv::{EquivBinding, EquivCpuEntry};
pub use error::{Result, UcodeError};
pub use msr::{CpuAccess, Msr, MsrFault};
pub use ops::{AmdMicrocode, MicrocodeOps};
pub use patch::{MatchResult, MicrocodePatch, PATCH_HDR_SIZE, PatchHeader, max_patch_size};
pub use signature::CpuSignature;
