//! # Architecture Backends
//!
//! One module per CPU family that can run on the host. Each provides an
//! [`ArchitectureModule`] implementation backed by a hand-written
//! stack-switching routine in `global_asm!`.
//!
//! - **x86-64** (System V): [`x86_64::X64Module`]
//! - **AArch64** (AAPCS64): [`aarch64::Arm64Module`]
//!
//! Backends are only compiled for the matching host, since their routines
//! execute directly on the current thread.

use crate::module::ArchitectureModule;

#[cfg(all(target_arch = "x86_64", unix))]
pub mod x86_64;

#[cfg(all(target_arch = "aarch64", unix))]
pub mod aarch64;

/// Backend for the running CPU, if one was compiled in.
pub fn native() -> Option<&'static dyn ArchitectureModule>
{
    #[cfg(all(target_arch = "x86_64", unix))]
    {
        Some(&x86_64::X64_MODULE)
    }

    #[cfg(all(target_arch = "aarch64", unix))]
    {
        Some(&aarch64::ARM64_MODULE)
    }

    #[cfg(not(any(all(target_arch = "x86_64", unix), all(target_arch = "aarch64", unix))))]
    {
        None
    }
}

/// Make freshly written code at `ptr..ptr + len` visible to instruction fetch.
///
/// x86 keeps instruction and data caches coherent, so this is a no-op there.
pub fn sync_instruction_cache(ptr: *const u8, len: usize)
{
    #[cfg(all(target_arch = "aarch64", unix))]
    aarch64::sync_instruction_cache(ptr, len);

    #[cfg(not(all(target_arch = "aarch64", unix)))]
    let _ = (ptr, len);
}
