//! # Platform Modules
//!
//! Operating-system backends implementing
//! [`PlatformModule`](crate::module::PlatformModule).
//!
//! - **Linux**, **FreeBSD**, **macOS**: [`posix::PosixPlatform`], one
//!   implementation over `mmap`/`mprotect` that differs only in its syscall
//!   gate.
//!
//! Windows identifiers exist so that contexts can name them, but no module
//! is provided; looking one up fails with `ModuleNotRegistered`.

use crate::module::PlatformModule;

#[cfg(unix)]
pub mod posix;

/// Module for the running operating system, if one was compiled in.
pub fn native() -> Option<&'static dyn PlatformModule>
{
    #[cfg(target_os = "linux")]
    {
        Some(&posix::LINUX)
    }

    #[cfg(target_os = "freebsd")]
    {
        Some(&posix::FREEBSD)
    }

    #[cfg(target_os = "macos")]
    {
        Some(&posix::MACOS)
    }

    #[cfg(not(any(target_os = "linux", target_os = "freebsd", target_os = "macos")))]
    {
        None
    }
}
