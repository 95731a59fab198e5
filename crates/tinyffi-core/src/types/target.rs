//! Architecture and platform identifiers.

use std::fmt;

/// CPU family a context targets
///
/// This is an open enumeration: adding a variant plus a conforming
/// [`ArchitectureModule`](crate::module::ArchitectureModule) is how a new
/// CPU family is supported. Register layouts exist for every variant even
/// when no module is registered, so register maps can be built for foreign
/// targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum ArchitectureId
{
    /// 32-bit x86 (IA-32)
    X86,
    /// 64-bit x86 (AMD64 / Intel 64)
    X64,
    /// 64-bit MIPS
    Mips64,
    /// 64-bit ARM (AArch64)
    Arm64,
}

impl ArchitectureId
{
    /// Every known identifier, in declaration order.
    pub const ALL: [ArchitectureId; 4] = [
        ArchitectureId::X86,
        ArchitectureId::X64,
        ArchitectureId::Mips64,
        ArchitectureId::Arm64,
    ];

    /// Get the architecture of the running binary
    ///
    /// Returns `None` on CPU families without an identifier.
    ///
    /// ```rust
    /// use tinyffi_core::types::ArchitectureId;
    ///
    /// #[cfg(target_arch = "x86_64")]
    /// assert_eq!(ArchitectureId::current(), Some(ArchitectureId::X64));
    /// ```
    pub const fn current() -> Option<Self>
    {
        #[cfg(target_arch = "x86_64")]
        {
            Some(ArchitectureId::X64)
        }

        #[cfg(target_arch = "x86")]
        {
            Some(ArchitectureId::X86)
        }

        #[cfg(target_arch = "aarch64")]
        {
            Some(ArchitectureId::Arm64)
        }

        #[cfg(target_arch = "mips64")]
        {
            Some(ArchitectureId::Mips64)
        }

        #[cfg(not(any(
            target_arch = "x86_64",
            target_arch = "x86",
            target_arch = "aarch64",
            target_arch = "mips64"
        )))]
        {
            None
        }
    }

    /// Size of a pointer in bytes for this architecture.
    #[must_use]
    pub const fn pointer_size_bytes(self) -> usize
    {
        match self {
            ArchitectureId::X86 => 4,
            ArchitectureId::X64 | ArchitectureId::Mips64 | ArchitectureId::Arm64 => 8,
        }
    }
}

impl fmt::Display for ArchitectureId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            ArchitectureId::X86 => write!(f, "x86"),
            ArchitectureId::X64 => write!(f, "x86_64"),
            ArchitectureId::Mips64 => write!(f, "mips64"),
            ArchitectureId::Arm64 => write!(f, "arm64"),
        }
    }
}

/// Operating system a context targets
///
/// Open enumeration, extended the same way as [`ArchitectureId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum PlatformId
{
    /// Windows 7
    Windows7,
    /// FreeBSD
    FreeBsd,
    /// Linux
    Linux,
    /// Windows 95/98/ME
    Windows9x,
    /// Windows NT family
    WindowsNt,
    /// macOS (Darwin)
    MacOs,
}

impl PlatformId
{
    /// Every known identifier, in declaration order.
    pub const ALL: [PlatformId; 6] = [
        PlatformId::Windows7,
        PlatformId::FreeBsd,
        PlatformId::Linux,
        PlatformId::Windows9x,
        PlatformId::WindowsNt,
        PlatformId::MacOs,
    ];

    /// Get the operating system of the running binary
    pub const fn current() -> Option<Self>
    {
        #[cfg(target_os = "linux")]
        {
            Some(PlatformId::Linux)
        }

        #[cfg(target_os = "freebsd")]
        {
            Some(PlatformId::FreeBsd)
        }

        #[cfg(target_os = "macos")]
        {
            Some(PlatformId::MacOs)
        }

        #[cfg(target_os = "windows")]
        {
            Some(PlatformId::WindowsNt)
        }

        #[cfg(not(any(target_os = "linux", target_os = "freebsd", target_os = "macos", target_os = "windows")))]
        {
            None
        }
    }

    /// `true` for the Windows family.
    pub const fn is_windows(self) -> bool
    {
        matches!(self, PlatformId::Windows7 | PlatformId::Windows9x | PlatformId::WindowsNt)
    }
}

impl fmt::Display for PlatformId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            PlatformId::Windows7 => write!(f, "windows7"),
            PlatformId::FreeBsd => write!(f, "freebsd"),
            PlatformId::Linux => write!(f, "linux"),
            PlatformId::Windows9x => write!(f, "windows9x"),
            PlatformId::WindowsNt => write!(f, "windowsnt"),
            PlatformId::MacOs => write!(f, "macos"),
        }
    }
}
