//! Per-architecture register-set layouts.
//!
//! A layout says how many registers a set holds and how wide each one is.
//! The byte image of a set is the registers packed back to back in the
//! order listed on each architecture's register enum, little-endian.

use super::RegisterSetKind;
use crate::types::ArchitectureId;

/// Shape of one register set on one architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout
{
    /// Number of registers in the set
    pub count: usize,
    /// Width of each register in bytes
    pub width: usize,
}

impl RegisterLayout
{
    const fn new(count: usize, width: usize) -> Self
    {
        Self { count, width }
    }

    /// Total size of the set's byte image.
    #[must_use]
    pub const fn size(&self) -> usize
    {
        self.count * self.width
    }

    /// Byte range of register `index`, if it exists.
    #[must_use]
    pub const fn slot(&self, index: usize) -> Option<(usize, usize)>
    {
        if index < self.count {
            Some((index * self.width, (index + 1) * self.width))
        } else {
            None
        }
    }
}

/// Look up the layout of `kind` on `arch`.
///
/// Returns `None` when the architecture has no such register class.
///
/// | arch | General | FloatingPoint | Vector128 | Vector256 | Vector512 |
/// |------|---------|---------------|-----------|-----------|-----------|
/// | X86 | 7 x 4 | 8 x 10 | 8 x 16 | 8 x 32 | 8 x 64 |
/// | X64 | 15 x 8 | 8 x 10 | 16 x 16 | 16 x 32 | 32 x 64 |
/// | Arm64 | 31 x 8 | 2 x 8 | 32 x 16 | - | - |
/// | Mips64 | 32 x 8 | 32 x 8 | - | - | - |
#[must_use]
pub const fn layout(arch: ArchitectureId, kind: RegisterSetKind) -> Option<RegisterLayout>
{
    use RegisterSetKind::{FloatingPoint, General, Vector128, Vector256, Vector512};

    match (arch, kind) {
        // edi, esi, ebp, ebx, edx, ecx, eax
        (ArchitectureId::X86, General) => Some(RegisterLayout::new(7, 4)),
        (ArchitectureId::X86, FloatingPoint) => Some(RegisterLayout::new(8, 10)),
        (ArchitectureId::X86, Vector128) => Some(RegisterLayout::new(8, 16)),
        (ArchitectureId::X86, Vector256) => Some(RegisterLayout::new(8, 32)),
        (ArchitectureId::X86, Vector512) => Some(RegisterLayout::new(8, 64)),

        // rax, rbx, rcx, rdx, rsi, rdi, rbp, r8-r15
        (ArchitectureId::X64, General) => Some(RegisterLayout::new(15, 8)),
        (ArchitectureId::X64, FloatingPoint) => Some(RegisterLayout::new(8, 10)),
        (ArchitectureId::X64, Vector128) => Some(RegisterLayout::new(16, 16)),
        (ArchitectureId::X64, Vector256) => Some(RegisterLayout::new(16, 32)),
        (ArchitectureId::X64, Vector512) => Some(RegisterLayout::new(32, 64)),

        // x0-x30; fpcr, fpsr; v0-v31
        (ArchitectureId::Arm64, General) => Some(RegisterLayout::new(31, 8)),
        (ArchitectureId::Arm64, FloatingPoint) => Some(RegisterLayout::new(2, 8)),
        (ArchitectureId::Arm64, Vector128) => Some(RegisterLayout::new(32, 16)),
        (ArchitectureId::Arm64, Vector256 | Vector512) => None,

        // r0-r31; f0-f31
        (ArchitectureId::Mips64, General) => Some(RegisterLayout::new(32, 8)),
        (ArchitectureId::Mips64, FloatingPoint) => Some(RegisterLayout::new(32, 8)),
        (ArchitectureId::Mips64, Vector128 | Vector256 | Vector512) => None,
    }
}

/// Sum of every layout the architecture defines.
///
/// This is the largest payload a frame for `arch` can ever need.
#[must_use]
pub fn max_payload(arch: ArchitectureId) -> usize
{
    RegisterSetKind::ALL
        .iter()
        .filter_map(|kind| layout(arch, *kind))
        .map(|l| l.size())
        .sum()
}
