//! # Types
//!
//! Small value types shared by every layer of the engine.
//!
//! These types keep addresses, sizes and identifiers apart so that a stack
//! size can never be passed where a program counter is expected.

pub mod address;
pub mod target;

// Re-export all public types
pub use address::Address;
pub use target::{ArchitectureId, PlatformId};

/// A contiguous memory range handed out by a platform module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region
{
    /// First byte of the range
    pub base: Address,
    /// Length in bytes (page-rounded by the platform)
    pub size: usize,
}

impl Region
{
    /// Create a region descriptor.
    pub const fn new(base: Address, size: usize) -> Self
    {
        Self { base, size }
    }

    /// One past the last byte.
    pub fn end(&self) -> Address
    {
        self.base + self.size as u64
    }

    /// `true` if `addr` lies in `[base, base + size)`.
    pub fn contains(&self, addr: Address) -> bool
    {
        addr >= self.base && addr < self.end()
    }
}
