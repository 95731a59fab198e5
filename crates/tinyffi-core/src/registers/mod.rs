//! # Registers
//!
//! Register sets and the insertion-ordered map that carries them into and
//! out of a foreign call.
//!
//! A [`RegisterMap`] is built for one architecture. Each entry is a
//! [`RegisterSet`] of one [`RegisterSetKind`], holding the raw byte image of
//! that register class as laid out in [`layout`]. Before a call the engine
//! loads every entry covered by the context's [`RegisterMask`]; after the
//! call it writes the captured values back into the same entries.
//!
//! ## Example
//!
//! ```rust
//! use tinyffi_core::registers::{RegisterId, RegisterMap, RegisterSetKind, X64Register};
//! use tinyffi_core::types::ArchitectureId;
//!
//! let mut regs = RegisterMap::new(ArchitectureId::X64);
//! regs.add(RegisterSetKind::General).unwrap();
//! regs.set(RegisterId::X64(X64Register::Rdi), 42).unwrap();
//! assert_eq!(regs.get(RegisterId::X64(X64Register::Rdi)), Some(42));
//! ```

pub mod id;
pub mod layout;

use std::fmt;
use std::ops::BitOr;

use smallvec::SmallVec;

pub use id::{Arm64Register, RegisterId, X64Register, X86Register};
pub use layout::{layout, RegisterLayout};

use crate::error::{FfiError, FfiResult};
use crate::types::ArchitectureId;

/// Register class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterSetKind
{
    /// Integer registers
    General,
    /// x87 stack on x86, control/status on AArch64, FPRs on MIPS
    FloatingPoint,
    /// XMM / NEON Q registers
    Vector128,
    /// YMM registers
    Vector256,
    /// ZMM registers
    Vector512,
}

impl RegisterSetKind
{
    /// Every kind, in slot order.
    pub const ALL: [RegisterSetKind; 5] = [
        RegisterSetKind::General,
        RegisterSetKind::FloatingPoint,
        RegisterSetKind::Vector128,
        RegisterSetKind::Vector256,
        RegisterSetKind::Vector512,
    ];

    /// Position of this kind's pointer in a frame header.
    pub const fn slot(self) -> usize
    {
        match self {
            RegisterSetKind::General => 0,
            RegisterSetKind::FloatingPoint => 1,
            RegisterSetKind::Vector128 => 2,
            RegisterSetKind::Vector256 => 3,
            RegisterSetKind::Vector512 => 4,
        }
    }

    const fn bit(self) -> u8
    {
        1 << self.slot()
    }
}

/// Set of register classes a context loads and captures
///
/// Entries of a [`RegisterMap`] whose kind is outside the mask are left
/// untouched by a call.
///
/// ```rust
/// use tinyffi_core::registers::{RegisterMask, RegisterSetKind};
///
/// let mask = RegisterMask::NONE.with(RegisterSetKind::General);
/// assert!(mask.contains(RegisterSetKind::General));
/// assert!(!mask.contains(RegisterSetKind::Vector128));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RegisterMask(u8);

impl RegisterMask
{
    /// No register classes.
    pub const NONE: Self = RegisterMask(0);

    /// Every register class.
    pub const ALL: Self = RegisterMask(0b1_1111);

    /// `true` if `kind` is in the mask.
    pub const fn contains(self, kind: RegisterSetKind) -> bool
    {
        self.0 & kind.bit() != 0
    }

    /// Copy of the mask with `kind` added.
    #[must_use]
    pub const fn with(self, kind: RegisterSetKind) -> Self
    {
        RegisterMask(self.0 | kind.bit())
    }

    /// Copy of the mask with `kind` removed.
    #[must_use]
    pub const fn without(self, kind: RegisterSetKind) -> Self
    {
        RegisterMask(self.0 & !kind.bit())
    }

    /// `true` if no class is selected.
    pub const fn is_empty(self) -> bool
    {
        self.0 == 0
    }

    /// Iterate over the kinds in the mask, in slot order.
    pub fn kinds(self) -> impl Iterator<Item = RegisterSetKind>
    {
        RegisterSetKind::ALL.into_iter().filter(move |kind| self.contains(*kind))
    }
}

impl BitOr for RegisterMask
{
    type Output = RegisterMask;

    fn bitor(self, rhs: Self) -> Self::Output
    {
        RegisterMask(self.0 | rhs.0)
    }
}

impl From<RegisterSetKind> for RegisterMask
{
    fn from(kind: RegisterSetKind) -> Self
    {
        RegisterMask::NONE.with(kind)
    }
}

impl fmt::Debug for RegisterMask
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_set().entries(self.kinds()).finish()
    }
}

/// One register class's byte image
#[derive(Clone, PartialEq, Eq)]
pub struct RegisterSet
{
    kind: RegisterSetKind,
    layout: RegisterLayout,
    bytes: Box<[u8]>,
}

impl RegisterSet
{
    fn zeroed(kind: RegisterSetKind, layout: RegisterLayout) -> FfiResult<Self>
    {
        let size = layout.size();
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|_| FfiError::OutOfMemory { requested: size })?;
        bytes.resize(size, 0);

        Ok(Self {
            kind,
            layout,
            bytes: bytes.into_boxed_slice(),
        })
    }

    /// Class of this set.
    pub fn kind(&self) -> RegisterSetKind
    {
        self.kind
    }

    /// Shape of this set.
    pub fn layout(&self) -> RegisterLayout
    {
        self.layout
    }

    /// Raw bytes, registers packed in layout order.
    pub fn bytes(&self) -> &[u8]
    {
        &self.bytes
    }

    /// Mutable raw bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8]
    {
        &mut self.bytes
    }

    /// Bytes of register `index`.
    pub fn lane(&self, index: usize) -> Option<&[u8]>
    {
        let (start, end) = self.layout.slot(index)?;
        Some(&self.bytes[start..end])
    }

    /// Mutable bytes of register `index`.
    pub fn lane_mut(&mut self, index: usize) -> Option<&mut [u8]>
    {
        let (start, end) = self.layout.slot(index)?;
        Some(&mut self.bytes[start..end])
    }

    /// Register `index` read as a little-endian integer.
    ///
    /// Only the low eight bytes are read for wider registers.
    pub fn read_u64(&self, index: usize) -> Option<u64>
    {
        let lane = self.lane(index)?;
        let mut raw = [0u8; 8];
        let n = lane.len().min(8);
        raw[..n].copy_from_slice(&lane[..n]);
        Some(u64::from_le_bytes(raw))
    }

    /// Store a little-endian integer into register `index`.
    ///
    /// The value is truncated to the register width; bytes above the eighth
    /// are zeroed.
    pub fn write_u64(&mut self, index: usize, value: u64) -> Option<()>
    {
        let lane = self.lane_mut(index)?;
        let raw = value.to_le_bytes();
        let n = lane.len().min(8);
        lane.fill(0);
        lane[..n].copy_from_slice(&raw[..n]);
        Some(())
    }
}

impl fmt::Debug for RegisterSet
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("RegisterSet")
            .field("kind", &self.kind)
            .field("count", &self.layout.count)
            .field("width", &self.layout.width)
            .finish()
    }
}

/// Insertion-ordered register sets for one architecture
///
/// At most one entry exists per [`RegisterSetKind`]. The order of entries
/// is the order in which they were added and is preserved by removals.
#[derive(Debug, Clone)]
pub struct RegisterMap
{
    architecture: ArchitectureId,
    entries: SmallVec<[RegisterSet; 5]>,
}

impl RegisterMap
{
    /// Create an empty map for `architecture`.
    pub fn new(architecture: ArchitectureId) -> Self
    {
        Self {
            architecture,
            entries: SmallVec::new(),
        }
    }

    /// Create a map holding zeroed entries of every `kinds`, in order.
    pub fn with_sets(architecture: ArchitectureId, kinds: &[RegisterSetKind]) -> FfiResult<Self>
    {
        let mut map = Self::new(architecture);
        for kind in kinds {
            map.add(*kind)?;
        }
        Ok(map)
    }

    /// Architecture the map was built for.
    pub fn architecture(&self) -> ArchitectureId
    {
        self.architecture
    }

    /// Number of entries.
    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    /// `true` if the map has no entries.
    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisterSet>
    {
        self.entries.iter()
    }

    /// Mutable entries in insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RegisterSet>
    {
        self.entries.iter_mut()
    }

    /// Kinds present, in insertion order.
    pub fn kinds(&self) -> impl Iterator<Item = RegisterSetKind> + '_
    {
        self.entries.iter().map(RegisterSet::kind)
    }

    /// Append a zeroed entry of `kind`.
    ///
    /// ## Errors
    ///
    /// - `UnsupportedRegisterSet` if the architecture has no such class
    /// - `DuplicateRegisterSet` if an entry of `kind` already exists
    /// - `OutOfMemory` if the entry cannot be allocated
    pub fn add(&mut self, kind: RegisterSetKind) -> FfiResult<&mut RegisterSet>
    {
        let layout = layout(self.architecture, kind).ok_or(FfiError::UnsupportedRegisterSet {
            architecture: self.architecture,
            kind,
        })?;

        if self.contains(kind) {
            return Err(FfiError::DuplicateRegisterSet(kind));
        }

        let set = RegisterSet::zeroed(kind, layout)?;
        self.entries.try_reserve(1).map_err(|_| FfiError::OutOfMemory {
            requested: std::mem::size_of::<RegisterSet>(),
        })?;
        self.entries.push(set);

        let last = self.entries.len() - 1;
        Ok(&mut self.entries[last])
    }

    /// Remove the entry at position `index`, keeping the order of the rest.
    pub fn remove_by_index(&mut self, index: usize) -> FfiResult<RegisterSet>
    {
        if index >= self.entries.len() {
            return Err(FfiError::IndexOutOfRange {
                index,
                len: self.entries.len(),
            });
        }
        Ok(self.entries.remove(index))
    }

    /// Remove the entry of `kind`, keeping the order of the rest.
    pub fn remove_by_kind(&mut self, kind: RegisterSetKind) -> FfiResult<RegisterSet>
    {
        let index = self.position(kind).ok_or(FfiError::RegisterSetNotFound(kind))?;
        Ok(self.entries.remove(index))
    }

    /// `true` if an entry of `kind` exists.
    pub fn contains(&self, kind: RegisterSetKind) -> bool
    {
        self.position(kind).is_some()
    }

    /// Insertion position of the entry of `kind`.
    pub fn position(&self, kind: RegisterSetKind) -> Option<usize>
    {
        self.entries.iter().position(|set| set.kind == kind)
    }

    /// Entry of `kind`.
    pub fn get_set(&self, kind: RegisterSetKind) -> Option<&RegisterSet>
    {
        self.entries.iter().find(|set| set.kind == kind)
    }

    /// Mutable entry of `kind`.
    pub fn get_set_mut(&mut self, kind: RegisterSetKind) -> Option<&mut RegisterSet>
    {
        self.entries.iter_mut().find(|set| set.kind == kind)
    }

    /// Read a general-purpose register.
    ///
    /// Returns `None` if `id` belongs to another architecture, is out of
    /// range, or the map has no `General` entry.
    pub fn get(&self, id: RegisterId) -> Option<u64>
    {
        let index = self.general_index(id)?;
        self.get_set(RegisterSetKind::General)?.read_u64(index)
    }

    /// Write a general-purpose register.
    ///
    /// Returns `None` under the same conditions as [`get`](Self::get).
    pub fn set(&mut self, id: RegisterId, value: u64) -> Option<()>
    {
        let index = self.general_index(id)?;
        self.get_set_mut(RegisterSetKind::General)?.write_u64(index, value)
    }

    /// Bytes of register `index` in the entry of `kind`.
    pub fn lane(&self, kind: RegisterSetKind, index: usize) -> Option<&[u8]>
    {
        self.get_set(kind)?.lane(index)
    }

    /// Overwrite register `index` in the entry of `kind`.
    ///
    /// `bytes` must be exactly one register wide.
    pub fn set_lane(&mut self, kind: RegisterSetKind, index: usize, bytes: &[u8]) -> FfiResult<()>
    {
        let set = self.get_set_mut(kind).ok_or(FfiError::RegisterSetNotFound(kind))?;
        let count = set.layout.count;
        let width = set.layout.width;
        let lane = set
            .lane_mut(index)
            .ok_or(FfiError::IndexOutOfRange { index, len: count })?;

        if bytes.len() != width {
            return Err(FfiError::InvalidArgument(format!(
                "{kind:?} register is {width} bytes wide, got {}",
                bytes.len()
            )));
        }

        lane.copy_from_slice(bytes);
        Ok(())
    }

    fn general_index(&self, id: RegisterId) -> Option<usize>
    {
        if id.architecture() != self.architecture {
            return None;
        }

        let count = layout(self.architecture, RegisterSetKind::General)?.count;
        let index = id.index();
        (index < count).then_some(index)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_mask_operations()
    {
        let mask = RegisterMask::from(RegisterSetKind::General) | RegisterSetKind::Vector128.into();
        assert!(mask.contains(RegisterSetKind::General));
        assert!(mask.contains(RegisterSetKind::Vector128));
        assert!(!mask.contains(RegisterSetKind::Vector512));

        let mask = mask.without(RegisterSetKind::General);
        assert_eq!(mask.kinds().collect::<Vec<_>>(), vec![RegisterSetKind::Vector128]);
        assert!(RegisterMask::NONE.is_empty());
        assert_eq!(RegisterMask::ALL.kinds().count(), 5);
    }

    #[test]
    fn test_write_u64_truncates_to_width()
    {
        let mut map = RegisterMap::new(ArchitectureId::X86);
        map.add(RegisterSetKind::General).unwrap();
        let eax = RegisterId::X86(X86Register::Eax);
        map.set(eax, 0x1_2345_6789).unwrap();
        assert_eq!(map.get(eax), Some(0x2345_6789));
    }

    #[test]
    fn test_arm64_register_range_checked()
    {
        let mut map = RegisterMap::new(ArchitectureId::Arm64);
        map.add(RegisterSetKind::General).unwrap();
        assert!(map.set(RegisterId::Arm64(Arm64Register::X(30)), 7).is_some());
        assert!(map.set(RegisterId::Arm64(Arm64Register::X(31)), 7).is_none());
    }

    #[test]
    fn test_every_kind_fits_inline()
    {
        let map = RegisterMap::with_sets(ArchitectureId::X64, &RegisterSetKind::ALL).unwrap();
        assert_eq!(map.len(), RegisterSetKind::ALL.len());
        assert!(!map.entries.spilled());
    }
}
