//! # Call Frames
//!
//! The frame is the only data shared between Rust and the per-architecture
//! stack-switching routines. It is written at the top of a [`Closure`]
//! before a call and read back after it.
//!
//! ## Layout
//!
//! ```text
//! header (80 bytes, 64-byte aligned)
//!   +0   pc          entry point, or resumption point after a yield
//!   +8   caller_sp   engine stack pointer, written by the routine
//!   +16  sets[5]     payload address per register kind, 0 = skip
//!   +56  target_sp   stack pointer the target starts (or resumes) on
//!   +64  status      0 = returned, 1 = yielded
//!   +72  control     engine floating-point control state
//! payloads, each 16-byte aligned
//! ```
//!
//! The target stack pointer is the address of the header, so the target's
//! stack grows down from just below the frame and never overlaps it.

use std::ptr::{self, NonNull};

use smallvec::SmallVec;
use tracing::trace;

use crate::closure::Closure;
use crate::error::{FfiError, FfiResult};
use crate::registers::{layout, RegisterMap, RegisterMask, RegisterSetKind};
use crate::types::{Address, ArchitectureId};

/// Alignment of the frame header.
pub const FRAME_ALIGN: usize = 64;

/// Alignment of every payload slot.
pub const PAYLOAD_ALIGN: usize = 16;

/// Room left below the frame for the target's own stack.
pub const MIN_TARGET_STACK: usize = 256;

/// Frame header shared with the assembly routines
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Frame
{
    /// Entry point, or resumption point after a yield
    pub pc: u64,
    /// Engine stack pointer saved on entry
    pub caller_sp: u64,
    /// Payload address per [`RegisterSetKind::slot`], 0 when not loaded
    pub sets: [u64; 5],
    /// Stack pointer the target runs on
    pub target_sp: u64,
    /// Raw [`FrameStatus`]
    pub status: u64,
    /// Engine floating-point control words (MXCSR, x87 CW)
    pub control: u64,
}

impl Frame
{
    /// Size of the header in bytes.
    pub const SIZE: usize = std::mem::size_of::<Frame>();
}

const _: () = assert!(Frame::SIZE == 80);

/// How the target left the trampoline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus
{
    /// The target returned from its entry point
    Returned,
    /// The target called the yield trap
    Yielded,
}

impl FrameStatus
{
    /// Decode the raw status word.
    pub fn from_raw(raw: u64) -> Self
    {
        if raw == 1 { FrameStatus::Yielded } else { FrameStatus::Returned }
    }
}

#[derive(Debug, Clone, Copy)]
struct PayloadSlot
{
    kind: RegisterSetKind,
    offset: usize,
    len: usize,
}

/// Placement of a frame and its payloads inside one closure
///
/// A plan is computed once and used both to marshal registers into the
/// closure and to read the captured values back, so both directions agree
/// on every offset.
#[derive(Debug, Clone)]
pub struct FramePlan
{
    closure_base: Address,
    header_offset: usize,
    area: usize,
    slots: SmallVec<[PayloadSlot; 5]>,
}

fn align_up(value: usize, align: usize) -> usize
{
    (value + align - 1) & !(align - 1)
}

impl FramePlan
{
    /// Plan a frame carrying every entry of `regs` selected by `mask`,
    /// in the map's insertion order.
    pub fn for_map(closure: &Closure, regs: &RegisterMap, mask: RegisterMask) -> FfiResult<Self>
    {
        let sets = regs
            .iter()
            .filter(|set| mask.contains(set.kind()))
            .map(|set| (set.kind(), set.bytes().len()));
        Self::build(closure, sets)
    }

    /// Plan a frame with a slot for every kind in `mask` that `arch` defines.
    ///
    /// Kinds present in `regs` come first, in insertion order; the remaining
    /// masked kinds follow in slot order. The header position depends only
    /// on the set of kinds, so every plan for the same closure and mask puts
    /// the header at the same address.
    ///
    /// Used by coroutines: the frame must not move between `start` and
    /// `resume`, whatever the caller adds to its register map.
    pub fn reserve(
        closure: &Closure,
        arch: ArchitectureId,
        mask: RegisterMask,
        regs: &RegisterMap,
    ) -> FfiResult<Self>
    {
        let present = regs.kinds().filter(|kind| mask.contains(*kind));
        let rest = mask.kinds().filter(|kind| !regs.contains(*kind));
        let sets = present
            .chain(rest)
            .filter_map(|kind| layout(arch, kind).map(|l| (kind, l.size())));
        Self::build(closure, sets)
    }

    fn build(closure: &Closure, sets: impl Iterator<Item = (RegisterSetKind, usize)>) -> FfiResult<Self>
    {
        closure.as_ptr()?;

        let mut slots = SmallVec::new();
        let mut cursor = Frame::SIZE;
        for (kind, len) in sets {
            cursor = align_up(cursor, PAYLOAD_ALIGN);
            slots.push(PayloadSlot { kind, offset: cursor, len });
            cursor += len;
        }
        let area = align_up(cursor, PAYLOAD_ALIGN);

        let base = closure.base().value();
        let lowest = base + MIN_TARGET_STACK as u64;
        let header = closure
            .sp()
            .checked_sub(area as u64)
            .map(|h| h.align_down(FRAME_ALIGN as u64))
            .filter(|h| h.value() >= lowest);

        let Some(header) = header else {
            let top = closure.size() - (closure.sp() - closure.base()) as usize;
            let minimum = area + MIN_TARGET_STACK + FRAME_ALIGN + top;
            return Err(FfiError::ClosureTooSmall {
                requested: closure.size(),
                minimum,
            });
        };

        let plan = Self {
            closure_base: closure.base(),
            header_offset: (header.value() - base) as usize,
            area,
            slots,
        };
        trace!("Frame plan at {} ({} bytes, {} payloads)", plan.header(), area, plan.slots.len());
        Ok(plan)
    }

    /// Address of the frame header.
    pub fn header(&self) -> Address
    {
        self.closure_base + self.header_offset as u64
    }

    /// Stack pointer the target starts on.
    pub fn target_sp(&self) -> Address
    {
        self.header()
    }

    /// Bytes occupied by the header and payloads.
    pub fn area(&self) -> usize
    {
        self.area
    }

    /// Address of the payload slot for `kind`.
    pub fn slot(&self, kind: RegisterSetKind) -> Option<Address>
    {
        self.find(kind).map(|slot| self.header() + slot.offset as u64)
    }

    /// Kinds with a payload slot, in slot order.
    pub fn kinds(&self) -> impl Iterator<Item = RegisterSetKind> + '_
    {
        self.slots.iter().map(|slot| slot.kind)
    }

    fn find(&self, kind: RegisterSetKind) -> Option<&PayloadSlot>
    {
        self.slots.iter().find(|slot| slot.kind == kind)
    }

    fn header_ptr(&self, closure: &Closure) -> FfiResult<NonNull<u8>>
    {
        let ptr = closure.as_ptr()?;
        if closure.base() != self.closure_base {
            return Err(FfiError::InvalidArgument(format!(
                "frame plan belongs to closure at {}, not {}",
                self.closure_base,
                closure.base()
            )));
        }

        // SAFETY: header_offset + area lies below sp, inside the allocation
        Ok(unsafe { NonNull::new_unchecked(ptr.as_ptr().add(self.header_offset)) })
    }

    /// Write a fresh header for a call to `pc` and copy in the payloads.
    pub fn marshal_call(
        &self,
        closure: &mut Closure,
        regs: &RegisterMap,
        mask: RegisterMask,
        pc: Address,
    ) -> FfiResult<NonNull<Frame>>
    {
        let header = self.header_ptr(closure)?;
        let mut frame = Frame {
            pc: pc.value(),
            target_sp: self.target_sp().value(),
            ..Frame::default()
        };
        self.write_payloads(header, &mut frame, regs, mask);

        let frame_ptr = header.cast::<Frame>();
        // SAFETY: header is 64-byte aligned and Frame::SIZE bytes are reserved
        unsafe { ptr::write(frame_ptr.as_ptr(), frame) };
        Ok(frame_ptr)
    }

    /// Re-marshal the payloads of a yielded frame.
    ///
    /// The resumption pc and stack pointer recorded by the yield are kept.
    pub fn marshal_resume(
        &self,
        closure: &mut Closure,
        regs: &RegisterMap,
        mask: RegisterMask,
    ) -> FfiResult<NonNull<Frame>>
    {
        let header = self.header_ptr(closure)?;
        let frame_ptr = header.cast::<Frame>();

        // SAFETY: the header was written by marshal_call and updated by the
        // yield routine; nothing else aliases the closure
        let mut frame = unsafe { ptr::read(frame_ptr.as_ptr()) };
        frame.sets = [0; 5];
        frame.status = 0;
        self.write_payloads(header, &mut frame, regs, mask);

        unsafe { ptr::write(frame_ptr.as_ptr(), frame) };
        Ok(frame_ptr)
    }

    fn write_payloads(&self, header: NonNull<u8>, frame: &mut Frame, regs: &RegisterMap, mask: RegisterMask)
    {
        for set in regs.iter().filter(|set| mask.contains(set.kind())) {
            let Some(slot) = self.find(set.kind()) else {
                continue;
            };
            debug_assert_eq!(slot.len, set.bytes().len());
            let len = slot.len.min(set.bytes().len());

            // SAFETY: the slot was sized for this kind when the plan was built
            unsafe {
                let dst = header.as_ptr().add(slot.offset);
                ptr::copy_nonoverlapping(set.bytes().as_ptr(), dst, len);
                frame.sets[set.kind().slot()] = dst as usize as u64;
            }
        }
    }

    /// Copy of the current header.
    pub fn read_header(&self, closure: &Closure) -> FfiResult<Frame>
    {
        let header = self.header_ptr(closure)?;
        // SAFETY: see marshal_resume
        Ok(unsafe { ptr::read(header.cast::<Frame>().as_ptr()) })
    }

    /// Copy captured payloads back into the matching entries of `regs`.
    pub fn unmarshal(&self, closure: &Closure, regs: &mut RegisterMap, mask: RegisterMask) -> FfiResult<()>
    {
        let header = self.header_ptr(closure)?;

        for set in regs.iter_mut().filter(|set| mask.contains(set.kind())) {
            let Some(slot) = self.find(set.kind()) else {
                continue;
            };
            let len = slot.len.min(set.bytes().len());

            // SAFETY: as in write_payloads
            unsafe {
                let src = header.as_ptr().add(slot.offset);
                ptr::copy_nonoverlapping(src, set.bytes_mut().as_mut_ptr(), len);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::closure::StackConvention;
    use crate::registers::{RegisterId, X64Register};

    fn closure(size: usize) -> Closure
    {
        Closure::allocate(size, StackConvention::DOWNWARD_16).unwrap()
    }

    #[test]
    fn test_payloads_follow_insertion_order()
    {
        let closure = closure(8192);
        let regs = RegisterMap::with_sets(
            ArchitectureId::X64,
            &[RegisterSetKind::Vector128, RegisterSetKind::General],
        )
        .unwrap();

        let plan = FramePlan::for_map(&closure, &regs, RegisterMask::ALL).unwrap();
        let v128 = plan.slot(RegisterSetKind::Vector128).unwrap();
        let general = plan.slot(RegisterSetKind::General).unwrap();

        assert_eq!(v128, plan.header() + Frame::SIZE as u64);
        assert_eq!(general, v128 + 256);
        assert!(plan.header().is_aligned(FRAME_ALIGN as u64));
        assert!(plan.header() + plan.area() as u64 <= closure.sp());
    }

    #[test]
    fn test_mask_excludes_slots()
    {
        let closure = closure(8192);
        let regs = RegisterMap::with_sets(
            ArchitectureId::X64,
            &[RegisterSetKind::General, RegisterSetKind::FloatingPoint],
        )
        .unwrap();

        let plan = FramePlan::for_map(&closure, &regs, RegisterSetKind::General.into()).unwrap();
        assert_eq!(plan.kinds().collect::<Vec<_>>(), vec![RegisterSetKind::General]);
    }

    #[test]
    fn test_marshal_unmarshal_same_offsets()
    {
        let mut closure = closure(8192);
        let mut regs = RegisterMap::with_sets(ArchitectureId::X64, &[RegisterSetKind::General]).unwrap();
        regs.set(RegisterId::X64(X64Register::R12), 0xdead_beef).unwrap();

        let plan = FramePlan::for_map(&closure, &regs, RegisterMask::ALL).unwrap();
        let frame = plan.marshal_call(&mut closure, &regs, RegisterMask::ALL, Address::new(0x4000)).unwrap();

        let header = plan.read_header(&closure).unwrap();
        assert_eq!(header.pc, 0x4000);
        assert_eq!(header.target_sp, plan.target_sp().value());
        assert_eq!(header.sets[0], plan.slot(RegisterSetKind::General).unwrap().value());
        assert_eq!(header.sets[1], 0);
        assert_eq!(frame.as_ptr() as usize as u64, plan.header().value());

        regs.set(RegisterId::X64(X64Register::R12), 0).unwrap();
        plan.unmarshal(&closure, &mut regs, RegisterMask::ALL).unwrap();
        assert_eq!(regs.get(RegisterId::X64(X64Register::R12)), Some(0xdead_beef));
    }

    #[test]
    fn test_reserve_larger_than_closure()
    {
        let closure = closure(1024);
        let regs = RegisterMap::new(ArchitectureId::X64);
        let err = FramePlan::reserve(&closure, ArchitectureId::X64, RegisterMask::ALL, &regs).unwrap_err();
        assert!(matches!(err, FfiError::ClosureTooSmall { requested: 1024, .. }));
    }

    #[test]
    fn test_reserve_follows_insertion_order()
    {
        let closure = closure(16 * 1024);
        let mask = RegisterMask::from(RegisterSetKind::General)
            | RegisterSetKind::FloatingPoint.into()
            | RegisterSetKind::Vector128.into();
        let empty = RegisterMap::new(ArchitectureId::X64);
        let regs = RegisterMap::with_sets(
            ArchitectureId::X64,
            &[RegisterSetKind::Vector128, RegisterSetKind::General],
        )
        .unwrap();

        let fresh = FramePlan::reserve(&closure, ArchitectureId::X64, mask, &empty).unwrap();
        let ordered = FramePlan::reserve(&closure, ArchitectureId::X64, mask, &regs).unwrap();
        let call = FramePlan::for_map(&closure, &regs, mask).unwrap();

        assert_eq!(
            ordered.kinds().collect::<Vec<_>>(),
            vec![
                RegisterSetKind::Vector128,
                RegisterSetKind::General,
                RegisterSetKind::FloatingPoint
            ]
        );
        assert_eq!(ordered.kinds().take(2).collect::<Vec<_>>(), call.kinds().collect::<Vec<_>>());
        assert_eq!(
            ordered.slot(RegisterSetKind::Vector128),
            Some(ordered.header() + Frame::SIZE as u64)
        );
        assert_eq!(ordered.header(), fresh.header());
        assert_eq!(ordered.area(), fresh.area());
    }
}
