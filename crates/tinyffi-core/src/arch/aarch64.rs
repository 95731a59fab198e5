//! # AArch64 Backend
//!
//! AAPCS64 implementation of [`ArchitectureModule`].
//!
//! The routines mirror the x86-64 backend:
//!
//! - `ffi_arm64_enter(frame)` saves x19-x30, d8-d15 and FPCR on the engine
//!   stack, switches to `frame.target_sp`, loads V0-V31, FPCR/FPSR and the
//!   general registers, then branches to `frame.pc` through x16.
//! - `ffi_arm64_yield` is reached from a trap stub with x16 = frame and the
//!   target's x16/x17 pushed on its stack.
//! - `ffi_arm64_resume(frame)` reloads everything and returns into the
//!   target through x30.
//!
//! x18 is the platform register on Darwin and Windows and is never loaded or
//! captured. Its slot in the general image is left as it was.
//!
//! ## References
//!
//! - [Procedure Call Standard for the Arm 64-bit Architecture](https://github.com/ARM-software/abi-aa/blob/main/aapcs64/aapcs64.rst)
//! - [Cache maintenance for self-modifying code](https://developer.arm.com/documentation/den0024/a/Caches/Cache-maintenance)

use std::arch::{asm, global_asm};
use std::ptr::NonNull;

use tracing::debug;

use crate::error::{FfiError, FfiResult};
use crate::frame::{Frame, FrameStatus};
use crate::module::{ArchitectureModule, ContextDefaults, SyscallGate};
use crate::registers::{Arm64Register, RegisterId, RegisterMap, RegisterSetKind};
use crate::types::{Address, ArchitectureId, PlatformId};

/// Length of the code returned by [`Arm64Module::yield_trap`].
pub const YIELD_TRAP_LEN: usize = 32;

#[cfg(target_vendor = "apple")]
macro_rules! c_symbol {
    ($name:literal) => {
        concat!("_", $name)
    };
}

#[cfg(not(target_vendor = "apple"))]
macro_rules! c_symbol {
    ($name:literal) => {
        $name
    };
}

// x0 = frame. Leaves x0 = frame and sp = frame.target_sp.
macro_rules! save_engine_state {
    () => {
        concat!(
            "sub sp, sp, #176\n",
            "stp x19, x20, [sp, #0]\n",
            "stp x21, x22, [sp, #16]\n",
            "stp x23, x24, [sp, #32]\n",
            "stp x25, x26, [sp, #48]\n",
            "stp x27, x28, [sp, #64]\n",
            "stp x29, x30, [sp, #80]\n",
            "stp d8, d9, [sp, #96]\n",
            "stp d10, d11, [sp, #112]\n",
            "stp d12, d13, [sp, #128]\n",
            "stp d14, d15, [sp, #144]\n",
            "mrs x9, fpcr\n",
            "str x9, [sp, #160]\n",
            "mov x9, sp\n",
            "str x9, [x0, #8]\n",
            "ldr x9, [x0, #56]\n",
            "mov sp, x9\n",
        )
    };
}

// x17 = general payload. x16 and x17 are loaded by the caller.
macro_rules! load_general {
    () => {
        concat!(
            "ldp x0, x1, [x17, #0]\n",
            "ldp x2, x3, [x17, #16]\n",
            "ldp x4, x5, [x17, #32]\n",
            "ldp x6, x7, [x17, #48]\n",
            "ldp x8, x9, [x17, #64]\n",
            "ldp x10, x11, [x17, #80]\n",
            "ldp x12, x13, [x17, #96]\n",
            "ldp x14, x15, [x17, #112]\n",
            "ldp x19, x20, [x17, #152]\n",
            "ldp x21, x22, [x17, #168]\n",
            "ldp x23, x24, [x17, #184]\n",
            "ldp x25, x26, [x17, #200]\n",
            "ldp x27, x28, [x17, #216]\n",
        )
    };
}

// x16 = general payload. x16 and x17 are stored by the caller.
macro_rules! store_general {
    () => {
        concat!(
            "stp x0, x1, [x16, #0]\n",
            "stp x2, x3, [x16, #16]\n",
            "stp x4, x5, [x16, #32]\n",
            "stp x6, x7, [x16, #48]\n",
            "stp x8, x9, [x16, #64]\n",
            "stp x10, x11, [x16, #80]\n",
            "stp x12, x13, [x16, #96]\n",
            "stp x14, x15, [x16, #112]\n",
            "stp x19, x20, [x16, #152]\n",
            "stp x21, x22, [x16, #168]\n",
            "stp x23, x24, [x16, #184]\n",
            "stp x25, x26, [x16, #200]\n",
            "stp x27, x28, [x16, #216]\n",
            "stp x29, x30, [x16, #232]\n",
        )
    };
}

global_asm!(
    ".text",
    // x17 = frame; clobbers x9-x11
    ".p2align 4",
    "tinyffi_arm64_load_ext:",
    "    ldr x9, [x17, #32]",
    "    cbz x9, 2f",
    "    ldp q0, q1, [x9, #0]",
    "    ldp q2, q3, [x9, #32]",
    "    ldp q4, q5, [x9, #64]",
    "    ldp q6, q7, [x9, #96]",
    "    ldp q8, q9, [x9, #128]",
    "    ldp q10, q11, [x9, #160]",
    "    ldp q12, q13, [x9, #192]",
    "    ldp q14, q15, [x9, #224]",
    "    ldp q16, q17, [x9, #256]",
    "    ldp q18, q19, [x9, #288]",
    "    ldp q20, q21, [x9, #320]",
    "    ldp q22, q23, [x9, #352]",
    "    ldp q24, q25, [x9, #384]",
    "    ldp q26, q27, [x9, #416]",
    "    ldp q28, q29, [x9, #448]",
    "    ldp q30, q31, [x9, #480]",
    "2:",
    "    ldr x9, [x17, #24]",
    "    cbz x9, 3f",
    "    ldp x10, x11, [x9]",
    "    msr fpcr, x10",
    "    msr fpsr, x11",
    "3:",
    "    ret",
    // x17 = frame; clobbers x9-x11
    ".p2align 4",
    "tinyffi_arm64_store_ext:",
    "    ldr x9, [x17, #32]",
    "    cbz x9, 2f",
    "    stp q0, q1, [x9, #0]",
    "    stp q2, q3, [x9, #32]",
    "    stp q4, q5, [x9, #64]",
    "    stp q6, q7, [x9, #96]",
    "    stp q8, q9, [x9, #128]",
    "    stp q10, q11, [x9, #160]",
    "    stp q12, q13, [x9, #192]",
    "    stp q14, q15, [x9, #224]",
    "    stp q16, q17, [x9, #256]",
    "    stp q18, q19, [x9, #288]",
    "    stp q20, q21, [x9, #320]",
    "    stp q22, q23, [x9, #352]",
    "    stp q24, q25, [x9, #384]",
    "    stp q26, q27, [x9, #416]",
    "    stp q28, q29, [x9, #448]",
    "    stp q30, q31, [x9, #480]",
    "2:",
    "    ldr x9, [x17, #24]",
    "    cbz x9, 3f",
    "    mrs x10, fpcr",
    "    mrs x11, fpsr",
    "    stp x10, x11, [x9]",
    "3:",
    "    ret",
    // x17 = frame; back on the engine stack saved by enter/resume
    ".p2align 4",
    "tinyffi_arm64_exit:",
    "    ldr x9, [x17, #8]",
    "    mov sp, x9",
    "    ldr x9, [sp, #160]",
    "    msr fpcr, x9",
    "    ldp x19, x20, [sp, #0]",
    "    ldp x21, x22, [sp, #16]",
    "    ldp x23, x24, [sp, #32]",
    "    ldp x25, x26, [sp, #48]",
    "    ldp x27, x28, [sp, #64]",
    "    ldp x29, x30, [sp, #80]",
    "    ldp d8, d9, [sp, #96]",
    "    ldp d10, d11, [sp, #112]",
    "    ldp d12, d13, [sp, #128]",
    "    ldp d14, d15, [sp, #144]",
    "    ldr x0, [x17, #64]",
    "    add sp, sp, #176",
    "    ret",
    // target stack while the target runs: [frame, 0]
    ".p2align 4",
    concat!(".globl ", c_symbol!("ffi_arm64_enter")),
    concat!(c_symbol!("ffi_arm64_enter"), ":"),
    save_engine_state!(),
    "    stp x0, xzr, [sp, #-16]!",
    "    mov x17, x0",
    "    bl tinyffi_arm64_load_ext",
    "    ldr x16, [x17]",
    "    ldr x17, [x17, #16]",
    "    cbz x17, 4f",
    load_general!(),
    "    ldr x29, [x17, #232]",
    "    ldr x17, [x17, #136]",
    "4:",
    "    blr x16",
    "    stp x16, x17, [sp, #-16]!",
    "    ldr x17, [sp, #16]",
    "    ldr x16, [x17, #16]",
    "    cbz x16, 5f",
    store_general!(),
    "    ldp x0, x1, [sp]",
    "    stp x0, x1, [x16, #128]",
    "5:",
    "    add sp, sp, #16",
    "    bl tinyffi_arm64_store_ext",
    "    str xzr, [x17, #64]",
    "    b tinyffi_arm64_exit",
    // entered from a trap stub: x16 = frame, x30 = resume pc, [target x16, x17]
    ".p2align 4",
    concat!(".globl ", c_symbol!("ffi_arm64_yield")),
    concat!(c_symbol!("ffi_arm64_yield"), ":"),
    "    mov x17, x16",
    "    ldr x16, [x17, #16]",
    "    cbz x16, 6f",
    store_general!(),
    "    ldp x0, x1, [sp]",
    "    stp x0, x1, [x16, #128]",
    "6:",
    "    str x30, [x17]",
    "    add x9, sp, #16",
    "    str x9, [x17, #56]",
    "    bl tinyffi_arm64_store_ext",
    "    mov x9, #1",
    "    str x9, [x17, #64]",
    "    b tinyffi_arm64_exit",
    ".p2align 4",
    concat!(".globl ", c_symbol!("ffi_arm64_resume")),
    concat!(c_symbol!("ffi_arm64_resume"), ":"),
    save_engine_state!(),
    "    mov x17, x0",
    "    bl tinyffi_arm64_load_ext",
    "    ldr x30, [x17]",
    "    ldr x17, [x17, #16]",
    "    cbz x17, 7f",
    load_general!(),
    "    ldr x29, [x17, #232]",
    "    ldr x16, [x17, #128]",
    "    ldr x17, [x17, #136]",
    "7:",
    "    ret",
);

extern "C" {
    fn ffi_arm64_enter(frame: *mut Frame) -> u64;
    fn ffi_arm64_resume(frame: *mut Frame) -> u64;
    fn ffi_arm64_yield();
}

/// Clean the data cache and invalidate the instruction cache over a range.
pub fn sync_instruction_cache(ptr: *const u8, len: usize)
{
    if len == 0 {
        return;
    }

    let ctr: u64;
    // SAFETY: CTR_EL0 is readable from EL0 on every supported OS
    unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags)) };

    let dline = 4usize << ((ctr >> 16) & 0xF);
    let iline = 4usize << (ctr & 0xF);
    let start = ptr as usize;
    let end = start + len;

    // SAFETY: cache maintenance by VA on memory this process owns
    unsafe {
        let mut addr = start & !(dline - 1);
        while addr < end {
            asm!("dc cvau, {}", in(reg) addr, options(nostack, preserves_flags));
            addr += dline;
        }
        asm!("dsb ish", options(nostack, preserves_flags));

        let mut addr = start & !(iline - 1);
        while addr < end {
            asm!("ic ivau, {}", in(reg) addr, options(nostack, preserves_flags));
            addr += iline;
        }
        asm!("dsb ish", "isb", options(nostack, preserves_flags));
    }
}

/// Register values after a raw `svc`
#[derive(Debug, Clone, Copy)]
struct SyscallResult
{
    x0: u64,
    x1: u64,
    carry: bool,
}

/// Execute `svc` with the number in x8 (Linux, FreeBSD) or x16 (Darwin).
///
/// # Safety
///
/// See the x86-64 backend: the syscall may touch any memory its arguments
/// point to.
unsafe fn raw_syscall(gate: SyscallGate, number: u64, args: [u64; 6]) -> SyscallResult
{
    let x0: u64;
    let x1: u64;
    let carry: u64;

    match gate {
        SyscallGate::Darwin => asm!(
            "svc #0x80",
            "cset {carry}, cs",
            carry = out(reg) carry,
            in("x16") number,
            inlateout("x0") args[0] => x0,
            inlateout("x1") args[1] => x1,
            in("x2") args[2],
            in("x3") args[3],
            in("x4") args[4],
            in("x5") args[5],
            options(nostack),
        ),
        SyscallGate::Linux | SyscallGate::Bsd => asm!(
            "svc #0",
            "cset {carry}, cs",
            carry = out(reg) carry,
            in("x8") number,
            inlateout("x0") args[0] => x0,
            inlateout("x1") args[1] => x1,
            in("x2") args[2],
            in("x3") args[3],
            in("x4") args[4],
            in("x5") args[5],
            options(nostack),
        ),
    }

    SyscallResult { x0, x1, carry: carry != 0 }
}

/// AAPCS64 backend
#[derive(Debug, Clone, Copy, Default)]
pub struct Arm64Module;

/// The instance registered by [`ModuleRegistry::native`](crate::module::ModuleRegistry::native).
pub static ARM64_MODULE: Arm64Module = Arm64Module;

impl ArchitectureModule for Arm64Module
{
    fn id(&self) -> ArchitectureId
    {
        ArchitectureId::Arm64
    }

    fn supports(&self, kind: RegisterSetKind) -> bool
    {
        matches!(
            kind,
            RegisterSetKind::General | RegisterSetKind::FloatingPoint | RegisterSetKind::Vector128
        )
    }

    fn context_init(&self, platform: PlatformId) -> FfiResult<ContextDefaults>
    {
        if platform.is_windows() {
            return Err(FfiError::IncompatibleModules {
                architecture: ArchitectureId::Arm64,
                platform,
            });
        }

        Ok(ContextDefaults {
            register_mask: self.default_mask(),
            exception_handler: Address::ZERO,
        })
    }

    fn call_syscall(&self, gate: SyscallGate, number: u64, regs: &mut RegisterMap) -> FfiResult<()>
    {
        if regs.architecture() != ArchitectureId::Arm64 {
            return Err(FfiError::InvalidArgument(format!(
                "register map is for {}, expected arm64",
                regs.architecture()
            )));
        }

        let general = regs
            .get_set(RegisterSetKind::General)
            .ok_or(FfiError::MissingRegisterSet(RegisterSetKind::General))?;
        let mut args = [0u64; 6];
        for (index, arg) in args.iter_mut().enumerate() {
            *arg = general.read_u64(index).unwrap_or(0);
        }

        // SAFETY: the caller chose the syscall and its arguments
        let result = unsafe { raw_syscall(gate, number, args) };

        let x0 = if gate != SyscallGate::Linux && result.carry {
            (result.x0 as i64).wrapping_neg() as u64
        } else {
            result.x0
        };
        debug!("syscall {:#x} via {:?} -> {:#x}", number, gate, x0);

        regs.set(RegisterId::Arm64(Arm64Register::X(0)), x0);
        regs.set(RegisterId::Arm64(Arm64Register::X(1)), result.x1);
        Ok(())
    }

    unsafe fn enter(&self, frame: NonNull<Frame>) -> FrameStatus
    {
        FrameStatus::from_raw(ffi_arm64_enter(frame.as_ptr()))
    }

    unsafe fn resume(&self, frame: NonNull<Frame>) -> FrameStatus
    {
        FrameStatus::from_raw(ffi_arm64_resume(frame.as_ptr()))
    }

    fn yield_trap(&self, frame: Address) -> Vec<u8>
    {
        let routine = ffi_arm64_yield as usize as u64;

        let mut code = Vec::with_capacity(YIELD_TRAP_LEN);
        for insn in [
            0xA9BF_47F0u32, // stp x16, x17, [sp, #-16]!
            0x5800_0070,    // ldr x16, frame
            0x5800_0091,    // ldr x17, routine
            0xD61F_0220,    // br x17
        ] {
            code.extend_from_slice(&insn.to_le_bytes());
        }
        code.extend_from_slice(&frame.value().to_le_bytes());
        code.extend_from_slice(&routine.to_le_bytes());
        code
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_yield_trap_layout()
    {
        let code = ARM64_MODULE.yield_trap(Address::new(0xAABB_CCDD_0011_2233));
        assert_eq!(code.len(), YIELD_TRAP_LEN);
        assert_eq!(&code[16..24], &0xAABB_CCDD_0011_2233u64.to_le_bytes());
    }

    #[test]
    fn test_wide_vectors_unsupported()
    {
        assert!(!ARM64_MODULE.supports(RegisterSetKind::Vector256));
        assert!(!ARM64_MODULE.default_mask().contains(RegisterSetKind::Vector512));
    }
}
