//! # x86-64 Backend
//!
//! System V AMD64 implementation of [`ArchitectureModule`].
//!
//! ## Routines
//!
//! - `ffi_x64_enter(frame)`: saves the engine's callee-saved registers,
//!   MXCSR and the x87 control word, switches to `frame.target_sp`, loads
//!   the payloads and calls `frame.pc`. When the target returns it captures
//!   the payloads and switches back.
//! - `ffi_x64_yield`: reached from a yield trap stub. Captures the target's
//!   registers, records the resumption pc and stack pointer in the frame and
//!   returns to whoever entered or resumed it.
//! - `ffi_x64_resume(frame)`: saves the engine state again, reloads the
//!   payloads and returns into the target at the recorded pc.
//!
//! ## Load order
//!
//! XMM, then YMM, then ZMM (each wider class overwrites the narrower view of
//! the same registers), then the x87 stack after `fninit`, then the general
//! registers last because RAX and RDI are used as scratch until then.
//!
//! ## General register image
//!
//! | reg | offset | reg | offset |
//! |-----|--------|-----|--------|
//! | rax | 0 | r8 | 56 |
//! | rbx | 8 | r9 | 64 |
//! | rcx | 16 | r10 | 72 |
//! | rdx | 24 | r11 | 80 |
//! | rsi | 32 | r12 | 88 |
//! | rdi | 40 | r13 | 96 |
//! | rbp | 48 | r14, r15 | 104, 112 |
//!
//! ## References
//!
//! - [System V AMD64 ABI](https://gitlab.com/x86-psABIs/x86-64-ABI)
//! - [Linux syscall(2)](https://man7.org/linux/man-pages/man2/syscall.2.html)

use std::arch::{asm, global_asm};
use std::ptr::NonNull;

use tracing::debug;

use crate::error::{FfiError, FfiResult};
use crate::frame::{Frame, FrameStatus};
use crate::module::{ArchitectureModule, ContextDefaults, SyscallGate};
use crate::registers::{RegisterId, RegisterMap, RegisterSetKind, X64Register};
use crate::types::{Address, ArchitectureId, PlatformId};

/// Length of the code returned by [`X64Module::yield_trap`].
pub const YIELD_TRAP_LEN: usize = 24;

/// Syscall class prefix for BSD calls on Darwin.
const DARWIN_CLASS_UNIX: u64 = 0x200_0000;

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

macro_rules! save_engine_state {
    () => {
        concat!(
            "push rbp\n",
            "push rbx\n",
            "push r12\n",
            "push r13\n",
            "push r14\n",
            "push r15\n",
            "stmxcsr dword ptr [rdi + 72]\n",
            "fnstcw word ptr [rdi + 76]\n",
            "mov qword ptr [rdi + 8], rsp\n",
            "mov rsp, qword ptr [rdi + 56]\n",
        )
    };
}

// rdi = frame. RDI and RAX are loaded last.
macro_rules! load_general {
    () => {
        concat!(
            "mov rax, qword ptr [rdi + 16]\n",
            "test rax, rax\n",
            "jz 5f\n",
            "mov rbx, qword ptr [rax + 8]\n",
            "mov rcx, qword ptr [rax + 16]\n",
            "mov rdx, qword ptr [rax + 24]\n",
            "mov rsi, qword ptr [rax + 32]\n",
            "mov rbp, qword ptr [rax + 48]\n",
            "mov r8, qword ptr [rax + 56]\n",
            "mov r9, qword ptr [rax + 64]\n",
            "mov r10, qword ptr [rax + 72]\n",
            "mov r11, qword ptr [rax + 80]\n",
            "mov r12, qword ptr [rax + 88]\n",
            "mov r13, qword ptr [rax + 96]\n",
            "mov r14, qword ptr [rax + 104]\n",
            "mov r15, qword ptr [rax + 112]\n",
            "mov rdi, qword ptr [rax + 40]\n",
            "mov rax, qword ptr [rax]\n",
            "5:\n",
        )
    };
}

// rax = general payload. RAX and RDI are stored by the caller.
macro_rules! store_general {
    () => {
        concat!(
            "mov qword ptr [rax + 8], rbx\n",
            "mov qword ptr [rax + 16], rcx\n",
            "mov qword ptr [rax + 24], rdx\n",
            "mov qword ptr [rax + 32], rsi\n",
            "mov qword ptr [rax + 48], rbp\n",
            "mov qword ptr [rax + 56], r8\n",
            "mov qword ptr [rax + 64], r9\n",
            "mov qword ptr [rax + 72], r10\n",
            "mov qword ptr [rax + 80], r11\n",
            "mov qword ptr [rax + 88], r12\n",
            "mov qword ptr [rax + 96], r13\n",
            "mov qword ptr [rax + 104], r14\n",
            "mov qword ptr [rax + 112], r15\n",
        )
    };
}

global_asm!(
    ".text",
    // rdi = frame; clobbers rax
    ".p2align 4",
    "tinyffi_x64_load_ext:",
    "    mov rax, qword ptr [rdi + 32]",
    "    test rax, rax",
    "    jz 2f",
    "    movdqu xmm0, xmmword ptr [rax]",
    "    movdqu xmm1, xmmword ptr [rax + 16]",
    "    movdqu xmm2, xmmword ptr [rax + 32]",
    "    movdqu xmm3, xmmword ptr [rax + 48]",
    "    movdqu xmm4, xmmword ptr [rax + 64]",
    "    movdqu xmm5, xmmword ptr [rax + 80]",
    "    movdqu xmm6, xmmword ptr [rax + 96]",
    "    movdqu xmm7, xmmword ptr [rax + 112]",
    "    movdqu xmm8, xmmword ptr [rax + 128]",
    "    movdqu xmm9, xmmword ptr [rax + 144]",
    "    movdqu xmm10, xmmword ptr [rax + 160]",
    "    movdqu xmm11, xmmword ptr [rax + 176]",
    "    movdqu xmm12, xmmword ptr [rax + 192]",
    "    movdqu xmm13, xmmword ptr [rax + 208]",
    "    movdqu xmm14, xmmword ptr [rax + 224]",
    "    movdqu xmm15, xmmword ptr [rax + 240]",
    "2:",
    "    mov rax, qword ptr [rdi + 40]",
    "    test rax, rax",
    "    jz 3f",
    "    vmovdqu ymm0, ymmword ptr [rax]",
    "    vmovdqu ymm1, ymmword ptr [rax + 32]",
    "    vmovdqu ymm2, ymmword ptr [rax + 64]",
    "    vmovdqu ymm3, ymmword ptr [rax + 96]",
    "    vmovdqu ymm4, ymmword ptr [rax + 128]",
    "    vmovdqu ymm5, ymmword ptr [rax + 160]",
    "    vmovdqu ymm6, ymmword ptr [rax + 192]",
    "    vmovdqu ymm7, ymmword ptr [rax + 224]",
    "    vmovdqu ymm8, ymmword ptr [rax + 256]",
    "    vmovdqu ymm9, ymmword ptr [rax + 288]",
    "    vmovdqu ymm10, ymmword ptr [rax + 320]",
    "    vmovdqu ymm11, ymmword ptr [rax + 352]",
    "    vmovdqu ymm12, ymmword ptr [rax + 384]",
    "    vmovdqu ymm13, ymmword ptr [rax + 416]",
    "    vmovdqu ymm14, ymmword ptr [rax + 448]",
    "    vmovdqu ymm15, ymmword ptr [rax + 480]",
    "3:",
    "    mov rax, qword ptr [rdi + 48]",
    "    test rax, rax",
    "    jz 4f",
    "    vmovdqu64 zmm0, zmmword ptr [rax]",
    "    vmovdqu64 zmm1, zmmword ptr [rax + 64]",
    "    vmovdqu64 zmm2, zmmword ptr [rax + 128]",
    "    vmovdqu64 zmm3, zmmword ptr [rax + 192]",
    "    vmovdqu64 zmm4, zmmword ptr [rax + 256]",
    "    vmovdqu64 zmm5, zmmword ptr [rax + 320]",
    "    vmovdqu64 zmm6, zmmword ptr [rax + 384]",
    "    vmovdqu64 zmm7, zmmword ptr [rax + 448]",
    "    vmovdqu64 zmm8, zmmword ptr [rax + 512]",
    "    vmovdqu64 zmm9, zmmword ptr [rax + 576]",
    "    vmovdqu64 zmm10, zmmword ptr [rax + 640]",
    "    vmovdqu64 zmm11, zmmword ptr [rax + 704]",
    "    vmovdqu64 zmm12, zmmword ptr [rax + 768]",
    "    vmovdqu64 zmm13, zmmword ptr [rax + 832]",
    "    vmovdqu64 zmm14, zmmword ptr [rax + 896]",
    "    vmovdqu64 zmm15, zmmword ptr [rax + 960]",
    "    vmovdqu64 zmm16, zmmword ptr [rax + 1024]",
    "    vmovdqu64 zmm17, zmmword ptr [rax + 1088]",
    "    vmovdqu64 zmm18, zmmword ptr [rax + 1152]",
    "    vmovdqu64 zmm19, zmmword ptr [rax + 1216]",
    "    vmovdqu64 zmm20, zmmword ptr [rax + 1280]",
    "    vmovdqu64 zmm21, zmmword ptr [rax + 1344]",
    "    vmovdqu64 zmm22, zmmword ptr [rax + 1408]",
    "    vmovdqu64 zmm23, zmmword ptr [rax + 1472]",
    "    vmovdqu64 zmm24, zmmword ptr [rax + 1536]",
    "    vmovdqu64 zmm25, zmmword ptr [rax + 1600]",
    "    vmovdqu64 zmm26, zmmword ptr [rax + 1664]",
    "    vmovdqu64 zmm27, zmmword ptr [rax + 1728]",
    "    vmovdqu64 zmm28, zmmword ptr [rax + 1792]",
    "    vmovdqu64 zmm29, zmmword ptr [rax + 1856]",
    "    vmovdqu64 zmm30, zmmword ptr [rax + 1920]",
    "    vmovdqu64 zmm31, zmmword ptr [rax + 1984]",
    "4:",
    // st0 is entry 0, so push entry 7 first
    "    mov rax, qword ptr [rdi + 24]",
    "    test rax, rax",
    "    jz 5f",
    "    fninit",
    "    fld tbyte ptr [rax + 70]",
    "    fld tbyte ptr [rax + 60]",
    "    fld tbyte ptr [rax + 50]",
    "    fld tbyte ptr [rax + 40]",
    "    fld tbyte ptr [rax + 30]",
    "    fld tbyte ptr [rax + 20]",
    "    fld tbyte ptr [rax + 10]",
    "    fld tbyte ptr [rax]",
    "5:",
    "    ret",
    // rdi = frame; clobbers rax
    ".p2align 4",
    "tinyffi_x64_store_ext:",
    "    mov rax, qword ptr [rdi + 24]",
    "    test rax, rax",
    "    jz 2f",
    "    fstp tbyte ptr [rax]",
    "    fstp tbyte ptr [rax + 10]",
    "    fstp tbyte ptr [rax + 20]",
    "    fstp tbyte ptr [rax + 30]",
    "    fstp tbyte ptr [rax + 40]",
    "    fstp tbyte ptr [rax + 50]",
    "    fstp tbyte ptr [rax + 60]",
    "    fstp tbyte ptr [rax + 70]",
    "    fnclex",
    "2:",
    "    mov rax, qword ptr [rdi + 32]",
    "    test rax, rax",
    "    jz 3f",
    "    movdqu xmmword ptr [rax], xmm0",
    "    movdqu xmmword ptr [rax + 16], xmm1",
    "    movdqu xmmword ptr [rax + 32], xmm2",
    "    movdqu xmmword ptr [rax + 48], xmm3",
    "    movdqu xmmword ptr [rax + 64], xmm4",
    "    movdqu xmmword ptr [rax + 80], xmm5",
    "    movdqu xmmword ptr [rax + 96], xmm6",
    "    movdqu xmmword ptr [rax + 112], xmm7",
    "    movdqu xmmword ptr [rax + 128], xmm8",
    "    movdqu xmmword ptr [rax + 144], xmm9",
    "    movdqu xmmword ptr [rax + 160], xmm10",
    "    movdqu xmmword ptr [rax + 176], xmm11",
    "    movdqu xmmword ptr [rax + 192], xmm12",
    "    movdqu xmmword ptr [rax + 208], xmm13",
    "    movdqu xmmword ptr [rax + 224], xmm14",
    "    movdqu xmmword ptr [rax + 240], xmm15",
    "3:",
    "    mov rax, qword ptr [rdi + 40]",
    "    test rax, rax",
    "    jz 4f",
    "    vmovdqu ymmword ptr [rax], ymm0",
    "    vmovdqu ymmword ptr [rax + 32], ymm1",
    "    vmovdqu ymmword ptr [rax + 64], ymm2",
    "    vmovdqu ymmword ptr [rax + 96], ymm3",
    "    vmovdqu ymmword ptr [rax + 128], ymm4",
    "    vmovdqu ymmword ptr [rax + 160], ymm5",
    "    vmovdqu ymmword ptr [rax + 192], ymm6",
    "    vmovdqu ymmword ptr [rax + 224], ymm7",
    "    vmovdqu ymmword ptr [rax + 256], ymm8",
    "    vmovdqu ymmword ptr [rax + 288], ymm9",
    "    vmovdqu ymmword ptr [rax + 320], ymm10",
    "    vmovdqu ymmword ptr [rax + 352], ymm11",
    "    vmovdqu ymmword ptr [rax + 384], ymm12",
    "    vmovdqu ymmword ptr [rax + 416], ymm13",
    "    vmovdqu ymmword ptr [rax + 448], ymm14",
    "    vmovdqu ymmword ptr [rax + 480], ymm15",
    "4:",
    "    mov rax, qword ptr [rdi + 48]",
    "    test rax, rax",
    "    jz 5f",
    "    vmovdqu64 zmmword ptr [rax], zmm0",
    "    vmovdqu64 zmmword ptr [rax + 64], zmm1",
    "    vmovdqu64 zmmword ptr [rax + 128], zmm2",
    "    vmovdqu64 zmmword ptr [rax + 192], zmm3",
    "    vmovdqu64 zmmword ptr [rax + 256], zmm4",
    "    vmovdqu64 zmmword ptr [rax + 320], zmm5",
    "    vmovdqu64 zmmword ptr [rax + 384], zmm6",
    "    vmovdqu64 zmmword ptr [rax + 448], zmm7",
    "    vmovdqu64 zmmword ptr [rax + 512], zmm8",
    "    vmovdqu64 zmmword ptr [rax + 576], zmm9",
    "    vmovdqu64 zmmword ptr [rax + 640], zmm10",
    "    vmovdqu64 zmmword ptr [rax + 704], zmm11",
    "    vmovdqu64 zmmword ptr [rax + 768], zmm12",
    "    vmovdqu64 zmmword ptr [rax + 832], zmm13",
    "    vmovdqu64 zmmword ptr [rax + 896], zmm14",
    "    vmovdqu64 zmmword ptr [rax + 960], zmm15",
    "    vmovdqu64 zmmword ptr [rax + 1024], zmm16",
    "    vmovdqu64 zmmword ptr [rax + 1088], zmm17",
    "    vmovdqu64 zmmword ptr [rax + 1152], zmm18",
    "    vmovdqu64 zmmword ptr [rax + 1216], zmm19",
    "    vmovdqu64 zmmword ptr [rax + 1280], zmm20",
    "    vmovdqu64 zmmword ptr [rax + 1344], zmm21",
    "    vmovdqu64 zmmword ptr [rax + 1408], zmm22",
    "    vmovdqu64 zmmword ptr [rax + 1472], zmm23",
    "    vmovdqu64 zmmword ptr [rax + 1536], zmm24",
    "    vmovdqu64 zmmword ptr [rax + 1600], zmm25",
    "    vmovdqu64 zmmword ptr [rax + 1664], zmm26",
    "    vmovdqu64 zmmword ptr [rax + 1728], zmm27",
    "    vmovdqu64 zmmword ptr [rax + 1792], zmm28",
    "    vmovdqu64 zmmword ptr [rax + 1856], zmm29",
    "    vmovdqu64 zmmword ptr [rax + 1920], zmm30",
    "    vmovdqu64 zmmword ptr [rax + 1984], zmm31",
    "5:",
    "    mov rax, qword ptr [rdi + 40]",
    "    or rax, qword ptr [rdi + 48]",
    "    jz 6f",
    "    vzeroupper",
    "6:",
    "    ret",
    // rdi = frame; back on the engine stack saved by enter/resume
    ".p2align 4",
    "tinyffi_x64_exit:",
    "    mov rsp, qword ptr [rdi + 8]",
    "    fninit",
    "    fldcw word ptr [rdi + 76]",
    "    ldmxcsr dword ptr [rdi + 72]",
    "    cld",
    "    mov rax, qword ptr [rdi + 64]",
    "    pop r15",
    "    pop r14",
    "    pop r13",
    "    pop r12",
    "    pop rbx",
    "    pop rbp",
    "    ret",
    // target stack while the target runs: [frame, pc, return address]
    ".p2align 4",
    concat!(".globl ", c_symbol!("ffi_x64_enter")),
    concat!(c_symbol!("ffi_x64_enter"), ":"),
    save_engine_state!(),
    "    push rdi",
    "    push qword ptr [rdi]",
    "    call tinyffi_x64_load_ext",
    load_general!(),
    "    call qword ptr [rsp]",
    "    push rdi",
    "    push rax",
    "    mov rdi, qword ptr [rsp + 24]",
    "    mov rax, qword ptr [rdi + 16]",
    "    test rax, rax",
    "    jz 6f",
    store_general!(),
    "    mov rbx, qword ptr [rsp]",
    "    mov qword ptr [rax], rbx",
    "    mov rbx, qword ptr [rsp + 8]",
    "    mov qword ptr [rax + 40], rbx",
    "6:",
    "    call tinyffi_x64_store_ext",
    "    mov qword ptr [rdi + 64], 0",
    "    jmp tinyffi_x64_exit",
    // entered from a trap stub: [frame, target rax, resume pc]
    ".p2align 4",
    concat!(".globl ", c_symbol!("ffi_x64_yield")),
    concat!(c_symbol!("ffi_x64_yield"), ":"),
    "    push rdi",
    "    mov rdi, qword ptr [rsp + 8]",
    "    mov rax, qword ptr [rdi + 16]",
    "    test rax, rax",
    "    jz 6f",
    store_general!(),
    "    mov rbx, qword ptr [rsp + 16]",
    "    mov qword ptr [rax], rbx",
    "    mov rbx, qword ptr [rsp]",
    "    mov qword ptr [rax + 40], rbx",
    "6:",
    "    mov rax, qword ptr [rsp + 24]",
    "    mov qword ptr [rdi], rax",
    "    lea rax, [rsp + 32]",
    "    mov qword ptr [rdi + 56], rax",
    "    call tinyffi_x64_store_ext",
    "    mov qword ptr [rdi + 64], 1",
    "    jmp tinyffi_x64_exit",
    ".p2align 4",
    concat!(".globl ", c_symbol!("ffi_x64_resume")),
    concat!(c_symbol!("ffi_x64_resume"), ":"),
    save_engine_state!(),
    "    push qword ptr [rdi]",
    "    call tinyffi_x64_load_ext",
    load_general!(),
    "    ret",
);

extern "C" {
    fn ffi_x64_enter(frame: *mut Frame) -> u64;
    fn ffi_x64_resume(frame: *mut Frame) -> u64;
    fn ffi_x64_yield();
}

/// Register values after a raw `syscall`
#[derive(Debug, Clone, Copy)]
struct SyscallResult
{
    rax: u64,
    rdx: u64,
    rcx: u64,
    r11: u64,
    carry: bool,
}

/// Execute `syscall` with the Linux/BSD argument registers.
///
/// # Safety
///
/// The syscall may read or write any memory its arguments point to, or
/// change the process in ways Rust cannot see (exit, mmap, ...).
unsafe fn raw_syscall(number: u64, args: [u64; 6]) -> SyscallResult
{
    let rax: u64;
    let rdx: u64;
    let rcx: u64;
    let r11: u64;
    let carry: u8;

    asm!(
        "syscall",
        "setc {carry}",
        carry = out(reg_byte) carry,
        inlateout("rax") number => rax,
        in("rdi") args[0],
        in("rsi") args[1],
        inlateout("rdx") args[2] => rdx,
        in("r10") args[3],
        in("r8") args[4],
        in("r9") args[5],
        lateout("rcx") rcx,
        lateout("r11") r11,
        options(nostack),
    );

    SyscallResult {
        rax,
        rdx,
        rcx,
        r11,
        carry: carry != 0,
    }
}

/// System V x86-64 backend
#[derive(Debug, Clone, Copy, Default)]
pub struct X64Module;

/// The instance registered by [`ModuleRegistry::native`](crate::module::ModuleRegistry::native).
pub static X64_MODULE: X64Module = X64Module;

impl ArchitectureModule for X64Module
{
    fn id(&self) -> ArchitectureId
    {
        ArchitectureId::X64
    }

    fn supports(&self, kind: RegisterSetKind) -> bool
    {
        match kind {
            RegisterSetKind::General | RegisterSetKind::FloatingPoint | RegisterSetKind::Vector128 => true,
            RegisterSetKind::Vector256 => std::is_x86_feature_detected!("avx"),
            RegisterSetKind::Vector512 => std::is_x86_feature_detected!("avx512f"),
        }
    }

    fn context_init(&self, platform: PlatformId) -> FfiResult<ContextDefaults>
    {
        if platform.is_windows() {
            return Err(FfiError::IncompatibleModules {
                architecture: ArchitectureId::X64,
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
        if regs.architecture() != ArchitectureId::X64 {
            return Err(FfiError::InvalidArgument(format!(
                "register map is for {}, expected x86_64",
                regs.architecture()
            )));
        }

        let general = regs
            .get_set(RegisterSetKind::General)
            .ok_or(FfiError::MissingRegisterSet(RegisterSetKind::General))?;
        let arg = |reg: X64Register| general.read_u64(reg.index()).unwrap_or(0);
        let args = [
            arg(X64Register::Rdi),
            arg(X64Register::Rsi),
            arg(X64Register::Rdx),
            arg(X64Register::R10),
            arg(X64Register::R8),
            arg(X64Register::R9),
        ];

        let number = match gate {
            SyscallGate::Darwin if number >> 24 == 0 => number | DARWIN_CLASS_UNIX,
            _ => number,
        };

        // SAFETY: the caller chose the syscall and its arguments; the asm
        // declares every register the instruction touches
        let result = unsafe { raw_syscall(number, args) };

        let rax = if gate != SyscallGate::Linux && result.carry {
            (result.rax as i64).wrapping_neg() as u64
        } else {
            result.rax
        };
        debug!("syscall {:#x} via {:?} -> {:#x}", number, gate, rax);

        for (reg, value) in [
            (X64Register::Rax, rax),
            (X64Register::Rdx, result.rdx),
            (X64Register::Rcx, result.rcx),
            (X64Register::R11, result.r11),
        ] {
            regs.set(RegisterId::X64(reg), value);
        }
        Ok(())
    }

    unsafe fn enter(&self, frame: NonNull<Frame>) -> FrameStatus
    {
        FrameStatus::from_raw(ffi_x64_enter(frame.as_ptr()))
    }

    unsafe fn resume(&self, frame: NonNull<Frame>) -> FrameStatus
    {
        FrameStatus::from_raw(ffi_x64_resume(frame.as_ptr()))
    }

    fn yield_trap(&self, frame: Address) -> Vec<u8>
    {
        let routine = ffi_x64_yield as usize as u64;

        let mut code = Vec::with_capacity(YIELD_TRAP_LEN);
        code.push(0x50); // push rax
        code.extend_from_slice(&[0x48, 0xB8]); // mov rax, frame
        code.extend_from_slice(&frame.value().to_le_bytes());
        code.push(0x50); // push rax
        code.extend_from_slice(&[0x48, 0xB8]); // mov rax, routine
        code.extend_from_slice(&routine.to_le_bytes());
        code.extend_from_slice(&[0xFF, 0xE0]); // jmp rax
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
        let code = X64_MODULE.yield_trap(Address::new(0x1122_3344_5566_7788));
        assert_eq!(code.len(), YIELD_TRAP_LEN);
        assert_eq!(&code[..3], &[0x50, 0x48, 0xB8]);
        assert_eq!(&code[3..11], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(code[11], 0x50);
        assert_eq!(&code[22..], &[0xFF, 0xE0]);
    }

    #[test]
    fn test_windows_rejected()
    {
        let err = X64_MODULE.context_init(PlatformId::WindowsNt).unwrap_err();
        assert!(matches!(err, FfiError::IncompatibleModules { .. }));
    }

    #[test]
    fn test_default_mask_has_baseline_sets()
    {
        let mask = X64_MODULE.default_mask();
        assert!(mask.contains(RegisterSetKind::General));
        assert!(mask.contains(RegisterSetKind::FloatingPoint));
        assert!(mask.contains(RegisterSetKind::Vector128));
    }
}
