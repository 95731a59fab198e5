//! Register identifiers.

use crate::types::ArchitectureId;

/// Identifier for one general-purpose register
///
/// Each variant belongs to exactly one architecture. Looking up a register
/// in a map built for another architecture yields `None` rather than
/// reinterpreting the bytes.
///
/// ## Example
///
/// ```rust
/// use tinyffi_core::registers::{Arm64Register, RegisterId, X64Register};
///
/// let rax = RegisterId::X64(X64Register::Rax);
/// let x0 = RegisterId::Arm64(Arm64Register::X(0));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterId
{
    /// 32-bit x86 register
    X86(X86Register),
    /// x86-64 register
    X64(X64Register),
    /// AArch64 register (X0-X30)
    Arm64(Arm64Register),
    /// MIPS64 register r0-r31
    Mips64(u8),
}

impl RegisterId
{
    /// Architecture this register belongs to.
    pub const fn architecture(self) -> ArchitectureId
    {
        match self {
            RegisterId::X86(_) => ArchitectureId::X86,
            RegisterId::X64(_) => ArchitectureId::X64,
            RegisterId::Arm64(_) => ArchitectureId::Arm64,
            RegisterId::Mips64(_) => ArchitectureId::Mips64,
        }
    }

    /// Index of the register inside the general-purpose set.
    pub const fn index(self) -> usize
    {
        match self {
            RegisterId::X86(reg) => reg.index(),
            RegisterId::X64(reg) => reg.index(),
            RegisterId::Arm64(Arm64Register::X(n)) | RegisterId::Mips64(n) => n as usize,
        }
    }
}

/// 32-bit x86 general-purpose register
///
/// Stored in `pushad` order without `esp`: EDI, ESI, EBP, EBX, EDX, ECX, EAX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum X86Register
{
    /// EDI - destination index
    Edi,
    /// ESI - source index
    Esi,
    /// EBP - frame pointer
    Ebp,
    /// EBX - base register
    Ebx,
    /// EDX - data register
    Edx,
    /// ECX - counter register
    Ecx,
    /// EAX - accumulator (return value)
    Eax,
}

impl X86Register
{
    const fn index(self) -> usize
    {
        match self {
            X86Register::Edi => 0,
            X86Register::Esi => 1,
            X86Register::Ebp => 2,
            X86Register::Ebx => 3,
            X86Register::Edx => 4,
            X86Register::Ecx => 5,
            X86Register::Eax => 6,
        }
    }
}

/// x86-64 general-purpose register
///
/// The stack pointer is not part of the set: the engine owns RSP for the
/// duration of a call.
///
/// ## Layout
///
/// - RAX = 0, RBX = 1, RCX = 2, RDX = 3
/// - RSI = 4, RDI = 5, RBP = 6
/// - R8 = 7 ... R15 = 14
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum X64Register
{
    /// RAX - Accumulator register (return values, syscall number)
    Rax,
    /// RBX - Base register
    Rbx,
    /// RCX - Counter register (4th argument)
    Rcx,
    /// RDX - Data register (3rd argument)
    Rdx,
    /// RSI - Source index register (2nd argument)
    Rsi,
    /// RDI - Destination index register (1st argument)
    Rdi,
    /// RBP - Base pointer
    Rbp,
    /// R8 - 5th argument
    R8,
    /// R9 - 6th argument
    R9,
    /// R10 - 4th syscall argument
    R10,
    /// R11
    R11,
    /// R12
    R12,
    /// R13
    R13,
    /// R14
    R14,
    /// R15
    R15,
}

impl X64Register
{
    /// Every register in storage order.
    pub const ALL: [X64Register; 15] = [
        X64Register::Rax,
        X64Register::Rbx,
        X64Register::Rcx,
        X64Register::Rdx,
        X64Register::Rsi,
        X64Register::Rdi,
        X64Register::Rbp,
        X64Register::R8,
        X64Register::R9,
        X64Register::R10,
        X64Register::R11,
        X64Register::R12,
        X64Register::R13,
        X64Register::R14,
        X64Register::R15,
    ];

    /// Index of this register in the general-purpose byte image.
    pub const fn index(self) -> usize
    {
        match self {
            X64Register::Rax => 0,
            X64Register::Rbx => 1,
            X64Register::Rcx => 2,
            X64Register::Rdx => 3,
            X64Register::Rsi => 4,
            X64Register::Rdi => 5,
            X64Register::Rbp => 6,
            X64Register::R8 => 7,
            X64Register::R9 => 8,
            X64Register::R10 => 9,
            X64Register::R11 => 10,
            X64Register::R12 => 11,
            X64Register::R13 => 12,
            X64Register::R14 => 13,
            X64Register::R15 => 14,
        }
    }

    /// Lower-case assembler name.
    pub const fn name(self) -> &'static str
    {
        match self {
            X64Register::Rax => "rax",
            X64Register::Rbx => "rbx",
            X64Register::Rcx => "rcx",
            X64Register::Rdx => "rdx",
            X64Register::Rsi => "rsi",
            X64Register::Rdi => "rdi",
            X64Register::Rbp => "rbp",
            X64Register::R8 => "r8",
            X64Register::R9 => "r9",
            X64Register::R10 => "r10",
            X64Register::R11 => "r11",
            X64Register::R12 => "r12",
            X64Register::R13 => "r13",
            X64Register::R14 => "r14",
            X64Register::R15 => "r15",
        }
    }
}

/// AArch64 general-purpose register identifier
///
/// - **X0-X7**: arguments and results
/// - **X8**: indirect result / Linux syscall number
/// - **X16, X17**: intra-procedure scratch; X16 carries the entry pc
/// - **X18**: platform register, never loaded or captured
/// - **X29 (FP)**, **X30 (LR)**
///
/// The value must be between 0 and 30 (inclusive); other values are
/// rejected by the register map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arm64Register
{
    /// General-purpose register X0-X30
    X(u8),
}
