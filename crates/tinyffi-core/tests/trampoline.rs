//! Tests that run generated machine code through the native trampoline
#![cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]

use tinyffi_core::error::FfiError;
use tinyffi_core::registers::{RegisterMask, RegisterSetKind};
use tinyffi_core::stub::Stub;
use tinyffi_core::types::{Address, ArchitectureId};
use tinyffi_core::{Context, RegisterMap};

fn stub(ctx: &Context, code: &[u8]) -> Stub
{
    Stub::with_code(ctx.platform_module(), code).unwrap()
}

#[test]
fn test_call_without_general_set()
{
    let mut ctx = Context::native().unwrap();
    #[cfg(target_arch = "x86_64")]
    let ret = stub(&ctx, &[0xC3]);
    #[cfg(target_arch = "aarch64")]
    let ret = stub(&ctx, &0xD65F_03C0u32.to_le_bytes());

    let mut regs = ctx.new_registers();
    ctx.call(ret.pc().unwrap(), &mut regs).unwrap();
    assert!(regs.is_empty());
}

#[test]
fn test_call_rejects_foreign_map()
{
    let mut ctx = Context::native().unwrap();
    let other = match ctx.architecture() {
        ArchitectureId::X64 => ArchitectureId::Arm64,
        _ => ArchitectureId::X64,
    };
    let mut regs = RegisterMap::new(other);

    assert!(matches!(
        ctx.call(Address::new(0x1000), &mut regs),
        Err(FfiError::InvalidArgument(_))
    ));
}

#[cfg(target_arch = "x86_64")]
mod x86_64
{
    use tinyffi_core::registers::{RegisterId, X64Register};

    use super::*;

    fn reg(r: X64Register) -> RegisterId
    {
        RegisterId::X64(r)
    }

    #[test]
    fn test_constant_return()
    {
        let mut ctx = Context::native().unwrap();
        // mov eax, 42; ret
        let code = stub(&ctx, &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]);

        let mut regs = ctx.new_registers();
        regs.add(RegisterSetKind::General).unwrap();
        regs.set(reg(X64Register::Rax), 0xFFFF_FFFF_FFFF_FFFF).unwrap();
        ctx.call(code.pc().unwrap(), &mut regs).unwrap();

        assert_eq!(regs.get(reg(X64Register::Rax)), Some(42));
    }

    #[test]
    fn test_argument_passthrough()
    {
        let mut ctx = Context::native().unwrap();
        // mov rax, rdi; add rax, rsi; ret
        let code = stub(&ctx, &[0x48, 0x89, 0xF8, 0x48, 0x01, 0xF0, 0xC3]);

        let mut regs = ctx.new_registers();
        regs.add(RegisterSetKind::General).unwrap();
        regs.set(reg(X64Register::Rdi), 0x1234_5678_0000_0000).unwrap();
        regs.set(reg(X64Register::Rsi), 0x9ABC).unwrap();
        regs.set(reg(X64Register::R15), 0x5555).unwrap();
        ctx.call(code.pc().unwrap(), &mut regs).unwrap();

        assert_eq!(regs.get(reg(X64Register::Rax)), Some(0x1234_5678_0000_9ABC));
        assert_eq!(regs.get(reg(X64Register::Rdi)), Some(0x1234_5678_0000_0000));
        assert_eq!(regs.get(reg(X64Register::R15)), Some(0x5555));
    }

    #[test]
    fn test_callee_saved_registers_captured()
    {
        let mut ctx = Context::native().unwrap();
        // mov rbx, 7; mov r12, rbx; ret
        let code = stub(
            &ctx,
            &[0x48, 0xC7, 0xC3, 0x07, 0x00, 0x00, 0x00, 0x49, 0x89, 0xDC, 0xC3],
        );

        let mut regs = ctx.new_registers();
        regs.add(RegisterSetKind::General).unwrap();
        ctx.call(code.pc().unwrap(), &mut regs).unwrap();

        assert_eq!(regs.get(reg(X64Register::Rbx)), Some(7));
        assert_eq!(regs.get(reg(X64Register::R12)), Some(7));
    }

    #[test]
    fn test_x87_stack()
    {
        let mut ctx = Context::native().unwrap();
        // fstp st(0); fld1; ret
        let code = stub(&ctx, &[0xDD, 0xD8, 0xD9, 0xE8, 0xC3]);

        let mut regs = ctx.new_registers();
        regs.add(RegisterSetKind::FloatingPoint).unwrap();
        ctx.call(code.pc().unwrap(), &mut regs).unwrap();

        assert_eq!(
            regs.lane(RegisterSetKind::FloatingPoint, 0),
            Some(&[0, 0, 0, 0, 0, 0, 0, 0x80, 0xFF, 0x3F][..])
        );
        assert_eq!(regs.lane(RegisterSetKind::FloatingPoint, 1), Some(&[0u8; 10][..]));
    }

    #[test]
    fn test_xmm_capture()
    {
        let mut ctx = Context::native().unwrap();
        // movq xmm0, rdi; ret
        let code = stub(&ctx, &[0x66, 0x48, 0x0F, 0x6E, 0xC7, 0xC3]);

        let mut regs = ctx.new_registers();
        regs.add(RegisterSetKind::General).unwrap();
        regs.add(RegisterSetKind::Vector128).unwrap();
        regs.set_lane(RegisterSetKind::Vector128, 0, &[0xAA; 16]).unwrap();
        regs.set_lane(RegisterSetKind::Vector128, 9, &[0x11; 16]).unwrap();
        regs.set(reg(X64Register::Rdi), 0x0102_0304_0506_0708).unwrap();
        ctx.call(code.pc().unwrap(), &mut regs).unwrap();

        let mut expected = [0u8; 16];
        expected[..8].copy_from_slice(&0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(regs.lane(RegisterSetKind::Vector128, 0), Some(&expected[..]));
        assert_eq!(regs.lane(RegisterSetKind::Vector128, 9), Some(&[0x11; 16][..]));
    }

    #[test]
    fn test_unmasked_sets_untouched()
    {
        let mut ctx = Context::native().unwrap();
        ctx.set_register_mask(RegisterMask::from(RegisterSetKind::General)).unwrap();
        // movq xmm0, rdi; ret
        let code = stub(&ctx, &[0x66, 0x48, 0x0F, 0x6E, 0xC7, 0xC3]);

        let mut regs = ctx.new_registers();
        regs.add(RegisterSetKind::General).unwrap();
        regs.add(RegisterSetKind::Vector128).unwrap();
        regs.set_lane(RegisterSetKind::Vector128, 0, &[0xAA; 16]).unwrap();
        regs.set(reg(X64Register::Rdi), 5).unwrap();
        ctx.call(code.pc().unwrap(), &mut regs).unwrap();

        assert_eq!(regs.lane(RegisterSetKind::Vector128, 0), Some(&[0xAA; 16][..]));
    }

    #[test]
    fn test_ymm_capture()
    {
        let mut ctx = Context::native().unwrap();
        if !ctx.architecture_module().supports(RegisterSetKind::Vector256) {
            return;
        }
        // vcmpps ymm3, ymm3, ymm3, 0x0f (true); ret
        let code = stub(&ctx, &[0xC5, 0xE4, 0xC2, 0xDB, 0x0F, 0xC3]);

        let mut regs = ctx.new_registers();
        regs.add(RegisterSetKind::Vector256).unwrap();
        ctx.call(code.pc().unwrap(), &mut regs).unwrap();

        assert_eq!(regs.lane(RegisterSetKind::Vector256, 3), Some(&[0xFF; 32][..]));
        assert_eq!(regs.lane(RegisterSetKind::Vector256, 2), Some(&[0u8; 32][..]));
    }

    #[test]
    fn test_zmm_capture()
    {
        let mut ctx = Context::native().unwrap();
        if !ctx.architecture_module().supports(RegisterSetKind::Vector512) {
            return;
        }
        // vpternlogd zmm7, zmm7, zmm7, 0xff; ret
        let code = stub(&ctx, &[0x62, 0xF3, 0x45, 0x48, 0x25, 0xFF, 0xFF, 0xC3]);

        let mut regs = ctx.new_registers();
        regs.add(RegisterSetKind::Vector512).unwrap();
        ctx.call(code.pc().unwrap(), &mut regs).unwrap();

        assert_eq!(regs.lane(RegisterSetKind::Vector512, 7), Some(&[0xFF; 64][..]));
    }

    #[test]
    fn test_missing_cpu_feature()
    {
        let mut ctx = Context::native().unwrap();
        if ctx.architecture_module().supports(RegisterSetKind::Vector512) {
            return;
        }
        ctx.set_register_mask(RegisterMask::ALL).unwrap();
        let code = stub(&ctx, &[0xC3]);

        let mut regs = ctx.new_registers();
        regs.add(RegisterSetKind::Vector512).unwrap();
        assert!(matches!(
            ctx.call(code.pc().unwrap(), &mut regs),
            Err(FfiError::CpuFeatureMissing(RegisterSetKind::Vector512))
        ));
    }

    #[test]
    fn test_call_function()
    {
        let ctx = Context::native().unwrap();
        // lea rax, [rdi + 1]; ret
        let code = stub(&ctx, &[0x48, 0x8D, 0x47, 0x01, 0xC3]);

        let mut regs = ctx.new_registers();
        regs.add(RegisterSetKind::General).unwrap();
        regs.set(reg(X64Register::Rdi), 99).unwrap();
        ctx.architecture_module()
            .call_function(code.pc().unwrap(), &mut regs)
            .unwrap();

        assert_eq!(regs.get(reg(X64Register::Rax)), Some(100));
    }

    #[test]
    fn test_repeated_calls_reuse_closure()
    {
        let mut ctx = Context::native().unwrap();
        // lea rax, [rdi + 1]; ret
        let code = stub(&ctx, &[0x48, 0x8D, 0x47, 0x01, 0xC3]);

        let mut regs = ctx.new_registers();
        regs.add(RegisterSetKind::General).unwrap();
        for _ in 0..100 {
            let next = regs.get(reg(X64Register::Rax)).unwrap();
            regs.set(reg(X64Register::Rdi), next).unwrap();
            ctx.call(code.pc().unwrap(), &mut regs).unwrap();
        }
        assert_eq!(regs.get(reg(X64Register::Rax)), Some(100));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_getpid_syscall()
    {
        let mut ctx = Context::native().unwrap();
        let mut regs = ctx.new_registers();
        regs.add(RegisterSetKind::General).unwrap();

        ctx.syscall(39, &mut regs).unwrap();
        assert_eq!(regs.get(reg(X64Register::Rax)), Some(u64::from(std::process::id())));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_syscall_returns_negative_errno()
    {
        let mut ctx = Context::native().unwrap();
        let mut regs = ctx.new_registers();
        regs.add(RegisterSetKind::General).unwrap();
        // close(-1)
        regs.set(reg(X64Register::Rdi), u64::MAX).unwrap();

        ctx.syscall(3, &mut regs).unwrap();
        assert_eq!(regs.get(reg(X64Register::Rax)).map(|v| v as i64), Some(-9));
    }

    #[test]
    fn test_syscall_requires_general()
    {
        let mut ctx = Context::native().unwrap();
        let mut regs = ctx.new_registers();

        assert!(matches!(
            ctx.syscall(39, &mut regs),
            Err(FfiError::MissingRegisterSet(RegisterSetKind::General))
        ));
    }
}

#[cfg(target_arch = "aarch64")]
mod aarch64
{
    use tinyffi_core::registers::{Arm64Register, RegisterId};

    use super::*;

    fn x(n: u8) -> RegisterId
    {
        RegisterId::Arm64(Arm64Register::X(n))
    }

    fn code(words: &[u32]) -> Vec<u8>
    {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_constant_return()
    {
        let mut ctx = Context::native().unwrap();
        // mov x0, #42; ret
        let code = stub(&ctx, &code(&[0xD280_0540, 0xD65F_03C0]));

        let mut regs = ctx.new_registers();
        regs.add(RegisterSetKind::General).unwrap();
        ctx.call(code.pc().unwrap(), &mut regs).unwrap();

        assert_eq!(regs.get(x(0)), Some(42));
    }

    #[test]
    fn test_argument_passthrough()
    {
        let mut ctx = Context::native().unwrap();
        // add x0, x0, x1; mov x19, x0; ret
        let code = stub(&ctx, &code(&[0x8B01_0000, 0xAA00_03F3, 0xD65F_03C0]));

        let mut regs = ctx.new_registers();
        regs.add(RegisterSetKind::General).unwrap();
        regs.set(x(0), 40).unwrap();
        regs.set(x(1), 2).unwrap();
        ctx.call(code.pc().unwrap(), &mut regs).unwrap();

        assert_eq!(regs.get(x(0)), Some(42));
        assert_eq!(regs.get(x(19)), Some(42));
    }

    #[test]
    fn test_wide_vectors_unsupported()
    {
        let ctx = Context::native().unwrap();
        let mut regs = ctx.new_registers();

        assert!(matches!(
            regs.add(RegisterSetKind::Vector256),
            Err(FfiError::UnsupportedRegisterSet { .. })
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_getpid_syscall()
    {
        let mut ctx = Context::native().unwrap();
        let mut regs = ctx.new_registers();
        regs.add(RegisterSetKind::General).unwrap();

        ctx.syscall(172, &mut regs).unwrap();
        assert_eq!(regs.get(x(0)), Some(u64::from(std::process::id())));
    }
}
