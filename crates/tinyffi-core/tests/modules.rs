//! Tests for the module registry using in-process fake backends
//!
//! The fake architecture never executes generated code: its `enter` edits the
//! marshalled payloads directly, which exercises the frame protocol and the
//! provided trait methods on any host.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use tinyffi_core::closure::Closure;
use tinyffi_core::error::{FfiError, FfiResult, ModuleKey};
use tinyffi_core::frame::{Frame, FrameStatus};
use tinyffi_core::module::{ArchitectureModule, ContextDefaults, ModuleRegistry, PlatformModule, SyscallGate};
use tinyffi_core::registers::{RegisterId, RegisterMap, RegisterMask, RegisterSetKind, X86Register};
use tinyffi_core::types::{Address, ArchitectureId, PlatformId, Region};
use tinyffi_core::ContextBuilder;

/// Offset of EAX in the x86 general image.
const EAX_OFFSET: usize = 6 * 4;

struct FakeArch
{
    closures: AtomicUsize,
    failing_frees: AtomicUsize,
}

impl FakeArch
{
    const fn new() -> Self
    {
        Self {
            closures: AtomicUsize::new(0),
            failing_frees: AtomicUsize::new(0),
        }
    }
}

impl ArchitectureModule for FakeArch
{
    fn id(&self) -> ArchitectureId
    {
        ArchitectureId::X86
    }

    fn supports(&self, kind: RegisterSetKind) -> bool
    {
        kind != RegisterSetKind::Vector512
    }

    fn context_init(&self, platform: PlatformId) -> FfiResult<ContextDefaults>
    {
        if platform == PlatformId::Windows7 {
            return Err(FfiError::IncompatibleModules {
                architecture: ArchitectureId::X86,
                platform,
            });
        }
        Ok(ContextDefaults {
            register_mask: self.default_mask(),
            exception_handler: Address::new(0x7000),
        })
    }

    fn alloc_closure(&self, size: usize) -> FfiResult<Closure>
    {
        let closure = Closure::allocate(size, self.stack())?;
        self.closures.fetch_add(1, Ordering::SeqCst);
        Ok(closure)
    }

    fn free_closure(&self, closure: &mut Closure) -> FfiResult<()>
    {
        let failing = self.failing_frees.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_frees.store(failing - 1, Ordering::SeqCst);
            return Err(FfiError::Os(io::Error::new(io::ErrorKind::Other, "munmap")));
        }
        closure.free()
    }

    fn call_syscall(&self, gate: SyscallGate, number: u64, regs: &mut RegisterMap) -> FfiResult<()>
    {
        let eax = RegisterId::X86(X86Register::Eax);
        let ecx = RegisterId::X86(X86Register::Ecx);
        regs.set(eax, number).ok_or(FfiError::MissingRegisterSet(RegisterSetKind::General))?;
        regs.set(ecx, u64::from(gate == SyscallGate::Bsd));
        Ok(())
    }

    unsafe fn enter(&self, frame: NonNull<Frame>) -> FrameStatus
    {
        let frame = frame.as_ptr();
        let general = (*frame).sets[RegisterSetKind::General.slot()];
        if general != 0 {
            let eax = (general as usize + EAX_OFFSET) as *mut u32;
            let edi = general as usize as *const u32;
            // eax = pc + edi
            eax.write_unaligned(((*frame).pc as u32).wrapping_add(edi.read_unaligned()));
        }
        FrameStatus::Returned
    }

    unsafe fn resume(&self, _frame: NonNull<Frame>) -> FrameStatus
    {
        FrameStatus::Returned
    }

    fn yield_trap(&self, frame: Address) -> Vec<u8>
    {
        frame.value().to_le_bytes().to_vec()
    }
}

struct FakePlatform
{
    id: PlatformId,
    initialized: AtomicUsize,
}

impl FakePlatform
{
    const fn new(id: PlatformId) -> Self
    {
        Self {
            id,
            initialized: AtomicUsize::new(0),
        }
    }
}

impl PlatformModule for FakePlatform
{
    fn id(&self) -> PlatformId
    {
        self.id
    }

    fn initialize(&self) -> FfiResult<()>
    {
        self.initialized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn page_size(&self) -> FfiResult<usize>
    {
        Ok(4096)
    }

    fn get_writable(&self, count: usize) -> FfiResult<Region>
    {
        Err(FfiError::OutOfMemory { requested: count })
    }

    fn free_writable(&self, region: Region) -> FfiResult<()>
    {
        Err(FfiError::ForeignRegion(region.base.value()))
    }

    fn get_executable(&self, region: Region) -> FfiResult<Address>
    {
        Err(FfiError::ForeignRegion(region.base.value()))
    }

    fn free_executable(&self, region: Region) -> FfiResult<()>
    {
        Err(FfiError::ForeignRegion(region.base.value()))
    }

    fn syscall_gate(&self) -> SyscallGate
    {
        SyscallGate::Bsd
    }
}

fn registry(arch: &'static FakeArch, platform: &'static FakePlatform) -> ModuleRegistry
{
    let mut registry = ModuleRegistry::new();
    registry.register_architecture(arch).register_platform(platform);
    registry
}

#[test]
fn test_registry_lookup()
{
    static ARCH: FakeArch = FakeArch::new();
    static PLATFORM: FakePlatform = FakePlatform::new(PlatformId::WindowsNt);
    let registry = registry(&ARCH, &PLATFORM);

    assert_eq!(registry.architectures().collect::<Vec<_>>(), vec![ArchitectureId::X86]);
    assert_eq!(registry.platforms().collect::<Vec<_>>(), vec![PlatformId::WindowsNt]);
    assert_eq!(registry.architecture(ArchitectureId::X86).unwrap().id(), ArchitectureId::X86);
    assert!(matches!(
        registry.architecture(ArchitectureId::X64),
        Err(FfiError::ModuleNotRegistered(ModuleKey::Architecture(ArchitectureId::X64)))
    ));
    assert!(matches!(
        registry.platform(PlatformId::Linux),
        Err(FfiError::ModuleNotRegistered(ModuleKey::Platform(PlatformId::Linux)))
    ));
}

#[test]
fn test_registering_twice_replaces()
{
    static ARCH: FakeArch = FakeArch::new();
    static PLATFORM: FakePlatform = FakePlatform::new(PlatformId::WindowsNt);
    let mut registry = registry(&ARCH, &PLATFORM);
    registry.register_architecture(&ARCH);

    assert_eq!(registry.architectures().count(), 1);
}

#[test]
fn test_context_from_custom_registry()
{
    static ARCH: FakeArch = FakeArch::new();
    static PLATFORM: FakePlatform = FakePlatform::new(PlatformId::WindowsNt);
    let registry = registry(&ARCH, &PLATFORM);

    let ctx = ContextBuilder::new()
        .registry(&registry)
        .architecture(ArchitectureId::X86)
        .platform(PlatformId::WindowsNt)
        .build()
        .unwrap();

    assert_eq!(ctx.architecture(), ArchitectureId::X86);
    assert_eq!(ctx.platform(), PlatformId::WindowsNt);
    assert_eq!(ctx.exception_handler().unwrap(), Address::new(0x7000));
    assert!(!ctx.register_mask().unwrap().contains(RegisterSetKind::Vector512));
    assert_eq!(PLATFORM.initialized.load(Ordering::SeqCst), 1);
    assert_eq!(ARCH.closures.load(Ordering::SeqCst), 1);
}

#[test]
fn test_incompatible_modules_allocate_nothing()
{
    static ARCH: FakeArch = FakeArch::new();
    static PLATFORM: FakePlatform = FakePlatform::new(PlatformId::Windows7);
    let registry = registry(&ARCH, &PLATFORM);

    let result = ContextBuilder::new()
        .registry(&registry)
        .architecture(ArchitectureId::X86)
        .platform(PlatformId::Windows7)
        .build();

    assert!(matches!(
        result,
        Err(FfiError::IncompatibleModules {
            architecture: ArchitectureId::X86,
            platform: PlatformId::Windows7,
        })
    ));
    assert_eq!(ARCH.closures.load(Ordering::SeqCst), 0);
}

#[test]
fn test_missing_platform_allocates_nothing()
{
    static ARCH: FakeArch = FakeArch::new();
    static PLATFORM: FakePlatform = FakePlatform::new(PlatformId::WindowsNt);
    let registry = registry(&ARCH, &PLATFORM);

    let result = ContextBuilder::new()
        .registry(&registry)
        .architecture(ArchitectureId::X86)
        .platform(PlatformId::FreeBsd)
        .build();

    assert!(matches!(
        result,
        Err(FfiError::ModuleNotRegistered(ModuleKey::Platform(PlatformId::FreeBsd)))
    ));
    assert_eq!(PLATFORM.initialized.load(Ordering::SeqCst), 0);
    assert_eq!(ARCH.closures.load(Ordering::SeqCst), 0);
}

#[test]
fn test_call_marshals_through_frame()
{
    static ARCH: FakeArch = FakeArch::new();
    static PLATFORM: FakePlatform = FakePlatform::new(PlatformId::WindowsNt);
    let registry = registry(&ARCH, &PLATFORM);
    let mut ctx = ContextBuilder::new()
        .registry(&registry)
        .architecture(ArchitectureId::X86)
        .platform(PlatformId::WindowsNt)
        .build()
        .unwrap();

    let mut regs = ctx.new_registers();
    regs.add(RegisterSetKind::Vector128).unwrap();
    regs.add(RegisterSetKind::General).unwrap();
    regs.set(RegisterId::X86(X86Register::Edi), 0x20).unwrap();
    regs.set_lane(RegisterSetKind::Vector128, 7, &[0x5A; 16]).unwrap();

    ctx.call(Address::new(0x40_1000), &mut regs).unwrap();

    assert_eq!(regs.get(RegisterId::X86(X86Register::Eax)), Some(0x40_1020));
    assert_eq!(regs.get(RegisterId::X86(X86Register::Edi)), Some(0x20));
    assert_eq!(regs.lane(RegisterSetKind::Vector128, 7), Some(&[0x5A; 16][..]));
}

#[test]
fn test_call_checks_cpu_features()
{
    static ARCH: FakeArch = FakeArch::new();
    static PLATFORM: FakePlatform = FakePlatform::new(PlatformId::WindowsNt);
    let registry = registry(&ARCH, &PLATFORM);
    let mut ctx = ContextBuilder::new()
        .registry(&registry)
        .architecture(ArchitectureId::X86)
        .platform(PlatformId::WindowsNt)
        .register_mask(RegisterMask::ALL)
        .build()
        .unwrap();

    let mut regs = ctx.new_registers();
    regs.add(RegisterSetKind::Vector512).unwrap();

    assert!(matches!(
        ctx.call(Address::new(0x1000), &mut regs),
        Err(FfiError::CpuFeatureMissing(RegisterSetKind::Vector512))
    ));
}

#[test]
fn test_syscall_uses_platform_gate()
{
    static ARCH: FakeArch = FakeArch::new();
    static PLATFORM: FakePlatform = FakePlatform::new(PlatformId::WindowsNt);
    let registry = registry(&ARCH, &PLATFORM);
    let mut ctx = ContextBuilder::new()
        .registry(&registry)
        .architecture(ArchitectureId::X86)
        .platform(PlatformId::WindowsNt)
        .build()
        .unwrap();

    let mut regs = ctx.new_registers();
    regs.add(RegisterSetKind::General).unwrap();
    ctx.syscall(20, &mut regs).unwrap();

    assert_eq!(regs.get(RegisterId::X86(X86Register::Eax)), Some(20));
    assert_eq!(regs.get(RegisterId::X86(X86Register::Ecx)), Some(1));
}

#[test]
fn test_call_function_uses_temporary_closure()
{
    static ARCH: FakeArch = FakeArch::new();

    let mut regs = RegisterMap::with_sets(ArchitectureId::X86, &[RegisterSetKind::General]).unwrap();
    ARCH.call_function(Address::new(0x1234), &mut regs).unwrap();

    assert_eq!(regs.get(RegisterId::X86(X86Register::Eax)), Some(0x1234));
    assert_eq!(ARCH.closures.load(Ordering::SeqCst), 1);
}

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
#[test]
fn test_global_registry_is_native()
{
    let registry = ModuleRegistry::global();

    assert_eq!(
        registry.architectures().collect::<Vec<_>>(),
        vec![ArchitectureId::current().unwrap()]
    );
    assert_eq!(registry.platforms().collect::<Vec<_>>(), vec![PlatformId::Linux]);
}

#[cfg(any(target_os = "linux", target_os = "freebsd", target_os = "macos"))]
#[test]
fn test_coroutine_free_retries_after_failure()
{
    static ARCH: FakeArch = FakeArch::new();
    let mut registry = ModuleRegistry::new();
    registry
        .register_architecture(&ARCH)
        .register_platform(tinyffi_core::platform::native().unwrap());

    let mut ctx = ContextBuilder::new()
        .registry(&registry)
        .architecture(ArchitectureId::X86)
        .platform(PlatformId::current().unwrap())
        .build()
        .unwrap();
    let mut co = ctx.coroutine().unwrap();

    ARCH.failing_frees.store(1, Ordering::SeqCst);
    assert!(matches!(co.free(), Err(FfiError::Os(_))));
    assert!(co.closure().is_live());

    co.free().unwrap();
    assert!(!co.closure().is_live());
    assert!(matches!(co.free(), Err(FfiError::DoubleFree("coroutine"))));
}
