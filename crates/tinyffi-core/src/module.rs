//! # Modules
//!
//! The engine is split into two pluggable halves:
//!
//! - a [`PlatformModule`] owns everything the operating system provides:
//!   page allocation and protection for stubs, and the syscall gate
//!   convention;
//! - an [`ArchitectureModule`] owns everything the CPU dictates: closure
//!   layout, the stack-switching trampoline, yield traps and the raw syscall
//!   instruction.
//!
//! A [`ModuleRegistry`] maps [`ArchitectureId`] and [`PlatformId`] values to
//! `&'static` implementations. Supporting a new CPU family or operating
//! system means implementing the trait and registering the instance; nothing
//! else in the engine changes.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tinyffi_core::module::ModuleRegistry;
//! use tinyffi_core::types::ArchitectureId;
//!
//! let registry = ModuleRegistry::global();
//! for arch in registry.architectures() {
//!     println!("native backend: {arch}");
//! }
//! ```

use std::collections::BTreeMap;
use std::ptr::NonNull;

use once_cell::sync::Lazy;
use tracing::debug;

use crate::closure::{Closure, StackConvention};
use crate::error::{FfiError, FfiResult, ModuleKey};
use crate::frame::{Frame, FramePlan, FrameStatus};
use crate::registers::{layout, RegisterMap, RegisterMask, RegisterSetKind};
use crate::types::{Address, ArchitectureId, PlatformId, Region};

/// Values a new context starts with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextDefaults
{
    /// Every register class the running CPU supports
    pub register_mask: RegisterMask,
    /// Exception handler address (zero: none)
    pub exception_handler: Address,
}

/// How the kernel expects to be entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyscallGate
{
    /// Linux numbering; errors come back as a negative errno
    Linux,
    /// BSD numbering; errors set the carry flag and return a positive errno
    Bsd,
    /// Darwin: BSD convention with the Unix class prefix on x86-64 and
    /// `svc #0x80` with the number in x16 on AArch64
    Darwin,
}

/// Operating-system half of the engine
///
/// Implementations keep their own process state (page size, the table of
/// regions they handed out) and must be safe to share between threads.
pub trait PlatformModule: Send + Sync
{
    /// Which platform this module implements.
    fn id(&self) -> PlatformId;

    /// Set up process state. Calling it again is a no-op.
    fn initialize(&self) -> FfiResult<()>;

    /// System page size.
    fn page_size(&self) -> FfiResult<usize>;

    /// Map at least `count` bytes of read+write memory.
    fn get_writable(&self, count: usize) -> FfiResult<Region>;

    /// Unmap a region obtained from [`get_writable`](Self::get_writable)
    /// that was never made executable.
    fn free_writable(&self, region: Region) -> FfiResult<()>;

    /// Flip a writable region to read+execute and return its entry address.
    ///
    /// The region is never writable and executable at the same time.
    fn get_executable(&self, region: Region) -> FfiResult<Address>;

    /// Unmap a region made executable by [`get_executable`](Self::get_executable).
    fn free_executable(&self, region: Region) -> FfiResult<()>;

    /// Gate convention of this operating system.
    fn syscall_gate(&self) -> SyscallGate;

    /// Issue syscall `number` with arguments from the general set of `regs`.
    fn call_syscall(&self, arch: &dyn ArchitectureModule, number: u64, regs: &mut RegisterMap) -> FfiResult<()>
    {
        arch.call_syscall(self.syscall_gate(), number, regs)
    }
}

/// CPU half of the engine
///
/// The provided methods implement the call protocol on top of the low-level
/// hooks ([`enter`](Self::enter), [`resume`](Self::resume),
/// [`yield_trap`](Self::yield_trap)), so a backend only has to supply the
/// machine-specific parts.
pub trait ArchitectureModule: Send + Sync
{
    /// Which architecture this module implements.
    fn id(&self) -> ArchitectureId;

    /// Stack rules for closures.
    fn stack(&self) -> StackConvention
    {
        StackConvention::DOWNWARD_16
    }

    /// `true` if the running CPU can load and capture `kind`.
    fn supports(&self, kind: RegisterSetKind) -> bool;

    /// Validate the pairing with `platform` and report context defaults.
    fn context_init(&self, platform: PlatformId) -> FfiResult<ContextDefaults>;

    /// Register classes that are both defined and supported on this CPU.
    fn default_mask(&self) -> RegisterMask
    {
        RegisterSetKind::ALL
            .into_iter()
            .filter(|kind| layout(self.id(), *kind).is_some() && self.supports(*kind))
            .fold(RegisterMask::NONE, RegisterMask::with)
    }

    /// Allocate a closure of at least `size` bytes.
    fn alloc_closure(&self, size: usize) -> FfiResult<Closure>
    {
        Closure::allocate(size, self.stack())
    }

    /// Release a closure.
    fn free_closure(&self, closure: &mut Closure) -> FfiResult<()>
    {
        closure.free()
    }

    /// Check that `regs` can be loaded under `mask` on this CPU.
    fn check_registers(&self, regs: &RegisterMap, mask: RegisterMask) -> FfiResult<()>
    {
        if regs.architecture() != self.id() {
            return Err(FfiError::InvalidArgument(format!(
                "register map is for {}, module is {}",
                regs.architecture(),
                self.id()
            )));
        }

        for kind in regs.kinds().filter(|kind| mask.contains(*kind)) {
            if !self.supports(kind) {
                return Err(FfiError::CpuFeatureMissing(kind));
            }
        }
        Ok(())
    }

    /// Call `pc` on `closure` with the masked entries of `regs` loaded, and
    /// capture them back into `regs` when the target returns.
    fn call_closure(
        &self,
        pc: Address,
        closure: &mut Closure,
        regs: &mut RegisterMap,
        mask: RegisterMask,
    ) -> FfiResult<()>
    {
        self.check_registers(regs, mask)?;

        let plan = FramePlan::for_map(closure, regs, mask)?;
        let frame = plan.marshal_call(closure, regs, mask, pc)?;
        debug!("Calling {} on closure at {}", pc, closure.base());

        // SAFETY: the frame was just written by the plan and lives inside a
        // closure this call holds exclusively
        let status = unsafe { self.enter(frame) };
        if status == FrameStatus::Yielded {
            return Err(FfiError::InvalidArgument(
                "target yielded outside of a coroutine".to_string(),
            ));
        }

        plan.unmarshal(closure, regs, mask)
    }

    /// Call `pc` on a temporary closure of the default size.
    fn call_function(&self, pc: Address, regs: &mut RegisterMap) -> FfiResult<()>
    {
        let mut closure = self.alloc_closure(self.stack().default_size)?;
        let result = self.call_closure(pc, &mut closure, regs, self.default_mask());
        self.free_closure(&mut closure)?;
        result
    }

    /// Execute the raw syscall instruction for `gate`.
    ///
    /// Arguments are taken from the general set in ABI order; the results
    /// are written back to the return registers.
    fn call_syscall(&self, gate: SyscallGate, number: u64, regs: &mut RegisterMap) -> FfiResult<()>;

    /// Switch to the frame's target stack, load its payloads and call its pc.
    ///
    /// # Safety
    ///
    /// `frame` must have been produced by a [`FramePlan`] over a live
    /// closure, and `frame.pc` must be executable code that honours this
    /// architecture's calling convention.
    unsafe fn enter(&self, frame: NonNull<Frame>) -> FrameStatus;

    /// Continue a yielded frame at its recorded pc and stack pointer.
    ///
    /// # Safety
    ///
    /// `frame` must have been left in the yielded state by
    /// [`enter`](Self::enter) or a previous `resume`, with its closure still
    /// live.
    unsafe fn resume(&self, frame: NonNull<Frame>) -> FrameStatus;

    /// Machine code that traps into the yield routine for `frame`.
    fn yield_trap(&self, frame: Address) -> Vec<u8>;
}

/// Lookup table from identifiers to module instances
#[derive(Clone, Default)]
pub struct ModuleRegistry
{
    architectures: BTreeMap<ArchitectureId, &'static dyn ArchitectureModule>,
    platforms: BTreeMap<PlatformId, &'static dyn PlatformModule>,
}

static GLOBAL: Lazy<ModuleRegistry> = Lazy::new(ModuleRegistry::native);

impl ModuleRegistry
{
    /// An empty registry.
    pub fn new() -> Self
    {
        Self::default()
    }

    /// A registry holding the backends compiled for this host.
    pub fn native() -> Self
    {
        let mut registry = Self::new();
        if let Some(arch) = crate::arch::native() {
            registry.register_architecture(arch);
        }
        if let Some(platform) = crate::platform::native() {
            registry.register_platform(platform);
        }
        registry
    }

    /// The process-wide native registry, built on first use.
    pub fn global() -> &'static ModuleRegistry
    {
        &GLOBAL
    }

    /// Add or replace the module for its architecture.
    pub fn register_architecture(&mut self, module: &'static dyn ArchitectureModule) -> &mut Self
    {
        debug!("Registering architecture module {}", module.id());
        self.architectures.insert(module.id(), module);
        self
    }

    /// Add or replace the module for its platform.
    pub fn register_platform(&mut self, module: &'static dyn PlatformModule) -> &mut Self
    {
        debug!("Registering platform module {}", module.id());
        self.platforms.insert(module.id(), module);
        self
    }

    /// Module registered for `id`.
    pub fn architecture(&self, id: ArchitectureId) -> FfiResult<&'static dyn ArchitectureModule>
    {
        self.architectures
            .get(&id)
            .copied()
            .ok_or(FfiError::ModuleNotRegistered(ModuleKey::Architecture(id)))
    }

    /// Module registered for `id`.
    pub fn platform(&self, id: PlatformId) -> FfiResult<&'static dyn PlatformModule>
    {
        self.platforms
            .get(&id)
            .copied()
            .ok_or(FfiError::ModuleNotRegistered(ModuleKey::Platform(id)))
    }

    /// Registered architectures, in identifier order.
    pub fn architectures(&self) -> impl Iterator<Item = ArchitectureId> + '_
    {
        self.architectures.keys().copied()
    }

    /// Registered platforms, in identifier order.
    pub fn platforms(&self) -> impl Iterator<Item = PlatformId> + '_
    {
        self.platforms.keys().copied()
    }
}

impl std::fmt::Debug for ModuleRegistry
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("ModuleRegistry")
            .field("architectures", &self.architectures.keys().collect::<Vec<_>>())
            .field("platforms", &self.platforms.keys().collect::<Vec<_>>())
            .finish()
    }
}
