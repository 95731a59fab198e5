//! # Context
//!
//! A [`Context`] binds one architecture module, one platform module and one
//! closure. Every foreign call, direct syscall and coroutine goes through a
//! context.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tinyffi_core::registers::{RegisterId, RegisterSetKind, X64Register};
//! use tinyffi_core::stub::Stub;
//! use tinyffi_core::Context;
//!
//! let mut ctx = Context::native()?;
//!
//! // mov rax, rdi; ret
//! let stub = Stub::with_code(ctx.platform_module(), &[0x48, 0x89, 0xF8, 0xC3])?;
//!
//! let mut regs = ctx.new_registers();
//! regs.add(RegisterSetKind::General)?;
//! regs.set(RegisterId::X64(X64Register::Rdi), 42);
//!
//! ctx.call(stub.pc()?, &mut regs)?;
//! assert_eq!(regs.get(RegisterId::X64(X64Register::Rax)), Some(42));
//! # Ok::<(), tinyffi_core::error::FfiError>(())
//! ```

use tracing::{debug, info, warn};

use crate::closure::Closure;
use crate::coroutine::Coroutine;
use crate::error::{FfiError, FfiResult};
use crate::module::{ArchitectureModule, ModuleRegistry, PlatformModule};
use crate::registers::{RegisterMap, RegisterMask};
use crate::types::{Address, ArchitectureId, PlatformId};

/// Builder for configuring a [`Context`] before it is created
///
/// Anything left unset falls back to the host (architecture, platform), the
/// architecture module's defaults (stack size, register mask) or zero
/// (exception handler).
///
/// ## Example
///
/// ```rust,no_run
/// use tinyffi_core::registers::{RegisterMask, RegisterSetKind};
/// use tinyffi_core::types::{ArchitectureId, PlatformId};
/// use tinyffi_core::ContextBuilder;
///
/// let ctx = ContextBuilder::new()
///     .architecture(ArchitectureId::X64)
///     .platform(PlatformId::Linux)
///     .stack_size(256 * 1024)
///     .register_mask(RegisterMask::from(RegisterSetKind::General))
///     .build()?;
/// # Ok::<(), tinyffi_core::error::FfiError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct ContextBuilder<'r>
{
    architecture: Option<ArchitectureId>,
    platform: Option<PlatformId>,
    stack_size: Option<usize>,
    register_mask: Option<RegisterMask>,
    exception_handler: Option<Address>,
    registry: Option<&'r ModuleRegistry>,
}

impl<'r> ContextBuilder<'r>
{
    /// A builder with every option unset.
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Target architecture.
    pub fn architecture(mut self, id: ArchitectureId) -> Self
    {
        self.architecture = Some(id);
        self
    }

    /// Target platform.
    pub fn platform(mut self, id: PlatformId) -> Self
    {
        self.platform = Some(id);
        self
    }

    /// Closure size in bytes.
    pub fn stack_size(mut self, size: usize) -> Self
    {
        self.stack_size = Some(size);
        self
    }

    /// Register classes to load and capture.
    pub fn register_mask(mut self, mask: RegisterMask) -> Self
    {
        self.register_mask = Some(mask);
        self
    }

    /// Exception handler address.
    pub fn exception_handler(mut self, handler: Address) -> Self
    {
        self.exception_handler = Some(handler);
        self
    }

    /// Resolve modules from `registry` instead of the global one.
    pub fn registry(mut self, registry: &'r ModuleRegistry) -> Self
    {
        self.registry = Some(registry);
        self
    }

    /// Create the context.
    ///
    /// ## Errors
    ///
    /// - `ModuleNotRegistered` if either identifier has no module
    /// - `IncompatibleModules` if the architecture refuses the platform
    /// - `ClosureTooSmall` / `OutOfMemory` if the closure cannot be allocated
    ///
    /// Nothing stays allocated when creation fails.
    pub fn build(self) -> FfiResult<Context>
    {
        let registry: &ModuleRegistry = match self.registry {
            Some(registry) => registry,
            None => ModuleRegistry::global(),
        };

        let architecture_id = self
            .architecture
            .or_else(ArchitectureId::current)
            .ok_or_else(|| FfiError::InvalidArgument("no architecture selected".to_string()))?;
        let platform_id = self
            .platform
            .or_else(PlatformId::current)
            .ok_or_else(|| FfiError::InvalidArgument("no platform selected".to_string()))?;

        let architecture = registry.architecture(architecture_id)?;
        let platform = registry.platform(platform_id)?;
        platform.initialize()?;

        let defaults = architecture.context_init(platform_id)?;
        let stack_size = self.stack_size.unwrap_or(architecture.stack().default_size);
        let closure = architecture.alloc_closure(stack_size)?;

        info!(
            "Created {}/{} context ({} byte stack)",
            architecture_id,
            platform_id,
            closure.size()
        );

        Ok(Context {
            architecture,
            platform,
            exception_handler: self.exception_handler.unwrap_or(defaults.exception_handler),
            register_mask: self.register_mask.unwrap_or(defaults.register_mask),
            closure: Some(closure),
        })
    }
}

/// One (architecture, platform) pairing with its own stack
///
/// The architecture and platform are fixed at creation. After
/// [`destroy`](Context::destroy) every operation fails with
/// `ContextDestroyed`; dropping a live context destroys it.
///
/// A context is `Send` but not `Sync`: calls take `&mut self`, so at most
/// one call is in flight per context.
pub struct Context
{
    architecture: &'static dyn ArchitectureModule,
    platform: &'static dyn PlatformModule,
    exception_handler: Address,
    register_mask: RegisterMask,
    closure: Option<Closure>,
}

impl Context
{
    /// A builder for a new context.
    pub fn builder() -> ContextBuilder<'static>
    {
        ContextBuilder::new()
    }

    /// Create a context for `architecture` on `platform` with default settings.
    pub fn new(architecture: ArchitectureId, platform: PlatformId) -> FfiResult<Self>
    {
        ContextBuilder::new().architecture(architecture).platform(platform).build()
    }

    /// Create a context for the host.
    pub fn native() -> FfiResult<Self>
    {
        ContextBuilder::new().build()
    }

    /// Architecture this context targets.
    pub fn architecture(&self) -> ArchitectureId
    {
        self.architecture.id()
    }

    /// Platform this context targets.
    pub fn platform(&self) -> PlatformId
    {
        self.platform.id()
    }

    /// The bound architecture module.
    pub fn architecture_module(&self) -> &'static dyn ArchitectureModule
    {
        self.architecture
    }

    /// The bound platform module.
    pub fn platform_module(&self) -> &'static dyn PlatformModule
    {
        self.platform
    }

    /// An empty register map for this context's architecture.
    pub fn new_registers(&self) -> RegisterMap
    {
        RegisterMap::new(self.architecture.id())
    }

    /// `true` after [`destroy`](Self::destroy).
    pub fn is_destroyed(&self) -> bool
    {
        self.closure.is_none()
    }

    fn live_closure(&mut self) -> FfiResult<&mut Closure>
    {
        self.closure.as_mut().ok_or(FfiError::ContextDestroyed)
    }

    /// The context's closure.
    pub fn closure(&self) -> FfiResult<&Closure>
    {
        self.closure.as_ref().ok_or(FfiError::ContextDestroyed)
    }

    /// Register classes loaded and captured by calls.
    pub fn register_mask(&self) -> FfiResult<RegisterMask>
    {
        self.closure()?;
        Ok(self.register_mask)
    }

    /// Replace the register mask.
    pub fn set_register_mask(&mut self, mask: RegisterMask) -> FfiResult<()>
    {
        self.live_closure()?;
        self.register_mask = mask;
        Ok(())
    }

    /// Exception handler address (zero: none).
    pub fn exception_handler(&self) -> FfiResult<Address>
    {
        self.closure()?;
        Ok(self.exception_handler)
    }

    /// Record an exception handler address.
    ///
    /// The address is stored with the context; no handler is installed with
    /// the operating system.
    pub fn set_exception_handler(&mut self, handler: Address) -> FfiResult<()>
    {
        self.live_closure()?;
        self.exception_handler = handler;
        Ok(())
    }

    /// Call `pc` on this context's closure.
    ///
    /// Every entry of `regs` selected by the register mask is loaded before
    /// the call and overwritten with the captured value after it.
    pub fn call(&mut self, pc: Address, regs: &mut RegisterMap) -> FfiResult<()>
    {
        let mask = self.register_mask;
        let architecture = self.architecture;
        let closure = self.live_closure()?;
        architecture.call_closure(pc, closure, regs, mask)
    }

    /// Invoke syscall `number` directly through the platform's gate.
    ///
    /// Arguments come from the general set of `regs`; results are written
    /// back into it.
    pub fn syscall(&mut self, number: u64, regs: &mut RegisterMap) -> FfiResult<()>
    {
        self.live_closure()?;
        self.platform.call_syscall(self.architecture, number, regs)
    }

    /// Create a coroutine with its own closure of the same size as this
    /// context's.
    pub fn coroutine(&mut self) -> FfiResult<Coroutine>
    {
        let size = self.closure()?.size();
        Coroutine::new(self.architecture, self.platform, self.register_mask, size)
    }

    /// Replace the closure with one of `size` bytes.
    ///
    /// The new closure is allocated first; on failure the old one is kept.
    pub fn resize_stack(&mut self, size: usize) -> FfiResult<()>
    {
        self.live_closure()?;
        let replacement = self.architecture.alloc_closure(size)?;

        if let Some(mut old) = self.closure.replace(replacement) {
            self.architecture.free_closure(&mut old)?;
        }
        debug!("Resized context stack to {} bytes", size);
        Ok(())
    }

    /// Release the closure. Later operations fail with `ContextDestroyed`.
    pub fn destroy(&mut self) -> FfiResult<()>
    {
        let mut closure = self.closure.take().ok_or(FfiError::ContextDestroyed)?;
        self.architecture.free_closure(&mut closure)?;
        debug!("Destroyed {}/{} context", self.architecture.id(), self.platform.id());
        Ok(())
    }
}

impl Drop for Context
{
    fn drop(&mut self)
    {
        if !self.is_destroyed() {
            if let Err(e) = self.destroy() {
                warn!("Failed to destroy context: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Context
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("Context")
            .field("architecture", &self.architecture.id())
            .field("platform", &self.platform.id())
            .field("exception_handler", &self.exception_handler)
            .field("register_mask", &self.register_mask)
            .field("closure", &self.closure)
            .finish()
    }
}
