//! # Coroutines
//!
//! A coroutine runs foreign code that can suspend itself by calling a yield
//! trap, hand its registers back to Rust, and be resumed later where it left
//! off.
//!
//! Each coroutine owns its own closure (so its stack survives between
//! `start` and `resume`), a yield trap [`Stub`] bound to its frame, and the
//! [`RegisterMap`] exchanged with the target.
//!
//! ## States
//!
//! ```text
//! Created --start--> Running --yield--> Yielded --resume--> Running
//!                       |                                      |
//!                       +------------return-----> Completed <--+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use tinyffi_core::registers::{RegisterId, X64Register};
//! use tinyffi_core::{Context, CoroutineState};
//!
//! # let target = tinyffi_core::types::Address::new(0x1000);
//! let mut ctx = Context::native()?;
//! let mut co = ctx.coroutine()?;
//!
//! // hand the trap address to the target in its first argument
//! let trap = co.yield_pc()?;
//! co.registers_mut().set(RegisterId::X64(X64Register::Rdi), trap.value());
//!
//! let mut state = co.start(target)?;
//! while state == CoroutineState::Yielded {
//!     state = co.resume()?;
//! }
//! # Ok::<(), tinyffi_core::error::FfiError>(())
//! ```

use tracing::debug;

use crate::closure::Closure;
use crate::error::{FfiError, FfiResult};
use crate::frame::{FramePlan, FrameStatus};
use crate::module::{ArchitectureModule, PlatformModule};
use crate::registers::{RegisterMap, RegisterMask, RegisterSetKind};
use crate::stub::{Stub, StubState};
use crate::types::Address;

/// Where a coroutine is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoroutineState
{
    /// Not started yet
    Created,
    /// Target code is executing
    Running,
    /// The target called the yield trap and can be resumed
    Yielded,
    /// The target returned from its entry point
    Completed,
}

/// A resumable foreign call
pub struct Coroutine
{
    architecture: &'static dyn ArchitectureModule,
    mask: RegisterMask,
    reserved: RegisterMask,
    registers: RegisterMap,
    plan: FramePlan,
    closure: Closure,
    stub: Stub,
    state: CoroutineState,
    resume_pc: Address,
    saved_sp: Address,
    freed: bool,
}

impl Coroutine
{
    /// Allocate the closure and yield trap for a new coroutine.
    ///
    /// The frame reserves a slot for every kind in `mask` the CPU supports,
    /// so register sets can be added to [`registers_mut`](Self::registers_mut)
    /// at any point before a `start` or `resume`. Payloads are laid out in
    /// the map's insertion order on every `start` and `resume`.
    pub(crate) fn new(
        architecture: &'static dyn ArchitectureModule,
        platform: &'static dyn PlatformModule,
        mask: RegisterMask,
        stack_size: usize,
    ) -> FfiResult<Self>
    {
        let reserved = mask
            .kinds()
            .filter(|kind| architecture.supports(*kind))
            .fold(RegisterMask::NONE, RegisterMask::with);

        let registers = RegisterMap::with_sets(architecture.id(), &[RegisterSetKind::General])?;
        let closure = architecture.alloc_closure(stack_size)?;
        let plan = FramePlan::reserve(&closure, architecture.id(), reserved, &registers)?;
        let trap = architecture.yield_trap(plan.header());
        let stub = Stub::with_code(platform, &trap)?;

        debug!(
            "Created coroutine on closure at {} (frame {}, trap {})",
            closure.base(),
            plan.header(),
            stub.pc()?
        );

        Ok(Self {
            architecture,
            mask,
            reserved,
            registers,
            plan,
            closure,
            stub,
            state: CoroutineState::Created,
            resume_pc: Address::ZERO,
            saved_sp: Address::ZERO,
            freed: false,
        })
    }

    /// Current state.
    pub fn state(&self) -> CoroutineState
    {
        self.state
    }

    /// Address the target calls to yield.
    pub fn yield_pc(&self) -> FfiResult<Address>
    {
        self.ensure_live()?;
        self.stub.pc()
    }

    /// Registers passed to the target, and captured from it at each yield
    /// or on completion.
    pub fn registers(&self) -> &RegisterMap
    {
        &self.registers
    }

    /// Mutable registers; changes are loaded by the next `start` or `resume`.
    pub fn registers_mut(&mut self) -> &mut RegisterMap
    {
        &mut self.registers
    }

    /// Register classes loaded and captured.
    pub fn register_mask(&self) -> RegisterMask
    {
        self.mask
    }

    /// Where the target continues on the next `resume` (zero before the
    /// first yield).
    pub fn resume_pc(&self) -> Address
    {
        self.resume_pc
    }

    /// Target stack pointer recorded at the last yield.
    pub fn saved_sp(&self) -> Address
    {
        self.saved_sp
    }

    /// The coroutine's own stack.
    pub fn closure(&self) -> &Closure
    {
        &self.closure
    }

    /// Placement of the frame used by the last `start` or `resume`.
    pub fn frame_plan(&self) -> &FramePlan
    {
        &self.plan
    }

    /// Run the target from `pc`.
    ///
    /// ## Errors
    ///
    /// - `CoroutineState` unless the coroutine is `Created`
    /// - `MissingRegisterSet` without a `General` set in the map and mask
    /// - `CpuFeatureMissing` for a masked set the CPU cannot load
    pub fn start(&mut self, pc: Address) -> FfiResult<CoroutineState>
    {
        self.ensure_live()?;
        if self.state != CoroutineState::Created {
            return Err(FfiError::CoroutineState {
                state: self.state,
                operation: "start",
            });
        }
        self.check_registers()?;
        self.replan()?;

        let frame = self.plan.marshal_call(&mut self.closure, &self.registers, self.mask, pc)?;
        debug!("Starting coroutine at {}", pc);

        self.state = CoroutineState::Running;
        // SAFETY: the frame was just marshalled into this coroutine's live closure
        let status = unsafe { self.architecture.enter(frame) };
        self.finish(status)
    }

    /// Continue a yielded target with the current register map.
    ///
    /// ## Errors
    ///
    /// - `CoroutineCompleted` if the target already returned
    /// - `CoroutineState` if the coroutine was never started
    pub fn resume(&mut self) -> FfiResult<CoroutineState>
    {
        self.ensure_live()?;
        match self.state {
            CoroutineState::Yielded => {}
            CoroutineState::Completed => return Err(FfiError::CoroutineCompleted),
            state => {
                return Err(FfiError::CoroutineState {
                    state,
                    operation: "resume",
                })
            }
        }
        self.check_registers()?;
        self.replan()?;

        let frame = self.plan.marshal_resume(&mut self.closure, &self.registers, self.mask)?;
        debug!("Resuming coroutine at {}", self.resume_pc);

        self.state = CoroutineState::Running;
        // SAFETY: the frame was left in the yielded state by the last enter
        // or resume, and the closure has not been released
        let status = unsafe { self.architecture.resume(frame) };
        self.finish(status)
    }

    /// Release the closure and the yield trap.
    ///
    /// If either release fails the coroutine stays live and `free` can be
    /// called again; only the part still held is released on the retry.
    ///
    /// ## Errors
    ///
    /// `DoubleFree` if the coroutine was already freed.
    pub fn free(&mut self) -> FfiResult<()>
    {
        if self.freed {
            return Err(FfiError::DoubleFree("coroutine"));
        }

        let stub = match self.stub.state() {
            StubState::Freed => Ok(()),
            _ => self.stub.free(),
        };
        let closure = if self.closure.is_live() {
            self.architecture.free_closure(&mut self.closure)
        } else {
            Ok(())
        };
        stub.and(closure)?;

        self.freed = true;
        debug!("Freed coroutine");
        Ok(())
    }

    fn ensure_live(&self) -> FfiResult<()>
    {
        if self.freed {
            return Err(FfiError::InvalidArgument("coroutine has been freed".to_string()));
        }
        Ok(())
    }

    /// Lay the payloads out in the map's current insertion order.
    fn replan(&mut self) -> FfiResult<()>
    {
        let plan = FramePlan::reserve(&self.closure, self.architecture.id(), self.reserved, &self.registers)?;
        if plan.header() != self.plan.header() {
            return Err(FfiError::InvalidArgument(format!(
                "coroutine frame moved from {} to {}",
                self.plan.header(),
                plan.header()
            )));
        }
        self.plan = plan;
        Ok(())
    }

    fn check_registers(&self) -> FfiResult<()>
    {
        // General registers carry the target's state across a yield.
        if !self.mask.contains(RegisterSetKind::General) || !self.registers.contains(RegisterSetKind::General) {
            return Err(FfiError::MissingRegisterSet(RegisterSetKind::General));
        }
        self.architecture.check_registers(&self.registers, self.mask)
    }

    fn finish(&mut self, status: FrameStatus) -> FfiResult<CoroutineState>
    {
        self.plan.unmarshal(&self.closure, &mut self.registers, self.mask)?;

        self.state = match status {
            FrameStatus::Yielded => {
                let header = self.plan.read_header(&self.closure)?;
                self.resume_pc = Address::new(header.pc);
                self.saved_sp = Address::new(header.target_sp);
                debug!("Coroutine yielded (resume at {}, sp {})", self.resume_pc, self.saved_sp);
                CoroutineState::Yielded
            }
            FrameStatus::Returned => {
                debug!("Coroutine completed");
                CoroutineState::Completed
            }
        };
        Ok(self.state)
    }
}

impl std::fmt::Debug for Coroutine
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("Coroutine")
            .field("architecture", &self.architecture.id())
            .field("state", &self.state)
            .field("resume_pc", &self.resume_pc)
            .field("saved_sp", &self.saved_sp)
            .field("freed", &self.freed)
            .finish()
    }
}
