//! # Error Types
//!
//! Error handling for the call engine.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages. Every public operation returns [`FfiResult`]; the
//! coarse three-kind taxonomy used at the module boundary is available through
//! [`FfiError::code`] and [`ResultCode`].

use thiserror::Error;

use crate::registers::RegisterSetKind;
use crate::types::{ArchitectureId, PlatformId};

/// Main error type for engine operations
///
/// This enum represents all the ways an engine operation can fail. Each
/// variant corresponds to a specific usage error or resource failure.
///
/// ## Error Categories
///
/// 1. **Register map errors**: UnsupportedRegisterSet, DuplicateRegisterSet, RegisterSetNotFound, IndexOutOfRange
/// 2. **Module errors**: ModuleNotRegistered, IncompatibleModules, NotInitialized
/// 3. **Lifetime errors**: DoubleFree, ForeignRegion, ContextDestroyed
/// 4. **Stub errors**: AlreadyLocked, NotExecutable, StubOutOfBounds
/// 5. **Coroutine errors**: CoroutineCompleted, CoroutineState
/// 6. **Resource errors**: OutOfMemory, ClosureTooSmall
/// 7. **Platform errors**: Os (errors reported by the operating system)
#[derive(Error, Debug)]
pub enum FfiError
{
    /// The register-set kind has no layout on the architecture
    ///
    /// Examples:
    /// - `Vector256` on `Arm64` (no SVE support)
    /// - `Vector128` on `Mips64`
    #[error("Register set {kind:?} is not supported on {architecture:?}")]
    UnsupportedRegisterSet
    {
        /// Architecture the map was built for
        architecture: ArchitectureId,
        /// Kind that was requested
        kind: RegisterSetKind,
    },

    /// A register map already holds an entry of this kind
    #[error("Register set {0:?} is already present in the map")]
    DuplicateRegisterSet(RegisterSetKind),

    /// No entry of this kind exists in the register map
    #[error("Register set {0:?} is not present in the map")]
    RegisterSetNotFound(RegisterSetKind),

    /// An index into the register map is past the end
    #[error("Register map index {index} out of range (len {len})")]
    IndexOutOfRange
    {
        /// Requested index
        index: usize,
        /// Number of entries in the map
        len: usize,
    },

    /// The operation needs a register set the map does not contain
    ///
    /// Direct syscalls, for example, take their arguments from the
    /// general-purpose set.
    #[error("Operation requires a {0:?} register set")]
    MissingRegisterSet(RegisterSetKind),

    /// No module is registered for the identifier
    ///
    /// Adding a module implementation to the registry is the way to
    /// support a new architecture or operating system.
    #[error("No module registered for {0}")]
    ModuleNotRegistered(ModuleKey),

    /// The architecture module cannot run on the selected platform
    ///
    /// Example: the System V x86-64 backend paired with a Windows platform.
    #[error("Architecture {architecture:?} cannot be paired with platform {platform:?}")]
    IncompatibleModules
    {
        /// Selected architecture
        architecture: ArchitectureId,
        /// Selected platform
        platform: PlatformId,
    },

    /// A platform module was used before `initialize` ran
    #[error("Platform module {0:?} is not initialized")]
    NotInitialized(PlatformId),

    /// The requested stack is too small for the architecture's frame
    #[error("Closure of {requested} bytes is too small (minimum {minimum})")]
    ClosureTooSmall
    {
        /// Size asked for
        requested: usize,
        /// Smallest size that leaves room for the frame and target stack
        minimum: usize,
    },

    /// A closure, stub or coroutine was released twice
    #[error("{0} was already freed")]
    DoubleFree(&'static str),

    /// A memory region was not handed out by this module
    #[error("Region at 0x{0:016x} is not owned by this module")]
    ForeignRegion(u64),

    /// A stub was locked a second time
    #[error("Stub is already executable")]
    AlreadyLocked,

    /// A stub was used as code before it was locked
    #[error("Stub is not executable yet")]
    NotExecutable,

    /// A write to a stub fell outside its requested length
    #[error("Write of {len} bytes at offset {offset} exceeds stub length {capacity}")]
    StubOutOfBounds
    {
        /// Offset of the write
        offset: usize,
        /// Number of bytes written
        len: usize,
        /// Writable length of the stub
        capacity: usize,
    },

    /// `resume` on a coroutine that ran to completion
    #[error("Coroutine has already completed")]
    CoroutineCompleted,

    /// The coroutine is not in a state that allows the operation
    ///
    /// Example: calling `start` twice.
    #[error("Coroutine is {state:?}, cannot {operation}")]
    CoroutineState
    {
        /// Current state
        state: crate::coroutine::CoroutineState,
        /// What the caller tried to do
        operation: &'static str,
    },

    /// The context handle was destroyed
    #[error("Context has been destroyed")]
    ContextDestroyed,

    /// The running CPU lacks an extension the register map needs
    #[error("CPU does not support register set {0:?}")]
    CpuFeatureMissing(RegisterSetKind),

    /// Invalid argument passed to an engine function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An allocation failed at some layer
    #[error("Out of memory allocating {requested} bytes")]
    OutOfMemory
    {
        /// Number of bytes requested
        requested: usize,
    },

    /// Error reported by the operating system (mprotect, munmap, ...)
    #[error("OS error: {0}")]
    Os(#[from] std::io::Error),
}

/// Identifies which registry lookup failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKey
{
    /// Architecture module lookup
    Architecture(ArchitectureId),
    /// Platform module lookup
    Platform(PlatformId),
}

impl std::fmt::Display for ModuleKey
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        match self {
            ModuleKey::Architecture(arch) => write!(f, "architecture {arch:?}"),
            ModuleKey::Platform(platform) => write!(f, "platform {platform:?}"),
        }
    }
}

/// Result code returned across the module boundary
///
/// Every public operation reduces to one of these three outcomes. Out
/// parameters (handles, program counters, captured registers) are only
/// meaningful when the code is `Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResultCode
{
    /// Operation completed
    Success = 0,
    /// Contract violation or OS refusal
    Failure = 1,
    /// Allocation failure at any layer
    OutOfMemory = 2,
}

impl ResultCode
{
    /// Reduce a result to its code.
    ///
    /// ```rust
    /// use tinyffi_core::error::{FfiError, FfiResult, ResultCode};
    ///
    /// let ok: FfiResult<()> = Ok(());
    /// assert_eq!(ResultCode::of(&ok), ResultCode::Success);
    ///
    /// let oom: FfiResult<()> = Err(FfiError::OutOfMemory { requested: 64 });
    /// assert_eq!(ResultCode::of(&oom), ResultCode::OutOfMemory);
    /// ```
    pub fn of<T>(result: &FfiResult<T>) -> Self
    {
        match result {
            Ok(_) => ResultCode::Success,
            Err(err) => err.code(),
        }
    }
}

impl FfiError
{
    /// The coarse result code for this error.
    pub fn code(&self) -> ResultCode
    {
        match self {
            FfiError::OutOfMemory { .. } => ResultCode::OutOfMemory,
            _ => ResultCode::Failure,
        }
    }
}

/// Convenience type alias for `Result<T, FfiError>`
///
/// ```rust
/// use tinyffi_core::error::FfiResult;
/// fn foo() -> FfiResult<()>
/// {
///     Ok(())
/// }
/// ```
pub type FfiResult<T> = std::result::Result<T, FfiError>;
