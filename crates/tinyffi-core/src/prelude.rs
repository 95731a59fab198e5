//! Common module for library exports

pub use crate::context::{Context, ContextBuilder};
pub use crate::coroutine::{Coroutine, CoroutineState};
pub use crate::error::{FfiError, FfiResult, ResultCode};
pub use crate::module::{ArchitectureModule, ModuleRegistry, PlatformModule, SyscallGate};
pub use crate::registers::{Arm64Register, RegisterId, RegisterMap, RegisterMask, RegisterSetKind, X64Register, X86Register};
pub use crate::stub::Stub;
pub use crate::types::{Address, ArchitectureId, PlatformId};
