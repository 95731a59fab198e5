//! # tinyffi-core
//!
//! Cross-architecture foreign call engine.
//!
//! Given an instruction address, a stack and an arbitrary set of register
//! values, the engine switches to that stack, loads the registers, runs the
//! target until it returns or yields, and captures the resulting registers
//! back for the caller.
//!
//! This crate provides:
//! - Register maps with checked, per-architecture typed access
//! - Closures (target stacks) and W^X machine-code stubs
//! - Synchronous calls, direct syscalls and yield/resume coroutines
//! - Pluggable architecture and platform modules
//!
//! ## Platform Support
//!
//! - **x86-64** (System V) and **AArch64** (AAPCS64) backends
//! - **Linux**, **FreeBSD** and **macOS** through one POSIX platform module
//!
//! Register layouts exist for every architecture identifier, so register
//! maps can be built for targets without a backend on this host.
//!
//! ## Why unsafe code is needed
//!
//! Switching stacks, executing generated code and issuing raw syscalls cannot
//! be expressed in safe Rust. The unsafe parts are confined to the closure,
//! frame, stub, arch and platform modules and wrapped in safe APIs.

#![allow(unsafe_code)] // Required for stack switching, mmap/mprotect and raw syscalls

pub mod arch;
pub mod closure;
pub mod context;
pub mod coroutine;
pub mod error;
pub mod frame;
pub mod module;
pub mod platform;
pub mod prelude;
pub mod registers;
pub mod stub;
pub mod types;

pub use context::{Context, ContextBuilder};
pub use coroutine::{Coroutine, CoroutineState};
// Re-export commonly used types
pub use error::{FfiError, FfiResult, ResultCode};
pub use module::{ArchitectureModule, ModuleRegistry, PlatformModule};
pub use registers::{RegisterId, RegisterMap, RegisterMask, RegisterSetKind};
