//! # Stubs
//!
//! A stub is a small block of machine code generated at runtime. It starts
//! out writable, is filled in, and is then locked: the instruction cache is
//! synchronised and the pages are flipped to read+execute. A stub is never
//! writable and executable at the same time, and locking is one-way.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tinyffi_core::module::ModuleRegistry;
//! use tinyffi_core::stub::Stub;
//! use tinyffi_core::types::PlatformId;
//!
//! let platform = ModuleRegistry::global().platform(PlatformId::Linux)?;
//! platform.initialize()?;
//!
//! // mov rax, rdi; ret
//! let mut stub = Stub::allocate(platform, 4)?;
//! stub.write(0, &[0x48, 0x89, 0xF8, 0xC3])?;
//! let pc = stub.lock()?;
//! # Ok::<(), tinyffi_core::error::FfiError>(())
//! ```

use std::fmt;

use tracing::{debug, warn};

use crate::arch;
use crate::error::{FfiError, FfiResult};
use crate::module::PlatformModule;
use crate::types::{Address, Region};

/// Lifecycle of a stub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubState
{
    /// Pages are read+write; code can be written
    Writable,
    /// Pages are read+execute; the stub can be called at this address
    Executable(Address),
    /// Pages have been returned to the platform
    Freed,
}

/// Runtime-generated machine code
pub struct Stub
{
    platform: &'static dyn PlatformModule,
    region: Region,
    len: usize,
    state: StubState,
}

impl Stub
{
    /// Map `count` writable bytes from `platform`.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument` if `count` is zero
    /// - `NotInitialized` if the platform was not initialized
    /// - `OutOfMemory` if the platform cannot map the pages
    pub fn allocate(platform: &'static dyn PlatformModule, count: usize) -> FfiResult<Self>
    {
        if count == 0 {
            return Err(FfiError::InvalidArgument("stub size must be non-zero".to_string()));
        }

        let region = platform.get_writable(count)?;
        debug!("Allocated {}-byte stub at {}", count, region.base);
        Ok(Self {
            platform,
            region,
            len: count,
            state: StubState::Writable,
        })
    }

    /// Allocate a stub holding `code` and lock it.
    pub fn with_code(platform: &'static dyn PlatformModule, code: &[u8]) -> FfiResult<Self>
    {
        let mut stub = Self::allocate(platform, code.len())?;
        stub.write(0, code)?;
        stub.lock()?;
        Ok(stub)
    }

    /// Current state.
    pub fn state(&self) -> StubState
    {
        self.state
    }

    /// Number of bytes requested at allocation.
    pub fn len(&self) -> usize
    {
        self.len
    }

    /// `true` if the stub holds no code. Never true for an allocated stub.
    pub fn is_empty(&self) -> bool
    {
        self.len == 0
    }

    /// The page-rounded region backing the stub.
    pub fn region(&self) -> Region
    {
        self.region
    }

    /// Entry address, once locked.
    ///
    /// ## Errors
    ///
    /// `NotExecutable` unless the stub is in the `Executable` state.
    pub fn pc(&self) -> FfiResult<Address>
    {
        match self.state {
            StubState::Executable(pc) => Ok(pc),
            _ => Err(FfiError::NotExecutable),
        }
    }

    /// The writable bytes.
    pub fn bytes_mut(&mut self) -> FfiResult<&mut [u8]>
    {
        match self.state {
            StubState::Writable => {
                // SAFETY: the region is a live read+write mapping of at least
                // `len` bytes, exclusively owned by this stub
                Ok(unsafe {
                    std::slice::from_raw_parts_mut(self.region.base.value() as usize as *mut u8, self.len)
                })
            }
            StubState::Executable(_) => Err(FfiError::AlreadyLocked),
            StubState::Freed => Err(FfiError::DoubleFree("stub")),
        }
    }

    /// Copy `bytes` into the stub at `offset`.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> FfiResult<()>
    {
        let capacity = self.len;
        let end = offset.checked_add(bytes.len()).filter(|end| *end <= capacity);
        let Some(end) = end else {
            return Err(FfiError::StubOutOfBounds {
                offset,
                len: bytes.len(),
                capacity,
            });
        };

        self.bytes_mut()?[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Make the stub executable and return its entry address.
    ///
    /// ## Errors
    ///
    /// `AlreadyLocked` if the stub was locked before.
    pub fn lock(&mut self) -> FfiResult<Address>
    {
        match self.state {
            StubState::Writable => {}
            StubState::Executable(_) => return Err(FfiError::AlreadyLocked),
            StubState::Freed => return Err(FfiError::DoubleFree("stub")),
        }

        arch::sync_instruction_cache(self.region.base.value() as usize as *const u8, self.len);
        let pc = self.platform.get_executable(self.region)?;
        self.state = StubState::Executable(pc);
        debug!("Locked stub at {}", pc);
        Ok(pc)
    }

    /// Return the pages to the platform.
    ///
    /// ## Errors
    ///
    /// `DoubleFree` if the stub was already freed.
    pub fn free(&mut self) -> FfiResult<()>
    {
        match self.state {
            StubState::Writable => self.platform.free_writable(self.region)?,
            StubState::Executable(_) => self.platform.free_executable(self.region)?,
            StubState::Freed => return Err(FfiError::DoubleFree("stub")),
        }
        self.state = StubState::Freed;
        debug!("Freed stub at {}", self.region.base);
        Ok(())
    }
}

impl fmt::Debug for Stub
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Stub")
            .field("platform", &self.platform.id())
            .field("region", &self.region)
            .field("len", &self.len)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Stub
{
    fn drop(&mut self)
    {
        if self.state != StubState::Freed {
            if let Err(e) = self.free() {
                warn!("Failed to free stub at {}: {}", self.region.base, e);
            }
        }
    }
}
