//! # POSIX Platform
//!
//! One [`PlatformModule`] implementation shared by Linux, FreeBSD and macOS.
//! The three differ only in their syscall gate convention.
//!
//! Stub memory comes from anonymous `mmap` and is flipped from read+write
//! to read+execute with `mprotect`. Every region handed out is recorded in a
//! table together with its current permission, and operations on regions
//! that are not in the table are refused.
//!
//! ## References
//!
//! - [mmap(2)](https://man7.org/linux/man-pages/man2/mmap.2.html)
//! - [mprotect(2)](https://man7.org/linux/man-pages/man2/mprotect.2.html)

use std::collections::HashMap;
use std::io;
use std::ptr;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use tracing::{debug, trace};

use crate::error::{FfiError, FfiResult};
use crate::module::{PlatformModule, SyscallGate};
use crate::types::{Address, PlatformId, Region};

/// Permission a tracked region currently has
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection
{
    /// Read + write
    Writable,
    /// Read + execute
    Executable,
}

#[derive(Debug)]
struct PosixState
{
    page_size: usize,
    regions: Mutex<HashMap<u64, (usize, Protection)>>,
}

/// POSIX platform module
///
/// State is created by [`initialize`](PlatformModule::initialize); before
/// that every operation returns `NotInitialized`.
#[derive(Debug)]
pub struct PosixPlatform
{
    id: PlatformId,
    gate: SyscallGate,
    state: OnceCell<PosixState>,
}

/// Linux instance.
pub static LINUX: PosixPlatform = PosixPlatform::new(PlatformId::Linux, SyscallGate::Linux);

/// FreeBSD instance.
pub static FREEBSD: PosixPlatform = PosixPlatform::new(PlatformId::FreeBsd, SyscallGate::Bsd);

/// macOS instance.
pub static MACOS: PosixPlatform = PosixPlatform::new(PlatformId::MacOs, SyscallGate::Darwin);

impl PosixPlatform
{
    /// Create an uninitialized module for `id`.
    pub const fn new(id: PlatformId, gate: SyscallGate) -> Self
    {
        Self {
            id,
            gate,
            state: OnceCell::new(),
        }
    }

    fn state(&self) -> FfiResult<&PosixState>
    {
        self.state.get().ok_or(FfiError::NotInitialized(self.id))
    }

    /// Current protection of the region starting at `base`, if tracked.
    pub fn protection(&self, base: Address) -> FfiResult<Option<Protection>>
    {
        let state = self.state()?;
        let regions = lock_regions(state);
        Ok(regions.get(&base.value()).map(|(_, prot)| *prot))
    }

    /// Number of regions currently handed out.
    pub fn live_regions(&self) -> FfiResult<usize>
    {
        let state = self.state()?;
        Ok(lock_regions(state).len())
    }

    fn release(&self, region: Region, expected: Protection) -> FfiResult<()>
    {
        let state = self.state()?;
        let mut regions = lock_regions(state);

        let (size, protection) = *regions
            .get(&region.base.value())
            .ok_or(FfiError::ForeignRegion(region.base.value()))?;
        if protection != expected {
            return Err(FfiError::InvalidArgument(format!(
                "region {} is {:?}, not {:?}",
                region.base, protection, expected
            )));
        }

        // SAFETY: base/size describe a mapping this module created and still tracks
        let rc = unsafe { libc::munmap(region.base.value() as usize as *mut libc::c_void, size) };
        if rc != 0 {
            return Err(FfiError::Os(io::Error::last_os_error()));
        }

        regions.remove(&region.base.value());
        debug!("Unmapped {:?} region at {} ({} bytes)", expected, region.base, size);
        Ok(())
    }
}

fn lock_regions(state: &PosixState) -> std::sync::MutexGuard<'_, HashMap<u64, (usize, Protection)>>
{
    // Poisoning is ignored: every update is a single insert or remove.
    state.regions.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub(crate) fn query_page_size() -> usize
{
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

impl PlatformModule for PosixPlatform
{
    fn id(&self) -> PlatformId
    {
        self.id
    }

    fn initialize(&self) -> FfiResult<()>
    {
        self.state.get_or_init(|| {
            let page_size = query_page_size();
            debug!("Initialized {} platform (page size {})", self.id, page_size);
            PosixState {
                page_size,
                regions: Mutex::new(HashMap::new()),
            }
        });
        Ok(())
    }

    fn page_size(&self) -> FfiResult<usize>
    {
        Ok(self.state()?.page_size)
    }

    fn get_writable(&self, count: usize) -> FfiResult<Region>
    {
        let state = self.state()?;
        if count == 0 {
            return Err(FfiError::InvalidArgument("stub size must be non-zero".to_string()));
        }

        let mask = state.page_size - 1;
        let size = count
            .checked_add(mask)
            .map(|s| s & !mask)
            .ok_or(FfiError::OutOfMemory { requested: count })?;

        // SAFETY: anonymous private mapping, no file descriptor involved
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            trace!("mmap of {} bytes failed: {}", size, io::Error::last_os_error());
            return Err(FfiError::OutOfMemory { requested: size });
        }

        let base = Address::from_ptr(raw.cast::<u8>());
        lock_regions(state).insert(base.value(), (size, Protection::Writable));
        debug!("Mapped writable region at {} ({} bytes)", base, size);
        Ok(Region::new(base, size))
    }

    fn free_writable(&self, region: Region) -> FfiResult<()>
    {
        self.release(region, Protection::Writable)
    }

    fn get_executable(&self, region: Region) -> FfiResult<Address>
    {
        let state = self.state()?;
        let mut regions = lock_regions(state);

        let entry = regions
            .get_mut(&region.base.value())
            .ok_or(FfiError::ForeignRegion(region.base.value()))?;
        if entry.1 == Protection::Executable {
            return Err(FfiError::AlreadyLocked);
        }

        // SAFETY: the region is a live mapping owned by this module
        let rc = unsafe {
            libc::mprotect(
                region.base.value() as usize as *mut libc::c_void,
                entry.0,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(FfiError::Os(io::Error::last_os_error()));
        }

        entry.1 = Protection::Executable;
        debug!("Region at {} is now executable", region.base);
        Ok(region.base)
    }

    fn free_executable(&self, region: Region) -> FfiResult<()>
    {
        self.release(region, Protection::Executable)
    }

    fn syscall_gate(&self) -> SyscallGate
    {
        self.gate
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_requires_initialize()
    {
        let platform = PosixPlatform::new(PlatformId::Linux, SyscallGate::Linux);
        assert!(matches!(platform.get_writable(16), Err(FfiError::NotInitialized(PlatformId::Linux))));
        platform.initialize().unwrap();
        platform.initialize().unwrap();
        assert!(platform.page_size().unwrap().is_power_of_two());
    }

    #[test]
    fn test_writable_then_executable()
    {
        let platform = PosixPlatform::new(PlatformId::Linux, SyscallGate::Linux);
        platform.initialize().unwrap();

        let region = platform.get_writable(10).unwrap();
        assert_eq!(region.size, platform.page_size().unwrap());
        assert_eq!(platform.protection(region.base).unwrap(), Some(Protection::Writable));

        let pc = platform.get_executable(region).unwrap();
        assert_eq!(pc, region.base);
        assert_eq!(platform.protection(region.base).unwrap(), Some(Protection::Executable));
        assert!(matches!(platform.get_executable(region), Err(FfiError::AlreadyLocked)));

        assert!(platform.free_writable(region).is_err());
        platform.free_executable(region).unwrap();
        assert_eq!(platform.live_regions().unwrap(), 0);
    }

    #[test]
    fn test_foreign_region_refused()
    {
        let platform = PosixPlatform::new(PlatformId::Linux, SyscallGate::Linux);
        platform.initialize().unwrap();

        let foreign = Region::new(Address::new(0x1000), 4096);
        assert!(matches!(platform.free_writable(foreign), Err(FfiError::ForeignRegion(0x1000))));
        assert!(matches!(platform.get_executable(foreign), Err(FfiError::ForeignRegion(0x1000))));
    }
}
