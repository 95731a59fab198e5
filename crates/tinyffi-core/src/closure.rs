//! # Closures
//!
//! A closure is the stack a foreign call runs on. It is allocated by an
//! architecture module, owned by exactly one [`Context`](crate::Context) or
//! [`Coroutine`](crate::Coroutine), and released exactly once.
//!
//! The top of the closure holds the call frame (see [`frame`](crate::frame));
//! the target stack grows downward from just below it. On Unix the stack is
//! an anonymous mapping with one inaccessible guard page directly below
//! `base`, so a target that overruns its stack faults instead of writing
//! into other memory.
//!
//! ```text
//! guard page | base                                          base + size
//!  PROT_NONE |  target stack (grows down) <- | frame | payloads | pad | sp |
//! ```

use std::ptr::NonNull;

use tracing::{debug, warn};

use crate::error::{FfiError, FfiResult};
use crate::types::{Address, Region};

/// Alignment of every closure allocation.
///
/// Matches the strictest frame payload requirement (ZMM images).
pub const CLOSURE_ALIGN: usize = 64;

/// Stack rules an architecture module applies to its closures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackConvention
{
    /// Stack pointer alignment in bytes (a power of two)
    pub alignment: usize,
    /// Smallest closure the module accepts
    pub minimum: usize,
    /// Size used for temporary closures and new contexts
    pub default_size: usize,
    /// Distance between the initial stack pointer and the end of the closure
    pub top_reserve: usize,
}

impl StackConvention
{
    /// The convention shared by the System V x86-64 and AAPCS64 backends.
    pub const DOWNWARD_16: Self = StackConvention {
        alignment: 16,
        minimum: 1024,
        default_size: 64 * 1024,
        top_reserve: 16,
    };

    /// Round `size` up to the stack alignment.
    pub fn round(&self, size: usize) -> Option<usize>
    {
        let mask = self.alignment - 1;
        size.checked_add(mask).map(|s| s & !mask)
    }
}

/// Stack memory a foreign call runs on
///
/// `sp` always lies inside `[base, base + size)`. The memory is released by
/// [`free`](Closure::free) or on drop, whichever happens first.
#[derive(Debug)]
pub struct Closure
{
    ptr: Option<NonNull<u8>>,
    mapping: StackMapping,
    base: Address,
    size: usize,
    sp: Address,
}

// The closure exclusively owns its allocation; nothing else aliases it.
unsafe impl Send for Closure {}

impl Closure
{
    /// Allocate a closure of at least `size` bytes under `convention`.
    ///
    /// ## Errors
    ///
    /// - `ClosureTooSmall` if the rounded size is below the convention's minimum
    /// - `OutOfMemory` if the memory cannot be mapped
    /// - `Os` if the guard page cannot be protected
    pub fn allocate(size: usize, convention: StackConvention) -> FfiResult<Self>
    {
        let rounded = convention
            .round(size)
            .ok_or_else(|| FfiError::InvalidArgument(format!("closure size {size} overflows")))?;

        if rounded < convention.minimum {
            return Err(FfiError::ClosureTooSmall {
                requested: size,
                minimum: convention.minimum,
            });
        }

        let (ptr, mapping) = StackMapping::map(rounded)?;

        let base = Address::from_ptr(ptr.as_ptr());
        let sp = base + (rounded - convention.top_reserve) as u64;
        debug!(
            "Allocated closure at {} ({} bytes, sp {}, guard {} bytes)",
            base, rounded, sp, mapping.guard
        );

        Ok(Self {
            ptr: Some(ptr),
            mapping,
            base,
            size: rounded,
            sp,
        })
    }

    /// Lowest address of the closure.
    pub fn base(&self) -> Address
    {
        self.base
    }

    /// Size in bytes.
    pub fn size(&self) -> usize
    {
        self.size
    }

    /// Initial stack pointer for calls made on this closure.
    pub fn sp(&self) -> Address
    {
        self.sp
    }

    /// The usable stack as a region.
    pub fn region(&self) -> Region
    {
        Region::new(self.base, self.size)
    }

    /// The inaccessible region directly below [`base`](Self::base).
    ///
    /// Empty on hosts where closures are heap allocations.
    pub fn guard(&self) -> Region
    {
        Region::new(self.base - self.mapping.guard as u64, self.mapping.guard)
    }

    /// `true` until the closure is freed.
    pub fn is_live(&self) -> bool
    {
        self.ptr.is_some()
    }

    /// Pointer to the first byte, if the closure is still live.
    pub fn as_ptr(&self) -> FfiResult<NonNull<u8>>
    {
        self.ptr
            .ok_or_else(|| FfiError::InvalidArgument("closure has been released".to_string()))
    }

    /// Release the memory, guard page included.
    ///
    /// A closure whose release fails stays live.
    ///
    /// ## Errors
    ///
    /// - `DoubleFree` if the closure was already released
    /// - `Os` if the OS refuses to unmap the stack
    pub fn free(&mut self) -> FfiResult<()>
    {
        let ptr = self.ptr.ok_or(FfiError::DoubleFree("closure"))?;

        // SAFETY: ptr and mapping were produced together by StackMapping::map
        // and are released only here
        unsafe { self.mapping.unmap(ptr)? };
        self.ptr = None;
        debug!("Released closure at {}", self.base);
        Ok(())
    }
}

impl Drop for Closure
{
    fn drop(&mut self)
    {
        if self.is_live() {
            if let Err(e) = self.free() {
                warn!("Failed to release closure at {}: {}", self.base, e);
            }
        }
    }
}

/// Backing memory of one closure
#[derive(Debug, Clone, Copy)]
struct StackMapping
{
    /// Bytes reserved as guard below the usable stack
    guard: usize,
    /// Usable bytes, guard excluded
    len: usize,
}

#[cfg(unix)]
impl StackMapping
{
    fn map(size: usize) -> FfiResult<(NonNull<u8>, Self)>
    {
        use std::io;

        let page = crate::platform::posix::query_page_size();
        let len = size
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or(FfiError::OutOfMemory { requested: size })?;
        let total = len.checked_add(page).ok_or(FfiError::OutOfMemory { requested: size })?;

        // SAFETY: anonymous private mapping, no file descriptor involved
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(FfiError::OutOfMemory { requested: total });
        }

        // SAFETY: the first page lies inside the mapping created above
        if unsafe { libc::mprotect(raw, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: the mapping is unused and owned by this function
            unsafe { libc::munmap(raw, total) };
            return Err(FfiError::Os(err));
        }

        // SAFETY: total > page, so raw + page is inside the mapping and non-null
        let base = unsafe { NonNull::new_unchecked(raw.cast::<u8>().add(page)) };
        Ok((base, Self { guard: page, len }))
    }

    /// Unmap the stack and its guard page.
    ///
    /// # Safety
    ///
    /// `base` must be the pointer returned together with `self` by `map`,
    /// and no call may still be running on the stack.
    unsafe fn unmap(&self, base: NonNull<u8>) -> FfiResult<()>
    {
        let start = base.as_ptr().sub(self.guard).cast::<libc::c_void>();
        if libc::munmap(start, self.guard + self.len) != 0 {
            return Err(FfiError::Os(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(not(unix))]
impl StackMapping
{
    fn layout(size: usize) -> FfiResult<std::alloc::Layout>
    {
        std::alloc::Layout::from_size_align(size, CLOSURE_ALIGN)
            .map_err(|_| FfiError::InvalidArgument(format!("closure size {size} overflows")))
    }

    fn map(size: usize) -> FfiResult<(NonNull<u8>, Self)>
    {
        let layout = Self::layout(size)?;
        // SAFETY: layout has a non-zero size (checked against the minimum)
        let raw = unsafe { std::alloc::alloc(layout) };
        let ptr = NonNull::new(raw).ok_or(FfiError::OutOfMemory { requested: size })?;
        Ok((ptr, Self { guard: 0, len: size }))
    }

    /// # Safety
    ///
    /// `base` must be the pointer returned together with `self` by `map`.
    unsafe fn unmap(&self, base: NonNull<u8>) -> FfiResult<()>
    {
        std::alloc::dealloc(base.as_ptr(), Self::layout(self.len)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_size_rounded_to_alignment()
    {
        let closure = Closure::allocate(1030, StackConvention::DOWNWARD_16).unwrap();
        assert_eq!(closure.size(), 1040);
        assert!(closure.base().is_aligned(CLOSURE_ALIGN as u64));
    }

    #[test]
    fn test_sp_inside_region()
    {
        let closure = Closure::allocate(4096, StackConvention::DOWNWARD_16).unwrap();
        assert!(closure.region().contains(closure.sp()));
        assert_eq!(closure.sp(), closure.base() + 4096 - 16);
        assert!(closure.sp().is_aligned(16));
    }

    #[test]
    fn test_too_small()
    {
        let err = Closure::allocate(512, StackConvention::DOWNWARD_16).unwrap_err();
        assert!(matches!(err, FfiError::ClosureTooSmall { minimum: 1024, .. }));
    }

    #[test]
    fn test_double_free()
    {
        let mut closure = Closure::allocate(2048, StackConvention::DOWNWARD_16).unwrap();
        closure.free().unwrap();
        assert!(!closure.is_live());
        assert!(matches!(closure.free(), Err(FfiError::DoubleFree("closure"))));
        assert!(closure.as_ptr().is_err());
    }

    /// Permissions and end address of the mapping containing `addr`.
    #[cfg(target_os = "linux")]
    fn mapping_of(addr: u64) -> Option<(String, u64)>
    {
        let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
        maps.lines().find_map(|line| {
            let mut fields = line.split_whitespace();
            let (start, end) = fields.next()?.split_once('-')?;
            let start = u64::from_str_radix(start, 16).ok()?;
            let end = u64::from_str_radix(end, 16).ok()?;
            if !(start..end).contains(&addr) {
                return None;
            }
            Some((fields.next()?.to_string(), end))
        })
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_guard_page_below_base()
    {
        let closure = Closure::allocate(64 * 1024, StackConvention::DOWNWARD_16).unwrap();
        let guard = closure.guard();

        assert!(guard.size > 0);
        assert_eq!(guard.base + guard.size as u64, closure.base());

        let (perms, end) = mapping_of(closure.base().value() - 1).unwrap();
        assert!(perms.starts_with("---"), "guard mapped as {perms}");
        assert_eq!(end, closure.base().value());

        let (perms, _) = mapping_of(closure.base().value()).unwrap();
        assert!(perms.starts_with("rw"), "stack mapped as {perms}");
    }
}
