//! [`VmSource`] trait and structures that implement it.
//!
//! [`VmSource`] is the allocator's only window onto the operating system's
//! virtual memory: moving the program break, mapping and unmapping anonymous
//! regions, remapping, and decommit advice. The allocator in
//! [`binmalloc::malloc`](crate::malloc) is generic over its source, so a
//! fixed in-process buffer can stand in for the OS during tests.

use core::ptr::NonNull;

/// Raw virtual-memory primitives consumed by the allocator.
///
/// # Safety
/// * Memory handed out by `map` and by growing the break must stay valid at
///   a stable address until released; copying or moving the source must not
///   invalidate it.
/// * `set_break` calls are serialized by the allocator's growth lock;
///   `map`/`unmap`/`remap`/`advise_unneeded` may be called concurrently and
///   implementations must tolerate that.
pub unsafe trait VmSource {
    /// Returns the current program break.
    unsafe fn current_break(&self) -> Result<NonNull<u8>, ()>;

    /// Moves the program break to `new_end`. Fails without side effects if
    /// the OS refuses.
    unsafe fn set_break(&self, new_end: *mut u8) -> Result<(), ()>;

    /// Maps a fresh anonymous read/write region of `len` bytes.
    unsafe fn map(&self, len: usize) -> Result<NonNull<u8>, ()>;

    /// Releases a region previously returned by `map` (or `remap`).
    unsafe fn unmap(&self, ptr: *mut u8, len: usize);

    /// Resizes a mapped region, moving it if necessary. Returns the region's
    /// (possibly new) base address.
    unsafe fn remap(
        &self,
        ptr: *mut u8,
        old_len: usize,
        new_len: usize,
    ) -> Result<NonNull<u8>, ()>;

    /// Hints that `len` bytes at `ptr` hold no live data, letting the OS
    /// reclaim the backing pages without giving up the address range.
    unsafe fn advise_unneeded(&self, ptr: *mut u8, len: usize);
}

/// The production source: `brk`/`sbrk`, `mmap` and friends via [`libc`].
#[derive(Debug)]
pub struct SysVm;

impl SysVm {
    #[inline(always)]
    pub const fn new() -> Self {
        SysVm
    }
}

impl Default for SysVm {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl VmSource for SysVm {
    unsafe fn current_break(&self) -> Result<NonNull<u8>, ()> {
        let end = libc::sbrk(0);
        if end as isize == -1 || end.is_null() {
            return Err(());
        }
        Ok(NonNull::new_unchecked(end.cast()))
    }

    unsafe fn set_break(&self, new_end: *mut u8) -> Result<(), ()> {
        if libc::brk(new_end.cast()) == -1 {
            return Err(());
        }
        Ok(())
    }

    unsafe fn map(&self, len: usize) -> Result<NonNull<u8>, ()> {
        let p = libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            return Err(());
        }
        Ok(NonNull::new_unchecked(p.cast()))
    }

    unsafe fn unmap(&self, ptr: *mut u8, len: usize) {
        libc::munmap(ptr.cast(), len);
    }

    #[cfg(target_os = "linux")]
    unsafe fn remap(
        &self,
        ptr: *mut u8,
        old_len: usize,
        new_len: usize,
    ) -> Result<NonNull<u8>, ()> {
        let p = libc::mremap(ptr.cast(), old_len, new_len, libc::MREMAP_MAYMOVE);
        if p == libc::MAP_FAILED {
            return Err(());
        }
        Ok(NonNull::new_unchecked(p.cast()))
    }

    #[cfg(not(target_os = "linux"))]
    unsafe fn remap(
        &self,
        _ptr: *mut u8,
        _old_len: usize,
        _new_len: usize,
    ) -> Result<NonNull<u8>, ()> {
        Err(())
    }

    unsafe fn advise_unneeded(&self, ptr: *mut u8, len: usize) {
        libc::madvise(ptr.cast(), len, libc::MADV_DONTNEED);
    }
}
