//! The bin-based allocation engine.
//!
//! [`BinMalloc`] owns a table of 64 size-segregated free lists, an occupancy
//! bitmap, and a growth cursor over memory obtained from a [`VmSource`].
//! Small requests are served from the bins (splitting and coalescing
//! neighbors through boundary-tag headers); requests above the mapping
//! threshold bypass the bins entirely and get a dedicated mapping that is
//! returned to the system on free.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::{self, addr_of_mut, copy_nonoverlapping, write_bytes, NonNull};

use tracing::{debug, error, instrument, Level};

use crate::bins::{bin_index, bin_index_up, BinTable};
use crate::chunk::{
    chunk_size, chunk_to_mem, is_mapped, mem_to_chunk, next_chunk, prev_chunk, probe, publish,
    Chunk, C_INUSE, DONTCARE, MMAP_THRESHOLD, OVERHEAD, PAGE_SIZE, RECLAIM, SIZE_ALIGN,
};
use crate::heap::HeapState;
use crate::lock::Lock;
use crate::vm::VmSource;

mod util;
use util::{adjust_size, zero_scan};

#[cfg(test)]
mod tests;

/// A general-purpose allocator over a [`VmSource`].
///
/// All methods take `&self`; the engine synchronizes internally with one
/// lock per bin, a global lock serializing coalescing against concurrent
/// frees, and a lock over the heap growth cursor.
pub struct BinMalloc<V: VmSource> {
    bins: BinTable,
    /// Serializes the final re-validation in free against concurrent frees
    /// of neighboring chunks. Always acquired after the destination bin's
    /// lock, never before.
    free_lock: Lock,
    heap_lock: Lock,
    /// Growth bookkeeping. Guarded by `heap_lock`.
    heap: UnsafeCell<HeapState>,
    /// One past the top sentinel of the most recent region, or 0 before the
    /// first expansion. Guarded by `heap_lock`.
    heap_end: UnsafeCell<usize>,
    vm: V,
}

// The engine hands out raw pointers and synchronizes all access to its
// shared state through its own locks.
unsafe impl<V: VmSource + Sync> Sync for BinMalloc<V> {}
unsafe impl<V: VmSource + Send> Send for BinMalloc<V> {}

impl<V: VmSource> fmt::Debug for BinMalloc<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinMalloc").finish_non_exhaustive()
    }
}

impl<V: VmSource> BinMalloc<V> {
    /// Creates an engine drawing memory from `vm`.
    ///
    /// # Safety
    /// The caller must guarantee that `vm`'s resources (program break,
    /// mappings it hands out) are managed exclusively through this engine
    /// for the engine's lifetime.
    pub const unsafe fn with_vm(vm: V) -> Self {
        BinMalloc {
            bins: BinTable::new(),
            free_lock: Lock::new(),
            heap_lock: Lock::new(),
            heap: UnsafeCell::new(HeapState::new()),
            heap_end: UnsafeCell::new(0),
            vm,
        }
    }

    /// Allocates `n` bytes, returning null on failure. The payload is
    /// aligned to [`SIZE_ALIGN`]. A zero-byte request returns a distinct,
    /// freeable pointer.
    pub fn allocate(&self, n: usize) -> *mut u8 {
        unsafe {
            self.alloc_inner(n)
                .map_or(ptr::null_mut(), NonNull::as_ptr)
        }
    }

    /// Allocates a zero-filled array of `count` elements of `size` bytes,
    /// returning null on overflow or exhaustion.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
        let Some(mut n) = count.checked_mul(size) else {
            return ptr::null_mut();
        };
        let p = self.allocate(n);
        if p.is_null() {
            return p;
        }
        unsafe {
            if is_mapped(mem_to_chunk(p)) {
                // Fresh mappings are zero-filled by the system.
                return p;
            }
            if n >= PAGE_SIZE {
                n = zero_scan(p, PAGE_SIZE, n);
            }
            write_bytes(p, 0, n);
        }
        p
    }

    /// Allocates `len` bytes whose address is a multiple of `align`.
    /// `align` must be a power of two; returns null otherwise.
    pub fn allocate_aligned(&self, align: usize, len: usize) -> *mut u8 {
        if !align.is_power_of_two() {
            return ptr::null_mut();
        }
        if align <= SIZE_ALIGN {
            return self.allocate(len);
        }
        if len > usize::MAX - align {
            return ptr::null_mut();
        }

        let mem = self.allocate(len + align - 1);
        if mem.is_null() {
            return mem;
        }
        let new = ((mem as usize + align - 1) & !(align - 1)) as *mut u8;
        if new == mem {
            return mem;
        }
        let off = new as usize - mem as usize;

        unsafe {
            let c = mem_to_chunk(mem);
            let n = mem_to_chunk(new);

            if is_mapped(c) {
                // Fold the slack into the mapped chunk's base offset; the
                // whole mapping is still released on free.
                (*n).psize = (*c).psize + off;
                (*n).csize = (*c).csize - off;
                return new;
            }

            // Split the slack off the front and free it as its own chunk.
            let t = next_chunk(c);
            (*n).psize = C_INUSE | off;
            (*c).csize = C_INUSE | off;
            (*t).psize -= off;
            (*n).csize = (*t).psize;
            self.bin_chunk(c);
        }
        new
    }

    /// Frees an allocation previously returned by this engine. Null is
    /// ignored.
    ///
    /// # Safety
    /// `p` must be null or a live pointer obtained from this engine, and
    /// must not be used after this call.
    #[instrument(level = "info")]
    pub unsafe fn free(&self, p: *mut u8) {
        if p.is_null() {
            return;
        }
        let c = mem_to_chunk(p);
        if is_mapped(c) {
            self.unmap_chunk(c);
        } else {
            self.bin_chunk(c);
        }
    }

    /// Resizes an allocation to `n` bytes, preserving the prefix contents.
    /// Grows in place when the successor chunk is free, otherwise moves the
    /// payload. On failure returns null and leaves the original allocation
    /// valid. A shrink to zero keeps the pointer, trimmed to the minimum
    /// chunk.
    ///
    /// # Safety
    /// `p` must be null or a live pointer obtained from this engine. On
    /// success the old pointer must no longer be used.
    pub unsafe fn resize(&self, p: *mut u8, n: usize) -> *mut u8 {
        self.realloc_inner(p, n)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Returns the usable payload capacity of a live allocation, which may
    /// exceed the requested size.
    ///
    /// # Safety
    /// `p` must be null or a live pointer obtained from this engine.
    pub unsafe fn usable_size(&self, p: *const u8) -> usize {
        if p.is_null() {
            return 0;
        }
        chunk_size(mem_to_chunk(p as *mut u8)) - OVERHEAD
    }

    /// Donates the byte range `[start, end)` to the free lists. Used to
    /// recycle memory the caller no longer needs, such as slack from image
    /// loading. Ranges too small to hold a chunk are silently dropped.
    ///
    /// # Safety
    /// The range must be writable, unused, and never touched by the caller
    /// again except through pointers this engine hands out.
    pub unsafe fn donate(&self, start: *mut u8, end: *mut u8) {
        let mut lo = start as usize;
        let mut hi = end as usize;
        if hi <= lo {
            return;
        }
        let align_lo = (SIZE_ALIGN - 1) & lo.wrapping_neg().wrapping_sub(OVERHEAD);
        let align_hi = (SIZE_ALIGN - 1) & hi;
        if hi - lo <= OVERHEAD + align_lo + align_hi {
            return;
        }
        lo += align_lo + OVERHEAD;
        hi -= align_hi;

        let c = mem_to_chunk(lo as *mut u8);
        let n = mem_to_chunk(hi as *mut u8);
        // Zero-size sentinels fence the donated range off from its
        // surroundings so coalescing never walks out of it.
        (*c).psize = C_INUSE;
        (*n).csize = C_INUSE;
        (*c).csize = C_INUSE | (hi - lo);
        (*n).psize = C_INUSE | (hi - lo);
        self.bin_chunk(c);
    }

    #[instrument(level = "info", ret(level = Level::INFO), err(Debug, level = Level::DEBUG))]
    unsafe fn alloc_inner(&self, n: usize) -> Result<NonNull<u8>, ()> {
        let n = adjust_size(n)?;

        if n > MMAP_THRESHOLD {
            let len = (n + OVERHEAD + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            let base = self.vm.map(len)?.as_ptr();
            let c = base.add(SIZE_ALIGN - OVERHEAD).cast::<Chunk>();
            // A clear in-use bit marks the chunk as mapped; psize holds the
            // offset back to the mapping base instead of a neighbor size.
            (*c).csize = len - (SIZE_ALIGN - OVERHEAD);
            (*c).psize = SIZE_ALIGN - OVERHEAD;
            debug!(len, "serviced by dedicated mapping");
            return Ok(NonNull::new_unchecked(chunk_to_mem(c)));
        }

        let i = bin_index_up(n);
        let c = loop {
            let mask = self.bins.mask_ge(i);
            if mask == 0 {
                let c = self.expand_heap(n)?;
                if self.alloc_rev(c) {
                    // Merge the fresh region into a free chunk that ends
                    // exactly at its base.
                    let x = c;
                    let c = prev_chunk(x);
                    let merged = (*x).csize + chunk_size(c);
                    let after = next_chunk(x);
                    (*c).csize = merged;
                    (*after).psize = merged;
                    break c;
                }
                break c;
            }
            let j = mask.trailing_zeros() as usize;
            self.bins.lock_bin(j);
            let c = self.bins.head(j);
            if c != self.bins.sentinel(j) {
                if !self.pretrim(c, n, i, j) {
                    self.bins.unbin(c, j);
                }
                self.bins.unlock_bin(j);
                debug!(bin = j, "serviced from bin");
                break c;
            }
            self.bins.unlock_bin(j);
        };

        // Now patch up in case we over-allocated.
        self.trim(c, n);
        Ok(NonNull::new_unchecked(chunk_to_mem(c)))
    }

    /// Grows the heap by at least `n` usable bytes and returns the
    /// resulting in-use chunk, with sentinels written at both ends of any
    /// fresh region.
    unsafe fn expand_heap(&self, n: usize) -> Result<*mut Chunk, ()> {
        // One extra unit covers the prologue of a discontiguous region (or
        // is kept as usable space when growth is contiguous).
        let Some(mut n) = n.checked_add(SIZE_ALIGN) else {
            return Err(());
        };

        self.heap_lock.lock();
        let grown = (*self.heap.get()).expand(&self.vm, n);
        let (p, granted) = match grown {
            Ok(v) => v,
            Err(()) => {
                self.heap_lock.unlock();
                return Err(());
            }
        };
        let mut p = p.as_ptr();
        n = granted;

        let end = self.heap_end.get();
        if p as usize != *end {
            // Fresh region: reserve the prologue and fence the bottom with
            // a zero-size marker so coalescing stops here.
            n -= SIZE_ALIGN;
            p = p.add(SIZE_ALIGN);
            (*mem_to_chunk(p)).psize = C_INUSE;
        }
        *end = p as usize + n;

        // Replace (or install) the top sentinel.
        let w = mem_to_chunk(*end as *mut u8);
        (*w).psize = n | C_INUSE;
        (*w).csize = C_INUSE;

        let c = mem_to_chunk(p);
        (*c).csize = n | C_INUSE;

        self.heap_lock.unlock();
        Ok(c)
    }

    /// Attempts to take `n` bytes off the front of bin `j`'s head chunk
    /// without unbinning it, leaving the remainder linked in place. Only
    /// legal when the remainder still indexes to bin `j`, so waiters on
    /// that bin stay correct, and only worthwhile for coarse bins.
    unsafe fn pretrim(&self, c: *mut Chunk, n: usize, i: usize, j: usize) -> bool {
        if j < 40 {
            return false;
        }
        let n1 = chunk_size(c);
        if j < i + 3 && (j != 63 || n1 - n <= MMAP_THRESHOLD) {
            return false;
        }
        if bin_index(n1 - n) != j {
            return false;
        }

        let after = next_chunk(c);
        let split = c.cast::<u8>().add(n).cast::<Chunk>();

        (*split).prev = (*c).prev;
        (*split).next = (*c).next;
        (*(*split).prev).next = split;
        (*(*split).next).prev = split;
        (*split).psize = n | C_INUSE;
        (*split).csize = n1 - n;
        (*after).psize = n1 - n;
        (*c).csize = n | C_INUSE;
        true
    }

    /// Splits the tail off an in-use chunk when the excess is worth
    /// binning.
    unsafe fn trim(&self, c: *mut Chunk, n: usize) {
        let n1 = chunk_size(c);
        if n >= n1 - DONTCARE {
            return;
        }
        let after = next_chunk(c);
        let split = c.cast::<u8>().add(n).cast::<Chunk>();

        (*split).psize = n | C_INUSE;
        (*split).csize = (n1 - n) | C_INUSE;
        (*after).psize = (n1 - n) | C_INUSE;
        (*c).csize = n | C_INUSE;
        self.bin_chunk(split);
    }

    /// Claims the free successor chunk `c` by unbinning it, retrying while
    /// its size changes under us. Returns false if `c` is in use.
    unsafe fn alloc_fwd(&self, c: *mut Chunk) -> bool {
        loop {
            let k = probe(addr_of_mut!((*c).csize));
            if k & C_INUSE != 0 {
                return false;
            }
            let i = bin_index(k);
            self.bins.lock_bin(i);
            if probe(addr_of_mut!((*c).csize)) == k {
                self.bins.unbin(c, i);
                self.bins.unlock_bin(i);
                return true;
            }
            self.bins.unlock_bin(i);
        }
    }

    /// Claims the free predecessor of `c` by unbinning it, retrying while
    /// the footer changes under us. Returns false if the predecessor is in
    /// use.
    unsafe fn alloc_rev(&self, c: *mut Chunk) -> bool {
        loop {
            let k = probe(addr_of_mut!((*c).psize));
            if k & C_INUSE != 0 {
                return false;
            }
            let i = bin_index(k);
            self.bins.lock_bin(i);
            if probe(addr_of_mut!((*c).psize)) == k {
                self.bins.unbin(prev_chunk(c), i);
                self.bins.unlock_bin(i);
                return true;
            }
            self.bins.unlock_bin(i);
        }
    }

    /// Returns a non-mapped chunk to the free lists, coalescing with free
    /// neighbors first and advising the system to drop interior pages of
    /// large coalesced spans.
    unsafe fn bin_chunk(&self, mut c: *mut Chunk) {
        let mut after = next_chunk(c);
        let mut final_size = chunk_size(c);
        let mut reclaim = false;

        // The freed size at entry; used to decide whether coalescing grew
        // the span enough to bother returning pages.
        let new_size = final_size;

        if (*after).psize != (*c).csize {
            self.crash("chunk header/footer mismatch");
        }

        let i = loop {
            if probe(addr_of_mut!((*c).psize)) & probe(addr_of_mut!((*after).csize)) & C_INUSE != 0
            {
                publish(addr_of_mut!((*c).csize), final_size | C_INUSE);
                publish(addr_of_mut!((*after).psize), final_size | C_INUSE);
                let i = bin_index(final_size);
                self.bins.lock_bin(i);
                self.free_lock.lock();
                // Neighbors may have been freed between the unlocked check
                // and lock acquisition; re-validate before committing.
                if probe(addr_of_mut!((*c).psize)) & probe(addr_of_mut!((*after).csize)) & C_INUSE
                    != 0
                {
                    break i;
                }
                self.free_lock.unlock();
                self.bins.unlock_bin(i);
            }

            if self.alloc_rev(c) {
                c = prev_chunk(c);
                let size = chunk_size(c);
                final_size += size;
                if new_size + size > RECLAIM && ((new_size + size) ^ size) > size {
                    reclaim = true;
                }
            }

            if self.alloc_fwd(after) {
                let size = chunk_size(after);
                final_size += size;
                if new_size + size > RECLAIM && ((new_size + size) ^ size) > size {
                    reclaim = true;
                }
                after = next_chunk(after);
            }
        };

        // The untagged size is what a neighboring free's optimistic phase
        // looks for, so these stores are probe-visible too.
        publish(addr_of_mut!((*c).csize), final_size);
        publish(addr_of_mut!((*after).psize), final_size);
        self.free_lock.unlock();

        self.bins.insert(c, i);
        debug!(bin = i, size = final_size, "binned chunk");

        if reclaim {
            // Drop whole pages strictly inside the span; the headers at
            // both ends must stay resident.
            let a = (c as usize + SIZE_ALIGN + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            let b = (after as usize - SIZE_ALIGN) & !(PAGE_SIZE - 1);
            if b > a {
                self.vm.advise_unneeded(a as *mut u8, b - a);
            }
        }

        self.bins.unlock_bin(i);
    }

    /// Releases a mapped chunk's whole mapping back to the system.
    unsafe fn unmap_chunk(&self, c: *mut Chunk) {
        let extra = (*c).psize;
        if extra & 1 != 0 {
            // The base offset of a live mapped chunk is always even; an odd
            // value means this header was already recycled.
            self.crash("double free of mapped chunk");
        }
        let base = c.cast::<u8>().sub(extra);
        let len = chunk_size(c) + extra;
        debug!(len, "unmapping");
        self.vm.unmap(base, len);
    }

    #[instrument(level = "info", ret(level = Level::INFO), err(Debug, level = Level::DEBUG))]
    unsafe fn realloc_inner(&self, p: *mut u8, n: usize) -> Result<NonNull<u8>, ()> {
        if p.is_null() {
            return self.alloc_inner(n);
        }
        let n = adjust_size(n)?;

        let c = mem_to_chunk(p);
        let n0 = chunk_size(c);
        let mut n1 = n0;

        if is_mapped(c) {
            let extra = (*c).psize;
            if extra & 1 != 0 {
                self.crash("resize of freed mapped chunk");
            }
            let base = c.cast::<u8>().sub(extra);
            let oldlen = n0 + extra;
            let newlen = n + extra;

            // Crossing back under a page is better served by the bins.
            if newlen < PAGE_SIZE {
                if let Ok(new) = self.alloc_inner(n - OVERHEAD) {
                    copy_nonoverlapping(p, new.as_ptr(), n - OVERHEAD);
                    self.free(p);
                    return Ok(new);
                }
            }

            let newlen = (newlen + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            if oldlen == newlen {
                return Ok(NonNull::new_unchecked(p));
            }
            if let Ok(moved) = self.vm.remap(base, oldlen, newlen) {
                let c = moved.as_ptr().add(extra).cast::<Chunk>();
                (*c).csize = newlen - extra;
                return Ok(NonNull::new_unchecked(chunk_to_mem(c)));
            }
            return self.copy_realloc(p, n, n0);
        }

        let mut after = next_chunk(c);
        if (*after).psize != (*c).csize {
            self.crash("chunk header/footer mismatch");
        }

        if n > n1 && self.alloc_fwd(after) {
            n1 += chunk_size(after);
            after = next_chunk(after);
        }
        // A free predecessor is never absorbed here: that would move the
        // payload, which defeats resizing in place.
        (*c).csize = n1 | C_INUSE;
        (*after).psize = n1 | C_INUSE;

        if n <= n1 {
            self.trim(c, n);
            return Ok(NonNull::new_unchecked(p));
        }

        self.copy_realloc(p, n, n0)
    }

    /// Fallback resize: fresh allocation, copy, free. The original stays
    /// valid if the allocation fails.
    unsafe fn copy_realloc(&self, p: *mut u8, n: usize, n0: usize) -> Result<NonNull<u8>, ()> {
        let new = self.alloc_inner(n - OVERHEAD)?;
        copy_nonoverlapping(p, new.as_ptr(), n0.min(n) - OVERHEAD);
        self.free(p);
        Ok(new)
    }

    /// Heap corruption was detected; the state is unrecoverable, so abort
    /// rather than hand out overlapping memory.
    fn crash(&self, why: &str) -> ! {
        error!(why, "heap corruption detected, aborting");
        std::process::abort()
    }

    #[cfg(test)]
    pub(crate) fn vm(&self) -> &V {
        &self.vm
    }

    /// Total bytes currently sitting in the free lists.
    #[cfg(test)]
    pub(crate) fn binned_bytes(&self) -> usize {
        let mut total = 0;
        for i in 0..64 {
            self.bins.lock_bin(i);
            unsafe {
                let sentinel = self.bins.sentinel(i);
                let mut c = self.bins.head(i);
                while c != sentinel {
                    total += chunk_size(c);
                    c = (*c).next;
                }
            }
            self.bins.unlock_bin(i);
        }
        total
    }
}

unsafe impl<V: VmSource + Sync> GlobalAlloc for BinMalloc<V> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= SIZE_ALIGN {
            self.allocate(layout.size())
        } else {
            self.allocate_aligned(layout.align(), layout.size())
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= SIZE_ALIGN {
            return self.allocate_zeroed(layout.size(), 1);
        }
        let p = self.allocate_aligned(layout.align(), layout.size());
        if !p.is_null() {
            write_bytes(p, 0, layout.size());
        }
        p
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= SIZE_ALIGN {
            return self.resize(ptr, new_size);
        }
        // Over-aligned layouts must keep their alignment across a move,
        // which plain resizing does not guarantee.
        let new = self.allocate_aligned(layout.align(), new_size);
        if !new.is_null() {
            copy_nonoverlapping(ptr, new, layout.size().min(new_size));
            self.free(ptr);
        }
        new
    }
}
