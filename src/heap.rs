//! The heap growth policy: in-place break extension with an independently
//! mapped fallback.
//!
//! Growth prefers advancing the program break so the heap stays one
//! contiguous run of chunks. When the break cannot move (the OS refuses, or
//! the extension would run into the stack), the request is served by a fresh
//! anonymous mapping whose size is bounded below by an exponentially growing
//! minimum, so a long sequence of fallback mappings cannot shred the address
//! space into arbitrarily small fragments.
//!
//! Callers serialize through the allocator's growth lock; at most one
//! expansion runs at a time.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::chunk::PAGE_SIZE;
use crate::vm::VmSource;

/// Distance below a known stack position that the break is never allowed to
/// enter. A heuristic safety margin, not a precise contract.
const STACK_GUARD: usize = 8 << 20;

/// Highest stack address observed across all growth calls. Probing only the
/// calling thread's stack would let an expansion requested from a worker
/// thread grow the break into the main thread's stack; remembering the
/// high-water mark guards every stack that has ever reached this code.
static STACK_ANCHOR: AtomicUsize = AtomicUsize::new(0);

/// Returns whether `[old, new]` comes too close to the current stack or to
/// the highest stack previously seen. Defends against break growth crossing
/// into stack memory.
fn traverses_stack(old: usize, new: usize) -> bool {
    let here = &old as *const usize as usize;
    let recorded = STACK_ANCHOR.fetch_max(here, Ordering::Relaxed);
    let hits = |top: usize| new > top.saturating_sub(STACK_GUARD) && old < top;
    hits(here) || (recorded != 0 && hits(recorded))
}

/// The growable segment's cursor plus the fallback-mapping step counter.
/// Mutated only under the growth lock.
pub(crate) struct HeapState {
    brk: usize,
    mmap_step: u32,
}

impl HeapState {
    pub const fn new() -> Self {
        HeapState {
            brk: 0,
            mmap_step: 0,
        }
    }

    /// Obtains at least `n` more bytes of memory, returning the region start
    /// and the granted size (a page multiple, possibly larger than asked).
    ///
    /// The returned region is contiguous with the previous break growth
    /// exactly when it starts at the caller's recorded heap end; fallback
    /// mappings are not contiguous with anything.
    ///
    /// # Safety
    /// The caller must hold the growth lock and must be the only manager of
    /// `vm`'s break.
    pub unsafe fn expand<V: VmSource>(
        &mut self,
        vm: &V,
        n: usize,
    ) -> Result<(NonNull<u8>, usize), ()> {
        if n > usize::MAX / 2 - PAGE_SIZE {
            return Err(());
        }
        let n = n + (n.wrapping_neg() & (PAGE_SIZE - 1));

        if self.brk == 0 {
            let b = vm.current_break()?.as_ptr() as usize;
            self.brk = b + (b.wrapping_neg() & (PAGE_SIZE - 1));
        }

        if n < usize::MAX - self.brk
            && !traverses_stack(self.brk, self.brk + n)
            && vm.set_break((self.brk + n) as *mut u8).is_ok()
        {
            let old = self.brk;
            self.brk += n;
            debug!(start = old, granted = n, "Extended break in place.");
            return Ok((NonNull::new_unchecked(old as *mut u8), n));
        }

        let min = PAGE_SIZE << (self.mmap_step / 2);
        let n = n.max(min);
        let area = vm.map(n)?;
        self.mmap_step += 1;
        debug!(
            start = area.as_ptr() as usize,
            granted = n,
            step = self.mmap_step,
            "Break unavailable, mapped a fallback region."
        );
        Ok((area, n))
    }
}
