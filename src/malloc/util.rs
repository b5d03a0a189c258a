//! Helpers specific to the [`BinMalloc`](super::BinMalloc) engine.

use core::mem::size_of;
use core::ptr::write_bytes;

use crate::chunk::{OVERHEAD, PAGE_SIZE, SIZE_ALIGN, SIZE_MASK};

/// Adjusts a requested payload size to a chunk size: adds the header
/// overhead and rounds up to the alignment unit. Zero-sized requests still
/// receive a minimum-size chunk; sizes too large for the address space are
/// rejected.
#[inline]
pub(super) fn adjust_size(n: usize) -> Result<usize, ()> {
    // Chunk sizes must fit a pointer difference, with headroom for the
    // overhead and page rounding applied later.
    if n.wrapping_sub(1) > isize::MAX as usize - SIZE_ALIGN - PAGE_SIZE {
        if n != 0 {
            return Err(());
        }
        return Ok(SIZE_ALIGN);
    }
    Ok((n + OVERHEAD + SIZE_ALIGN - 1) & SIZE_MASK)
}

/// Backward zero-scan used by zeroed allocation for recycled chunks.
///
/// Clears the tail of `[p, p + n)` page by page from the top, skipping over
/// word pairs that are already zero (freshly committed pages read as zero
/// without being dirtied), and returns the length of the prefix that the
/// caller must still clear unconditionally.
///
/// # Safety
/// `p` must point to at least `n` readable/writable bytes, aligned to the
/// alignment unit, with `n >= pagesz` and `pagesz` a power of two no smaller
/// than two word pairs.
pub(super) unsafe fn zero_scan(p: *mut u8, pagesz: usize, n: usize) -> usize {
    const PAIR: usize = 2 * size_of::<u64>();
    debug_assert!(n >= pagesz);
    debug_assert!(pagesz.is_power_of_two() && pagesz >= 2 * PAIR);

    let mut pp = p.add(n);
    let mut i = pp as usize & (pagesz - 1);
    loop {
        pp = pp.sub(i);
        write_bytes(pp, 0, i);
        if (pp as usize - p as usize) < pagesz {
            return pp as usize - p as usize;
        }
        i = pagesz;
        while i != 0 {
            let w = pp.cast::<u64>();
            if (*w.sub(1) | *w.sub(2)) != 0 {
                break;
            }
            i -= PAIR;
            pp = pp.sub(PAIR);
        }
    }
}
