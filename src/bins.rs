//! The segregated free-list table: 64 bins plus an occupancy bitmap.
//!
//! Each bin holds a circular doubly-linked list of free chunks within one
//! size class, protected by its own [`Lock`]. The first 33 bins map one size
//! class per alignment unit; the middle bins cover widening ranges of 8
//! units; the top bins cover ranges of 128 units, with bin 63 catching
//! everything up to the mapping threshold. The range boundaries are
//! irregular, so they live in a literal lookup table rather than a formula.
//!
//! The occupancy bitmap has one bit per bin, set iff that bin's list is
//! non-empty. It is read and written with atomic bit operations *outside*
//! the bin locks, so a reader may see a stale view; every algorithm that
//! consumes it re-checks under the relevant bin lock before trusting it.

use core::cell::UnsafeCell;
use core::mem::offset_of;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert;

use crate::chunk::{next_chunk, Chunk, C_INUSE, OVERHEAD, SIZE_ALIGN};
use crate::lock::Lock;

/// Maps ranges of alignment-unit counts to bin indices. Entries 0..60 cover
/// `u/8 - 4` for units 32..512; the same table shifted by 16 covers
/// `u/128 - 4` for units 512..0x1c00.
const BIN_TAB: [u8; 60] = [
    32, 33, 34, 35, 36, 36, 37, 37, 38, 38, 39, 39, 40, 40, 40,
    40, 41, 41, 41, 41, 42, 42, 42, 42, 43, 43, 43, 43, 44, 44,
    44, 44, 44, 44, 44, 44, 45, 45, 45, 45, 45, 45, 45, 45, 46,
    46, 46, 46, 46, 46, 46, 46, 47, 47, 47, 47, 47, 47, 47, 47,
];

/// Bin holding chunks of exactly size `n` (or the class containing `n`).
///
/// `n` must be an adjusted chunk size, i.e. a nonzero multiple of
/// [`SIZE_ALIGN`] no larger than the mapping threshold.
pub(crate) fn bin_index(n: usize) -> usize {
    debug_assert!(n >= SIZE_ALIGN && n % SIZE_ALIGN == 0);
    let x = n / SIZE_ALIGN - 1;
    if x <= 32 {
        return x;
    }
    if x < 512 {
        return BIN_TAB[x / 8 - 4] as usize;
    }
    if x > 0x1c00 {
        return 63;
    }
    BIN_TAB[x / 128 - 4] as usize + 16
}

/// Smallest bin index whose every member can satisfy a request of adjusted
/// size `n`. Rounds up where `bin_index` would round down, so a search
/// starting here never yields an undersized chunk.
pub(crate) fn bin_index_up(n: usize) -> usize {
    debug_assert!(n >= SIZE_ALIGN && n % SIZE_ALIGN == 0);
    let mut x = n / SIZE_ALIGN - 1;
    if x <= 32 {
        return x;
    }
    x -= 1;
    if x < 512 {
        return BIN_TAB[x / 8 - 4] as usize + 1;
    }
    BIN_TAB[x / 128 - 4] as usize + 17
}

/// One free-list bucket.
///
/// The layout duplicates a chunk header in front of the `head`/`tail` fields
/// so that a pointer to the bin doubles as the list's sentinel chunk: the
/// sentinel's `next` is the head and its `prev` is the tail, letting list
/// code treat the bin itself as just another node.
#[repr(C)]
pub(crate) struct Bin {
    _sentinel_hdr: UnsafeCell<[usize; 2]>,
    head: UnsafeCell<*mut Chunk>,
    tail: UnsafeCell<*mut Chunk>,
    lock: Lock,
}

const_assert!(offset_of!(Bin, head) == offset_of!(Chunk, next));
const_assert!(offset_of!(Bin, tail) == offset_of!(Chunk, prev));
const_assert!(offset_of!(Bin, head) == OVERHEAD);

impl Bin {
    const fn new() -> Self {
        Bin {
            _sentinel_hdr: UnsafeCell::new([0; 2]),
            head: UnsafeCell::new(null_mut()),
            tail: UnsafeCell::new(null_mut()),
            lock: Lock::new(),
        }
    }
}

pub(crate) struct BinTable {
    binmap: AtomicU64,
    bins: [Bin; 64],
}

impl BinTable {
    pub const fn new() -> Self {
        BinTable {
            binmap: AtomicU64::new(0),
            bins: [const { Bin::new() }; 64],
        }
    }

    /// The self-referential empty-list sentinel of bin `i`.
    pub(crate) fn sentinel(&self, i: usize) -> *mut Chunk {
        (&self.bins[i] as *const Bin as *mut Bin).cast()
    }

    /// Acquires bin `i`'s lock, initializing the list head on first use.
    pub(crate) fn lock_bin(&self, i: usize) {
        self.bins[i].lock.lock();
        unsafe {
            if (*self.bins[i].head.get()).is_null() {
                let sent = self.sentinel(i);
                *self.bins[i].head.get() = sent;
                *self.bins[i].tail.get() = sent;
            }
        }
    }

    pub(crate) fn unlock_bin(&self, i: usize) {
        self.bins[i].lock.unlock();
    }

    /// First chunk of bin `i`, or the sentinel if the bin is empty.
    ///
    /// # Safety
    /// The caller must hold bin `i`'s lock (which also guarantees the head is
    /// initialized).
    pub(crate) unsafe fn head(&self, i: usize) -> *mut Chunk {
        *self.bins[i].head.get()
    }

    /// Occupancy bits for bins `i..64`.
    pub(crate) fn mask_ge(&self, i: usize) -> u64 {
        self.binmap.load(Ordering::Relaxed) & (!0_u64 << i)
    }

    /// Occupancy bit for bin `i`.
    pub(crate) fn is_marked(&self, i: usize) -> bool {
        self.binmap.load(Ordering::Relaxed) & (1_u64 << i) != 0
    }

    /// Unlinks `c` from bin `i` and marks it in use, clearing the occupancy
    /// bit when the list becomes empty. The chunk is never observable as
    /// free-but-unlinked: the flag bits are set as part of the same
    /// operation.
    ///
    /// # Safety
    /// The caller must hold bin `i`'s lock, and `c` must be linked there.
    pub(crate) unsafe fn unbin(&self, c: *mut Chunk, i: usize) {
        if (*c).prev == (*c).next {
            self.binmap.fetch_and(!(1_u64 << i), Ordering::Relaxed);
        }
        (*(*c).prev).next = (*c).next;
        (*(*c).next).prev = (*c).prev;
        (*c).csize |= C_INUSE;
        (*next_chunk(c)).psize |= C_INUSE;
    }

    /// Appends `c` at the tail of bin `i`, setting the occupancy bit if it
    /// was clear. The chunk's header must already carry its free (untagged)
    /// size.
    ///
    /// # Safety
    /// The caller must hold bin `i`'s lock.
    pub(crate) unsafe fn insert(&self, c: *mut Chunk, i: usize) {
        if !self.is_marked(i) {
            self.binmap.fetch_or(1_u64 << i, Ordering::Relaxed);
        }
        let sent = self.sentinel(i);
        (*c).next = sent;
        (*c).prev = (*sent).prev;
        (*(*c).next).prev = c;
        (*(*c).prev).next = c;
    }
}
