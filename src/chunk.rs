//! The in-band chunk header codec.
//!
//! Every unit of heap memory managed by the allocator is a *chunk*: two
//! header words (`psize`, `csize`) followed by the payload handed to the
//! caller. The low bit of `csize` is the in-use flag, and the low bit of the
//! *next* chunk's `psize` always mirrors it, giving each chunk a redundant
//! footer that enables backward traversal and corruption checks.
//!
//! Free chunks additionally embed their free-list links (`next`, `prev`) in
//! the first two payload words, which is why payloads are never smaller than
//! two pointers.
//!
//! Everything in this module is pure pointer/offset arithmetic. Callers must
//! hold whatever lock currently protects the surrounding region; nothing
//! here synchronizes except [`probe`]/[`publish`], the relaxed atomic
//! accessors used where a header word is legitimately read or written
//! outside the owning lock.

use core::mem::{align_of, offset_of, size_of};
use core::sync::atomic::{AtomicUsize, Ordering};

use static_assertions::const_assert;

/// Minimum alignment unit: all chunk payload sizes are multiples of this,
/// and all payload pointers are aligned to it.
pub const SIZE_ALIGN: usize = 4 * size_of::<usize>();
pub const SIZE_MASK: usize = !(SIZE_ALIGN - 1);

/// Bytes taken by the `psize`/`csize` header words.
pub const OVERHEAD: usize = 2 * size_of::<usize>();

/// Requests whose adjusted size exceeds this bypass the bins and are served
/// by an independently mapped region. Chosen so it coincides with the top of
/// the largest bin class (`0x1c00` alignment units).
pub const MMAP_THRESHOLD: usize = 0x1c00 * SIZE_ALIGN;

/// Excess below this is left attached to a chunk rather than split off.
pub const DONTCARE: usize = 16;

/// Coalesced free chunks larger than this get their interior pages returned
/// to the OS via a decommit hint.
pub const RECLAIM: usize = 163840;

/// Granule used for rounding growth requests and for the zero-fill scan.
pub const PAGE_SIZE: usize = 4096;

/// In-use flag kept in the low bit of `csize` (and mirrored into the
/// successor's `psize`).
pub const C_INUSE: usize = 1;

/// A chunk header plus the two free-list link words that overlay the start
/// of a free chunk's payload. For in-use chunks only `psize`/`csize` are
/// meaningful; `next`/`prev` alias caller data.
#[repr(C)]
pub struct Chunk {
    /// Size of the previous (lower-address) chunk, low bit = its in-use flag.
    /// For mapped-large chunks this holds the back-offset to the mapping base
    /// instead.
    pub psize: usize,
    /// Size of this chunk, low bit = in-use flag.
    pub csize: usize,
    pub next: *mut Chunk,
    pub prev: *mut Chunk,
}

// The link words must start exactly where the payload starts, and flag
// tagging requires the alignment unit to keep the low size bit free.
const_assert!(offset_of!(Chunk, next) == OVERHEAD);
const_assert!(SIZE_ALIGN >= 2);
const_assert!(SIZE_ALIGN % align_of::<Chunk>() == 0);

/// Returns the chunk whose payload starts at `mem`.
#[inline(always)]
pub unsafe fn mem_to_chunk(mem: *mut u8) -> *mut Chunk {
    mem.sub(OVERHEAD).cast()
}

/// Returns the payload pointer of `c`.
#[inline(always)]
pub unsafe fn chunk_to_mem(c: *mut Chunk) -> *mut u8 {
    c.cast::<u8>().add(OVERHEAD)
}

/// Size of `c` with the flag bit masked out.
#[inline(always)]
pub unsafe fn chunk_size(c: *mut Chunk) -> usize {
    (*c).csize & !C_INUSE
}

/// Size of the chunk preceding `c`, flag bit masked out.
#[inline(always)]
pub unsafe fn chunk_psize(c: *mut Chunk) -> usize {
    (*c).psize & !C_INUSE
}

/// The chunk immediately after `c` in address order.
///
/// Valid only while the surrounding region is not being mutated by a thread
/// that does not hold the appropriate bin lock.
#[inline(always)]
pub unsafe fn next_chunk(c: *mut Chunk) -> *mut Chunk {
    c.cast::<u8>().add(chunk_size(c)).cast()
}

/// The chunk immediately before `c` in address order.
#[inline(always)]
pub unsafe fn prev_chunk(c: *mut Chunk) -> *mut Chunk {
    c.cast::<u8>().sub(chunk_psize(c)).cast()
}

/// Relaxed atomic load of a header word, for the optimistic phase of lock
/// acquisition: neighbor headers are read before the owning bin lock is
/// held, while another thread may be rewriting them. A plain load there
/// would be a data race, and the compiler could merge it with the
/// post-lock confirming read.
#[inline(always)]
pub unsafe fn probe(word: *mut usize) -> usize {
    AtomicUsize::from_ptr(word).load(Ordering::Relaxed)
}

/// Relaxed atomic store pairing with [`probe`], for header words rewritten
/// while a concurrent thread may be probing them.
#[inline(always)]
pub unsafe fn publish(word: *mut usize, value: usize) {
    AtomicUsize::from_ptr(word).store(value, Ordering::Relaxed);
}

/// Whether `c` is in use (allocated to a caller, or binned with its size
/// stored tagged).
#[inline(always)]
pub unsafe fn is_in_use(c: *mut Chunk) -> bool {
    (*c).csize & C_INUSE != 0
}

/// Whether `c` was served by an independently mapped region. Mapped chunks
/// never carry the in-use bit; its absence is what distinguishes them.
#[inline(always)]
pub unsafe fn is_mapped(c: *mut Chunk) -> bool {
    !is_in_use(c)
}
