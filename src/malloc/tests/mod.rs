use core::alloc::{GlobalAlloc, Layout};

use crate::chunk::{is_mapped, mem_to_chunk, MMAP_THRESHOLD, OVERHEAD, PAGE_SIZE, SIZE_ALIGN};
use crate::vm::arena_vm::ArenaVm;

use super::*;

/// A page-aligned buffer for the arena, leaked for the test's duration so
/// the engine's pointers stay valid until the process exits.
fn arena(len: usize, brk_span: usize) -> ArenaVm {
    let layout = Layout::from_size_align(len, PAGE_SIZE).unwrap();
    let buf = unsafe { std::alloc::alloc_zeroed(layout) };
    if buf.is_null() {
        std::alloc::handle_alloc_error(layout);
    }
    ArenaVm::new(buf, len, brk_span)
}

fn engine(len: usize, brk_span: usize) -> BinMalloc<ArenaVm> {
    unsafe { BinMalloc::with_vm(arena(len, brk_span)) }
}

/// Forces a single expansion big enough for the rest of the test, so later
/// assertions about "no further growth" are meaningful, and returns the
/// bytes sitting in the bins afterwards.
fn warm_up(allocator: &BinMalloc<ArenaVm>, n: usize) -> usize {
    let p = allocator.allocate(n);
    assert!(!p.is_null());
    unsafe { allocator.free(p) };
    allocator.binned_bytes()
}

fn growth(allocator: &BinMalloc<ArenaVm>) -> (usize, usize) {
    (allocator.vm().break_used(), allocator.vm().mapped_used())
}

#[test]
fn test_allocate_free_round_trip() {
    let allocator = engine(2 << 20, 1 << 20);
    let base = warm_up(&allocator, 64 * 1024);
    let grown = growth(&allocator);

    let mut live = vec![];
    for n in [1, 17, 100, 512, 4000, 9000] {
        let p = allocator.allocate(n);
        assert!(!p.is_null());
        unsafe {
            assert!(allocator.usable_size(p) >= n);
            // Every byte of the payload must be writable.
            write_bytes(p, 0x5A, n);
        }
        live.push(p);
    }
    for p in live {
        unsafe { allocator.free(p) };
    }

    assert_eq!(allocator.binned_bytes(), base);
    assert_eq!(growth(&allocator), grown);
}

#[test]
fn test_allocations_never_overlap() {
    let allocator = engine(2 << 20, 1 << 20);
    let mut spans: Vec<(usize, usize)> = vec![];
    for i in 0..64 {
        let n = 1 + (i * 37) % 700;
        let p = allocator.allocate(n);
        assert!(!p.is_null());
        let len = unsafe { allocator.usable_size(p) };
        spans.push((p as usize, len));
    }
    spans.sort_unstable();
    for w in spans.windows(2) {
        assert!(w[0].0 + w[0].1 <= w[1].0, "payloads {w:?} overlap");
    }
    for (start, _) in spans {
        unsafe { allocator.free(start as *mut u8) };
    }
}

#[test]
fn test_coalescing_all_free_orders() {
    for order in [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ] {
        let allocator = engine(2 << 20, 1 << 20);
        let base = warm_up(&allocator, 32 * 1024);
        let grown = growth(&allocator);

        let ps: Vec<*mut u8> = (0..3).map(|_| allocator.allocate(200)).collect();
        // Consecutive carves off one free chunk are adjacent.
        for w in ps.windows(2) {
            let step = unsafe { allocator.usable_size(w[0]) } + OVERHEAD;
            assert_eq!(w[1], unsafe { w[0].add(step) });
        }

        for &k in &order {
            unsafe { allocator.free(ps[k]) };
        }

        assert_eq!(allocator.binned_bytes(), base, "order {order:?}");
        // The span must have coalesced back into one chunk: a request for
        // the warm-up size has to succeed without growing the heap again.
        let p = allocator.allocate(32 * 1024);
        assert!(!p.is_null(), "order {order:?} left the span fragmented");
        assert_eq!(growth(&allocator), grown, "order {order:?}");
        unsafe { allocator.free(p) };
    }
}

#[test]
fn test_zeroed_allocation_clears_recycled_chunks() {
    let allocator = engine(2 << 20, 1 << 20);
    warm_up(&allocator, 128 * 1024);

    for n in [
        1,
        PAGE_SIZE - 1,
        PAGE_SIZE,
        PAGE_SIZE + 1,
        10 * PAGE_SIZE,
    ] {
        // Dirty a chunk of the same size first so the zeroed allocation has
        // to clear recycled memory rather than rely on fresh pages.
        let dirty = allocator.allocate(n);
        assert!(!dirty.is_null());
        unsafe {
            write_bytes(dirty, 0xFF, n);
            allocator.free(dirty);
        }

        let p = allocator.allocate_zeroed(n, 1);
        assert!(!p.is_null());
        unsafe {
            for i in 0..n {
                assert_eq!(*p.add(i), 0, "byte {i} of {n} not cleared");
            }
            allocator.free(p);
        }
    }
}

#[test]
fn test_zeroed_allocation_of_nothing() {
    let allocator = engine(2 << 20, 1 << 20);
    let p = allocator.allocate_zeroed(0, 1);
    let q = allocator.allocate_zeroed(16, 0);
    assert!(!p.is_null());
    assert!(!q.is_null());
    assert_ne!(p, q);
    unsafe {
        allocator.free(p);
        allocator.free(q);
    }
}

#[test]
fn test_zeroed_allocation_overflow_is_null() {
    let allocator = engine(2 << 20, 1 << 20);
    assert!(allocator.allocate_zeroed(usize::MAX, 2).is_null());
    assert!(allocator.allocate_zeroed(usize::MAX / 2, 3).is_null());
}

#[test]
fn test_threshold_routes_to_mapping() {
    let allocator = engine(4 << 20, 1 << 20);

    // The largest request that still fits the bins.
    let small = allocator.allocate(MMAP_THRESHOLD - OVERHEAD);
    assert!(!small.is_null());
    // One byte more and the chunk no longer fits any bin.
    let big = allocator.allocate(MMAP_THRESHOLD - OVERHEAD + 1);
    assert!(!big.is_null());

    unsafe {
        assert!(!is_mapped(mem_to_chunk(small)));
        assert!(is_mapped(mem_to_chunk(big)));
        assert!(allocator.usable_size(big) >= MMAP_THRESHOLD - OVERHEAD + 1);
        write_bytes(big, 0x3C, MMAP_THRESHOLD - OVERHEAD + 1);
        allocator.free(big);
        allocator.free(small);
    }
}

#[test]
fn test_zero_byte_allocations_are_distinct() {
    let allocator = engine(2 << 20, 1 << 20);
    let p1 = allocator.allocate(0);
    let p2 = allocator.allocate(0);
    assert!(!p1.is_null());
    assert!(!p2.is_null());
    assert_ne!(p1, p2);
    unsafe {
        assert_eq!(allocator.usable_size(p1), SIZE_ALIGN - OVERHEAD);
        allocator.free(p1);
        allocator.free(p2);
    }
}

#[test]
fn test_resize_grows_in_place_when_successor_is_free() {
    let allocator = engine(2 << 20, 1 << 20);
    let p = allocator.allocate(100);
    assert!(!p.is_null());
    unsafe {
        for i in 0..100 {
            *p.add(i) = i as u8;
        }
        // The rest of the first region sits free right behind the chunk.
        let q = allocator.resize(p, 3000);
        assert_eq!(q, p);
        assert!(allocator.usable_size(q) >= 3000);
        for i in 0..100 {
            assert_eq!(*q.add(i), i as u8);
        }
        allocator.free(q);
    }
}

#[test]
fn test_resize_moves_and_preserves_contents() {
    let allocator = engine(2 << 20, 1 << 20);
    let p = allocator.allocate(100);
    let blocker = allocator.allocate(16);
    assert!(!p.is_null() && !blocker.is_null());
    unsafe {
        for i in 0..100 {
            *p.add(i) = !(i as u8);
        }
        // An in-use successor forces the payload to move.
        let q = allocator.resize(p, 50 * 1024);
        assert!(!q.is_null());
        assert_ne!(q, p);
        for i in 0..100 {
            assert_eq!(*q.add(i), !(i as u8));
        }
        allocator.free(q);
        allocator.free(blocker);
    }
}

#[test]
fn test_resize_across_the_mapping_threshold() {
    let allocator = engine(4 << 20, 1 << 20);

    let small = 4000_usize;
    let p = allocator.allocate(small);
    assert!(!p.is_null());
    unsafe {
        for i in 0..small {
            p.add(i).write((i % 251) as u8);
        }

        // Growing past the threshold moves the payload into a mapping.
        let big = allocator.resize(p, 300 * 1024);
        assert!(!big.is_null());
        assert!(is_mapped(mem_to_chunk(big)));
        for i in 0..small {
            assert_eq!(big.add(i).read(), (i % 251) as u8);
        }

        // Shrinking well under a page hands the payload back to the bins.
        let back = allocator.resize(big, 2000);
        assert!(!back.is_null());
        assert!(!is_mapped(mem_to_chunk(back)));
        for i in 0..2000 {
            assert_eq!(back.add(i).read(), (i % 251) as u8);
        }
        allocator.free(back);
    }
}

#[test]
fn test_resize_shrink_preserves_prefix() {
    let allocator = engine(2 << 20, 1 << 20);
    let n = 6000_usize;
    let p = allocator.allocate(n);
    assert!(!p.is_null());
    unsafe {
        for i in 0..n {
            p.add(i).write((i % 199) as u8);
        }
        let q = allocator.resize(p, n / 2);
        assert!(!q.is_null());
        // A shrink within a binned chunk trims in place.
        assert_eq!(q, p);
        for i in 0..n / 2 {
            assert_eq!(q.add(i).read(), (i % 199) as u8);
        }
        allocator.free(q);
    }
}

#[test]
fn test_resize_to_zero_keeps_the_pointer() {
    let allocator = engine(2 << 20, 1 << 20);
    let p = allocator.allocate(1000);
    assert!(!p.is_null());
    unsafe {
        let q = allocator.resize(p, 0);
        assert_eq!(q, p);
        assert_eq!(allocator.usable_size(q), SIZE_ALIGN - OVERHEAD);
        allocator.free(q);
    }
}

#[test]
fn test_resize_null_allocates() {
    let allocator = engine(2 << 20, 1 << 20);
    let p = unsafe { allocator.resize(ptr::null_mut(), 300) };
    assert!(!p.is_null());
    unsafe { allocator.free(p) };
}

#[test]
fn test_failed_resize_leaves_original_valid() {
    // A tiny arena: the grow below cannot possibly be satisfied.
    let allocator = engine(16 * 1024, 8 * 1024);
    let p = allocator.allocate(100);
    assert!(!p.is_null());
    unsafe {
        write_bytes(p, 0x77, 100);
        let q = allocator.resize(p, 512 * 1024);
        assert!(q.is_null());
        for i in 0..100 {
            assert_eq!(*p.add(i), 0x77);
        }
        allocator.free(p);
    }
}

#[test]
fn test_exhaustion_returns_null() {
    let allocator = engine(16 * 1024, 8 * 1024);
    assert!(allocator.allocate(512 * 1024).is_null());
    // The engine still works afterwards.
    let p = allocator.allocate(64);
    assert!(!p.is_null());
    unsafe { allocator.free(p) };
}

#[test]
fn test_donated_memory_is_allocatable() {
    let allocator = engine(PAGE_SIZE, 0);
    let mut region = vec![0_u8; 8192];
    let lo = region.as_mut_ptr();

    unsafe {
        // Deliberately ragged bounds; the engine aligns them internally.
        allocator.donate(lo.add(3), lo.add(8192 - 5));
    }
    let binned = allocator.binned_bytes();
    assert!(binned >= 8192 - 2 * SIZE_ALIGN - OVERHEAD);

    let p = allocator.allocate(1000);
    assert!(!p.is_null());
    assert!((lo as usize..lo as usize + 8192).contains(&(p as usize)));
    // Nothing came from the system.
    assert_eq!(growth(&allocator), (0, 0));
    unsafe { allocator.free(p) };

    // A range too small for even one chunk is silently dropped.
    let before = allocator.binned_bytes();
    unsafe { allocator.donate(lo.add(100), lo.add(116)) };
    assert_eq!(allocator.binned_bytes(), before);

    drop(allocator);
    drop(region);
}

#[test]
fn test_aligned_allocations() {
    let allocator = engine(2 << 20, 1 << 20);
    for align in [SIZE_ALIGN, 64, 256, PAGE_SIZE] {
        let p = allocator.allocate_aligned(align, 500);
        assert!(!p.is_null());
        assert_eq!(p as usize % align, 0);
        unsafe {
            assert!(allocator.usable_size(p) >= 500);
            write_bytes(p, 0x11, 500);
            allocator.free(p);
        }
    }
    assert!(allocator.allocate_aligned(3, 10).is_null());
}

#[test]
fn test_aligned_allocation_above_threshold() {
    let allocator = engine(8 << 20, 1 << 20);
    let p = allocator.allocate_aligned(1 << 16, MMAP_THRESHOLD);
    assert!(!p.is_null());
    assert_eq!(p as usize % (1 << 16), 0);
    unsafe {
        assert!(is_mapped(mem_to_chunk(p)));
        write_bytes(p, 0x22, MMAP_THRESHOLD);
        allocator.free(p);
    }
}

#[test]
fn test_allocation_under_a_subscriber() {
    // Instrumented paths must behave identically when a subscriber is
    // installed and events are actually recorded.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("binmalloc=debug".parse().unwrap()),
        )
        .with_test_writer()
        .finish();
    tracing::subscriber::with_default(subscriber, || {
        let allocator = engine(2 << 20, 1 << 20);
        let p = allocator.allocate(123);
        assert!(!p.is_null());
        unsafe {
            let q = allocator.resize(p, 9000);
            assert!(!q.is_null());
            allocator.free(q);
        }
    });
}

#[test]
fn test_global_alloc_interface() {
    let allocator = engine(2 << 20, 1 << 20);
    unsafe {
        let layout = Layout::from_size_align(300, 128).unwrap();
        let p = allocator.alloc(layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % 128, 0);
        write_bytes(p, 0xEE, 300);

        let q = allocator.realloc(p, layout, 900);
        assert!(!q.is_null());
        assert_eq!(q as usize % 128, 0);
        for i in 0..300 {
            assert_eq!(*q.add(i), 0xEE);
        }
        allocator.dealloc(q, Layout::from_size_align(900, 128).unwrap());

        let z = allocator.alloc_zeroed(Layout::from_size_align(4096, 64).unwrap());
        assert!(!z.is_null());
        for i in 0..4096 {
            assert_eq!(*z.add(i), 0);
        }
        allocator.dealloc(z, Layout::from_size_align(4096, 64).unwrap());
    }
}
