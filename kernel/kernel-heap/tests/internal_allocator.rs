//! End-to-end tests for the internal allocator.

use kernel_heap::{HeapBackend, InternalAllocator, NoBackend};
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Host-memory backend handing out page-aligned regions, tracking how many
/// pages are outstanding.
struct TestBackend {
    live_pages: Arc<AtomicUsize>,
}

impl TestBackend {
    fn new() -> (Self, Arc<AtomicUsize>) {
        let live = Arc::new(AtomicUsize::new(0));
        (
            Self {
                live_pages: Arc::clone(&live),
            },
            live,
        )
    }
}

unsafe impl HeapBackend for TestBackend {
    fn alloc_pages(&mut self, count: usize) -> *mut u8 {
        let layout = Layout::from_size_align(count * Self::SMALL_PAGE_SIZE, 4096).unwrap();
        self.live_pages.fetch_add(count, Ordering::Relaxed);
        unsafe { std::alloc::alloc(layout) }
    }

    unsafe fn free_pages(&mut self, ptr: *mut u8, count: usize) {
        let layout = Layout::from_size_align(count * Self::SMALL_PAGE_SIZE, 4096).unwrap();
        self.live_pages.fetch_sub(count, Ordering::Relaxed);
        unsafe { std::alloc::dealloc(ptr, layout) };
    }
}

fn make_allocator() -> (InternalAllocator<TestBackend>, Arc<AtomicUsize>) {
    let (backend, live) = TestBackend::new();
    (InternalAllocator::new(backend), live)
}

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 16
    }
}

#[test]
fn basic_malloc_free() {
    let (mut a, _live) = make_allocator();
    let p = a.allocate(100, 8);
    assert!(!p.is_null());
    assert!(a.is_valid_pointer(p));
    assert!(!a.is_valid_pointer(std::ptr::null()));
    let on_stack = 0u64;
    assert!(!a.is_valid_pointer((&raw const on_stack).cast()));
    // interior pointers are not valid
    assert!(!a.is_valid_pointer(unsafe { p.add(10) }));
    a.free(p);
    assert!(!a.is_valid_pointer(p));
    a.validate_integrity();
    assert_eq!(a.total_allocated_block_bytes(), 0);
}

#[test]
fn zero_size_allocations_share_the_sentinel() {
    let (mut a, live) = make_allocator();
    let p = a.allocate(0, 8);
    let q = a.allocate(0, 64);
    assert!(!p.is_null());
    assert_eq!(p, q, "all zero-size allocations alias one sentinel");
    a.free(p);
    a.free(q);
    a.free(std::ptr::null_mut());
    assert_eq!(live.load(Ordering::Relaxed), 0, "sentinel needed no backing");
}

#[test]
fn fragmentation_resistance() {
    let (mut a, _live) = make_allocator();
    let mut small: Vec<*mut u8> = (0..100).map(|_| a.allocate(64, 8)).collect();
    assert!(small.iter().all(|p| !p.is_null()));

    // free every other small block to fragment the slabs
    for p in small.iter_mut().step_by(2) {
        a.free(*p);
        *p = std::ptr::null_mut();
    }

    let large: Vec<*mut u8> = (0..20).map(|_| a.allocate(512, 8)).collect();
    for p in &large {
        assert!(!p.is_null());
        assert!(a.is_valid_pointer(*p));
    }

    for p in small.into_iter().filter(|p| !p.is_null()) {
        a.free(p);
    }
    for p in large {
        a.free(p);
    }
    a.validate_integrity();
    assert_eq!(a.total_allocated_block_bytes(), 0);
}

#[test]
fn alignment_grid() {
    let (mut a, _live) = make_allocator();
    for size in 1..=1024usize {
        for align in [8usize, 16, 32, 64, 128, 256] {
            let p = a.allocate(size, align);
            assert!(!p.is_null(), "allocate({size}, {align}) failed");
            assert_eq!(p as usize % align, 0, "allocate({size}, {align}) misaligned");
            assert!(a.is_valid_pointer(p));
            // the block must survive being fully written
            unsafe { p.write_bytes(0xA5, size) };
            a.free(p);
        }
    }
    a.validate_integrity();
    assert_eq!(a.total_allocated_block_bytes(), 0);
}

#[test]
fn odd_size_with_large_alignment_frees_exactly() {
    let (mut a, _live) = make_allocator();
    // size not a multiple of align, large enough to bypass the slabs: the
    // aligned block layout must still identify the canonical pointer
    let p = a.allocate(700, 512);
    assert!(!p.is_null());
    assert_eq!(p as usize % 512, 0);
    assert!(a.is_valid_pointer(p));
    unsafe { p.write_bytes(0x5A, 700) };
    // an interior pointer into the same block must be rejected
    assert!(!a.is_valid_pointer(unsafe { p.add(8) }));
    a.free(p);
    assert!(!a.is_valid_pointer(p));
    a.validate_integrity();
    assert_eq!(a.total_allocated_block_bytes(), 0);
}

#[test]
fn coalescing_restores_large_blocks() {
    let (mut a, _live) = make_allocator();
    let blocks: Vec<*mut u8> = (0..50).map(|_| a.allocate(1024, 8)).collect();
    assert!(blocks.iter().all(|p| !p.is_null()));

    for p in blocks.iter().skip(1).step_by(2) {
        a.free(*p);
        a.validate_integrity();
    }
    for p in blocks.iter().step_by(2) {
        a.free(*p);
        a.validate_integrity();
    }
    assert_eq!(a.total_allocated_block_bytes(), 0);

    let large = a.allocate(50 * 1024 / 2, 8);
    assert!(!large.is_null());
    a.free(large);
    a.validate_integrity();
}

#[test]
fn malloc_free_round_trip_restores_committed_bytes() {
    let (mut a, _live) = make_allocator();
    // prime a span so the round trip does not grow or shrink one
    let keep = a.allocate(2048, 8);
    let before = a.stats();
    let p = a.allocate(1024, 16);
    assert!(!p.is_null());
    a.free(p);
    assert_eq!(a.stats(), before);
    a.free(keep);
    a.validate_integrity();
}

#[test]
fn mixed_stress_drains_to_zero() {
    let (mut a, live) = make_allocator();
    const SIZES: [usize; 10] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096];
    const MAX_LIVE: usize = 2000;

    let mut rng = Lcg(0x1234_5678_9ABC_DEF0);
    let mut held: Vec<(*mut u8, usize, u8)> = Vec::new();

    for round in 0..200_000u32 {
        let grow = held.is_empty() || (held.len() < MAX_LIVE && rng.next() % 10 < 7);
        if grow {
            let size = SIZES[(rng.next() % 10) as usize];
            let p = a.allocate(size, 8);
            assert!(!p.is_null());
            let tag = (rng.next() & 0xFF) as u8;
            unsafe { p.write_bytes(tag, size) };
            held.push((p, size, tag));
        } else {
            let i = (rng.next() as usize) % held.len();
            let (p, size, tag) = held.swap_remove(i);
            // the memory must still carry our pattern
            for off in [0, size / 2, size - 1] {
                assert_eq!(unsafe { p.add(off).read() }, tag, "heap corruption");
            }
            a.free(p);
        }
        if round % 20_000 == 0 {
            a.validate_integrity();
        }
    }

    for (p, _, _) in held.drain(..) {
        a.free(p);
    }
    a.validate_integrity();
    assert_eq!(a.stats().total_used_bytes, 0);
    assert_eq!(a.total_allocated_block_bytes(), 0);
    assert_eq!(live.load(Ordering::Relaxed), 0, "backend pages leaked");
}

#[test]
fn seeded_allocator_works_without_a_backend() {
    let layout = Layout::from_size_align(64 * 1024, 4096).unwrap();
    let buffer = NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap();
    {
        let mut a =
            unsafe { InternalAllocator::with_initial_buffer(NoBackend, buffer, layout.size()) };
        let mut held = Vec::new();
        loop {
            let p = a.allocate(4096, 8);
            if p.is_null() {
                break;
            }
            held.push(p);
        }
        assert!(!held.is_empty(), "seed buffer produced no allocations");
        assert_eq!(a.stats().total_system_memory, 64 * 1024);

        for p in held.drain(..) {
            a.free(p);
        }
        // the seed span is unreleasable and must survive going empty
        assert_eq!(a.stats().total_system_memory, 64 * 1024);
        assert!(!a.allocate(4096, 8).is_null());
        a.validate_integrity();
    }
    unsafe { std::alloc::dealloc(buffer.as_ptr(), layout) };
}

#[test]
fn slabs_are_returned_when_fully_free() {
    let (mut a, live) = make_allocator();
    let cells: Vec<*mut u8> = (0..200).map(|_| a.allocate(8, 8)).collect();
    assert!(a.remaining_slab_count() >= 2);
    for p in cells {
        a.free(p);
    }
    assert_eq!(a.remaining_slab_count(), 0);
    assert_eq!(a.stats().total_used_bytes, 0);
    assert_eq!(live.load(Ordering::Relaxed), 0);
}

#[test]
fn requests_beyond_the_largest_class_bypass_the_slabs() {
    let (mut a, _live) = make_allocator();
    let p = a.allocate(513, 8);
    assert!(!p.is_null());
    a.free(p);
    // all slab caches must still be empty
    assert_eq!(a.remaining_slab_count(), 0);
    a.validate_integrity();
}

#[test]
#[should_panic(expected = "invalid pointer")]
fn freeing_an_interior_pointer_is_fatal() {
    let (mut a, _live) = make_allocator();
    let p = a.allocate(64, 8);
    a.free(unsafe { p.add(8) });
}

#[test]
#[should_panic(expected = "invalid pointer")]
fn double_free_of_a_coarse_block_is_fatal() {
    let (mut a, _live) = make_allocator();
    let p = a.allocate(1024, 8);
    let q = a.allocate(1024, 8);
    let _ = q;
    a.free(p);
    a.free(p);
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_of_a_slab_cell_is_fatal() {
    let (mut a, _live) = make_allocator();
    let p = a.allocate(32, 8);
    let q = a.allocate(32, 8);
    let _ = q;
    a.free(p);
    a.free(p);
}
