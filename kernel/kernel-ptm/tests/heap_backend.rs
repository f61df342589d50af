//! The whole memory stack end to end: physical page allocator underneath
//! the page table manager, with the kernel heap drawing spans through the
//! manager's heap backend.

use kernel_heap::InternalAllocator;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_pagealloc::{PageAllocator, PhysMemoryRange, RangeConfig, required_buffer_size};
use kernel_ptm::{PageTableManager, PtmHeapBackend};
use std::alloc::Layout;
use std::ptr::NonNull;

struct Aligned {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Aligned {
    fn new(len: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(len, align).unwrap();
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).unwrap();
        Self { ptr, layout }
    }
}

impl Drop for Aligned {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[test]
fn heap_runs_on_the_full_stack() {
    kernel_hal::init_processor_topology(1);
    kernel_hal::set_current_processor(0);

    // physical memory: [1 MiB, 64 MiB)
    let range = PhysMemoryRange {
        start: PhysicalAddress::new(0x10_0000),
        end: PhysicalAddress::new(0x400_0000),
    };
    let ppa_buf = Aligned::new(required_buffer_size(range, 1), 64);
    let ppa = unsafe {
        PageAllocator::new(
            &[RangeConfig {
                range,
                buffer: ppa_buf.ptr,
                buffer_len: ppa_buf.layout.size(),
            }],
            1,
        )
    };

    let window_buf = Aligned::new(64 * 1024 * 1024, 4096);
    let ptm = unsafe { PageTableManager::new(window_buf.ptr, 1, &ppa) };

    // The kernel heap region; on the host this is real memory so the heap
    // can write through the virtual addresses it is handed. Generously
    // sized: the backend bump-allocates virtual space and never reuses it.
    let heap_buf = Aligned::new(64 * 1024 * 1024, 4096);
    let heap_base = VirtualAddress::from_nonnull(heap_buf.ptr);

    let baseline = {
        let backend = PtmHeapBackend::new(&ptm, heap_base, heap_buf.layout.size() as u64).unwrap();
        let mut allocator = InternalAllocator::new(backend);

        let mut rng = 0xC0FF_EE00_1234_5678u64;
        let mut held: Vec<(*mut u8, usize, u8)> = Vec::new();
        for _ in 0..10_000 {
            rng = rng
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            let grow = held.len() < 100 || (held.len() < 500 && (rng >> 20) % 10 < 7);
            if grow {
                let size = [8usize, 24, 64, 200, 512, 1500, 4000][(rng >> 33) as usize % 7];
                let p = allocator.allocate(size, 8);
                assert!(!p.is_null(), "full-stack allocation failed");
                let tag = (rng >> 40) as u8;
                unsafe { p.write_bytes(tag, size) };
                held.push((p, size, tag));
            } else {
                let i = (rng >> 24) as usize % held.len();
                let (p, size, tag) = held.swap_remove(i);
                assert_eq!(unsafe { p.read() }, tag, "heap corruption");
                assert_eq!(unsafe { p.add(size - 1).read() }, tag, "heap corruption");
                allocator.free(p);
            }
        }
        allocator.validate_integrity();
        for (p, _, _) in held {
            allocator.free(p);
        }
        assert_eq!(allocator.stats().total_used_bytes, 0);
        assert_eq!(allocator.total_allocated_block_bytes(), 0);

        // anchored live pages: everything beyond reserve stock must be the
        // partial's own tables once all spans are gone
        ptm.live_window_pages() as isize - ptm.reserve_pool_occupancy() as isize
        // allocator (and with it the backend and its partial) drops here
    };

    ptm.process_overflow_pool();
    let after = ptm.live_window_pages() as isize - ptm.reserve_pool_occupancy() as isize;
    // the partial held at least its top-level table and supplement
    assert!(after < baseline, "backend teardown released no tables");

    ppa.validate_integrity();
}
