//! End-to-end tests for the page table manager, driven against a window
//! buffer and a mock frame source.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_ptm::{
    FrameSource, PageMappingCacheType, PageMappingPermissions, PageSize, PageTableManager,
    TOP_LEVEL_STRIDE,
};
use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicIsize, AtomicU64, AtomicUsize, Ordering};

const PROCESSORS: usize = 4;
const WINDOW_BUFFER_BYTES: usize = 64 * 1024 * 1024;

/// Frames are just numbers on the host; this source hands them out from a
/// bump cursor with a free list, and counts what is outstanding.
struct MockFrames {
    next: AtomicU64,
    freed: Mutex<Vec<u64>>,
    allocation_calls: AtomicUsize,
    outstanding: AtomicIsize,
}

impl MockFrames {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(0x100_0000),
            freed: Mutex::new(Vec::new()),
            allocation_calls: AtomicUsize::new(0),
            outstanding: AtomicIsize::new(0),
        }
    }

    fn outstanding(&self) -> isize {
        self.outstanding.load(Ordering::Relaxed)
    }

    fn allocation_calls(&self) -> usize {
        self.allocation_calls.load(Ordering::Relaxed)
    }
}

impl FrameSource for MockFrames {
    fn allocate_small_page(&self) -> Option<PhysicalAddress> {
        self.allocation_calls.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        if let Some(f) = self.freed.lock().unwrap().pop() {
            return Some(PhysicalAddress::new(f));
        }
        Some(PhysicalAddress::new(
            self.next.fetch_add(4096, Ordering::Relaxed),
        ))
    }

    fn free_small_page(&self, frame: PhysicalAddress) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.freed.lock().unwrap().push(frame.as_u64());
    }
}

struct WindowBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl WindowBuffer {
    fn new() -> Self {
        let layout = Layout::from_size_align(WINDOW_BUFFER_BYTES, 4096).unwrap();
        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).unwrap();
        Self { ptr, layout }
    }
}

impl Drop for WindowBuffer {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Build a manager over a window buffer. Tests that never leave processor
/// 0 use a single-processor manager so retirement completes locally; the
/// cross-processor test asks for all four.
fn make_ptm(processor_count: usize) -> (PageTableManager<MockFrames>, WindowBuffer) {
    kernel_hal::init_processor_topology(PROCESSORS);
    kernel_hal::set_current_processor(0);
    let buffer = WindowBuffer::new();
    let ptm = unsafe { PageTableManager::new(buffer.ptr, processor_count, MockFrames::new()) };
    (ptm, buffer)
}

fn heap_partial_base() -> VirtualAddress {
    VirtualAddress::new(4 * TOP_LEVEL_STRIDE)
}

/// Live window pages excluding reserve-pool stock. Mapping cycles may
/// convert stock into tables and retire them, so the raw live count drifts
/// with pool occupancy; this difference is the conserved quantity.
fn anchored_live(ptm: &PageTableManager<MockFrames>) -> isize {
    ptm.live_window_pages() as isize - ptm.reserve_pool_occupancy() as isize
}

#[test]
fn bootstrap_settles_into_the_documented_state() {
    let (ptm, _buf) = make_ptm(1);
    let state = ptm.partially_occupied_ring_state();
    assert_eq!(state.read_head, 0);
    assert_eq!(state.written_limit, 1);
    // three tables, three metadata pages, the directory
    assert_eq!(ptm.live_window_pages(), 7);
    assert_eq!(ptm.frame_source().outstanding(), 7);
}

#[test]
fn internal_entry_churn_reuses_tables_without_the_frame_source() {
    let (ptm, _buf) = make_ptm(1);

    let mut held: Vec<u32> = (0..3000)
        .map(|_| ptm.allocate_internal_page_table_entry())
        .collect();
    let unique: std::collections::HashSet<u32> = held.iter().copied().collect();
    assert_eq!(unique.len(), held.len(), "internal entry handed out twice");

    let live_before = ptm.live_window_pages();
    for e in held.drain(..) {
        ptm.free_internal_page_table_entry(e);
    }

    // every further allocation must be served from the recycled free lists
    let calls_before = ptm.frame_source().allocation_calls();
    for _ in 0..3000 {
        held.push(ptm.allocate_internal_page_table_entry());
    }
    assert_eq!(
        ptm.frame_source().allocation_calls(),
        calls_before,
        "reallocation invoked the physical page allocator"
    );
    assert_eq!(ptm.live_window_pages(), live_before);

    for e in held {
        ptm.free_internal_page_table_entry(e);
    }
}

#[test]
fn paired_entry_churn_leaves_no_residue() {
    let (ptm, _buf) = make_ptm(1);
    let first = ptm.allocate_internal_page_table_entry();
    ptm.free_internal_page_table_entry(first);
    let live = ptm.live_window_pages();
    for _ in 0..3000 {
        let e = ptm.allocate_internal_page_table_entry();
        ptm.free_internal_page_table_entry(e);
    }
    assert_eq!(ptm.live_window_pages(), live);
}

#[test]
fn small_mapping_round_trip() {
    let (ptm, _buf) = make_ptm(1);
    let partial = ptm
        .make_partial_page_structure(heap_partial_base(), TOP_LEVEL_STRIDE)
        .unwrap();

    let va = heap_partial_base() + 0x1234_5000;
    let pa = PhysicalAddress::new(0x5555_8000);
    let perms = PageMappingPermissions::READ | PageMappingPermissions::WRITE;
    assert!(!ptm.is_page_present(&partial, va));
    ptm.map_address(&partial, pa, va, PageSize::Small, perms, None)
        .unwrap();

    assert!(ptm.is_page_present(&partial, va));
    assert_eq!(ptm.get_page_size(&partial, va), Some(PageSize::Small));
    assert_eq!(ptm.get_page_permissions(&partial, va), Some(perms));
    assert_eq!(
        ptm.get_page_caching_policy(&partial, va),
        Some(PageMappingCacheType::FullyCached)
    );
    assert_eq!(
        ptm.resolve_virtual_address(&partial, va + 0x123),
        Some(pa + 0x123)
    );

    ptm.unmap_address(&partial, va);
    assert!(!ptm.is_page_present(&partial, va));

    ptm.destroy_partial_page_structure(partial);
    ptm.process_overflow_pool();
}

#[test]
fn map_unmap_leaks_no_inner_tables() {
    let (ptm, _buf) = make_ptm(1);
    let partial = ptm
        .make_partial_page_structure(heap_partial_base(), TOP_LEVEL_STRIDE)
        .unwrap();
    let va = heap_partial_base() + 0x4000_0000;
    let pa = PhysicalAddress::new(0x9999_1000);
    let perms = PageMappingPermissions::READ;

    // settle the reserve pool and the lazily-built inner tables
    ptm.map_address(&partial, pa, va, PageSize::Small, perms, None)
        .unwrap();
    ptm.unmap_address(&partial, va);
    ptm.process_overflow_pool();
    let live = anchored_live(&ptm);

    for _ in 0..16 {
        ptm.map_address(&partial, pa, va, PageSize::Small, perms, None)
            .unwrap();
        ptm.unmap_address(&partial, va);
    }
    ptm.process_overflow_pool();

    assert_eq!(anchored_live(&ptm), live, "inner tables leaked");
    // every outstanding frame backs exactly one live window page
    assert_eq!(
        ptm.frame_source().outstanding(),
        ptm.live_window_pages() as isize,
        "frames leaked"
    );
    ptm.destroy_partial_page_structure(partial);
}

#[test]
fn big_mapping_round_trip() {
    let (ptm, _buf) = make_ptm(1);
    let partial = ptm
        .make_partial_page_structure(heap_partial_base(), TOP_LEVEL_STRIDE)
        .unwrap();
    let va = heap_partial_base() + 8 * 0x20_0000;
    let pa = PhysicalAddress::new(0x4000_0000);
    let perms = PageMappingPermissions::READ | PageMappingPermissions::EXECUTE;
    ptm.map_address(
        &partial,
        pa,
        va,
        PageSize::Big,
        perms,
        Some(PageMappingCacheType::WriteCombining),
    )
    .unwrap();

    assert_eq!(ptm.get_page_size(&partial, va), Some(PageSize::Big));
    assert_eq!(
        ptm.get_page_caching_policy(&partial, va),
        Some(PageMappingCacheType::WriteCombining)
    );
    // an address in the middle of the big page resolves through it
    assert_eq!(
        ptm.resolve_virtual_address(&partial, va + 0x12_3456),
        Some(pa + 0x12_3456)
    );
    assert_eq!(ptm.get_page_permissions(&partial, va), Some(perms));

    ptm.unmap_address(&partial, va);
    assert!(!ptm.is_page_present(&partial, va));
    ptm.destroy_partial_page_structure(partial);
}

#[test]
fn batched_mapping_covers_the_range() {
    let (ptm, _buf) = make_ptm(1);
    let partial = ptm
        .make_partial_page_structure(heap_partial_base(), TOP_LEVEL_STRIDE)
        .unwrap();
    let base = heap_partial_base() + 0x10_0000;
    let frames: Vec<PhysicalAddress> =
        (0..64).map(|i| PhysicalAddress::new(0x800_0000 + i * 4096)).collect();
    ptm.map_addresses(
        &partial,
        &frames,
        base,
        PageSize::Small,
        PageMappingPermissions::READ | PageMappingPermissions::WRITE,
        None,
    )
    .unwrap();
    for (i, f) in frames.iter().enumerate() {
        let va = base + i as u64 * 4096;
        assert_eq!(ptm.resolve_virtual_address(&partial, va), Some(*f));
    }
    ptm.unmap_addresses(&partial, base, frames.len(), PageSize::Small);
    for i in 0..frames.len() {
        assert!(!ptm.is_page_present(&partial, base + i as u64 * 4096));
    }
    ptm.destroy_partial_page_structure(partial);
}

#[test]
fn mutators_rewrite_live_leaves() {
    let (ptm, _buf) = make_ptm(1);
    let partial = ptm
        .make_partial_page_structure(heap_partial_base(), TOP_LEVEL_STRIDE)
        .unwrap();
    let va = heap_partial_base() + 0x7000;
    let pa = PhysicalAddress::new(0x1_0000);
    ptm.map_address(
        &partial,
        pa,
        va,
        PageSize::Small,
        PageMappingPermissions::READ | PageMappingPermissions::WRITE,
        None,
    )
    .unwrap();

    ptm.set_page_permissions(&partial, va, PageMappingPermissions::READ);
    assert_eq!(
        ptm.get_page_permissions(&partial, va),
        Some(PageMappingPermissions::READ)
    );

    ptm.set_access_flag(&partial, va);
    assert_eq!(ptm.was_page_accessed(&partial, va), Some(true));
    ptm.reset_access_flag(&partial, va);
    assert_eq!(ptm.was_page_accessed(&partial, va), Some(false));

    ptm.set_page_caching_policy(&partial, va, PageMappingCacheType::Uncached);
    assert_eq!(
        ptm.get_page_caching_policy(&partial, va),
        Some(PageMappingCacheType::Uncached)
    );
    // the frame survives every rewrite
    assert_eq!(ptm.resolve_virtual_address(&partial, va), Some(pa));

    ptm.unmap_address(&partial, va);
    ptm.destroy_partial_page_structure(partial);
}

#[test]
fn composites_link_partials_and_install() {
    let (ptm, _buf) = make_ptm(1);
    let partial = ptm
        .make_partial_page_structure(heap_partial_base(), TOP_LEVEL_STRIDE)
        .unwrap();
    let va = heap_partial_base() + 0x9000;
    let pa = PhysicalAddress::new(0x77_0000);
    ptm.map_address(
        &partial,
        pa,
        va,
        PageSize::Small,
        PageMappingPermissions::READ,
        None,
    )
    .unwrap();

    let composite = ptm.make_composite_page_structure(5).unwrap();
    assert!(!ptm.is_page_present(&composite, va));
    ptm.add_structure_to_composite(&composite, &partial);
    assert!(ptm.is_page_present(&composite, va));
    assert_eq!(ptm.resolve_virtual_address(&composite, va), Some(pa));

    ptm.install_page_structure(&composite);
    let installed = ptm.get_current_page_structure().unwrap();
    assert_eq!(installed.pcid, 5);
    assert!(installed.root.as_u64() != 0);

    ptm.remove_structure_from_composite(&composite, &partial);
    assert!(!ptm.is_page_present(&composite, va));

    ptm.unmap_address(&partial, va);
    ptm.destroy_composite_page_structure(composite);
    ptm.destroy_partial_page_structure(partial);
}

#[test]
fn flush_planner_stack_batches_invalidations() {
    use kernel_ptm::BatchFlushPlanner;

    let (ptm, _buf) = make_ptm(1);
    let partial = ptm
        .make_partial_page_structure(heap_partial_base(), TOP_LEVEL_STRIDE)
        .unwrap();
    let va = heap_partial_base() + 0xA000;
    ptm.map_address(
        &partial,
        PhysicalAddress::new(0x33_0000),
        va,
        PageSize::Small,
        PageMappingPermissions::READ | PageMappingPermissions::WRITE,
        None,
    )
    .unwrap();

    let mut planner = BatchFlushPlanner::<16>::new();
    unsafe {
        ptm.push_flush_planner(NonNull::new(&raw mut planner as *mut dyn kernel_ptm::FlushPlanner).unwrap());
    }
    ptm.set_page_permissions(&partial, va, PageMappingPermissions::READ);
    ptm.set_access_flag(&partial, va);
    let popped = unsafe { ptm.pop_flush_planner() }.expect("planner was pushed");
    assert_eq!(popped.as_ptr() as *mut (), &raw mut planner as *mut ());
    assert_eq!(planner.pending_count(), 2, "mutations must reach the planner");
    planner.flush();

    ptm.unmap_address(&partial, va);
    ptm.destroy_partial_page_structure(partial);
}

#[test]
fn cross_processor_drain_returns_frames() {
    let (ptm, _buf) = make_ptm(PROCESSORS);
    let partial = ptm
        .make_partial_page_structure(heap_partial_base(), TOP_LEVEL_STRIDE)
        .unwrap();

    // settle reserve pool and table shapes, then measure
    let probe = heap_partial_base() + 0x100_0000;
    ptm.map_address(
        &partial,
        PhysicalAddress::new(0x2000),
        probe,
        PageSize::Small,
        PageMappingPermissions::READ,
        None,
    )
    .unwrap();
    ptm.unmap_address(&partial, probe);
    drain_on_all_processors(&ptm);
    let live = anchored_live(&ptm);

    // five mappings in five distinct 2 MiB regions force five leaf tables
    let vas: Vec<VirtualAddress> = (0..5)
        .map(|i| heap_partial_base() + 0x4000_0000 + i * 0x20_0000)
        .collect();
    for va in &vas {
        ptm.map_address(
            &partial,
            PhysicalAddress::new(0x8000),
            *va,
            PageSize::Small,
            PageMappingPermissions::READ,
            None,
        )
        .unwrap();
    }
    for va in &vas {
        ptm.unmap_address(&partial, *va);
    }

    // the frames cannot come back until every processor has drained
    drain_on_all_processors(&ptm);
    assert_eq!(anchored_live(&ptm), live);
    assert_eq!(
        ptm.frame_source().outstanding(),
        ptm.live_window_pages() as isize
    );

    ptm.destroy_partial_page_structure(partial);
}

fn drain_on_all_processors(ptm: &PageTableManager<MockFrames>) {
    std::thread::scope(|s| {
        for pid in 1..PROCESSORS as u16 {
            s.spawn(move || {
                kernel_hal::set_current_processor(pid);
                ptm.process_overflow_pool();
            });
        }
    });
    ptm.process_overflow_pool();
    // a second local pass retires anything acknowledged last by a remote
    ptm.process_overflow_pool();
}

#[test]
#[should_panic(expected = "already-present page")]
fn duplicate_mapping_is_fatal() {
    let (ptm, _buf) = make_ptm(1);
    let partial = ptm
        .make_partial_page_structure(heap_partial_base(), TOP_LEVEL_STRIDE)
        .unwrap();
    let va = heap_partial_base() + 0x3000;
    for _ in 0..2 {
        ptm.map_address(
            &partial,
            PhysicalAddress::new(0x1000),
            va,
            PageSize::Small,
            PageMappingPermissions::READ,
            None,
        )
        .unwrap();
    }
}

#[test]
#[should_panic(expected = "non-present page")]
fn unmapping_an_absent_page_is_fatal() {
    let (ptm, _buf) = make_ptm(1);
    let partial = ptm
        .make_partial_page_structure(heap_partial_base(), TOP_LEVEL_STRIDE)
        .unwrap();
    ptm.unmap_address(&partial, heap_partial_base() + 0x5000);
}
