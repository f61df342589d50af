//! Per-range allocator state and the zone/pool algorithms.
//!
//! One [`ContiguousRangeAllocator`] owns every big page in one usable
//! physical range. Methods here do **not** acquire locks; the public surface
//! in `lib.rs` batches calls under the right locks so hot paths do not bounce
//! the lock word between operations.

use crate::indices::{
    BigPageFreeMapping, BigPageIndex, BigPoolIndex, BufferId, GLOBAL_POOL, LocalPoolInfo,
    SmallPageIndex, SmallPoolIndex,
};
use crate::{PhysMemoryRange, RangeConfig};
use core::cell::UnsafeCell;
use kernel_hal::{CACHE_LINE_SIZE, ProcessorId};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, SMALL_PAGES_PER_BIG, Size2M, Size4K, align_down, align_up,
};

extern crate alloc;
use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_sync::CachePadded;

const SMALL_PER_BIG: u16 = SMALL_PAGES_PER_BIG as u16;
/// `free_index` value of a big page whose small pool is exhausted.
const SMALL_POOL_FULL: u16 = SMALL_PER_BIG;

const fn round_to_cache_line(bytes: usize) -> usize {
    align_up(bytes as u64, CACHE_LINE_SIZE as u64) as usize
}

/// Size of the caller-provided scratch buffer needed to manage `range` with
/// `processor_count` local pools. Pure function of its inputs.
#[must_use]
pub fn required_buffer_size(range: PhysMemoryRange, processor_count: usize) -> usize {
    let big_pages = big_page_count(range);
    let small_pages = big_pages * SMALL_PAGES_PER_BIG;

    let pool_stride = round_to_cache_line(big_pages * size_of::<BigPageIndex>());
    // one global pool plus one local pool per processor
    let mut out = pool_stride * (processor_count + 1);
    out += round_to_cache_line(big_pages * size_of::<BigPageFreeMapping>());
    out += round_to_cache_line(small_pages * size_of::<SmallPageIndex>());
    out += round_to_cache_line(small_pages * size_of::<SmallPoolIndex>());
    out += round_to_cache_line(big_pages * size_of::<u16>());
    out
}

fn big_page_count(range: PhysMemoryRange) -> usize {
    let top = align_up(range.end.as_u64(), Size2M::SIZE);
    let bottom = align_down(range.start.as_u64(), Size2M::SIZE);
    ((top - bottom) / Size2M::SIZE) as usize
}

pub(crate) struct ContiguousRangeAllocator {
    /// Pool buffers; the global pool is at offset 0, the local pool of
    /// processor `k` at `(k + 1) * pool_stride`.
    big_page_pools: *mut BigPageIndex,
    pool_stride: usize,
    free_map: *mut BigPageFreeMapping,
    small_page_pool: *mut SmallPageIndex,
    small_page_free_map: *mut SmallPoolIndex,
    small_page_free_index: *mut u16,

    local_pool_info: Box<[CachePadded<UnsafeCell<LocalPoolInfo>>]>,
    /// Guarded by the allocator-global lock (single-threaded during boot
    /// reservation).
    global_pool_size: UnsafeCell<usize>,

    pub(crate) range: PhysMemoryRange,
    big_page_count: usize,
}

// Safety: all mutable state is reached through raw pointers or UnsafeCell and
// the public surface serializes access per processor pool (local locks) and
// for the global pool (global lock).
unsafe impl Send for ContiguousRangeAllocator {}
unsafe impl Sync for ContiguousRangeAllocator {}

impl ContiguousRangeAllocator {
    /// Carve `config.buffer` into the pool arrays and hand every big page to
    /// the global pool.
    ///
    /// # Safety
    /// The buffer must be exclusively owned by this allocator for its entire
    /// lifetime, at least [`required_buffer_size`] bytes long and cache-line
    /// aligned.
    pub(crate) unsafe fn new(config: &RangeConfig, processor_count: usize) -> Self {
        let range = config.range;
        let big_pages = big_page_count(range);
        let small_pages = big_pages * SMALL_PAGES_PER_BIG;
        let pool_stride = round_to_cache_line(big_pages * size_of::<BigPageIndex>());

        assert!(
            config.buffer_len >= required_buffer_size(range, processor_count),
            "page allocator scratch buffer too small for {range:?}"
        );
        let base = config.buffer.as_ptr();
        assert!(
            (base as usize) % CACHE_LINE_SIZE == 0,
            "page allocator scratch buffer must be cache-line aligned"
        );

        let mut cursor = base;
        let big_page_pools = cursor.cast::<BigPageIndex>();
        cursor = unsafe { cursor.add(pool_stride * (processor_count + 1)) };
        let free_map = cursor.cast::<BigPageFreeMapping>();
        cursor = unsafe {
            cursor.add(round_to_cache_line(
                big_pages * size_of::<BigPageFreeMapping>(),
            ))
        };
        let small_page_pool = cursor.cast::<SmallPageIndex>();
        cursor = unsafe {
            cursor.add(round_to_cache_line(small_pages * size_of::<SmallPageIndex>()))
        };
        let small_page_free_map = cursor.cast::<SmallPoolIndex>();
        cursor = unsafe {
            cursor.add(round_to_cache_line(small_pages * size_of::<SmallPoolIndex>()))
        };
        let small_page_free_index = cursor.cast::<u16>();

        let local_pool_info = (0..processor_count)
            .map(|_| CachePadded::new(UnsafeCell::new(LocalPoolInfo::default())))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let allocator = Self {
            big_page_pools,
            pool_stride,
            free_map,
            small_page_pool,
            small_page_free_map,
            small_page_free_index,
            local_pool_info,
            global_pool_size: UnsafeCell::new(big_pages),
            range,
            big_page_count: big_pages,
        };

        unsafe {
            for i in 0..big_pages {
                let bi = BigPageIndex(i as u32);
                // every big page starts out in the global pool
                *allocator.pool_for(GLOBAL_POOL).add(i) = bi;
                allocator
                    .map_entry(bi)
                    .write(BigPageFreeMapping::new(BigPoolIndex(i as u32), GLOBAL_POOL));
                *allocator.small_free_index(bi) = 0;
                // identity permutation for the small sub-pool
                for j in 0..SMALL_PAGES_PER_BIG {
                    let flat = i * SMALL_PAGES_PER_BIG + j;
                    *allocator.small_page_pool.add(flat) = SmallPageIndex(j as u16);
                    *allocator.small_page_free_map.add(flat) = SmallPoolIndex(j as u16);
                }
            }
            // claim the fragments of the first and last big page that fall
            // outside the usable range
            allocator.reserve_overlap(0);
        }
        allocator
    }

    // ---- raw accessors -------------------------------------------------

    fn pool_for(&self, id: BufferId) -> *mut BigPageIndex {
        unsafe {
            self.big_page_pools
                .byte_add(id.0 as usize * self.pool_stride)
        }
    }

    fn map_entry(&self, bi: BigPageIndex) -> *mut BigPageFreeMapping {
        debug_assert!((bi.0 as usize) < self.big_page_count);
        unsafe { self.free_map.add(bi.0 as usize) }
    }

    fn small_free_index(&self, bi: BigPageIndex) -> *mut u16 {
        unsafe { self.small_page_free_index.add(bi.0 as usize) }
    }

    fn small_pool_at(&self, bi: BigPageIndex, slot: SmallPoolIndex) -> *mut SmallPageIndex {
        debug_assert!(slot.0 < SMALL_PER_BIG);
        unsafe {
            self.small_page_pool
                .add(bi.0 as usize * SMALL_PAGES_PER_BIG + slot.0 as usize)
        }
    }

    fn small_map_entry(&self, bi: BigPageIndex, si: SmallPageIndex) -> *mut SmallPoolIndex {
        debug_assert!(si.0 < SMALL_PER_BIG);
        unsafe {
            self.small_page_free_map
                .add(bi.0 as usize * SMALL_PAGES_PER_BIG + si.0 as usize)
        }
    }

    /// # Safety
    /// Caller holds the lock of processor `pid`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn info(&self, pid: ProcessorId) -> &mut LocalPoolInfo {
        unsafe { &mut *self.local_pool_info[pid as usize].get() }
    }

    /// # Safety
    /// Caller holds the global lock (or runs single-threaded boot code).
    #[allow(clippy::mut_from_ref)]
    unsafe fn global_size(&self) -> &mut usize {
        unsafe { &mut *self.global_pool_size.get() }
    }

    pub(crate) fn global_pool_len(&self) -> usize {
        // Racy snapshot used only as a "worth taking the lock" hint.
        unsafe { *self.global_pool_size.get() }
    }

    // ---- address arithmetic -------------------------------------------

    fn range_bottom(&self) -> u64 {
        align_down(self.range.start.as_u64(), Size2M::SIZE)
    }

    pub(crate) fn address_in_range(&self, addr: PhysicalAddress) -> bool {
        addr >= self.range.start && addr < self.range.end
    }

    fn big_index_from_addr(&self, addr: PhysicalAddress) -> BigPageIndex {
        let abs = addr.as_u64() / Size2M::SIZE;
        let base = self.range_bottom() / Size2M::SIZE;
        BigPageIndex((abs - base) as u32)
    }

    fn small_index_from_addr(addr: PhysicalAddress) -> SmallPageIndex {
        SmallPageIndex(((addr.as_u64() / Size4K::SIZE) % SMALL_PAGES_PER_BIG as u64) as u16)
    }

    fn big_page_addr(&self, bi: BigPageIndex) -> PhysicalAddress {
        PhysicalAddress::new(self.range_bottom() + u64::from(bi.0) * Size2M::SIZE)
    }

    fn small_page_addr(&self, bi: BigPageIndex, si: SmallPageIndex) -> PhysicalAddress {
        self.big_page_addr(bi) + u64::from(si.0) * Size4K::SIZE
    }

    pub(crate) fn owner_of(&self, addr: PhysicalAddress) -> BufferId {
        unsafe { (*self.map_entry(self.big_index_from_addr(addr))).buffer() }
    }

    // ---- zone moves ----------------------------------------------------
    //
    // A big page moves between zones by swapping with the page at the zone
    // boundary and adjusting the boundary; the reverse map is updated in
    // lock-step. Moves between the fully-allocated and fully-free zones
    // cross the partially-allocated zone and take two swaps.

    unsafe fn place(&self, pool: *mut BigPageIndex, buf: BufferId, slot: u32, page: BigPageIndex) {
        unsafe {
            *pool.add(slot as usize) = page;
            let e = self.map_entry(page);
            (*e).index = BigPoolIndex(slot);
            (*e).set_buffer(buf);
        }
    }

    unsafe fn swap_slots(&self, pool: *mut BigPageIndex, buf: BufferId, a: u32, b: u32) {
        if a == b {
            return;
        }
        unsafe {
            let pa = *pool.add(a as usize);
            let pb = *pool.add(b as usize);
            self.place(pool, buf, a, pb);
            self.place(pool, buf, b, pa);
        }
    }

    unsafe fn slot_of(&self, bi: BigPageIndex) -> u32 {
        unsafe { (*self.map_entry(bi)).index.0 }
    }

    unsafe fn move_free_to_partial(&self, bi: BigPageIndex, pid: ProcessorId) {
        unsafe {
            let info = self.info(pid);
            let pool = self.pool_for(BufferId::from_processor(pid));
            let s = self.slot_of(bi);
            debug_assert!(s >= info.bottom_of_free_pool, "page must be fully free");
            self.swap_slots(pool, BufferId::from_processor(pid), s, info.bottom_of_free_pool);
            info.bottom_of_free_pool += 1;
            info.free_small_pages_in_partial_allocs += SMALL_PAGES_PER_BIG;
        }
    }

    unsafe fn move_partial_to_free(&self, bi: BigPageIndex, pid: ProcessorId) {
        unsafe {
            let info = self.info(pid);
            let pool = self.pool_for(BufferId::from_processor(pid));
            let s = self.slot_of(bi);
            debug_assert!(
                s >= info.bottom_of_used_pool && s < info.bottom_of_free_pool,
                "page must be partially allocated"
            );
            self.swap_slots(
                pool,
                BufferId::from_processor(pid),
                s,
                info.bottom_of_free_pool - 1,
            );
            info.bottom_of_free_pool -= 1;
            info.free_small_pages_in_partial_allocs -= SMALL_PAGES_PER_BIG;
        }
    }

    unsafe fn move_partial_to_full(&self, bi: BigPageIndex, pid: ProcessorId) {
        unsafe {
            let info = self.info(pid);
            let pool = self.pool_for(BufferId::from_processor(pid));
            let s = self.slot_of(bi);
            debug_assert!(
                s >= info.bottom_of_used_pool && s < info.bottom_of_free_pool,
                "page must be partially allocated"
            );
            self.swap_slots(pool, BufferId::from_processor(pid), s, info.bottom_of_used_pool);
            info.bottom_of_used_pool += 1;
        }
    }

    unsafe fn move_full_to_partial(&self, bi: BigPageIndex, pid: ProcessorId) {
        unsafe {
            let info = self.info(pid);
            let pool = self.pool_for(BufferId::from_processor(pid));
            let s = self.slot_of(bi);
            debug_assert!(s < info.bottom_of_used_pool, "page must be fully allocated");
            self.swap_slots(pool, BufferId::from_processor(pid), s, info.bottom_of_used_pool - 1);
            info.bottom_of_used_pool -= 1;
        }
    }

    unsafe fn move_free_to_full(&self, bi: BigPageIndex, pid: ProcessorId) {
        unsafe {
            let info = self.info(pid);
            let buf = BufferId::from_processor(pid);
            let pool = self.pool_for(buf);
            let s = self.slot_of(bi);
            debug_assert!(s >= info.bottom_of_free_pool, "page must be fully free");
            self.swap_slots(pool, buf, s, info.bottom_of_free_pool);
            self.swap_slots(pool, buf, info.bottom_of_free_pool, info.bottom_of_used_pool);
            info.bottom_of_used_pool += 1;
            info.bottom_of_free_pool += 1;
        }
    }

    unsafe fn move_full_to_free(&self, bi: BigPageIndex, pid: ProcessorId) {
        unsafe {
            let info = self.info(pid);
            let buf = BufferId::from_processor(pid);
            let pool = self.pool_for(buf);
            let s = self.slot_of(bi);
            debug_assert!(s < info.bottom_of_used_pool, "page must be fully allocated");
            self.swap_slots(pool, buf, s, info.bottom_of_used_pool - 1);
            self.swap_slots(
                pool,
                buf,
                info.bottom_of_used_pool - 1,
                info.bottom_of_free_pool - 1,
            );
            info.bottom_of_used_pool -= 1;
            info.bottom_of_free_pool -= 1;
        }
    }

    // ---- global pool ---------------------------------------------------

    /// # Safety
    /// Caller holds the global lock and the lock of `pid`.
    unsafe fn claim_big_page_from_global(&self, pid: ProcessorId) {
        unsafe {
            let gsize = self.global_size();
            debug_assert!(*gsize > 0, "tried to take big page from empty global pool");
            let top = *self.pool_for(GLOBAL_POOL).add(*gsize - 1);
            *gsize -= 1;

            let info = self.info(pid);
            let buf = BufferId::from_processor(pid);
            self.place(self.pool_for(buf), buf, info.local_pool_size as u32, top);
            info.local_pool_size += 1;
        }
    }

    /// # Safety
    /// Caller holds the global lock and the lock of `pid`.
    pub(crate) unsafe fn claim_big_pages_from_global(&self, count: usize, pid: ProcessorId) {
        unsafe {
            let gsize = self.global_size();
            debug_assert!(*gsize >= count, "global pool underflow");
            let info = self.info(pid);
            let buf = BufferId::from_processor(pid);
            let lpool = self.pool_for(buf);
            let gpool = self.pool_for(GLOBAL_POOL);
            for i in 0..count {
                let page = *gpool.add(*gsize - count + i);
                self.place(lpool, buf, (info.local_pool_size + i) as u32, page);
            }
            *gsize -= count;
            info.local_pool_size += count;
        }
    }

    /// # Safety
    /// Caller holds the global lock and the lock of `pid`.
    unsafe fn claim_specific_big_page_from_global(&self, bi: BigPageIndex, pid: ProcessorId) {
        unsafe {
            debug_assert!(
                (*self.map_entry(bi)).buffer() == GLOBAL_POOL,
                "page is not in the global pool"
            );
            let gsize = *self.global_size();
            let s = self.slot_of(bi);
            self.swap_slots(self.pool_for(GLOBAL_POOL), GLOBAL_POOL, s, gsize as u32 - 1);
            self.claim_big_page_from_global(pid);
        }
    }

    /// How many big pages the caller may steal; claims up to `requested`.
    ///
    /// # Safety
    /// Caller holds the global lock and the lock of `pid`.
    pub(crate) unsafe fn steal_big_pages_from_global(
        &self,
        requested: usize,
        pid: ProcessorId,
    ) -> usize {
        unsafe {
            let allocatable = requested.min(*self.global_size());
            self.claim_big_pages_from_global(allocatable, pid);
            allocatable
        }
    }

    // ---- reservation ---------------------------------------------------

    fn small_page_allocated(&self, bi: BigPageIndex, si: SmallPageIndex) -> bool {
        unsafe { (*self.small_map_entry(bi, si)).0 < *self.small_free_index(bi) }
    }

    fn big_page_allocated(&self, bi: BigPageIndex) -> bool {
        unsafe {
            let e = &*self.map_entry(bi);
            let buf = e.buffer();
            if buf == GLOBAL_POOL {
                return false;
            }
            let info = &*self.local_pool_info[buf.0 as usize - 1].get();
            e.index.0 < info.bottom_of_used_pool
        }
    }

    /// Reserve one small page before normal operation starts.
    ///
    /// Reservation of an already-reserved page is tolerated and only sanity
    /// checked.
    ///
    /// # Safety
    /// Caller holds the global lock and the lock of `pid`.
    unsafe fn reserve_small_page(&self, bi: BigPageIndex, si: SmallPageIndex, pid: ProcessorId) {
        unsafe {
            if self.small_page_allocated(bi, si) {
                assert!(
                    (*self.map_entry(bi)).buffer() == BufferId::from_processor(pid),
                    "re-reservation sanity check failed"
                );
                return;
            }
            if (*self.map_entry(bi)).buffer() == GLOBAL_POOL {
                self.claim_specific_big_page_from_global(bi, pid);
            }
            debug_assert!(
                (*self.map_entry(bi)).buffer() == BufferId::from_processor(pid),
                "tried to reserve small page from wrong pool"
            );

            if self.slot_of(bi) >= self.info(pid).bottom_of_free_pool {
                self.move_free_to_partial(bi, pid);
            }
            debug_assert!(
                self.slot_of(bi) >= self.info(pid).bottom_of_used_pool
                    && self.slot_of(bi) < self.info(pid).bottom_of_free_pool,
                "tried to reserve small page in fully allocated big page"
            );

            // swap the target small page with the first free one, then
            // advance the sub-pool boundary
            let free_index = self.small_free_index(bi);
            let target_slot = *self.small_map_entry(bi, si);
            debug_assert!(target_slot.0 >= *free_index, "small page already reserved");
            self.swap_small_slots(bi, target_slot, SmallPoolIndex(*free_index));
            *free_index += 1;
            self.info(pid).free_small_pages_in_partial_allocs -= 1;

            if *free_index == SMALL_POOL_FULL {
                self.move_partial_to_full(bi, pid);
            }
        }
    }

    /// Reserve one big page before normal operation starts.
    ///
    /// # Safety
    /// Caller holds the global lock and the lock of `pid`.
    unsafe fn reserve_big_page(&self, bi: BigPageIndex, pid: ProcessorId) {
        unsafe {
            if self.big_page_allocated(bi) {
                assert!(
                    (*self.map_entry(bi)).buffer() == BufferId::from_processor(pid),
                    "re-reservation sanity check failed"
                );
                return;
            }
            if (*self.map_entry(bi)).buffer() == GLOBAL_POOL {
                self.claim_specific_big_page_from_global(bi, pid);
            }
            debug_assert!(
                (*self.map_entry(bi)).buffer() == BufferId::from_processor(pid),
                "tried to reserve big page from wrong pool"
            );

            let s = self.slot_of(bi);
            debug_assert!(
                s >= self.info(pid).bottom_of_used_pool,
                "big page already in use"
            );
            if s < self.info(pid).bottom_of_free_pool {
                // some small pages inside were reserved earlier; absorb the rest
                let free_index = self.small_free_index(bi);
                self.info(pid).free_small_pages_in_partial_allocs -=
                    (SMALL_POOL_FULL - *free_index) as usize;
                *free_index = SMALL_POOL_FULL;
                self.move_partial_to_full(bi, pid);
            } else {
                self.move_free_to_full(bi, pid);
            }
        }
    }

    /// Reserve every small frame of `to_reserve` that intersects this range
    /// (including the alignment overlap just outside it).
    ///
    /// # Safety
    /// Caller holds the global lock and the lock of `pid`.
    pub(crate) unsafe fn reserve_phys_memory_range(
        &self,
        to_reserve: PhysMemoryRange,
        pid: ProcessorId,
    ) {
        let range_top = align_up(self.range.end.as_u64(), Size2M::SIZE);
        let range_bottom = self.range_bottom();
        if to_reserve.start.as_u64() >= range_top || to_reserve.end.as_u64() <= range_bottom {
            return;
        }

        let bottom = to_reserve.start.as_u64().max(range_bottom);
        let top = to_reserve.end.as_u64().min(range_top);
        if bottom == top {
            return;
        }
        let mut cursor = align_down(bottom, Size4K::SIZE);
        let top = align_up(top, Size4K::SIZE);

        while cursor < top {
            let addr = PhysicalAddress::new(cursor);
            if cursor % Size2M::SIZE == 0 && cursor + Size2M::SIZE <= top {
                unsafe { self.reserve_big_page(self.big_index_from_addr(addr), pid) };
                cursor += Size2M::SIZE;
            } else {
                unsafe {
                    self.reserve_small_page(
                        self.big_index_from_addr(addr),
                        Self::small_index_from_addr(addr),
                        pid,
                    );
                }
                cursor += Size4K::SIZE;
            }
        }
    }

    /// Reserve the pieces of the first and last big page that lie outside
    /// the usable range, so the pools never hand them out.
    unsafe fn reserve_overlap(&self, pid: ProcessorId) {
        let top = PhysicalAddress::new(align_up(self.range.end.as_u64(), Size2M::SIZE));
        let bottom = PhysicalAddress::new(self.range_bottom());
        unsafe {
            self.reserve_phys_memory_range(
                PhysMemoryRange {
                    start: bottom,
                    end: self.range.start,
                },
                pid,
            );
            self.reserve_phys_memory_range(
                PhysMemoryRange {
                    start: self.range.end,
                    end: top,
                },
                pid,
            );
        }
    }

    unsafe fn swap_small_slots(&self, bi: BigPageIndex, a: SmallPoolIndex, b: SmallPoolIndex) {
        if a == b {
            return;
        }
        unsafe {
            let pa = *self.small_pool_at(bi, a);
            let pb = *self.small_pool_at(bi, b);
            *self.small_pool_at(bi, a) = pb;
            *self.small_pool_at(bi, b) = pa;
            *self.small_map_entry(bi, pb) = a;
            *self.small_map_entry(bi, pa) = b;
        }
    }

    // ---- allocation ----------------------------------------------------

    /// Free big pages in the local pool of `pid`.
    ///
    /// # Safety
    /// Caller holds the lock of `pid`.
    pub(crate) unsafe fn free_local_big_pages(&self, pid: ProcessorId) -> usize {
        unsafe {
            let info = self.info(pid);
            info.local_pool_size - info.bottom_of_free_pool as usize
        }
    }

    /// Free small pages reachable from the local pool of `pid`, counting
    /// both partially-allocated big pages and fully free big pages.
    ///
    /// # Safety
    /// Caller holds the lock of `pid`.
    pub(crate) unsafe fn free_local_small_pages(&self, pid: ProcessorId) -> usize {
        unsafe {
            let in_partial = self.info(pid).free_small_pages_in_partial_allocs;
            in_partial + self.free_local_big_pages(pid) * SMALL_PAGES_PER_BIG
        }
    }

    /// Whether the partially-allocated zone of `pid` is non-empty.
    ///
    /// # Safety
    /// Caller holds the lock of `pid`.
    pub(crate) unsafe fn has_partial_big_pages(&self, pid: ProcessorId) -> bool {
        unsafe {
            let info = self.info(pid);
            info.bottom_of_used_pool < info.bottom_of_free_pool
        }
    }

    /// # Safety
    /// Caller holds the lock of `pid` and checked that
    /// [`free_local_small_pages`](Self::free_local_small_pages) is non-zero.
    pub(crate) unsafe fn allocate_small_page(&self, pid: ProcessorId) -> PhysicalAddress {
        unsafe {
            if !self.has_partial_big_pages(pid) {
                debug_assert!(
                    self.free_local_big_pages(pid) > 0,
                    "tried to allocate a small page from an empty local pool"
                );
                let bottom_free = self.info(pid).bottom_of_free_pool;
                let bi = *self
                    .pool_for(BufferId::from_processor(pid))
                    .add(bottom_free as usize);
                self.move_free_to_partial(bi, pid);
            }
            let bottom_free = self.info(pid).bottom_of_free_pool;
            let bi = *self
                .pool_for(BufferId::from_processor(pid))
                .add(bottom_free as usize - 1);
            let si = self.allocate_small_page_within(bi, pid);
            self.small_page_addr(bi, si)
        }
    }

    unsafe fn allocate_small_page_within(
        &self,
        bi: BigPageIndex,
        pid: ProcessorId,
    ) -> SmallPageIndex {
        unsafe {
            let free_index = self.small_free_index(bi);
            debug_assert!(
                *free_index < SMALL_POOL_FULL,
                "tried to allocate small page from full big page"
            );
            let si = *self.small_pool_at(bi, SmallPoolIndex(*free_index));
            *free_index += 1;
            self.info(pid).free_small_pages_in_partial_allocs -= 1;
            if *free_index == SMALL_POOL_FULL {
                self.move_partial_to_full(bi, pid);
            }
            si
        }
    }

    /// # Safety
    /// Caller holds the lock of `pid` and checked that
    /// [`free_local_big_pages`](Self::free_local_big_pages) is non-zero.
    pub(crate) unsafe fn allocate_big_page(&self, pid: ProcessorId) -> PhysicalAddress {
        unsafe {
            debug_assert!(
                self.free_local_big_pages(pid) > 0,
                "tried to allocate a big page from an empty local pool"
            );
            let bottom_free = self.info(pid).bottom_of_free_pool;
            let bi = *self
                .pool_for(BufferId::from_processor(pid))
                .add(bottom_free as usize);
            self.move_free_to_full(bi, pid);
            self.big_page_addr(bi)
        }
    }

    // ---- freeing -------------------------------------------------------

    /// # Safety
    /// Caller holds the lock of `pid`, and `pid` owns the backing big page.
    pub(crate) unsafe fn free_small_page(&self, addr: PhysicalAddress, pid: ProcessorId) {
        unsafe {
            let bi = self.big_index_from_addr(addr);
            let si = Self::small_index_from_addr(addr);
            assert!(
                (*self.map_entry(bi)).buffer() == BufferId::from_processor(pid),
                "small page freed into the wrong processor pool"
            );
            let free_index = self.small_free_index(bi);
            assert!(
                (*self.small_map_entry(bi, si)).0 < *free_index,
                "tried to free an unallocated small page"
            );

            let was_fully_allocated = self.slot_of(bi) < self.info(pid).bottom_of_used_pool;

            // swap the freed page with the top of the allocated sub-pool and
            // retract the boundary
            let top = SmallPoolIndex(*free_index - 1);
            self.swap_small_slots(bi, *self.small_map_entry(bi, si), top);
            *free_index -= 1;

            if was_fully_allocated {
                self.move_full_to_partial(bi, pid);
            }
            self.info(pid).free_small_pages_in_partial_allocs += 1;

            if *free_index == 0 {
                self.move_partial_to_free(bi, pid);
            }
        }
    }

    /// # Safety
    /// Caller holds the lock of `pid`, and `pid` owns the big page.
    pub(crate) unsafe fn free_big_page(&self, addr: PhysicalAddress, pid: ProcessorId) {
        unsafe {
            let bi = self.big_index_from_addr(addr);
            assert!(
                (*self.map_entry(bi)).buffer() == BufferId::from_processor(pid),
                "big page freed into the wrong processor pool"
            );
            let info = self.info(pid);
            assert!(
                self.slot_of(bi) < info.bottom_of_used_pool,
                "tried to free a big page that is not fully allocated"
            );
            let free_index = self.small_free_index(bi);
            debug_assert!(
                *free_index == 0 || *free_index == SMALL_POOL_FULL,
                "tried to free a big page whose small pages are allocated individually"
            );
            *free_index = 0;
            self.move_full_to_free(bi, pid);
        }
    }

    // ---- debug invariants ---------------------------------------------

    /// Check every pool invariant. Only called from tests and debug builds,
    /// with all locks held.
    ///
    /// # Safety
    /// Caller holds the global lock and every local lock.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) unsafe fn validate_integrity(&self, processor_count: usize) {
        unsafe {
            let gsize = *self.global_size();
            let mut seen_pool_slots = 0usize;
            for i in 0..self.big_page_count {
                let bi = BigPageIndex(i as u32);
                let e = &*self.map_entry(bi);
                let buf = e.buffer();
                let slot = e.index.0 as usize;
                let free_index = *self.small_free_index(bi);
                if buf == GLOBAL_POOL {
                    assert!(slot < gsize, "global reverse-map slot out of bounds");
                    assert!(
                        *self.pool_for(GLOBAL_POOL).add(slot) == bi,
                        "global reverse map inconsistent"
                    );
                    assert!(free_index == 0, "global big page not fully free");
                } else {
                    let pid = buf.0 as usize - 1;
                    assert!(pid < processor_count, "reverse map names unknown processor");
                    let info = &*self.local_pool_info[pid].get();
                    assert!(slot < info.local_pool_size, "local reverse-map slot OOB");
                    assert!(
                        *self.pool_for(buf).add(slot) == bi,
                        "local reverse map inconsistent"
                    );
                    if slot < info.bottom_of_used_pool as usize {
                        assert!(
                            free_index == 0 || free_index == SMALL_POOL_FULL,
                            "fully allocated big page has a partially used sub-pool"
                        );
                    } else if slot < info.bottom_of_free_pool as usize {
                        assert!(
                            free_index > 0 && free_index < SMALL_POOL_FULL,
                            "partially allocated big page zone mismatch"
                        );
                    } else {
                        assert!(free_index == 0, "fully free big page has allocations");
                    }
                }
                seen_pool_slots += 1;

                // the small sub-pool and its free map stay inverse permutations
                for j in 0..SMALL_PER_BIG {
                    let slot = *self.small_map_entry(bi, SmallPageIndex(j));
                    assert!(
                        *self.small_pool_at(bi, slot) == SmallPageIndex(j),
                        "small sub-pool reverse map inconsistent"
                    );
                }
            }
            assert_eq!(seen_pool_slots, self.big_page_count);

            for pid in 0..processor_count {
                let info = &*self.local_pool_info[pid].get();
                assert!(info.bottom_of_used_pool <= info.bottom_of_free_pool);
                assert!(info.bottom_of_free_pool as usize <= info.local_pool_size);
                let pool = self.pool_for(BufferId::from_processor(pid as ProcessorId));
                let mut partial_free = 0usize;
                for slot in info.bottom_of_used_pool..info.bottom_of_free_pool {
                    let bi = *pool.add(slot as usize);
                    partial_free += (SMALL_POOL_FULL - *self.small_free_index(bi)) as usize;
                }
                assert_eq!(
                    partial_free, info.free_small_pages_in_partial_allocs,
                    "free-small-page accounting diverged"
                );
            }
        }
    }
}
