//! # Physical Page Allocator
//!
//! Owns every usable physical frame reported by firmware and hands frames
//! out in two granularities: 4 KiB small pages and 2 MiB big pages (512
//! small pages each).
//!
//! ## Structure
//!
//! Each contiguous physical range gets its own
//! [`range::ContiguousRangeAllocator`] carved out of a caller-provided
//! scratch buffer. Within a range, big pages live in pools: one global pool
//! plus one local pool per processor, so the common allocation path touches
//! only processor-local cache lines. A local pool is partitioned into three
//! zones (fully allocated / partially allocated / fully free) maintained by
//! boundary swaps, and every big page carries a 512-entry sub-pool handing
//! out its small pages.
//!
//! ## Locking
//!
//! One spinlock per processor protects that processor's pool bookkeeping;
//! a single global spinlock protects the stealing path that migrates big
//! pages from the global pools into a local pool. Cross-processor frees
//! resolve the owning processor from the reverse map (with an atomic load)
//! and take *that* processor's lock.
//!
//! ## Failure semantics
//!
//! Allocation returns `None` when every pool is empty and stealing failed.
//! Freeing a frame that no range covers, or that nobody owns, panics.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod indices;
mod range;

pub use range::required_buffer_size;

use crate::indices::{BufferId, GLOBAL_POOL};
use crate::range::ContiguousRangeAllocator;
use alloc::vec::Vec;
use core::ptr::NonNull;
use kernel_hal::ProcessorId;
use kernel_memory_addresses::{PageSize, PhysicalAddress, SMALL_PAGES_PER_BIG, Size2M, Size4K};
use kernel_sync::{CachePadded, RawSpin};

/// One usable physical memory range `[start, end)`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhysMemoryRange {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
}

/// A usable range paired with the scratch buffer that will hold its pool
/// bookkeeping. The required buffer size is [`required_buffer_size`].
pub struct RangeConfig {
    pub range: PhysMemoryRange,
    pub buffer: NonNull<u8>,
    pub buffer_len: usize,
}

/// Extra big pages requested whenever a processor steals from the global
/// pool, so the next few allocations stay on the fast path.
const STEAL_EXTRA_REQUESTED_PAGES: usize = 4;

enum BulkAllocationPolicy {
    /// Drain partially-used big pages before breaking fresh ones.
    UseUpSmall,
    /// Satisfy as much of the request as possible with whole big pages.
    PreferBig,
}

/// The physical page allocator. See the crate docs for the overall design.
pub struct PageAllocator {
    ranges: Vec<ContiguousRangeAllocator>,
    global_lock: RawSpin,
    local_locks: Vec<CachePadded<RawSpin>>,
    processor_count: usize,
}

impl PageAllocator {
    /// Build one allocator per usable range.
    ///
    /// # Safety
    /// Every scratch buffer in `configs` must be exclusively owned by the
    /// returned allocator for its entire lifetime, cache-line aligned, and
    /// at least [`required_buffer_size`] bytes long.
    #[must_use]
    pub unsafe fn new(configs: &[RangeConfig], processor_count: usize) -> Self {
        log::debug!(
            "initializing page allocator: {} ranges, {processor_count} processors",
            configs.len()
        );
        let ranges = configs
            .iter()
            .map(|c| unsafe { ContiguousRangeAllocator::new(c, processor_count) })
            .collect();
        Self {
            ranges,
            global_lock: RawSpin::new(),
            local_locks: (0..processor_count)
                .map(|_| CachePadded::new(RawSpin::new()))
                .collect(),
            processor_count,
        }
    }

    /// Mark each small frame of `range` allocated before normal operation
    /// starts (kernel image, firmware tables, the allocator's own buffers).
    pub fn reserve_physical_range(&self, range: PhysMemoryRange) {
        self.global_lock.lock();
        self.local_locks[0].lock();
        for r in &self.ranges {
            unsafe { r.reserve_phys_memory_range(range, 0) };
        }
        unsafe {
            self.local_locks[0].unlock();
            self.global_lock.unlock();
        }
    }

    /// Number of free small pages reachable from the local pool of `pid`.
    #[must_use]
    pub fn local_free_small_pages(&self, pid: ProcessorId) -> usize {
        self.local_locks[pid as usize].with(|| {
            self.ranges
                .iter()
                .map(|r| unsafe { r.free_local_small_pages(pid) })
                .sum()
        })
    }

    /// Number of fully free big pages in the local pool of `pid`.
    #[must_use]
    pub fn local_free_big_pages(&self, pid: ProcessorId) -> usize {
        self.local_locks[pid as usize].with(|| {
            self.ranges
                .iter()
                .map(|r| unsafe { r.free_local_big_pages(pid) })
                .sum()
        })
    }

    /// Try to migrate big pages from the global pools into the local pool of
    /// `pid`. Returns whether at least `required_big_pages` were obtained.
    fn try_steal_pages(&self, required_big_pages: usize, pid: ProcessorId) -> bool {
        let mut remaining = required_big_pages + STEAL_EXTRA_REQUESTED_PAGES;
        self.global_lock.lock();
        for r in &self.ranges {
            if r.global_pool_len() > 0 {
                remaining -= unsafe { r.steal_big_pages_from_global(remaining, pid) };
            }
            if remaining <= STEAL_EXTRA_REQUESTED_PAGES {
                unsafe { self.global_lock.unlock() };
                return true;
            }
        }
        unsafe { self.global_lock.unlock() };
        false
    }

    /// Hook invoked after every free; reserved for future balancing between
    /// processor pools. The baseline policy keeps pages where they are.
    fn try_donate_pages_if_necessary(&self, pid: ProcessorId) {
        let _ = pid;
    }

    /// Allocate one small page from the current processor's pools, stealing
    /// from the global pools if the local ones are exhausted.
    #[must_use]
    pub fn allocate_small_page(&self) -> Option<PhysicalAddress> {
        let pid = kernel_hal::current_processor_id();
        let lock = &self.local_locks[pid as usize];
        lock.lock();
        loop {
            for r in &self.ranges {
                if unsafe { r.free_local_small_pages(pid) } > 0 {
                    let out = unsafe { r.allocate_small_page(pid) };
                    unsafe { lock.unlock() };
                    return Some(out);
                }
            }
            if !self.try_steal_pages(1, pid) {
                unsafe { lock.unlock() };
                return None;
            }
        }
    }

    /// Allocate one big page from the current processor's pools.
    #[must_use]
    pub fn allocate_big_page(&self) -> Option<PhysicalAddress> {
        let pid = kernel_hal::current_processor_id();
        let lock = &self.local_locks[pid as usize];
        lock.lock();
        loop {
            for r in &self.ranges {
                if unsafe { r.free_local_big_pages(pid) } > 0 {
                    let out = unsafe { r.allocate_big_page(pid) };
                    unsafe { lock.unlock() };
                    return Some(out);
                }
            }
            if !self.try_steal_pages(1, pid) {
                unsafe { lock.unlock() };
                return None;
            }
        }
    }

    /// Bulk allocation: fill `small_pages` and `big_pages` with frames whose
    /// combined capacity covers `requested_bytes`, or return `false` and
    /// leave both untouched if the request cannot be satisfied.
    pub fn allocate_pages(
        &self,
        requested_bytes: usize,
        small_pages: &mut Vec<PhysicalAddress>,
        big_pages: &mut Vec<PhysicalAddress>,
    ) -> bool {
        let pid = kernel_hal::current_processor_id();
        let lock = &self.local_locks[pid as usize];
        lock.lock();

        let mut available_small = 0usize;
        let mut available_big = 0usize;
        for r in &self.ranges {
            available_small += unsafe { r.free_local_small_pages(pid) };
            available_big += unsafe { r.free_local_big_pages(pid) };
        }
        let small_in_partial = available_small - available_big * SMALL_PAGES_PER_BIG;

        if requested_bytes > available_small * Size4K::SIZE as usize {
            let needed_big = (requested_bytes - available_small * Size4K::SIZE as usize)
                .div_ceil(Size2M::SIZE as usize);
            if !self.try_steal_pages(needed_big, pid) {
                unsafe { lock.unlock() };
                return false;
            }
        }

        let policy = if small_in_partial > 4 * SMALL_PAGES_PER_BIG * self.ranges.len() {
            BulkAllocationPolicy::UseUpSmall
        } else {
            BulkAllocationPolicy::PreferBig
        };

        let mut remaining = requested_bytes.div_ceil(Size4K::SIZE as usize);
        match policy {
            BulkAllocationPolicy::UseUpSmall => {
                // drain every partially allocated big page first
                small_pages.reserve(remaining.min(small_in_partial));
                'drain: for r in &self.ranges {
                    while remaining > 0 && unsafe { r.has_partial_big_pages(pid) } {
                        small_pages.push(unsafe { r.allocate_small_page(pid) });
                        remaining -= 1;
                    }
                    if remaining == 0 {
                        break 'drain;
                    }
                }
                // round the remainder down to whole big pages with a few
                // small pages from a fresh big page
                if remaining % SMALL_PAGES_PER_BIG != 0 {
                    for r in &self.ranges {
                        if unsafe { r.free_local_big_pages(pid) } > 0 {
                            while remaining % SMALL_PAGES_PER_BIG != 0 {
                                small_pages.push(unsafe { r.allocate_small_page(pid) });
                                remaining -= 1;
                            }
                            break;
                        }
                    }
                }
                big_pages.reserve(remaining / SMALL_PAGES_PER_BIG);
                'big: for r in &self.ranges {
                    while remaining > 0 && unsafe { r.free_local_big_pages(pid) } > 0 {
                        big_pages.push(unsafe { r.allocate_big_page(pid) });
                        remaining -= SMALL_PAGES_PER_BIG;
                    }
                    if remaining == 0 {
                        break 'big;
                    }
                }
            }
            BulkAllocationPolicy::PreferBig => {
                for r in &self.ranges {
                    while remaining >= SMALL_PAGES_PER_BIG
                        && unsafe { r.free_local_big_pages(pid) } > 0
                    {
                        big_pages.push(unsafe { r.allocate_big_page(pid) });
                        remaining -= SMALL_PAGES_PER_BIG;
                    }
                    if remaining < SMALL_PAGES_PER_BIG {
                        break;
                    }
                }
                small_pages.reserve(remaining);
                'partial: for r in &self.ranges {
                    while remaining > 0 && unsafe { r.has_partial_big_pages(pid) } {
                        small_pages.push(unsafe { r.allocate_small_page(pid) });
                        remaining -= 1;
                    }
                    if remaining == 0 {
                        break 'partial;
                    }
                }
                if remaining > 0 {
                    for r in &self.ranges {
                        if unsafe { r.free_local_big_pages(pid) } > 0 {
                            while remaining > 0 {
                                small_pages.push(unsafe { r.allocate_small_page(pid) });
                                remaining -= 1;
                            }
                            break;
                        }
                    }
                }
            }
        }
        assert!(remaining == 0, "bulk allocation accounting failed");

        unsafe { lock.unlock() };
        true
    }

    /// Free one small page, resolving which processor owns its backing big
    /// page and returning the frame to that pool.
    pub fn free_small_page(&self, page: PhysicalAddress) {
        for r in &self.ranges {
            if r.address_in_range(page) {
                let owner = r.owner_of(page);
                assert!(owner != GLOBAL_POOL, "tried to free an unowned page");
                let pid = owner.0 - 1;
                let lock = &self.local_locks[pid as usize];
                lock.lock();
                unsafe { r.free_small_page(page, pid) };
                self.try_donate_pages_if_necessary(pid);
                unsafe { lock.unlock() };
                return;
            }
        }
        panic!("tried to free page outside of any allocator range: {page}");
    }

    /// Free one big page. See [`free_small_page`](Self::free_small_page).
    pub fn free_big_page(&self, page: PhysicalAddress) {
        for r in &self.ranges {
            if r.address_in_range(page) {
                let owner = r.owner_of(page);
                assert!(owner != GLOBAL_POOL, "tried to free an unowned page");
                let pid = owner.0 - 1;
                let lock = &self.local_locks[pid as usize];
                lock.lock();
                unsafe { r.free_big_page(page, pid) };
                self.try_donate_pages_if_necessary(pid);
                unsafe { lock.unlock() };
                return;
            }
        }
        panic!("tried to free page outside of any allocator range: {page}");
    }

    /// Optimised free for a small page the caller got from the current
    /// processor's pool.
    pub fn free_local_small_page(&self, page: PhysicalAddress) {
        let pid = kernel_hal::current_processor_id();
        for r in &self.ranges {
            if r.address_in_range(page) {
                let lock = &self.local_locks[pid as usize];
                lock.lock();
                unsafe { r.free_small_page(page, pid) };
                self.try_donate_pages_if_necessary(pid);
                unsafe { lock.unlock() };
                return;
            }
        }
        panic!("tried to free page outside of any allocator range: {page}");
    }

    /// Optimised free for a big page the caller got from the current
    /// processor's pool.
    pub fn free_local_big_page(&self, page: PhysicalAddress) {
        let pid = kernel_hal::current_processor_id();
        for r in &self.ranges {
            if r.address_in_range(page) {
                let lock = &self.local_locks[pid as usize];
                lock.lock();
                unsafe { r.free_big_page(page, pid) };
                self.try_donate_pages_if_necessary(pid);
                unsafe { lock.unlock() };
                return;
            }
        }
        panic!("tried to free page outside of any allocator range: {page}");
    }

    /// Bulk free for pages owned by the current processor. Panics if any
    /// page falls outside every range.
    pub fn free_local_pages(
        &self,
        small_pages: &mut Vec<PhysicalAddress>,
        big_pages: &mut Vec<PhysicalAddress>,
    ) {
        let pid = kernel_hal::current_processor_id();
        let lock = &self.local_locks[pid as usize];
        lock.lock();
        for r in &self.ranges {
            Self::drain_matching(small_pages, r, |p| {
                unsafe { r.free_small_page(p, pid) };
                true
            });
            Self::drain_matching(big_pages, r, |p| {
                unsafe { r.free_big_page(p, pid) };
                true
            });
        }
        self.try_donate_pages_if_necessary(pid);
        unsafe { lock.unlock() };
        assert!(
            small_pages.is_empty() && big_pages.is_empty(),
            "tried to free pages outside of any allocator range"
        );
    }

    /// Bulk free with no restriction on which pools the pages belong to.
    /// Ownership is discovered with atomic loads of the reverse map, then
    /// confirmed under the owning processor's lock.
    pub fn free_pages(
        &self,
        small_pages: &mut Vec<PhysicalAddress>,
        big_pages: &mut Vec<PhysicalAddress>,
    ) {
        for pid in 0..self.processor_count {
            let pid = pid as ProcessorId;
            let lock = &self.local_locks[pid as usize];
            lock.lock();
            for r in &self.ranges {
                let owned =
                    |p: PhysicalAddress| r.owner_of(p) == BufferId::from_processor(pid);
                Self::drain_matching(small_pages, r, |p| {
                    if owned(p) {
                        unsafe { r.free_small_page(p, pid) };
                        true
                    } else {
                        false
                    }
                });
                Self::drain_matching(big_pages, r, |p| {
                    if owned(p) {
                        unsafe { r.free_big_page(p, pid) };
                        true
                    } else {
                        false
                    }
                });
            }
            self.try_donate_pages_if_necessary(pid);
            unsafe { lock.unlock() };
        }
        assert!(
            small_pages.is_empty() && big_pages.is_empty(),
            "tried to free pages outside of any allocator range"
        );
    }

    /// Free every page of `pages` that `free` accepts, removing it from the
    /// vector; pages outside `r` or rejected by `free` stay.
    fn drain_matching(
        pages: &mut Vec<PhysicalAddress>,
        r: &ContiguousRangeAllocator,
        mut free: impl FnMut(PhysicalAddress) -> bool,
    ) {
        let mut i = 0;
        while i < pages.len() {
            let p = pages[i];
            if r.address_in_range(p) && free(p) {
                pages.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Check every pool invariant under all locks. Debug/test aid.
    pub fn validate_integrity(&self) {
        self.global_lock.lock();
        for lock in &self.local_locks {
            lock.lock();
        }
        for r in &self.ranges {
            unsafe { r.validate_integrity(self.processor_count) };
        }
        for lock in &self.local_locks {
            unsafe { lock.unlock() };
        }
        unsafe { self.global_lock.unlock() };
    }
}
