//! The reserve and free-overflow rings.
//!
//! Both are bounded MPMC ring buffers built on the two-phase protocol: a
//! producer first claims a slot by CAS on the write head, then publishes the
//! payload behind a per-slot flag. Consumers symmetrically claim with a CAS
//! on the read head and then wait for the slot's flag. A failed CAS retries;
//! nothing ever parks.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use kernel_hal::{MAX_PROCESSOR_COUNT, memory_fence};
use kernel_memory_addresses::PhysicalAddress;

pub(crate) const RESERVE_POOL_SIZE: usize = 128;
pub(crate) const RESERVE_POOL_DEFAULT_FILL: usize = 48;
pub(crate) const RESERVE_POOL_LAZY_FILL_THRESHOLD: usize = 16;
pub(crate) const FREE_OVERFLOW_POOL_SIZE: usize = 128;

pub(crate) const BITMAP_WORDS: usize = MAX_PROCESSOR_COUNT / 64;

/// A pre-mapped window page: its backing frame and its window page index.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct PageInfo {
    pub phys: PhysicalAddress,
    pub window_page: u32,
}

struct ReservePoolEntry {
    phys: AtomicU64,
    window_page: AtomicU32,
    populated: AtomicBool,
}

/// Cushion of pre-mapped page-table pages, for consumers that must not
/// re-enter the physical page allocator.
pub(crate) struct ReservePool {
    entries: [ReservePoolEntry; RESERVE_POOL_SIZE],
    write_head: AtomicUsize,
    read_head: AtomicUsize,
}

impl ReservePool {
    pub(crate) fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| ReservePoolEntry {
                phys: AtomicU64::new(0),
                window_page: AtomicU32::new(0),
                populated: AtomicBool::new(false),
            }),
            write_head: AtomicUsize::new(0),
            read_head: AtomicUsize::new(0),
        }
    }

    /// Entries currently in the ring (racy snapshot).
    pub(crate) fn occupancy(&self) -> usize {
        let w = self.write_head.load(Ordering::Acquire);
        let r = self.read_head.load(Ordering::Acquire);
        (w + RESERVE_POOL_SIZE - r) % RESERVE_POOL_SIZE
    }

    /// Two-phase produce. Returns false when the ring is full.
    pub(crate) fn push(&self, page: PageInfo) -> bool {
        let slot = loop {
            let prev = self.write_head.load(Ordering::Acquire);
            let next = (prev + 1) % RESERVE_POOL_SIZE;
            if next == self.read_head.load(Ordering::Acquire) {
                return false;
            }
            if self
                .write_head
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break prev;
            }
        };
        let entry = &self.entries[slot];
        // a consumer that claimed this slot earlier may still be copying out
        while entry.populated.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        entry.phys.store(page.phys.as_u64(), Ordering::Relaxed);
        entry.window_page.store(page.window_page, Ordering::Relaxed);
        memory_fence();
        entry.populated.store(true, Ordering::Release);
        true
    }

    /// Two-phase consume. Returns `None` when the ring is empty.
    pub(crate) fn pop(&self) -> Option<PageInfo> {
        let slot = loop {
            let prev = self.read_head.load(Ordering::Acquire);
            if prev == self.write_head.load(Ordering::Acquire) {
                return None;
            }
            let next = (prev + 1) % RESERVE_POOL_SIZE;
            if self
                .read_head
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break prev;
            }
        };
        let entry = &self.entries[slot];
        // the producer that claimed this slot may still be publishing
        while !entry.populated.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        let page = PageInfo {
            phys: PhysicalAddress::new(entry.phys.load(Ordering::Relaxed)),
            window_page: entry.window_page.load(Ordering::Relaxed),
        };
        memory_fence();
        entry.populated.store(false, Ordering::Release);
        Some(page)
    }
}

pub(crate) struct OverflowPoolEntry {
    phys: AtomicU64,
    window_page: AtomicU32,
    ready_to_process: AtomicBool,
    /// One bit per processor that still has to invalidate its TLB entry.
    to_process: [AtomicU64; BITMAP_WORDS],
}

/// Pages that are free but whose stale translations must be dropped on
/// every processor before the frame can be retired.
pub(crate) struct OverflowPool {
    entries: [OverflowPoolEntry; FREE_OVERFLOW_POOL_SIZE],
    write_head: AtomicUsize,
    read_head: AtomicUsize,
}

impl OverflowPool {
    pub(crate) fn new() -> Self {
        Self {
            entries: core::array::from_fn(|_| OverflowPoolEntry {
                phys: AtomicU64::new(0),
                window_page: AtomicU32::new(0),
                ready_to_process: AtomicBool::new(false),
                to_process: core::array::from_fn(|_| AtomicU64::new(0)),
            }),
            write_head: AtomicUsize::new(0),
            read_head: AtomicUsize::new(0),
        }
    }

    pub(crate) fn read_head(&self) -> usize {
        self.read_head.load(Ordering::Acquire)
    }

    /// Queue a freed page for cross-processor invalidation. Returns false
    /// when the ring is full; the caller then drains its own share first.
    pub(crate) fn push(&self, page: PageInfo, blank_bitmap: &[u64; BITMAP_WORDS]) -> bool {
        let slot = loop {
            let prev = self.write_head.load(Ordering::Acquire);
            let next = (prev + 1) % FREE_OVERFLOW_POOL_SIZE;
            if next == self.read_head.load(Ordering::Acquire) {
                return false;
            }
            if self
                .write_head
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break prev;
            }
        };
        let entry = &self.entries[slot];
        // retirement clears the flag before the read head moves past a slot
        debug_assert!(
            !entry.ready_to_process.load(Ordering::Acquire),
            "overflow ring slot reused before retirement"
        );
        entry.phys.store(page.phys.as_u64(), Ordering::Relaxed);
        entry.window_page.store(page.window_page, Ordering::Relaxed);
        for (word, blank) in entry.to_process.iter().zip(blank_bitmap) {
            word.store(*blank, Ordering::Relaxed);
        }
        memory_fence();
        entry.ready_to_process.store(true, Ordering::Release);
        true
    }

    /// Walk the ring from the read head, invalidating this processor's
    /// share and retiring fully-acknowledged entries through `retire`.
    ///
    /// Only the processor whose read-head CAS succeeds calls `retire` for a
    /// given entry, so the frame is released exactly once.
    pub(crate) fn process(
        &self,
        processor: usize,
        meaningful_words: usize,
        mut invalidate: impl FnMut(PageInfo),
        mut retire: impl FnMut(PageInfo),
    ) {
        let word_index = processor / 64;
        let mask = 1u64 << (processor % 64);
        let mut index = self.read_head.load(Ordering::Acquire);
        'ring: while index != self.write_head.load(Ordering::Acquire) {
            let entry = &self.entries[index];
            while !entry.ready_to_process.load(Ordering::Acquire) {
                // Either the producer is mid-publish, or another processor
                // retired the slot under us. Skip slots the read head has
                // already moved past instead of spinning on them.
                let rh = self.read_head.load(Ordering::Acquire);
                let wh = self.write_head.load(Ordering::Acquire);
                let in_flight = (index + FREE_OVERFLOW_POOL_SIZE - rh) % FREE_OVERFLOW_POOL_SIZE
                    < (wh + FREE_OVERFLOW_POOL_SIZE - rh) % FREE_OVERFLOW_POOL_SIZE;
                if !in_flight {
                    index = (index + 1) % FREE_OVERFLOW_POOL_SIZE;
                    continue 'ring;
                }
                core::hint::spin_loop();
            }
            let page = PageInfo {
                phys: PhysicalAddress::new(entry.phys.load(Ordering::Relaxed)),
                window_page: entry.window_page.load(Ordering::Relaxed),
            };
            if entry.to_process[word_index].load(Ordering::Acquire) & mask != 0 {
                invalidate(page);
                entry.to_process[word_index].fetch_and(!mask, Ordering::AcqRel);
                kernel_hal::compiler_fence();
            }
            let all_clear = entry.to_process[..meaningful_words]
                .iter()
                .all(|w| w.load(Ordering::Acquire) == 0);
            if all_clear {
                memory_fence();
                entry.ready_to_process.store(false, Ordering::Release);
                let next = (index + 1) % FREE_OVERFLOW_POOL_SIZE;
                if self
                    .read_head
                    .compare_exchange(index, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    retire(page);
                }
            }
            index = (index + 1) % FREE_OVERFLOW_POOL_SIZE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: u64) -> PageInfo {
        PageInfo {
            phys: PhysicalAddress::new(n * 4096),
            window_page: n as u32,
        }
    }

    #[test]
    fn reserve_pool_round_trip_is_fifo() {
        let pool = ReservePool::new();
        assert_eq!(pool.occupancy(), 0);
        assert!(pool.pop().is_none());
        for i in 0..5 {
            assert!(pool.push(page(i)));
        }
        assert_eq!(pool.occupancy(), 5);
        for i in 0..5 {
            assert_eq!(pool.pop(), Some(page(i)));
        }
        assert!(pool.pop().is_none());
    }

    #[test]
    fn reserve_pool_rejects_when_full() {
        let pool = ReservePool::new();
        for i in 0..RESERVE_POOL_SIZE as u64 - 1 {
            assert!(pool.push(page(i)));
        }
        assert!(!pool.push(page(999)));
        assert_eq!(pool.pop(), Some(page(0)));
        assert!(pool.push(page(999)));
    }

    #[test]
    fn reserve_pool_parallel_producers_and_consumers() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicU64 as Sum;

        let pool = Arc::new(ReservePool::new());
        let popped_sum = Arc::new(Sum::new(0));
        let popped_count = Arc::new(Sum::new(0));

        std::thread::scope(|s| {
            for t in 0..2u64 {
                let pool = Arc::clone(&pool);
                s.spawn(move || {
                    for i in 0..500 {
                        let v = t * 1000 + i + 1;
                        while !pool.push(page(v)) {
                            std::thread::yield_now();
                        }
                    }
                });
            }
            for _ in 0..2 {
                let pool = Arc::clone(&pool);
                let sum = Arc::clone(&popped_sum);
                let count = Arc::clone(&popped_count);
                s.spawn(move || {
                    loop {
                        if count.load(Ordering::Relaxed) >= 1000 {
                            break;
                        }
                        if let Some(p) = pool.pop() {
                            sum.fetch_add(u64::from(p.window_page), Ordering::Relaxed);
                            count.fetch_add(1, Ordering::Relaxed);
                        } else {
                            std::thread::yield_now();
                        }
                    }
                });
            }
        });

        let expected: u64 = (1..=500u64).map(|i| i).sum::<u64>()
            + (1..=500u64).map(|i| 1000 + i).sum::<u64>();
        // consumers may slightly overshoot the count check, so drain the rest
        let mut sum = popped_sum.load(Ordering::Relaxed);
        while let Some(p) = pool.pop() {
            sum += u64::from(p.window_page);
        }
        assert_eq!(sum, expected);
    }

    #[test]
    fn overflow_pool_retires_after_all_processors_acknowledge() {
        let pool = OverflowPool::new();
        let blank = [0b1111u64, 0, 0, 0]; // four processors
        for i in 0..5 {
            assert!(pool.push(page(i), &blank));
        }

        let mut retired = Vec::new();
        let mut invalidated = [0usize; 4];
        for cpu in 1..4 {
            pool.process(cpu, 1, |_| invalidated[cpu] += 1, |p| retired.push(p));
            assert!(retired.is_empty(), "retired before every processor acked");
        }
        pool.process(0, 1, |_| invalidated[0] += 1, |p| retired.push(p));

        assert_eq!(invalidated, [5, 5, 5, 5]);
        assert_eq!(retired.len(), 5);
        assert_eq!(pool.read_head(), 5);

        // a second sweep finds nothing
        pool.process(0, 1, |_| panic!("nothing left to invalidate"), |_| {
            panic!("nothing left to retire")
        });
    }

    #[test]
    fn overflow_pool_single_processor_retires_immediately() {
        let pool = OverflowPool::new();
        let blank = [1u64, 0, 0, 0];
        assert!(pool.push(page(7), &blank));
        let mut retired = Vec::new();
        pool.process(0, 1, |_| {}, |p| retired.push(p));
        assert_eq!(retired, vec![page(7)]);
    }
}
