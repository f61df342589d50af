//! The manager's reserved virtual window and its occupancy tracking.
//!
//! The manager owns a fixed 1 GiB span of virtual address space. Window
//! pages are referred to by their dense index `k`; the page lives at
//! `window_base + k * 4096`. The carving is self-describing:
//!
//! - pages `0..512` hold the internal page tables themselves. The table at
//!   window page `t` is installed as directory slot `t`, so its entry `e`
//!   controls window page `t * 512 + e` — equivalently, the entry governing
//!   window page `k` sits at byte offset `k * 8` from the window base.
//! - pages `512..1024` hold the fast-metadata region: one machine word per
//!   window page, `word(k)` at byte offset `2 MiB + k * 8`.
//! - page `1024` holds the mapping directory; everything above it is handed
//!   out for page-table pages, their supplements, and reserve-pool stock.

use crate::table::{ENTRIES_PER_TABLE, PageTable};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use kernel_memory_addresses::{PageSize, Size2M, Size4K, VirtualAddress};
use kernel_sync::SpinLock;

extern crate alloc;
use alloc::vec::Vec;

/// Base of the manager's window on the reference target: −3 GiB.
pub const WINDOW_BASE: u64 = 0xFFFF_FFFF_4000_0000;
/// Size of the manager's window.
pub const WINDOW_SIZE: u64 = 1 << 30;

pub(crate) const MAPPING_TABLE: u16 = 0;
pub(crate) const METADATA_TABLE: u16 = 1;
pub(crate) const INITIAL_TABLE: u16 = 2;
/// First window page mapped by the metadata-mapping table.
pub(crate) const METADATA_FIRST_PAGE: u32 = 512;
/// The mapping directory's window page (initial table, entry 0).
pub(crate) const DIRECTORY_PAGE: u32 = 1024;

const _: () = {
    assert!(WINDOW_SIZE / Size4K::SIZE / (ENTRIES_PER_TABLE as u64) == 512);
    assert!(METADATA_FIRST_PAGE as u64 * Size4K::SIZE == Size2M::SIZE);
};

/// The window as seen from the kernel: a base pointer plus index math.
///
/// On the bare-metal target the base is [`WINDOW_BASE`]; tests point it at a
/// host buffer standing in for the window, which exercises every code path
/// because the manager only ever reaches its state through window indices.
pub(crate) struct Window {
    base: NonNull<u8>,
}

// Safety: the window memory is shared mutable state accessed through
// atomics (page tables) or under locks.
unsafe impl Send for Window {}
unsafe impl Sync for Window {}

impl Window {
    /// # Safety
    /// `base` points at the start of the (pre-mapped) window span.
    pub(crate) const unsafe fn new(base: NonNull<u8>) -> Self {
        Self { base }
    }

    fn page_ptr(&self, page: u32) -> *mut u8 {
        unsafe { self.base.as_ptr().add(page as usize * Size4K::SIZE as usize) }
    }

    /// View window page `page` as a page table.
    pub(crate) fn page_table_at(&self, page: u32) -> &PageTable {
        unsafe { &*self.page_ptr(page).cast::<PageTable>() }
    }

    /// One of the internal tables (window pages `0..512`).
    pub(crate) fn table(&self, table: u16) -> &PageTable {
        debug_assert!((table as usize) < ENTRIES_PER_TABLE);
        self.page_table_at(u32::from(table))
    }

    /// The entry governing window page `page` (flat view).
    pub(crate) fn entry_for_page(&self, page: u32) -> crate::entry::PageEntry {
        let table = (page as usize / ENTRIES_PER_TABLE) as u16;
        self.table(table).entry(page as usize % ENTRIES_PER_TABLE)
    }

    /// The fast-metadata word of window page `page`.
    pub(crate) fn metadata_word(&self, page: u32) -> &AtomicU64 {
        let offset = Size2M::SIZE as usize + page as usize * 8;
        unsafe { &*self.base.as_ptr().add(offset).cast::<AtomicU64>() }
    }

    /// The child-index slots of a supplementary metadata page.
    pub(crate) fn supplement_slots(&self, page: u32) -> &[AtomicU32; ENTRIES_PER_TABLE] {
        unsafe { &*self.page_ptr(page).cast::<[AtomicU32; ENTRIES_PER_TABLE]>() }
    }

    pub(crate) fn zero_page(&self, page: u32) {
        unsafe {
            self.page_ptr(page).write_bytes(0, Size4K::SIZE as usize);
        }
    }

    /// Virtual address of window page `page`.
    pub(crate) fn virt_of_page(&self, page: u32) -> VirtualAddress {
        VirtualAddress::from_ptr(self.page_ptr(page))
    }
}

const MARKER_WORDS: usize = ENTRIES_PER_TABLE / 64;

/// The partially-occupied ring: internal tables that still have at least
/// one free entry, in FIFO order, plus the full/partially-occupied marker
/// bitmaps that serialize state transitions.
pub(crate) struct PartiallyOccupiedRing {
    ring: [AtomicU16; ENTRIES_PER_TABLE],
    write_head: AtomicU16,
    written_limit: AtomicU16,
    read_head: AtomicU16,
    full_markers: [AtomicU64; MARKER_WORDS],
    partial_markers: [AtomicU64; MARKER_WORDS],
}

impl PartiallyOccupiedRing {
    /// Bootstrap state: `full` tables are position-allocated forever, and
    /// `initial` is the one general-purpose table already in the ring.
    pub(crate) fn seeded(full: &[u16], initial: u16) -> Self {
        let ring = Self {
            ring: core::array::from_fn(|_| AtomicU16::new(0)),
            write_head: AtomicU16::new(1),
            written_limit: AtomicU16::new(1),
            read_head: AtomicU16::new(0),
            full_markers: core::array::from_fn(|_| AtomicU64::new(0)),
            partial_markers: core::array::from_fn(|_| AtomicU64::new(0)),
        };
        for &t in full {
            ring.mark_full_state(t, true);
        }
        ring.mark_partial_state(initial, true);
        ring.ring[0].store(initial, Ordering::Relaxed);
        ring
    }

    pub(crate) fn read_head(&self) -> u16 {
        self.read_head.load(Ordering::Acquire)
    }

    pub(crate) fn written_limit(&self) -> u16 {
        self.written_limit.load(Ordering::Acquire)
    }

    pub(crate) fn write_head(&self) -> u16 {
        self.write_head.load(Ordering::Acquire)
    }

    pub(crate) fn ring_at(&self, index: u16) -> u16 {
        self.ring[index as usize].load(Ordering::Acquire)
    }

    pub(crate) fn ring_store(&self, index: u16, table: u16) {
        self.ring[index as usize].store(table, Ordering::Release);
    }

    pub(crate) fn is_full(&self, table: u16) -> bool {
        let word = &self.full_markers[table as usize / 64];
        word.load(Ordering::Acquire) & (1 << (table % 64)) != 0
    }

    /// Flip the full marker of `table` to `full`. Returns whether this call
    /// performed the transition; the winner owns the follow-up ring update.
    pub(crate) fn mark_full_state(&self, table: u16, full: bool) -> bool {
        Self::mark(&self.full_markers, table, full)
    }

    /// Flip the partially-occupied marker; same ownership contract.
    pub(crate) fn mark_partial_state(&self, table: u16, partially_occupied: bool) -> bool {
        Self::mark(&self.partial_markers, table, partially_occupied)
    }

    fn mark(words: &[AtomicU64; MARKER_WORDS], table: u16, value: bool) -> bool {
        let word = &words[table as usize / 64];
        let mask = 1u64 << (table % 64);
        let mut old = word.load(Ordering::Acquire);
        loop {
            if value == (old & mask != 0) {
                return false;
            }
            let new = if value { old | mask } else { old & !mask };
            match word.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(v) => old = v,
            }
        }
    }

    /// Exclusive read-head advance by the thread that marked a table full.
    pub(crate) fn advance_read_head(&self) {
        let next = (self.read_head.load(Ordering::Acquire) + 1) % ENTRIES_PER_TABLE as u16;
        self.read_head.store(next, Ordering::Release);
    }

    /// Claim the write-head slot `expected`. Returns whether we won it.
    pub(crate) fn try_advance_write_head(&self, expected: u16) -> bool {
        let next = (expected + 1) % ENTRIES_PER_TABLE as u16;
        self.write_head
            .compare_exchange(expected, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publish slot `expected`: spin until it is our turn to move the
    /// written limit, preserving FIFO across producers that finish out of
    /// order.
    pub(crate) fn publish_written_limit(&self, expected: u16) {
        let next = (expected + 1) % ENTRIES_PER_TABLE as u16;
        while self
            .written_limit
            .compare_exchange_weak(expected, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }
}

/// Registry mapping the 12-bit supplement indices stored inline in tables to
/// the window pages holding the supplementary data.
pub(crate) struct SupplementRegistry {
    slots: Vec<AtomicU32>,
    recycled: SpinLock<Vec<u16>>,
    next: AtomicU16,
}

pub(crate) const SUPPLEMENT_REGISTRY_CAPACITY: usize = 1 << 12;

impl SupplementRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slots: (0..SUPPLEMENT_REGISTRY_CAPACITY)
                .map(|_| AtomicU32::new(0))
                .collect(),
            recycled: SpinLock::new(Vec::new()),
            next: AtomicU16::new(0),
        }
    }

    pub(crate) fn register(&self, window_page: u32) -> u16 {
        let id = self.recycled.with_lock(Vec::pop).unwrap_or_else(|| {
            let id = self.next.fetch_add(1, Ordering::AcqRel);
            assert!(
                (id as usize) < SUPPLEMENT_REGISTRY_CAPACITY,
                "supplement registry exhausted"
            );
            id
        });
        self.slots[id as usize].store(window_page, Ordering::Release);
        id
    }

    pub(crate) fn lookup(&self, id: u16) -> u32 {
        self.slots[id as usize].load(Ordering::Acquire)
    }

    pub(crate) fn release(&self, id: u16) {
        self.slots[id as usize].store(0, Ordering::Release);
        self.recycled.with_lock(|v| v.push(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_ring_matches_the_bootstrap_contract() {
        let ring = PartiallyOccupiedRing::seeded(&[0, 1], 2);
        assert!(ring.is_full(0));
        assert!(ring.is_full(1));
        assert!(!ring.is_full(2));
        assert_eq!(ring.read_head(), 0);
        assert_eq!(ring.written_limit(), 1);
        assert_eq!(ring.ring_at(0), 2);
    }

    #[test]
    fn marker_transitions_have_single_winners() {
        let ring = PartiallyOccupiedRing::seeded(&[], 2);
        assert!(ring.mark_full_state(7, true));
        assert!(!ring.mark_full_state(7, true), "second marking must lose");
        assert!(ring.mark_full_state(7, false));
        assert!(!ring.mark_full_state(7, false));
    }

    #[test]
    fn supplement_registry_recycles_indices() {
        let reg = SupplementRegistry::new();
        let a = reg.register(1111);
        let b = reg.register(2222);
        assert_ne!(a, b);
        assert_eq!(reg.lookup(a), 1111);
        reg.release(a);
        let c = reg.register(3333);
        assert_eq!(c, a, "released index should be recycled");
        assert_eq!(reg.lookup(c), 3333);
        assert_eq!(reg.lookup(b), 2222);
    }
}
