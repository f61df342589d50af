//! # Page Table Manager
//!
//! Maintains the architecture's page-table hierarchy while keeping its own
//! book-keeping inside the very address space it manages. The manager
//! reserves a fixed 1 GiB virtual window ([`WINDOW_BASE`]); every page-table
//! page it ever allocates is mapped there at a deterministic address derived
//! from a dense window-page index, together with per-table metadata.
//!
//! ## Self-hosting
//!
//! The window's first 512 pages are the manager's *internal* page tables;
//! the table occupying window page `t` is installed as directory slot `t`,
//! which makes the flat array of entries at the window base govern the
//! window's own pages. Three tables plus the directory are initialized by
//! hand during [`PageTableManager::new`], using the same free-list layout
//! the steady state uses; everything afterwards runs through the normal
//! machinery.
//!
//! ## Concurrency
//!
//! Allocation of internal entries is lock-free (CAS on each table's header
//! free-list). The set of tables with free entries is tracked by the
//! partially-occupied ring, whose producers claim a slot by CAS and then
//! publish it through a separate written limit, preserving FIFO. Mutations
//! of live tables take the affected table's lock bit only, so disjoint
//! tables are edited concurrently. Freed page-table pages park in the
//! overflow pool until every processor has invalidated its stale
//! translation ([`PageTableManager::process_overflow_pool`]); only then is
//! the frame retired to the physical page allocator.
//!
//! ## Bring-up
//!
//! Boot code parses the memory map, initializes the physical page
//! allocator, and pre-maps the window's bootstrap pages before constructing
//! the manager; installing the directory into the boot paging structures is
//! boot glue and stays outside this crate. Hosted builds (tests) point the
//! window at a plain memory buffer, which exercises all of the machinery
//! because nothing here dereferences translated addresses.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod address_space;
mod backend;
mod entry;
mod flush;
mod pools;
mod table;
mod window;

pub use address_space::{
    CompositeHandle, MapError, PageSize, PartialHandle, StructureRef, TOP_LEVEL_STRIDE,
};
pub use backend::PtmHeapBackend;
pub use entry::{PageEntry, PageMappingCacheType, PageMappingPermissions};
pub use flush::{BatchFlushPlanner, FlushPlanner, ImmediateFlushPlanner};
pub use kernel_hal::{invlpcid, invlpg, invltlb};
pub use window::{WINDOW_BASE, WINDOW_SIZE};

use crate::flush::PlannerSlot;
use crate::pools::{
    BITMAP_WORDS, OverflowPool, PageInfo, RESERVE_POOL_DEFAULT_FILL,
    RESERVE_POOL_LAZY_FILL_THRESHOLD, ReservePool,
};
use crate::table::ENTRIES_PER_TABLE;
use crate::window::{
    DIRECTORY_PAGE, INITIAL_TABLE, MAPPING_TABLE, METADATA_FIRST_PAGE, METADATA_TABLE,
    PartiallyOccupiedRing, SupplementRegistry, Window,
};
use alloc::boxed::Box;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use kernel_hal::Cr3;
use kernel_memory_addresses::PhysicalAddress;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::CachePadded;

/// Source of physical frames for page-table pages.
pub trait FrameSource {
    fn allocate_small_page(&self) -> Option<PhysicalAddress>;
    fn free_small_page(&self, frame: PhysicalAddress);
}

impl FrameSource for kernel_pagealloc::PageAllocator {
    fn allocate_small_page(&self) -> Option<PhysicalAddress> {
        Self::allocate_small_page(self)
    }

    fn free_small_page(&self, frame: PhysicalAddress) {
        Self::free_small_page(self, frame);
    }
}

impl<T: FrameSource + ?Sized> FrameSource for &T {
    fn allocate_small_page(&self) -> Option<PhysicalAddress> {
        (**self).allocate_small_page()
    }

    fn free_small_page(&self, frame: PhysicalAddress) {
        (**self).free_small_page(frame);
    }
}

/// The address-space root installed on a processor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InstalledStructure {
    pub root: PhysicalAddress,
    pub pcid: u16,
}

/// Snapshot of the partially-occupied ring heads, for diagnostics.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RingState {
    pub read_head: u16,
    pub written_limit: u16,
    pub write_head: u16,
}

/// The page table manager. See the crate docs for the big picture.
pub struct PageTableManager<S: FrameSource> {
    window: Window,
    frames: S,
    por: PartiallyOccupiedRing,
    unpopulated_head: AtomicUsize,
    reserve: ReservePool,
    overflow: OverflowPool,
    supplements: SupplementRegistry,
    planner_slots: Box<[CachePadded<PlannerSlot>]>,
    installed: Box<[CachePadded<AtomicU64>]>,
    live_window_pages: AtomicUsize,
    meaningful_bitmap_words: usize,
    blank_bitmap: [u64; BITMAP_WORDS],
}

impl<S: FrameSource> PageTableManager<S> {
    /// Bootstrap the manager inside its window.
    ///
    /// Hand-initializes the mapping table, the metadata-mapping table, one
    /// general-purpose table and the mapping directory, all with the
    /// steady-state layouts, then seeds the occupancy tracking.
    ///
    /// # Safety
    /// `window_base` points at the start of the manager's window span, and
    /// at least its first three table pages, the first three metadata pages
    /// and the directory page are mapped writable before the call (boot
    /// glue on the bare-metal target; a plain buffer on the host).
    pub unsafe fn new(window_base: NonNull<u8>, processor_count: usize, frames: S) -> Self {
        assert!(processor_count >= 1 && processor_count <= kernel_hal::MAX_PROCESSOR_COUNT);
        let mut blank_bitmap = [0u64; BITMAP_WORDS];
        let mut remaining = processor_count;
        for word in &mut blank_bitmap {
            if remaining == 0 {
                break;
            }
            let bits = remaining.min(64);
            *word = if bits == 64 { u64::MAX } else { (1 << bits) - 1 };
            remaining -= bits;
        }

        let window = unsafe { Window::new(window_base) };
        let manager = Self {
            window,
            frames,
            por: PartiallyOccupiedRing::seeded(&[MAPPING_TABLE, METADATA_TABLE], INITIAL_TABLE),
            unpopulated_head: AtomicUsize::new(3),
            reserve: ReservePool::new(),
            overflow: OverflowPool::new(),
            supplements: SupplementRegistry::new(),
            planner_slots: (0..processor_count)
                .map(|_| CachePadded::new(PlannerSlot::new()))
                .collect(),
            installed: (0..processor_count)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
            live_window_pages: AtomicUsize::new(0),
            meaningful_bitmap_words: processor_count.div_ceil(64),
            blank_bitmap,
        };
        manager.bootstrap();
        manager
    }

    fn bootstrap(&self) {
        log::debug!("bootstrapping the page table manager window");
        let frame = |what: &str| {
            self.frames
                .allocate_small_page()
                .unwrap_or_else(|| panic!("out of physical memory for the {what}"))
        };
        let table_frames = [
            frame("mapping table"),
            frame("metadata-mapping table"),
            frame("initial page table"),
        ];
        let directory_frame = frame("mapping directory");
        let metadata_frames = [
            frame("metadata page"),
            frame("metadata page"),
            frame("metadata page"),
        ];

        for page in [0u32, 1, 2, DIRECTORY_PAGE] {
            self.window.zero_page(page);
        }
        for offset in 0..3 {
            self.window.zero_page(METADATA_FIRST_PAGE + offset);
        }

        // The mapping table maps the internal tables themselves; it is
        // position-allocated, so it never joins the free-entry machinery.
        let mapping = self.window.table(MAPPING_TABLE);
        mapping.initialize_as_full();
        mapping.set_and_preserve_metadata(0, PageEntry::window_page(table_frames[0]));
        for (i, f) in table_frames.iter().enumerate().skip(1) {
            mapping.store_entry(i, PageEntry::window_page(*f));
        }

        // Likewise for the metadata-mapping table.
        let metadata = self.window.table(METADATA_TABLE);
        metadata.initialize_as_full();
        for (i, f) in metadata_frames.iter().enumerate() {
            metadata.store_entry(i, PageEntry::window_page(*f));
        }

        // The initial general-purpose table: entry 0 maps the directory,
        // the rest is a live free list.
        let initial = self.window.table(INITIAL_TABLE);
        initial.initialize_free_list();
        initial.set_and_preserve_metadata(0, PageEntry::window_page(directory_frame));

        // The directory sees the three tables at their slots.
        let directory = self.window.page_table_at(DIRECTORY_PAGE);
        for (i, f) in table_frames.iter().enumerate() {
            directory.store_entry(i, PageEntry::window_page(*f));
        }

        // window pages now live: 3 tables, 3 metadata pages, the directory
        self.live_window_pages.store(7, Ordering::Release);
        // the directory occupies the initial table's entry 0
        self.window
            .metadata_word(u32::from(INITIAL_TABLE))
            .store(1, Ordering::Release);
    }

    /// The frame source backing this manager.
    pub fn frame_source(&self) -> &S {
        &self.frames
    }

    /// Count of window pages currently mapped (tables, metadata,
    /// supplements and reserve stock).
    #[must_use]
    pub fn live_window_pages(&self) -> usize {
        self.live_window_pages.load(Ordering::Acquire)
    }

    /// Snapshot of the partially-occupied ring heads.
    #[must_use]
    pub fn partially_occupied_ring_state(&self) -> RingState {
        RingState {
            read_head: self.por.read_head(),
            written_limit: self.por.written_limit(),
            write_head: self.por.write_head(),
        }
    }

    /// Occupancy of the reserve pool.
    #[must_use]
    pub fn reserve_pool_occupancy(&self) -> usize {
        self.reserve.occupancy()
    }

    // ---- internal entry allocation -------------------------------------

    /// Allocate one internal page-table entry and return its window page
    /// index. The entry's virtual address is
    /// `window_base + index * SMALL_PAGE_SIZE`; the caller decides what to
    /// map there.
    ///
    /// Spins through ring refills and table materialization; panics only if
    /// physical memory is exhausted while materializing a new table.
    pub fn allocate_internal_page_table_entry(&self) -> u32 {
        loop {
            let read_head = self.por.read_head();
            if read_head != self.por.written_limit() {
                let table_index = self.por.ring_at(read_head);
                if self.por.is_full(table_index) {
                    // stale slot; the winner is still advancing the head
                    core::hint::spin_loop();
                    continue;
                }
                let table = self.window.table(table_index);
                if let Some(entry) = table.allocate_entry() {
                    self.window
                        .metadata_word(u32::from(table_index))
                        .fetch_add(1, Ordering::AcqRel);
                    return u32::from(table_index) * ENTRIES_PER_TABLE as u32 + entry as u32;
                }
                self.mark_table_full(table_index);
            } else {
                self.allocate_new_page_table_if_necessary();
                core::hint::spin_loop();
            }
        }
    }

    /// Return an internal entry to its table's free list.
    pub fn free_internal_page_table_entry(&self, window_page: u32) {
        let table_index = (window_page as usize / ENTRIES_PER_TABLE) as u16;
        let entry = window_page as usize % ENTRIES_PER_TABLE;
        self.window.table(table_index).free_entry(entry);
        self.window
            .metadata_word(u32::from(table_index))
            .fetch_sub(1, Ordering::AcqRel);
        self.mark_table_partially_occupied(table_index);
    }

    fn mark_table_full(&self, table_index: u16) {
        if self.por.mark_full_state(table_index, true) {
            // we won the transition, so the dequeue is exclusively ours
            debug_assert_eq!(
                self.por.ring_at(self.por.read_head()),
                table_index,
                "table marked full was not at the ring head"
            );
            self.por.advance_read_head();
            self.por.mark_partial_state(table_index, false);
        }
    }

    fn mark_table_partially_occupied(&self, table_index: u16) {
        if self.por.mark_partial_state(table_index, true) {
            // we won the transition and owe the ring a slot
            let slot = loop {
                let prev = self.por.write_head();
                if self.por.try_advance_write_head(prev) {
                    break prev;
                }
            };
            self.por.ring_store(slot, table_index);
            self.por.mark_full_state(table_index, false);
            kernel_hal::memory_fence();
            self.por.publish_written_limit(slot);
        }
    }

    /// If the ring is drained, claim responsibility for materializing a new
    /// internal page table and publishing it.
    fn allocate_new_page_table_if_necessary(&self) {
        let prev = self.por.write_head();
        if self.por.read_head() != prev {
            return;
        }
        if !self.por.try_advance_write_head(prev) {
            return;
        }
        // we hold the claimed ring slot exclusively; nobody else can be in
        // this block concurrently
        let table_index = self.unpopulated_head.load(Ordering::Acquire);
        assert!(
            table_index < ENTRIES_PER_TABLE,
            "page-table window exhausted"
        );
        let table_frame = self
            .frames
            .allocate_small_page()
            .expect("out of physical memory materializing a page table");
        let metadata_frame = self
            .frames
            .allocate_small_page()
            .expect("out of physical memory materializing a metadata page");

        let t = table_index as u16;
        self.window
            .table(MAPPING_TABLE)
            .store_entry(table_index, PageEntry::window_page(table_frame));
        self.window
            .table(METADATA_TABLE)
            .store_entry(table_index, PageEntry::window_page(metadata_frame));
        self.window.zero_page(table_index as u32);
        self.window.zero_page(METADATA_FIRST_PAGE + table_index as u32);
        self.window.table(t).initialize_free_list();
        self.window
            .page_table_at(DIRECTORY_PAGE)
            .store_entry(table_index, PageEntry::window_page(table_frame));
        self.por.ring_store(prev, t);
        self.por.mark_partial_state(t, true);
        self.unpopulated_head.store(table_index + 1, Ordering::Release);
        self.live_window_pages.fetch_add(2, Ordering::AcqRel);
        log::trace!("materialized internal page table {table_index}");
        kernel_hal::memory_fence();
        self.por.publish_written_limit(prev);
    }

    // ---- window page allocation ----------------------------------------

    /// Allocate a frame and map it at a fresh window page. Returns `None`
    /// on physical memory exhaustion.
    fn allocate_window_page(&self) -> Option<PageInfo> {
        let window_page = self.allocate_internal_page_table_entry();
        let Some(phys) = self.frames.allocate_small_page() else {
            self.free_internal_page_table_entry(window_page);
            return None;
        };
        let table_index = (window_page as usize / ENTRIES_PER_TABLE) as u16;
        let entry = window_page as usize % ENTRIES_PER_TABLE;
        self.window
            .table(table_index)
            .set_and_preserve_metadata(entry, PageEntry::window_page(phys));
        self.live_window_pages.fetch_add(1, Ordering::AcqRel);
        Some(PageInfo { phys, window_page })
    }

    /// Queue a window page for retirement: its translation is dropped on
    /// every processor before the frame goes back to the frame source.
    fn free_window_page(&self, window_page: u32) {
        let phys = self.window.entry_for_page(window_page).frame();
        let info = PageInfo { phys, window_page };
        while !self.overflow.push(info, &self.blank_bitmap) {
            // ring full: drain our own share to make room
            self.process_overflow_pool();
            core::hint::spin_loop();
        }
    }

    /// Process this processor's share of pending invalidations, retiring
    /// entries every processor has acknowledged. Must be called
    /// periodically on every processor (interrupt return, allocator entry).
    pub fn process_overflow_pool(&self) {
        let pid = kernel_hal::current_processor_id() as usize;
        self.overflow.process(
            pid,
            self.meaningful_bitmap_words,
            |page| kernel_hal::invlpg(self.window.virt_of_page(page.window_page)),
            |page| {
                self.frames.free_small_page(page.phys);
                self.free_internal_page_table_entry(page.window_page);
                self.live_window_pages.fetch_sub(1, Ordering::AcqRel);
            },
        );
    }

    // ---- reserve pool --------------------------------------------------

    /// Refill the reserve pool when it has drained below its threshold.
    /// Called from mapping entry points, where no table lock is held.
    pub fn ensure_reserve_pool(&self) {
        if self.reserve.occupancy() >= RESERVE_POOL_LAZY_FILL_THRESHOLD {
            return;
        }
        while self.reserve.occupancy() < RESERVE_POOL_DEFAULT_FILL {
            match self.allocate_window_page() {
                Some(page) => {
                    if !self.reserve.push(page) {
                        self.free_window_page(page.window_page);
                        break;
                    }
                }
                None => {
                    log::warn!("reserve pool refill stopped: physical memory exhausted");
                    break;
                }
            }
        }
    }

    /// A pre-mapped window page for a new table: reserve stock first, the
    /// frame source as fallback.
    pub(crate) fn take_page_for_table(&self) -> Option<PageInfo> {
        self.reserve.pop().or_else(|| self.allocate_window_page())
    }

    // ---- flush planners ------------------------------------------------

    /// Push a flush planner for the current processor.
    ///
    /// # Safety
    /// `planner` must stay alive and pinned until popped, and must not be
    /// accessed by the caller while pushed. Push and pop must happen on the
    /// same processor.
    pub unsafe fn push_flush_planner(&self, mut planner: NonNull<dyn FlushPlanner>) {
        let slot = &self.planner_slots[kernel_hal::current_processor_id() as usize];
        unsafe {
            planner.as_mut().set_previous(slot.top());
            slot.set_top(Some(planner));
        }
    }

    /// Pop the current processor's top flush planner.
    ///
    /// # Safety
    /// Must pair with [`push_flush_planner`](Self::push_flush_planner) on
    /// the same processor.
    pub unsafe fn pop_flush_planner(&self) -> Option<NonNull<dyn FlushPlanner>> {
        let slot = &self.planner_slots[kernel_hal::current_processor_id() as usize];
        unsafe {
            let top = slot.top()?;
            slot.set_top(top.as_ref().previous());
            Some(top)
        }
    }

    /// Report an invalidation to the active planner, or issue it directly
    /// when none is pushed.
    pub(crate) fn note_mapping_change(&self, va: VirtualAddress) {
        let slot = &self.planner_slots[kernel_hal::current_processor_id() as usize];
        unsafe {
            match slot.top() {
                Some(mut planner) => planner.as_mut().note_mapping_change(va),
                None => kernel_hal::invlpg(va),
            }
        }
    }

    // ---- structure installation ----------------------------------------

    /// Install a composite structure as the active address space of the
    /// current processor.
    pub fn install_page_structure(&self, composite: &CompositeHandle) {
        let root = self
            .window
            .entry_for_page(composite.pml4_window_page())
            .frame();
        let cr3 = Cr3::from_root(root, composite.pcid());
        // SAFETY: the composite's top-level table is a live window page and
        // carries whatever kernel mappings its partials contributed; the
        // caller picks composites that keep the kernel mapped.
        unsafe { cr3.write() };
        self.installed[kernel_hal::current_processor_id() as usize]
            .store(cr3.into_bits(), Ordering::Release);
    }

    /// The structure most recently installed on the current processor.
    #[must_use]
    pub fn get_current_page_structure(&self) -> Option<InstalledStructure> {
        let raw = self.installed[kernel_hal::current_processor_id() as usize]
            .load(Ordering::Acquire);
        if raw == 0 {
            return None;
        }
        let cr3 = Cr3::from_bits(raw);
        Some(InstalledStructure {
            root: cr3.root_phys(),
            pcid: cr3.pcid(),
        })
    }

    // ---- window access for the address-space layer ---------------------

    pub(crate) fn window(&self) -> &Window {
        &self.window
    }

    /// Child-index slots of the supplement attached to `table_page`.
    pub(crate) fn supplement_slots_of(
        &self,
        table_page: u32,
    ) -> &[core::sync::atomic::AtomicU32; ENTRIES_PER_TABLE] {
        let table = self.window.page_table_at(table_page);
        debug_assert!(table.has_supplement(), "table carries no supplement");
        let page = self.supplements.lookup(table.supplement_index());
        self.window.supplement_slots(page)
    }

    /// Allocate and zero a page-table page for the address-space layer,
    /// attaching a supplementary metadata page when the table will link
    /// child tables. `None` on physical memory exhaustion.
    pub(crate) fn allocate_user_table(&self, with_supplement: bool) -> Option<(u32, PhysicalAddress)> {
        let info = self.take_page_for_table()?;
        self.window.zero_page(info.window_page);
        if with_supplement {
            let Some(supplement) = self.take_page_for_table() else {
                self.free_window_page(info.window_page);
                return None;
            };
            self.window.zero_page(supplement.window_page);
            let id = self.supplements.register(supplement.window_page);
            self.window.page_table_at(info.window_page).attach_supplement(id);
        }
        Some((info.window_page, info.phys))
    }

    /// Retire a user table (and its supplement, if any) through the
    /// overflow pool.
    pub(crate) fn release_user_table(&self, table_page: u32) {
        let table = self.window.page_table_at(table_page);
        if table.has_supplement() {
            let id = table.supplement_index();
            let supplement_page = self.supplements.lookup(id);
            table.detach_supplement();
            self.supplements.release(id);
            self.free_window_page(supplement_page);
        }
        self.free_window_page(table_page);
    }
}
