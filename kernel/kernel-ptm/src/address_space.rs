//! Address structures: partial and composite handles and the mapping API.
//!
//! A *partial* structure owns a contiguous virtual sub-range whose base is
//! aligned to the top-level stride (512 GiB) and whose size is a positive
//! multiple of it; it owns the whole page-table subtree below its top-level
//! slots. A *composite* structure is a full address space: one top-level
//! table assembled from partials plus a PCID, installable on a processor.
//!
//! All tables are window pages. Parent tables record each child's window
//! page index in their supplementary metadata page, which gives walks a
//! deterministic physical-to-window translation without raw pointer cycles.

use crate::entry::{PageEntry, PageMappingCacheType, PageMappingPermissions};
use crate::table::{ENTRIES_PER_TABLE, PageTable};
use crate::{FrameSource, PageTableManager};
use kernel_memory_addresses::{PageSize as PageSizeMarker, PhysicalAddress, Size2M, Size4K, VirtualAddress};

extern crate alloc;
use alloc::vec::Vec;

/// Span of virtual address space covered by one top-level entry (512 GiB).
pub const TOP_LEVEL_STRIDE: u64 = 1 << 39;

/// Granularity of one mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageSize {
    /// 4 KiB, mapped at the lowest level.
    Small,
    /// 2 MiB, mapped one level up.
    Big,
}

impl PageSize {
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Small => Size4K::SIZE,
            Self::Big => Size2M::SIZE,
        }
    }
}

/// Mapping failure. Contract violations (duplicate map, unmap of an absent
/// page) are panics, not errors; this only covers resource exhaustion.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of physical memory while allocating an inner page table")]
    OutOfMemory,
}

/// A contiguous virtual sub-range and its owned page-table subtree.
pub struct PartialHandle {
    base: VirtualAddress,
    top_level_count: usize,
    /// Window page of the second-level table for each covered top-level
    /// slot.
    pdpts: Vec<u32>,
}

impl PartialHandle {
    #[must_use]
    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.top_level_count as u64 * TOP_LEVEL_STRIDE
    }

    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        va >= self.base && (va.as_u64() - self.base.as_u64()) < self.size()
    }

    fn pdpt_for(&self, va: VirtualAddress) -> u32 {
        assert!(self.contains(va), "address outside the partial's range: {va}");
        let slot = ((va.as_u64() - self.base.as_u64()) / TOP_LEVEL_STRIDE) as usize;
        self.pdpts[slot]
    }

    /// Top-level slot index of the first covered entry.
    fn first_top_level_slot(&self) -> usize {
        ((self.base.as_u64() >> 39) & 0x1FF) as usize
    }
}

/// A complete address space: a top-level table plus its PCID.
pub struct CompositeHandle {
    pcid: u16,
    pml4_page: u32,
}

impl CompositeHandle {
    #[must_use]
    pub fn pcid(&self) -> u16 {
        self.pcid
    }

    pub(crate) fn pml4_window_page(&self) -> u32 {
        self.pml4_page
    }
}

/// Either kind of address structure, for the query surface.
#[derive(Copy, Clone)]
pub enum StructureRef<'a> {
    Partial(&'a PartialHandle),
    Composite(&'a CompositeHandle),
}

impl<'a> From<&'a PartialHandle> for StructureRef<'a> {
    fn from(p: &'a PartialHandle) -> Self {
        Self::Partial(p)
    }
}

impl<'a> From<&'a CompositeHandle> for StructureRef<'a> {
    fn from(c: &'a CompositeHandle) -> Self {
        Self::Composite(c)
    }
}

const fn level_index(va: VirtualAddress, shift: u32) -> usize {
    ((va.as_u64() >> shift) & 0x1FF) as usize
}

struct LeafRef {
    table_page: u32,
    index: usize,
    entry: PageEntry,
    big: bool,
}

impl<S: FrameSource> PageTableManager<S> {
    // ---- structure lifecycle -------------------------------------------

    /// Create a partial structure owning `[base, base + size)`.
    ///
    /// `base` must be aligned to [`TOP_LEVEL_STRIDE`] and `size` a positive
    /// multiple of it.
    pub fn make_partial_page_structure(
        &self,
        base: VirtualAddress,
        size: u64,
    ) -> Result<PartialHandle, MapError> {
        assert!(
            base.is_aligned_to(TOP_LEVEL_STRIDE),
            "partial base must be aligned to the top-level stride"
        );
        assert!(
            size > 0 && size % TOP_LEVEL_STRIDE == 0,
            "partial size must be a positive multiple of the top-level stride"
        );
        let count = (size / TOP_LEVEL_STRIDE) as usize;
        assert!(
            ((base.as_u64() >> 39) & 0x1FF) as usize + count <= ENTRIES_PER_TABLE,
            "partial range crosses the top-level table boundary"
        );
        let mut pdpts = Vec::with_capacity(count);
        for _ in 0..count {
            match self.allocate_user_table(true) {
                Some((page, _)) => pdpts.push(page),
                None => {
                    for page in pdpts {
                        self.release_user_table(page);
                    }
                    return Err(MapError::OutOfMemory);
                }
            }
        }
        Ok(PartialHandle {
            base,
            top_level_count: count,
            pdpts,
        })
    }

    /// Tear a partial down, retiring every owned table through the overflow
    /// pool. The partial must have been removed from every composite first.
    pub fn destroy_partial_page_structure(&self, partial: PartialHandle) {
        for &pdpt_page in &partial.pdpts {
            let slots = self.supplement_slots_of(pdpt_page);
            for i3 in 0..ENTRIES_PER_TABLE {
                let pd_page = slots[i3].load(core::sync::atomic::Ordering::Acquire);
                if pd_page == 0 {
                    continue;
                }
                let pd_slots = self.supplement_slots_of(pd_page);
                for i2 in 0..ENTRIES_PER_TABLE {
                    let pt_page = pd_slots[i2].load(core::sync::atomic::Ordering::Acquire);
                    if pt_page != 0 {
                        self.release_user_table(pt_page);
                    }
                }
                self.release_user_table(pd_page);
            }
            self.release_user_table(pdpt_page);
        }
    }

    /// Create a composite structure with the given PCID.
    pub fn make_composite_page_structure(&self, pcid: u16) -> Result<CompositeHandle, MapError> {
        assert!(pcid < 4096, "PCID is a 12-bit identifier");
        let (pml4_page, _) = self.allocate_user_table(true).ok_or(MapError::OutOfMemory)?;
        Ok(CompositeHandle { pcid, pml4_page })
    }

    /// Tear a composite down. Linked partials survive; only the top-level
    /// table is retired.
    pub fn destroy_composite_page_structure(&self, composite: CompositeHandle) {
        self.release_user_table(composite.pml4_page);
    }

    /// Link every top-level entry of `partial` into `composite`.
    pub fn add_structure_to_composite(
        &self,
        composite: &CompositeHandle,
        partial: &PartialHandle,
    ) {
        let pml4 = self.window().page_table_at(composite.pml4_page);
        pml4.acquire_lock();
        let slots = self.supplement_slots_of(composite.pml4_page);
        let first = partial.first_top_level_slot();
        for k in 0..partial.top_level_count {
            let slot = first + k;
            let pdpt_page = partial.pdpts[k];
            let pdpt_phys = self.window().entry_for_page(pdpt_page).frame();
            assert!(
                !pml4.entry(slot).present(),
                "composite top-level slot {slot} is already populated"
            );
            pml4.set_and_preserve_metadata(slot, PageEntry::table_link(pdpt_phys));
            slots[slot].store(pdpt_page, core::sync::atomic::Ordering::Release);
        }
        pml4.set_allocated_count(pml4.allocated_count() + partial.top_level_count as u64);
        pml4.release_lock();
    }

    /// Unlink `partial`'s top-level entries from `composite`.
    pub fn remove_structure_from_composite(
        &self,
        composite: &CompositeHandle,
        partial: &PartialHandle,
    ) {
        let pml4 = self.window().page_table_at(composite.pml4_page);
        pml4.acquire_lock();
        let slots = self.supplement_slots_of(composite.pml4_page);
        let first = partial.first_top_level_slot();
        for k in 0..partial.top_level_count {
            let slot = first + k;
            assert!(
                pml4.entry(slot).present()
                    && slots[slot].load(core::sync::atomic::Ordering::Acquire)
                        == partial.pdpts[k],
                "composite top-level slot {slot} does not hold this partial"
            );
            pml4.set_and_preserve_metadata(slot, PageEntry::new());
            slots[slot].store(0, core::sync::atomic::Ordering::Release);
        }
        pml4.set_allocated_count(pml4.allocated_count() - partial.top_level_count as u64);
        pml4.release_lock();
    }

    // ---- mapping -------------------------------------------------------

    /// Ensure the child table behind `parent[index]` exists, allocating it
    /// when missing. Caller holds the parent's lock.
    fn ensure_child_table(
        &self,
        parent_page: u32,
        index: usize,
        child_is_leaf_table: bool,
    ) -> Result<u32, MapError> {
        let parent = self.window().page_table_at(parent_page);
        let entry = parent.entry(index);
        if entry.present() {
            assert!(
                !entry.big_leaf(),
                "mapping conflicts with an existing big-page mapping"
            );
            let child = self.supplement_slots_of(parent_page)[index]
                .load(core::sync::atomic::Ordering::Acquire);
            debug_assert!(child != 0, "present link without a recorded child");
            return Ok(child);
        }
        let (child_page, child_phys) = self
            .allocate_user_table(!child_is_leaf_table)
            .ok_or(MapError::OutOfMemory)?;
        parent.set_and_preserve_metadata(index, PageEntry::table_link(child_phys));
        self.supplement_slots_of(parent_page)[index]
            .store(child_page, core::sync::atomic::Ordering::Release);
        parent.set_allocated_count(parent.allocated_count() + 1);
        Ok(child_page)
    }

    /// Install one mapping `virt → phys` in `partial`.
    ///
    /// Mapping an already-present page is a contract violation and panics.
    pub fn map_address(
        &self,
        partial: &PartialHandle,
        phys: PhysicalAddress,
        virt: VirtualAddress,
        size: PageSize,
        perms: PageMappingPermissions,
        cache: Option<PageMappingCacheType>,
    ) -> Result<(), MapError> {
        let cache = cache.unwrap_or(PageMappingCacheType::FullyCached);
        assert!(
            virt.is_aligned_to(size.bytes()) && phys.is_aligned_to(size.bytes()),
            "mapping endpoints must be aligned to the page size"
        );
        self.ensure_reserve_pool();
        self.process_overflow_pool();

        // Hand-over-hand locking down the levels: the child's lock is taken
        // while the parent is still held, so a concurrent lazy reclaim can
        // never retire a table we are descending into.
        let pdpt_page = partial.pdpt_for(virt);
        let pdpt = self.window().page_table_at(pdpt_page);
        pdpt.acquire_lock();
        let pd_page = match self.ensure_child_table(pdpt_page, level_index(virt, 30), false) {
            Ok(page) => page,
            Err(e) => {
                pdpt.release_lock();
                return Err(e);
            }
        };
        let pd = self.window().page_table_at(pd_page);
        pd.acquire_lock();
        pdpt.release_lock();

        match size {
            PageSize::Big => {
                let i2 = level_index(virt, 21);
                assert!(
                    !pd.entry(i2).present(),
                    "mapping an already-present page at {virt}"
                );
                pd.set_and_preserve_metadata(i2, PageEntry::leaf(phys, true, perms, cache));
                pd.set_allocated_count(pd.allocated_count() + 1);
                pd.release_lock();
            }
            PageSize::Small => {
                let pt_page = match self.ensure_child_table(pd_page, level_index(virt, 21), true) {
                    Ok(page) => page,
                    Err(e) => {
                        pd.release_lock();
                        return Err(e);
                    }
                };
                let pt = self.window().page_table_at(pt_page);
                pt.acquire_lock();
                pd.release_lock();
                let i1 = level_index(virt, 12);
                assert!(
                    !pt.entry(i1).present(),
                    "mapping an already-present page at {virt}"
                );
                pt.set_and_preserve_metadata(i1, PageEntry::leaf(phys, false, perms, cache));
                pt.set_allocated_count(pt.allocated_count() + 1);
                pt.release_lock();
            }
        }
        self.note_mapping_change(virt);
        Ok(())
    }

    /// Batched mapping of same-sized pages at consecutive addresses.
    pub fn map_addresses(
        &self,
        partial: &PartialHandle,
        frames: &[PhysicalAddress],
        base: VirtualAddress,
        size: PageSize,
        perms: PageMappingPermissions,
        cache: Option<PageMappingCacheType>,
    ) -> Result<(), MapError> {
        for (i, frame) in frames.iter().enumerate() {
            self.map_address(
                partial,
                *frame,
                base + i as u64 * size.bytes(),
                size,
                perms,
                cache,
            )?;
        }
        Ok(())
    }

    /// Remove the mapping at `virt`, lazily reclaiming inner tables that
    /// become empty. Unmapping an absent page panics.
    pub fn unmap_address(&self, partial: &PartialHandle, virt: VirtualAddress) {
        self.process_overflow_pool();
        let pdpt_page = partial.pdpt_for(virt);
        let pdpt = self.window().page_table_at(pdpt_page);
        let i3 = level_index(virt, 30);

        // hand-over-hand locking, as in map_address
        pdpt.acquire_lock();
        assert!(
            pdpt.entry(i3).present(),
            "unmapping a non-present page at {virt}"
        );
        let pd_page =
            self.supplement_slots_of(pdpt_page)[i3].load(core::sync::atomic::Ordering::Acquire);
        let pd = self.window().page_table_at(pd_page);
        let i2 = level_index(virt, 21);
        pd.acquire_lock();
        pdpt.release_lock();
        let e2 = pd.entry(i2);
        assert!(e2.present(), "unmapping a non-present page at {virt}");
        if e2.big_leaf() {
            pd.set_and_preserve_metadata(i2, PageEntry::new());
            pd.set_allocated_count(pd.allocated_count() - 1);
            let remaining = pd.allocated_count();
            pd.release_lock();
            self.note_mapping_change(virt);
            if remaining == 0 {
                self.reclaim_child_table(pdpt_page, i3, pd_page);
            }
            return;
        }
        let pt_page =
            self.supplement_slots_of(pd_page)[i2].load(core::sync::atomic::Ordering::Acquire);
        let pt = self.window().page_table_at(pt_page);
        let i1 = level_index(virt, 12);
        pt.acquire_lock();
        pd.release_lock();
        assert!(
            pt.entry(i1).present(),
            "unmapping a non-present page at {virt}"
        );
        pt.set_and_preserve_metadata(i1, PageEntry::new());
        pt.set_allocated_count(pt.allocated_count() - 1);
        let remaining = pt.allocated_count();
        pt.release_lock();
        self.note_mapping_change(virt);

        if remaining == 0 && self.reclaim_child_table(pd_page, i2, pt_page) {
            pd.acquire_lock();
            let empty = pd.allocated_count() == 0;
            pd.release_lock();
            if empty {
                self.reclaim_child_table(pdpt_page, i3, pd_page);
            }
        }
    }

    /// Batched unmap of same-sized pages at consecutive addresses.
    pub fn unmap_addresses(
        &self,
        partial: &PartialHandle,
        base: VirtualAddress,
        count: usize,
        size: PageSize,
    ) {
        for i in 0..count {
            self.unmap_address(partial, base + i as u64 * size.bytes());
        }
    }

    /// Detach `child_page` from `parent[index]` if it is still linked and
    /// still empty, and retire it. Returns whether the child was reclaimed.
    fn reclaim_child_table(&self, parent_page: u32, index: usize, child_page: u32) -> bool {
        let parent = self.window().page_table_at(parent_page);
        parent.acquire_lock();
        let slots = self.supplement_slots_of(parent_page);
        if slots[index].load(core::sync::atomic::Ordering::Acquire) != child_page
            || !parent.entry(index).present()
        {
            parent.release_lock();
            return false;
        }
        let child = self.window().page_table_at(child_page);
        child.acquire_lock();
        if child.allocated_count() != 0 {
            child.release_lock();
            parent.release_lock();
            return false;
        }
        parent.set_and_preserve_metadata(index, PageEntry::new());
        slots[index].store(0, core::sync::atomic::Ordering::Release);
        parent.set_allocated_count(parent.allocated_count() - 1);
        child.release_lock();
        parent.release_lock();
        self.release_user_table(child_page);
        true
    }

    // ---- queries -------------------------------------------------------

    fn top_level_table_for<'a>(
        &self,
        structure: StructureRef<'a>,
        va: VirtualAddress,
    ) -> Option<u32> {
        match structure {
            StructureRef::Partial(p) => {
                if !p.contains(va) {
                    return None;
                }
                Some(p.pdpt_for(va))
            }
            StructureRef::Composite(c) => {
                let pml4 = self.window().page_table_at(c.pml4_page);
                let i4 = level_index(va, 39);
                if !pml4.entry(i4).present() {
                    return None;
                }
                let child = self.supplement_slots_of(c.pml4_page)[i4]
                    .load(core::sync::atomic::Ordering::Acquire);
                (child != 0).then_some(child)
            }
        }
    }

    fn walk_to_leaf<'a>(
        &self,
        structure: StructureRef<'a>,
        va: VirtualAddress,
    ) -> Option<LeafRef> {
        let pdpt_page = self.top_level_table_for(structure, va)?;
        let pdpt = self.window().page_table_at(pdpt_page);
        let e3 = pdpt.entry(level_index(va, 30));
        if !e3.present() {
            return None;
        }
        let pd_page = self.supplement_slots_of(pdpt_page)[level_index(va, 30)]
            .load(core::sync::atomic::Ordering::Acquire);
        if pd_page == 0 {
            return None;
        }
        let pd = self.window().page_table_at(pd_page);
        let i2 = level_index(va, 21);
        let e2 = pd.entry(i2);
        if !e2.present() {
            return None;
        }
        if e2.big_leaf() {
            return Some(LeafRef {
                table_page: pd_page,
                index: i2,
                entry: e2,
                big: true,
            });
        }
        let pt_page =
            self.supplement_slots_of(pd_page)[i2].load(core::sync::atomic::Ordering::Acquire);
        if pt_page == 0 {
            return None;
        }
        let pt = self.window().page_table_at(pt_page);
        let i1 = level_index(va, 12);
        let e1 = pt.entry(i1);
        e1.present().then(|| LeafRef {
            table_page: pt_page,
            index: i1,
            entry: e1,
            big: false,
        })
    }

    /// Whether `va` is mapped in `structure`.
    pub fn is_page_present<'a>(
        &self,
        structure: impl Into<StructureRef<'a>>,
        va: VirtualAddress,
    ) -> bool {
        self.walk_to_leaf(structure.into(), va).is_some()
    }

    /// Whether the hardware marked the mapping at `va` accessed.
    pub fn was_page_accessed<'a>(
        &self,
        structure: impl Into<StructureRef<'a>>,
        va: VirtualAddress,
    ) -> Option<bool> {
        Some(self.walk_to_leaf(structure.into(), va)?.entry.accessed())
    }

    /// Granularity of the mapping at `va`.
    pub fn get_page_size<'a>(
        &self,
        structure: impl Into<StructureRef<'a>>,
        va: VirtualAddress,
    ) -> Option<PageSize> {
        let leaf = self.walk_to_leaf(structure.into(), va)?;
        Some(if leaf.big { PageSize::Big } else { PageSize::Small })
    }

    /// Access rights of the mapping at `va`.
    pub fn get_page_permissions<'a>(
        &self,
        structure: impl Into<StructureRef<'a>>,
        va: VirtualAddress,
    ) -> Option<PageMappingPermissions> {
        Some(self.walk_to_leaf(structure.into(), va)?.entry.permissions())
    }

    /// Caching policy of the mapping at `va`.
    pub fn get_page_caching_policy<'a>(
        &self,
        structure: impl Into<StructureRef<'a>>,
        va: VirtualAddress,
    ) -> Option<PageMappingCacheType> {
        let leaf = self.walk_to_leaf(structure.into(), va)?;
        Some(leaf.entry.caching(leaf.big))
    }

    /// Physical address `va` translates to.
    pub fn resolve_virtual_address<'a>(
        &self,
        structure: impl Into<StructureRef<'a>>,
        va: VirtualAddress,
    ) -> Option<PhysicalAddress> {
        let leaf = self.walk_to_leaf(structure.into(), va)?;
        Some(if leaf.big {
            leaf.entry.big_leaf_frame() + va.offset_in_page::<Size2M>()
        } else {
            leaf.entry.frame() + va.offset_in_page::<Size4K>()
        })
    }

    // ---- mutators (partials only) --------------------------------------

    fn modify_leaf(
        &self,
        partial: &PartialHandle,
        va: VirtualAddress,
        f: impl FnOnce(PageEntry, bool) -> PageEntry,
    ) {
        let leaf = self
            .walk_to_leaf(partial.into(), va)
            .unwrap_or_else(|| panic!("modifying a non-present mapping at {va}"));
        let table: &PageTable = self.window().page_table_at(leaf.table_page);
        table.acquire_lock();
        let entry = table.entry(leaf.index);
        assert!(entry.present(), "mapping at {va} vanished under mutation");
        table.set_and_preserve_metadata(leaf.index, f(entry, leaf.big));
        table.release_lock();
        self.note_mapping_change(va);
    }

    /// Clear the accessed flag of the mapping at `va`.
    pub fn reset_access_flag(&self, partial: &PartialHandle, va: VirtualAddress) {
        self.modify_leaf(partial, va, |e, _| e.with_accessed(false));
    }

    /// Set the accessed flag of the mapping at `va`.
    pub fn set_access_flag(&self, partial: &PartialHandle, va: VirtualAddress) {
        self.modify_leaf(partial, va, |e, _| e.with_accessed(true));
    }

    /// Replace the access rights of the mapping at `va`.
    pub fn set_page_permissions(
        &self,
        partial: &PartialHandle,
        va: VirtualAddress,
        perms: PageMappingPermissions,
    ) {
        self.modify_leaf(partial, va, |e, _| {
            e.with_writable(perms.contains(PageMappingPermissions::WRITE))
                .with_user(perms.contains(PageMappingPermissions::USER))
                .with_no_execute(!perms.contains(PageMappingPermissions::EXECUTE))
        });
    }

    /// Replace the caching policy of the mapping at `va`.
    pub fn set_page_caching_policy(
        &self,
        partial: &PartialHandle,
        va: VirtualAddress,
        cache: PageMappingCacheType,
    ) {
        self.modify_leaf(partial, va, |e, big| {
            // rebuild the leaf with the new policy, carrying over the frame,
            // rights and hardware-maintained flags
            let frame = if big { e.big_leaf_frame() } else { e.frame() };
            PageEntry::leaf(frame, big, e.permissions(), cache)
                .with_accessed(e.accessed())
                .with_dirty(e.dirty())
                .with_global(e.global())
        });
    }

    /// Range form of [`reset_access_flag`](Self::reset_access_flag).
    pub fn reset_access_flag_range(
        &self,
        partial: &PartialHandle,
        base: VirtualAddress,
        len: u64,
    ) {
        self.for_each_mapped_page(partial, base, len, |va| self.reset_access_flag(partial, va));
    }

    /// Range form of [`set_access_flag`](Self::set_access_flag).
    pub fn set_access_flag_range(&self, partial: &PartialHandle, base: VirtualAddress, len: u64) {
        self.for_each_mapped_page(partial, base, len, |va| self.set_access_flag(partial, va));
    }

    /// Range form of [`set_page_permissions`](Self::set_page_permissions).
    pub fn set_page_permissions_range(
        &self,
        partial: &PartialHandle,
        base: VirtualAddress,
        len: u64,
        perms: PageMappingPermissions,
    ) {
        self.for_each_mapped_page(partial, base, len, |va| {
            self.set_page_permissions(partial, va, perms);
        });
    }

    /// Range form of [`set_page_caching_policy`](Self::set_page_caching_policy).
    pub fn set_page_caching_policy_range(
        &self,
        partial: &PartialHandle,
        base: VirtualAddress,
        len: u64,
        cache: PageMappingCacheType,
    ) {
        self.for_each_mapped_page(partial, base, len, |va| {
            self.set_page_caching_policy(partial, va, cache);
        });
    }

    /// Step through `[base, base + len)` leaf by leaf, honoring each
    /// mapping's own granularity; unmapped stretches advance by small pages.
    fn for_each_mapped_page(
        &self,
        partial: &PartialHandle,
        base: VirtualAddress,
        len: u64,
        mut f: impl FnMut(VirtualAddress),
    ) {
        let mut offset = 0;
        while offset < len {
            let va = base + offset;
            match self.get_page_size(partial, va) {
                Some(size) => {
                    f(va);
                    offset += size.bytes();
                }
                None => offset += PageSize::Small.bytes(),
            }
        }
    }
}
