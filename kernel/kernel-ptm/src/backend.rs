//! The heap backend: page-aligned spans for the kernel heap, carved out of
//! a virtual region owned by the page table manager.
//!
//! The backend owns one partial structure covering the kernel heap region
//! and bump-allocates virtual space inside it; every requested span is
//! backed by small frames from the frame source and mapped read/write.
//! Virtual space is not recycled after a span is released — only the frames
//! and the mappings are — which keeps the backend trivially correct and is
//! plenty for a kernel heap that rarely shrinks.

use crate::address_space::{PageSize, PartialHandle, TOP_LEVEL_STRIDE};
use crate::entry::PageMappingPermissions;
use crate::{FrameSource, PageTableManager};
use kernel_heap::HeapBackend;
use kernel_memory_addresses::{PageSize as _, Size4K, VirtualAddress, align_down, align_up};

/// Heap backend over a [`PageTableManager`] and its frame source.
pub struct PtmHeapBackend<'a, S: FrameSource> {
    ptm: &'a PageTableManager<S>,
    partial: Option<PartialHandle>,
    cursor: u64,
    end: u64,
}

impl<'a, S: FrameSource> PtmHeapBackend<'a, S> {
    /// Create a backend serving spans from `[heap_base, heap_base + heap_len)`.
    ///
    /// The enclosing top-level-aligned region must not be claimed by any
    /// other partial structure.
    pub fn new(
        ptm: &'a PageTableManager<S>,
        heap_base: VirtualAddress,
        heap_len: u64,
    ) -> Result<Self, crate::MapError> {
        assert!(heap_base.is_aligned_to(Size4K::SIZE));
        assert!(heap_len > 0 && heap_len % Size4K::SIZE == 0);
        let region_base = align_down(heap_base.as_u64(), TOP_LEVEL_STRIDE);
        let region_len = align_up(heap_base.as_u64() + heap_len, TOP_LEVEL_STRIDE) - region_base;
        let partial =
            ptm.make_partial_page_structure(VirtualAddress::new(region_base), region_len)?;
        Ok(Self {
            ptm,
            partial: Some(partial),
            cursor: heap_base.as_u64(),
            end: heap_base.as_u64() + heap_len,
        })
    }

    fn partial(&self) -> &PartialHandle {
        self.partial.as_ref().expect("partial lives until drop")
    }
}

unsafe impl<S: FrameSource> HeapBackend for PtmHeapBackend<'_, S> {
    fn alloc_pages(&mut self, count: usize) -> *mut u8 {
        let bytes = count as u64 * Size4K::SIZE;
        if self.cursor + bytes > self.end {
            log::warn!("kernel heap region exhausted ({count} pages requested)");
            return core::ptr::null_mut();
        }
        let base = VirtualAddress::new(self.cursor);
        for i in 0..count {
            let va = base + i as u64 * Size4K::SIZE;
            let Some(frame) = self.ptm.frame_source().allocate_small_page() else {
                // roll the partially-built span back
                for j in 0..i {
                    let va = base + j as u64 * Size4K::SIZE;
                    let frame = self
                        .ptm
                        .resolve_virtual_address(self.partial(), va)
                        .expect("span page vanished during rollback");
                    self.ptm.unmap_address(self.partial(), va);
                    self.ptm.frame_source().free_small_page(frame);
                }
                return core::ptr::null_mut();
            };
            self.ptm
                .map_address(
                    self.partial(),
                    frame,
                    va,
                    PageSize::Small,
                    PageMappingPermissions::READ | PageMappingPermissions::WRITE,
                    None,
                )
                .expect("out of memory mapping a heap span");
        }
        self.cursor += bytes;
        base.as_mut_ptr()
    }

    unsafe fn free_pages(&mut self, ptr: *mut u8, count: usize) {
        let base = VirtualAddress::from_ptr(ptr);
        for i in 0..count {
            let va = base + i as u64 * Size4K::SIZE;
            let frame = self
                .ptm
                .resolve_virtual_address(self.partial(), va)
                .expect("releasing an unmapped heap span page");
            self.ptm.unmap_address(self.partial(), va);
            self.ptm.frame_source().free_small_page(frame);
        }
    }
}

impl<S: FrameSource> Drop for PtmHeapBackend<'_, S> {
    fn drop(&mut self) {
        if let Some(partial) = self.partial.take() {
            self.ptm.destroy_partial_page_structure(partial);
        }
    }
}
