//! Memory spans and the blocks inside them.
//!
//! A span is one contiguous region obtained from the backend. Its header
//! sits at the span base and tracks three intrusive trees over the blocks in
//! the span buffer: allocated blocks by address (for validating frees), free
//! blocks by size (best fit), and free blocks by address (coalescing).
//!
//! Block headers are written straight into span memory. An allocated block
//! has two layouts: *compact*, where the user pointer sits immediately after
//! the header, and *aligned*, where alignment padding was absorbed into the
//! header and an extra `data_begin` pointer records the canonical user
//! pointer. Frees of anything that is not a canonical user pointer are
//! rejected.

use crate::rbtree::{Links, RbAdapter, RbTree};
use crate::stats::CoarseStats;
use core::ptr::null_mut;

/// Free block header. `size` includes the header itself.
#[repr(C)]
pub(crate) struct FreeBlockHeader {
    size: usize,
    /// Largest free block size anywhere in this node's by-size subtree.
    pub(crate) max_size_in_subtree: usize,
    by_size: Links<FreeBlockHeader>,
    by_addr: Links<FreeBlockHeader>,
}

/// Allocated block header (compact layout). The size word carries the
/// aligned-layout discriminator in its low bit; sizes are multiples of the
/// header alignment so the bit is free.
#[repr(C)]
pub(crate) struct AllocatedBlockHeader {
    size_and_flags: usize,
    by_addr: Links<AllocatedBlockHeader>,
    #[cfg(feature = "stats")]
    requested_size: usize,
}

/// Allocated block header, aligned layout: the canonical user pointer
/// follows at a distance and is recorded explicitly.
#[repr(C)]
pub(crate) struct AlignedAllocatedBlockHeader {
    pub(crate) header: AllocatedBlockHeader,
    data_begin: *mut u8,
}

const ALIGNED_FLAG: usize = 1;

impl AllocatedBlockHeader {
    pub(crate) fn size(&self) -> usize {
        self.size_and_flags & !ALIGNED_FLAG
    }

    pub(crate) fn is_aligned_layout(&self) -> bool {
        self.size_and_flags & ALIGNED_FLAG != 0
    }
}

/// Smallest block the allocator will ever carve out. Leftovers below this
/// are absorbed into the neighboring allocation.
pub(crate) const MINIMUM_BLOCK_SIZE: usize = 2 * max3(
    size_of::<FreeBlockHeader>(),
    size_of::<AllocatedBlockHeader>(),
    size_of::<AlignedAllocatedBlockHeader>(),
);

const fn max3(a: usize, b: usize, c: usize) -> usize {
    let ab = if a > b { a } else { b };
    if ab > c { ab } else { c }
}

const BLOCK_ALIGN: usize = align_of::<AllocatedBlockHeader>();

/// Alignment the compact layout guarantees for the user pointer.
const GUARANTEED_ALIGN_AFTER_HEADER: usize = {
    let sz = size_of::<AllocatedBlockHeader>();
    let pow2 = 1 << sz.trailing_zeros();
    if pow2 < BLOCK_ALIGN { pow2 } else { BLOCK_ALIGN }
};

const ALIGNED_HEADER_EXTRA: usize =
    size_of::<AlignedAllocatedBlockHeader>() - size_of::<AllocatedBlockHeader>();

const fn align_up(x: usize, a: usize) -> usize {
    (x + a - 1) & !(a - 1)
}

const fn align_down(x: usize, a: usize) -> usize {
    x & !(a - 1)
}

/// Worst-case block size needed to satisfy `(size, align)`, counting header
/// space and alignment slack.
///
/// The payload is clamped so the carved block always reaches the minimum
/// block size; without this, a tiny payload with a huge alignment could pick
/// a free block too small for the mandatory `header + MINIMUM_BLOCK_SIZE`
/// footprint.
pub(crate) const fn worst_case_padded_size(size: usize, align: usize) -> usize {
    let floor = MINIMUM_BLOCK_SIZE - size_of::<AllocatedBlockHeader>();
    let size = if size < floor { floor } else { size };
    if GUARANTEED_ALIGN_AFTER_HEADER & (align - 1) != 0 {
        size + align + size_of::<AlignedAllocatedBlockHeader>()
    } else {
        size + size_of::<AllocatedBlockHeader>()
    }
}

/// First address suitable for the user buffer inside a free block starting
/// at `base`, leaving room for the appropriate header before it.
const fn first_aligned_addr_after_header_space(base: usize, align: usize) -> usize {
    let mut out = base + size_of::<AllocatedBlockHeader>();
    if out & (align - 1) != 0 {
        out += ALIGNED_HEADER_EXTRA;
        out = align_up(out, align);
    }
    out
}

/// Where the allocated header goes for a user buffer at `ret`.
const fn header_location_below(ret: usize) -> usize {
    align_down(ret - size_of::<AllocatedBlockHeader>(), BLOCK_ALIGN)
}

// ---- tree adapters -----------------------------------------------------

pub(crate) struct FreeBySize;

unsafe impl RbAdapter for FreeBySize {
    type Node = FreeBlockHeader;

    fn links(node: *mut FreeBlockHeader) -> *mut Links<FreeBlockHeader> {
        unsafe { &raw mut (*node).by_size }
    }

    unsafe fn less(a: *const FreeBlockHeader, b: *const FreeBlockHeader) -> bool {
        unsafe { ((*a).size, a as usize) < ((*b).size, b as usize) }
    }

    unsafe fn update_augment(node: *mut FreeBlockHeader) {
        unsafe {
            let links = Self::links(node);
            let mut m = (*node).size;
            let l = (*links).left;
            let r = (*links).right;
            if !l.is_null() {
                m = m.max((*l).max_size_in_subtree);
            }
            if !r.is_null() {
                m = m.max((*r).max_size_in_subtree);
            }
            (*node).max_size_in_subtree = m;
        }
    }
}

pub(crate) struct FreeByAddr;

unsafe impl RbAdapter for FreeByAddr {
    type Node = FreeBlockHeader;

    fn links(node: *mut FreeBlockHeader) -> *mut Links<FreeBlockHeader> {
        unsafe { &raw mut (*node).by_addr }
    }

    unsafe fn less(a: *const FreeBlockHeader, b: *const FreeBlockHeader) -> bool {
        (a as usize) < (b as usize)
    }
}

pub(crate) struct AllocatedByAddr;

unsafe impl RbAdapter for AllocatedByAddr {
    type Node = AllocatedBlockHeader;

    fn links(node: *mut AllocatedBlockHeader) -> *mut Links<AllocatedBlockHeader> {
        unsafe { &raw mut (*node).by_addr }
    }

    unsafe fn less(a: *const AllocatedBlockHeader, b: *const AllocatedBlockHeader) -> bool {
        (a as usize) < (b as usize)
    }
}

// ---- span header -------------------------------------------------------

/// Header embedded at the base of every span.
#[repr(C)]
pub(crate) struct SpanHeader {
    /// Span size in bytes, header included.
    pub(crate) span_size: usize,
    /// A span seeded from a fixed pre-mapped buffer is never returned to the
    /// backend.
    pub(crate) releasable: bool,
    pub(crate) by_addr: Links<SpanHeader>,
    pub(crate) by_free: Links<SpanHeader>,
    /// Free bytes in the buffer, block headers included.
    pub(crate) free_space: usize,
    /// Size of the largest free block in this span.
    pub(crate) largest_free_block: usize,
    /// Augment over the span-by-free-space tree.
    pub(crate) max_largest_free_in_subtree: usize,
    allocated_blocks: RbTree<AllocatedByAddr>,
    free_by_size: RbTree<FreeBySize>,
    free_by_addr: RbTree<FreeByAddr>,
}

impl SpanHeader {
    /// Write a fresh span header at `base` and seed the buffer with one free
    /// block covering it.
    ///
    /// # Safety
    /// `[base, base + span_size)` is exclusively owned, writable memory with
    /// at least page alignment.
    pub(crate) unsafe fn initialize(
        base: *mut u8,
        span_size: usize,
        releasable: bool,
    ) -> *mut SpanHeader {
        let span = base.cast::<SpanHeader>();
        unsafe {
            span.write(SpanHeader {
                span_size,
                releasable,
                by_addr: Links::new(),
                by_free: Links::new(),
                free_space: 0,
                largest_free_block: 0,
                max_largest_free_in_subtree: 0,
                allocated_blocks: RbTree::new(),
                free_by_size: RbTree::new(),
                free_by_addr: RbTree::new(),
            });
            let first = Self::buffer_start(span);
            let free_space = base as usize + span_size - first;
            (*span).free_space = free_space;
            let block = first as *mut FreeBlockHeader;
            (*block).size = free_space;
            (*span).insert_free_block(block);
        }
        span
    }

    fn buffer_start(span: *const SpanHeader) -> usize {
        align_up(span as usize + size_of::<SpanHeader>(), BLOCK_ALIGN)
    }

    /// Usable buffer bytes behind the header.
    pub(crate) fn buffer_size(&self) -> usize {
        let base = core::ptr::from_ref(self) as usize;
        base + self.span_size - Self::buffer_start(self)
    }

    pub(crate) fn is_fully_free(&self) -> bool {
        self.free_space == self.buffer_size()
    }

    pub(crate) fn contains(&self, ptr: *const u8) -> bool {
        let base = core::ptr::from_ref(self) as usize;
        (ptr as usize) >= base && (ptr as usize) < base + self.span_size
    }

    unsafe fn insert_free_block(&mut self, block: *mut FreeBlockHeader) {
        unsafe {
            let size = (*block).size;
            (*block).max_size_in_subtree = size;
            self.free_by_size.insert(block);
            self.free_by_addr.insert(block);
            if size > self.largest_free_block {
                self.largest_free_block = size;
            }
        }
    }

    unsafe fn remove_free_block(&mut self, block: *mut FreeBlockHeader) {
        unsafe {
            let size = (*block).size;
            self.free_by_addr.remove(block);
            self.free_by_size.remove(block);
            if self.largest_free_block == size {
                let max = self.free_by_size.max();
                self.largest_free_block = if max.is_null() { 0 } else { (*max).size };
            }
        }
    }

    /// Carve a block for `(size, align)` out of this span, or return null if
    /// no free block fits.
    pub(crate) unsafe fn allocate_block(
        &mut self,
        size: usize,
        align: usize,
        stats: &mut CoarseStats,
    ) -> *mut u8 {
        let padded = worst_case_padded_size(size, align);
        if self.largest_free_block < padded {
            return null_mut();
        }
        unsafe {
            // best fit: smallest free block that surely fits
            let block = self
                .free_by_size
                .ceil_by(|n| ((*n).size, 0usize).cmp(&(padded, 0)));
            assert!(
                !block.is_null(),
                "largest_free_block was stale: no free block fits"
            );
            let free_size = (*block).size;
            self.remove_free_block(block);

            let base = block as usize;
            let end = base + free_size;
            let ret = first_aligned_addr_after_header_space(base, align);
            let mut header_addr = header_location_below(ret);

            // a leftover below the header smaller than the minimum block is
            // absorbed by extending the header downward
            if header_addr - base < MINIMUM_BLOCK_SIZE {
                header_addr = base;
            }

            let mut next_header = align_up(
                (ret + size).max(header_addr + MINIMUM_BLOCK_SIZE),
                BLOCK_ALIGN,
            );
            debug_assert!(next_header <= end, "carved block overruns its free block");
            if end - next_header < MINIMUM_BLOCK_SIZE {
                next_header = end;
            }

            let allocated = header_addr as *mut AllocatedBlockHeader;
            let block_size = next_header - header_addr;
            let compact = header_addr + size_of::<AllocatedBlockHeader>() == ret;
            (*allocated).size_and_flags =
                block_size | if compact { 0 } else { ALIGNED_FLAG };
            if !compact {
                let aligned = allocated.cast::<AlignedAllocatedBlockHeader>();
                (*aligned).data_begin = ret as *mut u8;
            }
            #[cfg(feature = "stats")]
            {
                (*allocated).requested_size = size;
                stats.total_requested_bytes += size;
            }
            self.allocated_blocks.insert(allocated);

            if header_addr != base {
                let below = base as *mut FreeBlockHeader;
                (*below).size = header_addr - base;
                self.insert_free_block(below);
            }
            if next_header != end {
                let above = next_header as *mut FreeBlockHeader;
                (*above).size = end - next_header;
                self.insert_free_block(above);
            }

            self.free_space -= block_size;
            stats.total_committed_bytes += block_size;
            ret as *mut u8
        }
    }

    /// Resolve `ptr` to its allocated block header, rejecting interior and
    /// non-canonical pointers.
    pub(crate) unsafe fn validated_header_for_ptr(
        &self,
        ptr: *const u8,
    ) -> *mut AllocatedBlockHeader {
        unsafe {
            let addr = ptr as usize;
            let header = self
                .allocated_blocks
                .floor_by(|n| (n as usize).cmp(&addr));
            if header.is_null() {
                return null_mut();
            }
            if (*header).is_aligned_layout() {
                let aligned = header.cast::<AlignedAllocatedBlockHeader>();
                if (*aligned).data_begin as usize != addr {
                    return null_mut();
                }
            } else if header as usize + size_of::<AllocatedBlockHeader>() != addr {
                return null_mut();
            }
            header
        }
    }

    pub(crate) unsafe fn is_pointer_allocated(&self, ptr: *const u8) -> bool {
        unsafe { !self.validated_header_for_ptr(ptr).is_null() }
    }

    /// Return a block to the free trees, coalescing with adjacent free
    /// blocks. Returns false for pointers that identify no allocated block.
    pub(crate) unsafe fn free_block(&mut self, ptr: *const u8, stats: &mut CoarseStats) -> bool {
        unsafe {
            let header = self.validated_header_for_ptr(ptr);
            if header.is_null() {
                return false;
            }
            let size = (*header).size();
            #[cfg(feature = "stats")]
            {
                stats.total_requested_bytes -= (*header).requested_size;
            }
            stats.total_committed_bytes -= size;
            self.allocated_blocks.remove(header);

            let free = header.cast::<FreeBlockHeader>();
            (*free).size = size;
            self.insert_free_block(free);
            self.coalesce_adjacent(free);
            self.free_space += size;
            true
        }
    }

    unsafe fn coalesce_adjacent(&mut self, block: *mut FreeBlockHeader) {
        unsafe {
            let addr = block as usize;
            let mut before = RbTree::<FreeByAddr>::prev(block);
            if !before.is_null() && before as usize + (*before).size != addr {
                before = null_mut();
            }
            let mut after = RbTree::<FreeByAddr>::next(block);
            if !after.is_null() && addr + (*block).size != after as usize {
                after = null_mut();
            }
            if before.is_null() && after.is_null() {
                return;
            }

            let mut merged = block;
            self.remove_free_block(block);
            if !before.is_null() {
                self.remove_free_block(before);
                (*before).size += (*merged).size;
                merged = before;
            }
            if !after.is_null() {
                self.remove_free_block(after);
                (*merged).size += (*after).size;
            }
            self.insert_free_block(merged);
        }
    }

    // ---- integrity checks (tests and the debug interface) -------------

    pub(crate) unsafe fn total_free_block_bytes(&self) -> usize {
        let mut out = 0;
        unsafe {
            self.free_by_addr.for_each(|b| out += (*b).size);
        }
        out
    }

    pub(crate) unsafe fn total_allocated_block_bytes(&self) -> usize {
        let mut out = 0;
        unsafe {
            self.allocated_blocks.for_each(|b| out += (*b).size());
        }
        out
    }

    /// Walk every block tree and assert the span invariants.
    pub(crate) unsafe fn validate(&self) {
        unsafe {
            // no two adjacent free blocks may exist
            self.free_by_addr.for_each(|b| {
                let next = RbTree::<FreeByAddr>::next(b);
                if !next.is_null() {
                    assert!(
                        b as usize + (*b).size != next as usize,
                        "adjacent free blocks were not coalesced"
                    );
                }
            });
            // the augmented max must match a recomputation at every node
            self.free_by_addr.for_each(|b| {
                let links = FreeBySize::links(b);
                let mut expect = (*b).size;
                let l = (*links).left;
                let r = (*links).right;
                if !l.is_null() {
                    expect = expect.max((*l).max_size_in_subtree);
                }
                if !r.is_null() {
                    expect = expect.max((*r).max_size_in_subtree);
                }
                assert_eq!((*b).max_size_in_subtree, expect, "stale free-size augment");
            });
            let free = self.total_free_block_bytes();
            let allocated = self.total_allocated_block_bytes();
            assert_eq!(free, self.free_space, "free space accounting diverged");
            assert_eq!(
                free + allocated,
                self.buffer_size(),
                "blocks do not tile the span buffer"
            );
            let max = self.free_by_size.max();
            let largest = if max.is_null() { 0 } else { (*max).size };
            assert_eq!(largest, self.largest_free_block, "stale largest-free-block");
        }
    }
}

// ---- span set adapters -------------------------------------------------

pub(crate) struct SpanByAddr;

unsafe impl RbAdapter for SpanByAddr {
    type Node = SpanHeader;

    fn links(node: *mut SpanHeader) -> *mut Links<SpanHeader> {
        unsafe { &raw mut (*node).by_addr }
    }

    unsafe fn less(a: *const SpanHeader, b: *const SpanHeader) -> bool {
        (a as usize) < (b as usize)
    }
}

pub(crate) struct SpanByFree;

unsafe impl RbAdapter for SpanByFree {
    type Node = SpanHeader;

    fn links(node: *mut SpanHeader) -> *mut Links<SpanHeader> {
        unsafe { &raw mut (*node).by_free }
    }

    unsafe fn less(a: *const SpanHeader, b: *const SpanHeader) -> bool {
        unsafe { ((*a).free_space, a as usize) < ((*b).free_space, b as usize) }
    }

    unsafe fn update_augment(node: *mut SpanHeader) {
        unsafe {
            let links = Self::links(node);
            let mut m = (*node).largest_free_block;
            let l = (*links).left;
            let r = (*links).right;
            if !l.is_null() {
                m = m.max((*l).max_largest_free_in_subtree);
            }
            if !r.is_null() {
                m = m.max((*r).max_largest_free_in_subtree);
            }
            (*node).max_largest_free_in_subtree = m;
        }
    }
}
