//! The coarse allocator: a set of spans searched by best fit.
//!
//! Spans are kept in two intrusive trees: one ordered by start address (for
//! resolving frees) and one ordered by remaining free space, tie-broken by
//! address and augmented with the largest free block in each subtree. The
//! augmentation makes "most occupied span that can still fit this request"
//! an O(log n) descent.

use crate::backend::HeapBackend;
use crate::span::{SpanByAddr, SpanByFree, SpanHeader, worst_case_padded_size};
use crate::stats::CoarseStats;
use crate::rbtree::RbTree;
use core::ptr::{NonNull, null_mut};

/// Spans are never created smaller than this.
pub(crate) const MINIMUM_SPAN_SIZE: usize = 16 * 1024;

pub(crate) struct CoarseAllocator {
    spans_by_free: RbTree<SpanByFree>,
    spans_by_addr: RbTree<SpanByAddr>,
    pub(crate) stats: CoarseStats,
}

impl CoarseAllocator {
    pub(crate) const fn new() -> Self {
        Self {
            spans_by_free: RbTree::new(),
            spans_by_addr: RbTree::new(),
            stats: CoarseStats {
                total_system_memory: 0,
                total_committed_bytes: 0,
                total_span_header_bytes: 0,
                #[cfg(feature = "stats")]
                total_requested_bytes: 0,
            },
        }
    }

    /// Register `[base, base + span_size)` as a new span.
    ///
    /// # Safety
    /// The region is exclusively owned, writable and page-aligned.
    pub(crate) unsafe fn create_span(
        &mut self,
        base: NonNull<u8>,
        span_size: usize,
        releasable: bool,
    ) -> *mut SpanHeader {
        unsafe {
            let span = SpanHeader::initialize(base.as_ptr(), span_size, releasable);
            self.spans_by_addr.insert(span);
            self.spans_by_free.insert(span);
            self.stats.total_system_memory += span_size;
            self.stats.total_span_header_bytes += size_of::<SpanHeader>();
            span
        }
    }

    unsafe fn destroy_span<B: HeapBackend>(&mut self, backend: &mut B, span: *mut SpanHeader) {
        unsafe {
            if !(*span).releasable {
                return;
            }
            self.spans_by_free.remove(span);
            self.spans_by_addr.remove(span);
            let span_size = (*span).span_size;
            self.stats.total_system_memory -= span_size;
            self.stats.total_span_header_bytes -= size_of::<SpanHeader>();
            backend.free_pages(span.cast::<u8>(), span_size / B::SMALL_PAGE_SIZE);
        }
    }

    /// Span whose region contains `ptr`, or null.
    pub(crate) unsafe fn find_span_containing(&self, ptr: *const u8) -> *mut SpanHeader {
        unsafe {
            let span = self.spans_by_addr.floor_by(|s| (s as usize).cmp(&(ptr as usize)));
            if span.is_null() || !(*span).contains(ptr) {
                return null_mut();
            }
            span
        }
    }

    /// Most occupied span that still holds a free block of at least the
    /// worst-case padded size, or null.
    unsafe fn find_most_occupied_span_fitting(&self, padded: usize) -> *mut SpanHeader {
        unsafe {
            let mut best = null_mut();
            let mut cur = self.spans_by_free.root();
            while !cur.is_null() {
                if (*cur).max_largest_free_in_subtree < padded {
                    break;
                }
                let left = span_by_free_left(cur);
                let right = span_by_free_right(cur);
                if (*cur).largest_free_block >= padded {
                    best = cur;
                    cur = left;
                    continue;
                }
                if !left.is_null() && (*left).max_largest_free_in_subtree >= padded {
                    cur = left;
                    continue;
                }
                cur = right;
            }
            best
        }
    }

    /// Allocate `(size, align)` from an existing span or grow a new one.
    pub(crate) unsafe fn allocate<B: HeapBackend>(
        &mut self,
        backend: &mut B,
        size: usize,
        align: usize,
    ) -> *mut u8 {
        unsafe {
            let padded = worst_case_padded_size(size, align);
            let mut span = self.find_most_occupied_span_fitting(padded);
            if span.is_null() {
                let span_size = (2 * padded + size_of::<SpanHeader>())
                    .max(MINIMUM_SPAN_SIZE)
                    .next_multiple_of(B::SMALL_PAGE_SIZE);
                let base = backend.alloc_pages(span_size / B::SMALL_PAGE_SIZE);
                let Some(base) = NonNull::new(base) else {
                    return null_mut();
                };
                log::trace!("coarse allocator grew a {span_size}-byte span");
                span = self.create_span(base, span_size, true);
            }
            // the span's position in the by-free-space tree changes with its
            // free space, so unlink around the mutation
            self.spans_by_free.remove(span);
            let out = (*span).allocate_block(size, align, &mut self.stats);
            self.spans_by_free.insert(span);
            debug_assert!(!out.is_null(), "span lost the block it promised");
            out
        }
    }

    /// Free `ptr` if some span owns it; returns whether it did.
    pub(crate) unsafe fn free<B: HeapBackend>(&mut self, backend: &mut B, ptr: *const u8) -> bool {
        unsafe {
            let span = self.find_span_containing(ptr);
            if span.is_null() {
                return false;
            }
            self.spans_by_free.remove(span);
            let freed = (*span).free_block(ptr, &mut self.stats);
            self.spans_by_free.insert(span);
            if freed && (*span).is_fully_free() && (*span).releasable {
                self.destroy_span(backend, span);
            }
            freed
        }
    }

    pub(crate) unsafe fn is_pointer_allocated(&self, ptr: *const u8) -> bool {
        unsafe {
            let span = self.find_span_containing(ptr);
            !span.is_null() && (*span).is_pointer_allocated(ptr)
        }
    }

    pub(crate) unsafe fn for_each_span(&self, mut f: impl FnMut(*mut SpanHeader)) {
        unsafe { self.spans_by_addr.for_each(|s| f(s)) }
    }

    /// Walk every span and assert its invariants, plus the span-tree
    /// augmentation.
    pub(crate) unsafe fn validate(&self) {
        unsafe {
            self.spans_by_addr.for_each(|s| (*s).validate());
            self.spans_by_free.for_each(|s| {
                let left = span_by_free_left(s);
                let right = span_by_free_right(s);
                let mut expect = (*s).largest_free_block;
                if !left.is_null() {
                    expect = expect.max((*left).max_largest_free_in_subtree);
                }
                if !right.is_null() {
                    expect = expect.max((*right).max_largest_free_in_subtree);
                }
                assert_eq!(
                    (*s).max_largest_free_in_subtree,
                    expect,
                    "stale span-tree augment"
                );
            });
        }
    }
}

fn span_by_free_left(span: *mut SpanHeader) -> *mut SpanHeader {
    unsafe { crate::rbtree::links_left::<SpanByFree>(span) }
}

fn span_by_free_right(span: *mut SpanHeader) -> *mut SpanHeader {
    unsafe { crate::rbtree::links_right::<SpanByFree>(span) }
}
