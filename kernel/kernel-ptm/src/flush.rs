//! TLB flush planning.
//!
//! Mutating a live mapping requires invalidation work. Rather than hard-code
//! `invlpg` after every write, the manager reports each change to the
//! per-processor *flush planner* stack: the planner on top decides when the
//! invalidations are issued, so a batch of mutations can be flushed with one
//! full TLB flush, or deferred to a natural barrier.
//!
//! Planners are stack-allocated by the caller and linked through a
//! previous-planner pointer; pushing and popping never allocates.

use core::ptr::NonNull;
use kernel_memory_addresses::VirtualAddress;

/// A receiver for invalidation work on one processor.
///
/// # Safety
/// Implementations must keep the previous-planner link exactly as handed to
/// [`set_previous`](Self::set_previous); the manager relies on it to unwind
/// the stack.
pub unsafe trait FlushPlanner {
    /// A mapping for `va` changed on this processor; the translation must be
    /// invalidated before the planner is considered done.
    fn note_mapping_change(&mut self, va: VirtualAddress);

    /// Install the link to the planner below this one.
    fn set_previous(&mut self, prev: Option<NonNull<dyn FlushPlanner>>);

    /// The planner below this one.
    fn previous(&self) -> Option<NonNull<dyn FlushPlanner>>;
}

/// The default policy: invalidate immediately.
#[derive(Default)]
pub struct ImmediateFlushPlanner {
    prev: Option<NonNull<dyn FlushPlanner>>,
}

impl ImmediateFlushPlanner {
    #[must_use]
    pub const fn new() -> Self {
        Self { prev: None }
    }
}

unsafe impl FlushPlanner for ImmediateFlushPlanner {
    fn note_mapping_change(&mut self, va: VirtualAddress) {
        kernel_hal::invlpg(va);
    }

    fn set_previous(&mut self, prev: Option<NonNull<dyn FlushPlanner>>) {
        self.prev = prev;
    }

    fn previous(&self) -> Option<NonNull<dyn FlushPlanner>> {
        self.prev
    }
}

/// Batches invalidations for a group of mutations; falls back to a full TLB
/// flush when the batch overflows.
pub struct BatchFlushPlanner<const CAPACITY: usize = 32> {
    prev: Option<NonNull<dyn FlushPlanner>>,
    pending: [VirtualAddress; CAPACITY],
    len: usize,
    overflowed: bool,
}

impl<const CAPACITY: usize> Default for BatchFlushPlanner<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAPACITY: usize> BatchFlushPlanner<CAPACITY> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            prev: None,
            pending: [VirtualAddress::zero(); CAPACITY],
            len: 0,
            overflowed: false,
        }
    }

    /// Number of queued page invalidations.
    #[must_use]
    pub const fn pending_count(&self) -> usize {
        self.len
    }

    /// Issue everything queued so far.
    pub fn flush(&mut self) {
        if self.overflowed {
            kernel_hal::invltlb(false);
        } else {
            for va in &self.pending[..self.len] {
                kernel_hal::invlpg(*va);
            }
        }
        self.len = 0;
        self.overflowed = false;
    }
}

impl<const CAPACITY: usize> Drop for BatchFlushPlanner<CAPACITY> {
    fn drop(&mut self) {
        self.flush();
    }
}

unsafe impl<const CAPACITY: usize> FlushPlanner for BatchFlushPlanner<CAPACITY> {
    fn note_mapping_change(&mut self, va: VirtualAddress) {
        if self.len == CAPACITY {
            self.overflowed = true;
        } else {
            self.pending[self.len] = va;
            self.len += 1;
        }
    }

    fn set_previous(&mut self, prev: Option<NonNull<dyn FlushPlanner>>) {
        self.prev = prev;
    }

    fn previous(&self) -> Option<NonNull<dyn FlushPlanner>> {
        self.prev
    }
}

/// Per-processor top-of-stack pointer.
///
/// Only ever touched by the owning processor, which is what makes the plain
/// interior mutability sound.
pub(crate) struct PlannerSlot {
    top: core::cell::UnsafeCell<Option<NonNull<dyn FlushPlanner>>>,
}

unsafe impl Send for PlannerSlot {}
unsafe impl Sync for PlannerSlot {}

impl PlannerSlot {
    pub(crate) const fn new() -> Self {
        Self {
            top: core::cell::UnsafeCell::new(None),
        }
    }

    /// # Safety
    /// Called only from the owning processor.
    pub(crate) unsafe fn top(&self) -> Option<NonNull<dyn FlushPlanner>> {
        unsafe { *self.top.get() }
    }

    /// # Safety
    /// Called only from the owning processor.
    pub(crate) unsafe fn set_top(&self, planner: Option<NonNull<dyn FlushPlanner>>) {
        unsafe { *self.top.get() = planner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // one test so the process-global TLB counters see no interference
    #[test]
    fn batch_planner_defers_flushes_and_overflows() {
        kernel_hal::reset_tlb_counters();
        let mut planner = BatchFlushPlanner::<8>::new();
        for i in 0..5u64 {
            planner.note_mapping_change(VirtualAddress::new(0x1000 * i));
        }
        assert_eq!(planner.pending_count(), 5);
        assert_eq!(kernel_hal::invlpg_count(), 0, "batched changes must not flush yet");
        planner.flush();
        assert_eq!(kernel_hal::invlpg_count(), 5);

        let before_full = kernel_hal::invltlb_count();
        let mut small = BatchFlushPlanner::<4>::new();
        for i in 0..9u64 {
            small.note_mapping_change(VirtualAddress::new(0x1000 * i));
        }
        small.flush();
        assert_eq!(kernel_hal::invlpg_count(), 5, "overflow must not invlpg");
        assert_eq!(kernel_hal::invltlb_count(), before_full + 1);
    }
}
