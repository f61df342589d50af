//! Index newtypes for the pool bookkeeping.
//!
//! The allocator juggles four different index spaces: identities of big and
//! small pages, and slots inside the pool buffers that track them. Mixing
//! those up compiles fine with bare integers and corrupts the pools at
//! runtime, so each space gets its own wrapper.

use core::sync::atomic::{AtomicU16, Ordering};

/// Identity of a big page within its contiguous range (address-derived).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct BigPageIndex(pub u32);

/// Identity of a small page within its big page (`0..SMALL_PAGES_PER_BIG`).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct SmallPageIndex(pub u16);

/// Slot in a big-page pool buffer.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct BigPoolIndex(pub u32);

/// Slot in the small-page sub-pool of one big page.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct SmallPoolIndex(pub u16);

/// Which pool buffer a big page currently belongs to.
///
/// `0` is the global pool; `k + 1` is the local pool of processor `k`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct BufferId(pub u16);

pub(crate) const GLOBAL_POOL: BufferId = BufferId(0);

impl BufferId {
    pub(crate) const fn from_processor(pid: u16) -> Self {
        Self(pid + 1)
    }
}

/// Reverse-map entry: where a big page currently sits.
///
/// The `buffer` field is scanned by other processors outside the owner's
/// lock (bulk free has to discover ownership), so it is accessed atomically.
#[repr(C)]
pub(crate) struct BigPageFreeMapping {
    pub index: BigPoolIndex,
    buffer: AtomicU16,
}

impl BigPageFreeMapping {
    pub(crate) fn new(index: BigPoolIndex, buffer: BufferId) -> Self {
        Self {
            index,
            buffer: AtomicU16::new(buffer.0),
        }
    }

    pub(crate) fn buffer(&self) -> BufferId {
        BufferId(self.buffer.load(Ordering::Relaxed))
    }

    pub(crate) fn set_buffer(&self, id: BufferId) {
        self.buffer.store(id.0, Ordering::Relaxed);
    }
}

/// Per-processor pool bookkeeping.
///
/// The big-page pool of one processor is partitioned into three contiguous
/// zones:
///
/// ```text
/// [0, bottom_of_used_pool)                    fully allocated
/// [bottom_of_used_pool, bottom_of_free_pool)  partially allocated
/// [bottom_of_free_pool, local_pool_size)      fully free
/// ```
#[derive(Default)]
pub(crate) struct LocalPoolInfo {
    pub local_pool_size: usize,
    /// Count of free small pages inside partially-allocated big pages.
    pub free_small_pages_in_partial_allocs: usize,
    /// First slot of the fully-free zone.
    pub bottom_of_free_pool: u32,
    /// First slot of the partially-allocated zone.
    pub bottom_of_used_pool: u32,
}
