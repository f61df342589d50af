//! Allocator statistics.

/// Counters maintained by the coarse allocator.
#[derive(Default, Clone, Copy)]
pub(crate) struct CoarseStats {
    /// Bytes obtained from the backend, span headers included.
    pub total_system_memory: usize,
    /// Bytes inside currently allocated blocks, block headers included.
    pub total_committed_bytes: usize,
    /// Bytes spent on span headers.
    pub total_span_header_bytes: usize,
    /// Sum of the sizes callers actually asked for.
    #[cfg(feature = "stats")]
    pub total_requested_bytes: usize,
}

/// Snapshot returned by [`InternalAllocator::stats`](crate::InternalAllocator::stats).
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct AllocatorStats {
    /// Bytes obtained from the backend and still held.
    pub total_system_memory: usize,
    /// Bytes used by live blocks plus span headers.
    pub total_used_bytes: usize,
    /// Sum of the sizes callers actually asked for.
    #[cfg(feature = "stats")]
    pub total_requested_bytes: usize,
}

impl AllocatorStats {
    /// Bookkeeping overhead: bytes held for live allocations beyond what
    /// callers asked for.
    #[cfg(feature = "stats")]
    #[must_use]
    pub fn metadata_overhead(&self) -> usize {
        self.total_used_bytes - self.total_requested_bytes
    }
}
