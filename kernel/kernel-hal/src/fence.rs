use core::sync::atomic::Ordering;

/// Full memory fence.
///
/// Orders all prior loads and stores before all later ones, both for the
/// compiler and the processor.
#[inline(always)]
pub fn memory_fence() {
    core::sync::atomic::fence(Ordering::SeqCst);
}

/// Compiler-only fence; no instruction is emitted.
#[inline(always)]
pub fn compiler_fence() {
    core::sync::atomic::compiler_fence(Ordering::SeqCst);
}
