use core::sync::atomic::{AtomicUsize, Ordering};

/// Dense logical processor index in `[0, processor_count())`.
pub type ProcessorId = u16;

/// Upper bound on supported logical processors.
pub const MAX_PROCESSOR_COUNT: usize = 256;

/// Number of logical processors, published once by boot code.
static PROCESSOR_COUNT: AtomicUsize = AtomicUsize::new(1);

/// Publish the processor count.
///
/// Called once during bring-up before any allocator is initialized with the
/// same count.
pub fn init_processor_topology(count: usize) {
    assert!(count >= 1 && count <= MAX_PROCESSOR_COUNT);
    PROCESSOR_COUNT.store(count, Ordering::Release);
}

/// Number of logical processors.
#[must_use]
pub fn processor_count() -> usize {
    PROCESSOR_COUNT.load(Ordering::Acquire)
}

/// Identity of the executing processor.
///
/// Guaranteed to be in `[0, processor_count())`. On the bare-metal target the
/// value is read from `IA32_TSC_AUX`, which boot code programs with the dense
/// index of each application processor before it enters the kernel proper.
#[cfg(target_os = "none")]
#[must_use]
pub fn current_processor_id() -> ProcessorId {
    let aux: u32;
    // SAFETY: RDTSCP is unprivileged reads of TSC + IA32_TSC_AUX.
    unsafe {
        core::arch::asm!(
            "rdtscp",
            out("ecx") aux,
            out("eax") _,
            out("edx") _,
            options(nomem, nostack, preserves_flags),
        );
    }
    aux as ProcessorId
}

#[cfg(not(target_os = "none"))]
std::thread_local! {
    static MOCK_PROCESSOR_ID: core::cell::Cell<ProcessorId> = const { core::cell::Cell::new(0) };
}

/// Identity of the executing processor (hosted stand-in, per thread).
#[cfg(not(target_os = "none"))]
#[must_use]
pub fn current_processor_id() -> ProcessorId {
    MOCK_PROCESSOR_ID.with(core::cell::Cell::get)
}

/// Set the processor identity reported to the calling thread.
#[cfg(not(target_os = "none"))]
pub fn set_current_processor(id: ProcessorId) {
    assert!((id as usize) < processor_count());
    MOCK_PROCESSOR_ID.with(|c| c.set(id));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processor_identity_is_per_thread() {
        init_processor_topology(4);
        set_current_processor(2);
        assert_eq!(current_processor_id(), 2);

        std::thread::spawn(|| {
            assert_eq!(current_processor_id(), 0);
            set_current_processor(3);
            assert_eq!(current_processor_id(), 3);
        })
        .join()
        .unwrap();

        assert_eq!(current_processor_id(), 2);
    }
}
