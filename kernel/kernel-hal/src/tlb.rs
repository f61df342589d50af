use kernel_memory_addresses::VirtualAddress;

#[cfg(not(target_os = "none"))]
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(not(target_os = "none"))]
static INVLPG_COUNT: AtomicUsize = AtomicUsize::new(0);
#[cfg(not(target_os = "none"))]
static INVLTLB_COUNT: AtomicUsize = AtomicUsize::new(0);
#[cfg(not(target_os = "none"))]
static INVLPCID_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Invalidate the TLB entry for one page on the executing processor.
#[cfg(target_os = "none")]
pub fn invlpg(va: VirtualAddress) {
    // SAFETY: INVLPG is always safe at CPL0; it only drops a TLB entry.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Invalidate the TLB entry for one page (hosted stand-in, counts calls).
#[cfg(not(target_os = "none"))]
pub fn invlpg(va: VirtualAddress) {
    let _ = va;
    INVLPG_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Flush the whole TLB of the executing processor.
///
/// With `flush_global` set, entries marked global are dropped as well (by
/// toggling CR4.PGE); otherwise a CR3 reload suffices.
#[cfg(target_os = "none")]
pub fn invltlb(flush_global: bool) {
    unsafe {
        if flush_global {
            let cr4: u64;
            core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
            const PGE: u64 = 1 << 7;
            core::arch::asm!("mov cr4, {}", in(reg) cr4 & !PGE, options(nostack, preserves_flags));
            core::arch::asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
        } else {
            let cr3: u64;
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}

/// Flush the whole TLB (hosted stand-in, counts calls).
#[cfg(not(target_os = "none"))]
pub fn invltlb(flush_global: bool) {
    let _ = flush_global;
    INVLTLB_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Invalidate all TLB entries tagged with `pcid` on the executing processor.
#[cfg(target_os = "none")]
pub fn invlpcid(pcid: u16) {
    // INVPCID type 1: single-context invalidation for the PCID in the descriptor.
    let descriptor: [u64; 2] = [pcid as u64, 0];
    unsafe {
        core::arch::asm!(
            "invpcid {}, [{}]",
            in(reg) 1u64,
            in(reg) &raw const descriptor,
            options(nostack, preserves_flags),
        );
    }
}

/// Invalidate all TLB entries tagged with `pcid` (hosted stand-in).
#[cfg(not(target_os = "none"))]
pub fn invlpcid(pcid: u16) {
    let _ = pcid;
    INVLPCID_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Number of [`invlpg`] calls since the last counter reset (hosted only).
#[cfg(not(target_os = "none"))]
#[must_use]
pub fn invlpg_count() -> usize {
    INVLPG_COUNT.load(Ordering::Relaxed)
}

/// Number of [`invltlb`] calls since the last counter reset (hosted only).
#[cfg(not(target_os = "none"))]
#[must_use]
pub fn invltlb_count() -> usize {
    INVLTLB_COUNT.load(Ordering::Relaxed)
}

/// Number of [`invlpcid`] calls since the last counter reset (hosted only).
#[cfg(not(target_os = "none"))]
#[must_use]
pub fn invlpcid_count() -> usize {
    INVLPCID_COUNT.load(Ordering::Relaxed)
}

/// Reset the hosted TLB instrumentation counters.
#[cfg(not(target_os = "none"))]
pub fn reset_tlb_counters() {
    INVLPG_COUNT.store(0, Ordering::Relaxed);
    INVLTLB_COUNT.store(0, Ordering::Relaxed);
    INVLPCID_COUNT.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosted_tlb_ops_count() {
        reset_tlb_counters();
        invlpg(VirtualAddress::new(0xFFFF_FFFF_4000_0000));
        invlpg(VirtualAddress::new(0xFFFF_FFFF_4000_1000));
        invltlb(true);
        invlpcid(3);
        assert_eq!(invlpg_count(), 2);
        assert_eq!(invltlb_count(), 1);
        assert_eq!(invlpcid_count(), 1);
    }
}
