use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// CR3 — address-space root register with PCID enabled (CR4.PCIDE = 1).
///
/// Holds the physical base address of the top-level page table plus the
/// 12-bit process-context identifier that tags TLB entries created under
/// this root.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–11 — PCID: process-context identifier.
    #[bits(12)]
    pub pcid: u16,

    /// Bits 12–51 — top-level table physical base >> 12.
    #[bits(40)]
    root_base_4k: u64,

    /// Bits 52–62 — Reserved (must be 0 when written).
    #[bits(11)]
    pub reserved: u16,

    /// Bit 63 — when set on a write, TLB entries for the PCID are preserved.
    pub preserve_translations: bool,
}

impl Cr3 {
    /// Create a `Cr3` value from a 4 KiB-aligned root table address and a PCID.
    #[must_use]
    pub fn from_root(root_phys: PhysicalAddress, pcid: u16) -> Self {
        debug_assert!(
            root_phys.is_aligned_to(4096),
            "page-structure root must be 4K-aligned"
        );
        debug_assert!(pcid < 4096, "PCID is a 12-bit identifier");
        Self::new()
            .with_pcid(pcid)
            .with_root_base_4k(root_phys.as_u64() >> 12)
    }

    /// Return the full physical address of the root table.
    #[must_use]
    pub fn root_phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.root_base_4k() << 12)
    }

    /// Read the current CR3 image.
    #[cfg(target_os = "none")]
    #[must_use]
    pub fn read() -> Self {
        let raw: u64;
        // SAFETY: reading CR3 has no side effects at CPL0.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) raw, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(raw)
    }

    /// Install this image as the active address-space root.
    ///
    /// # Safety
    /// The root must point at a valid top-level page table whose kernel
    /// mappings cover the executing code, or the processor faults
    /// unrecoverably on the next fetch.
    #[cfg(target_os = "none")]
    pub unsafe fn write(self) {
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) self.into_bits(), options(nostack, preserves_flags));
        }
    }

    /// Read the current CR3 image (hosted stand-in: process-global cell).
    #[cfg(not(target_os = "none"))]
    #[must_use]
    pub fn read() -> Self {
        Self::from_bits(mock::CR3.load(core::sync::atomic::Ordering::Acquire))
    }

    /// Install this image (hosted stand-in: process-global cell).
    ///
    /// # Safety
    /// Mirrors the bare-metal contract; the hosted version only records the
    /// value so tests can observe structure switches.
    #[cfg(not(target_os = "none"))]
    pub unsafe fn write(self) {
        mock::CR3.store(self.into_bits(), core::sync::atomic::Ordering::Release);
    }
}

#[cfg(not(target_os = "none"))]
mod mock {
    use core::sync::atomic::AtomicU64;

    pub static CR3: AtomicU64 = AtomicU64::new(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_root_and_pcid() {
        let cr3 = Cr3::from_root(PhysicalAddress::new(0x1234_5000), 7);
        assert_eq!(cr3.root_phys().as_u64(), 0x1234_5000);
        assert_eq!(cr3.pcid(), 7);
        assert!(!cr3.preserve_translations());
    }

    #[test]
    fn hosted_write_is_observable() {
        let cr3 = Cr3::from_root(PhysicalAddress::new(0xABCD_E000), 12);
        unsafe { cr3.write() };
        assert_eq!(Cr3::read().root_phys().as_u64(), 0xABCD_E000);
        assert_eq!(Cr3::read().pcid(), 12);
    }
}
