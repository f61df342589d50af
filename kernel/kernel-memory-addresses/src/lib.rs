//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses used by the physical page
//! allocator, the page table manager and the kernel heap.
//!
//! Virtual and physical addresses are both 64-bit quantities, and mixing them
//! up is one of the classic ways to corrupt a kernel. [`PhysicalAddress`] and
//! [`VirtualAddress`] make the distinction explicit at compile time while
//! remaining zero-cost wrappers around `u64`; there is no conversion between
//! the two, so code that translates has to spell the translation out.
//! Pointer bridging exists only on the virtual side, where it is meaningful.
//!
//! Page sizes are expressed through the [`PageSize`] marker trait with the
//! two granularities the memory subsystem supports: [`Size4K`] small pages
//! and [`Size2M`] big pages ([`SMALL_PAGES_PER_BIG`] small pages each).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod address;
mod page_size;

pub use address::*;
pub use page_size::*;

/// Number of [`Size4K`] pages that tile one [`Size2M`] page.
pub const SMALL_PAGES_PER_BIG: usize = (Size2M::SIZE / Size4K::SIZE) as usize;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two; this is not checked at runtime.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(4096, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + (a - 1)` must not overflow.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_page_offsets() {
        let va = VirtualAddress::new(0x1234_5678_9ABC_DEF0);
        assert_eq!(va.offset_in_page::<Size4K>(), 0xEF0);
        assert_eq!(va.offset_in_page::<Size2M>(), 0x1C_DEF0);

        let pa = PhysicalAddress::new(0x0000_0008_1234_5678);
        assert_eq!(pa.offset_in_page::<Size4K>(), 0x678);
        assert_eq!(
            pa.offset_in_page::<Size2M>(),
            pa.as_u64() % Size2M::SIZE
        );
    }

    #[test]
    fn physical_arithmetic_and_alignment() {
        let p = PhysicalAddress::new(0x20_0000);
        assert_eq!((p + 0x1000).as_u64(), 0x20_1000);
        assert_eq!((p + 0x1000) - p, 0x1000);
        assert!(p.is_aligned_to(Size2M::SIZE));
        assert!(!(p + 0x1000).is_aligned_to(Size2M::SIZE));
        assert!(p > PhysicalAddress::zero());
    }

    #[test]
    fn virtual_pointer_round_trip() {
        let x = 42u32;
        let va = VirtualAddress::from_ptr(&raw const x);
        let p: *const u32 = va.as_ptr();
        assert_eq!(unsafe { *p }, 42);
        assert_eq!(va, VirtualAddress::new(&raw const x as usize as u64));
    }

    #[test]
    fn formatting_tags_the_address_space() {
        let pa = PhysicalAddress::new(0xABC);
        let va = VirtualAddress::new(0xABC);
        assert!(format!("{pa:?}").starts_with("PA("));
        assert!(format!("{va:?}").starts_with("VA("));
        assert_eq!(format!("{pa}"), format!("{va}"));
    }

    #[test]
    fn small_pages_per_big() {
        assert_eq!(SMALL_PAGES_PER_BIG, 512);
        assert_eq!(align_up(Size4K::SIZE + 1, Size2M::SIZE), Size2M::SIZE);
        assert_eq!(align_down(Size2M::SIZE - 1, Size4K::SIZE), Size2M::SIZE - Size4K::SIZE);
    }
}
