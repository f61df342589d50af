//! Translation granularities, expressed at the type level.

/// A supported page size. The subsystem deals in exactly two: the base
/// granule and the big page one level up.
pub trait PageSize: Copy + Eq + core::fmt::Debug {
    /// Bytes covered by one page of this size.
    const SIZE: u64;
    /// Bits of in-page offset (`SIZE == 1 << SHIFT`).
    const SHIFT: u32;
}

/// The 4 KiB base translation granule.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Size4K;

impl PageSize for Size4K {
    const SIZE: u64 = 1 << 12;
    const SHIFT: u32 = 12;
}

/// The 2 MiB big page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Size2M;

impl PageSize for Size2M {
    const SIZE: u64 = 1 << 21;
    const SHIFT: u32 = 21;
}

const _: () = {
    assert!(Size4K::SIZE == 1 << Size4K::SHIFT);
    assert!(Size2M::SIZE == 1 << Size2M::SHIFT);
    assert!(Size2M::SIZE % Size4K::SIZE == 0);
};
