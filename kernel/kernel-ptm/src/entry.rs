//! Page-table entry encoding.
//!
//! A page-directory entry is one 64-bit word. The architecture defines which
//! bits are available to the OS, and which of those are available depends on
//! what the entry is: an entry pointing at a table has bits 6, 8–11 and
//! 52–62 free, while an entry sitting on a free list (not present, not
//! referenced by hardware beyond the present bit) can use the whole 1–62
//! window. The metadata accessors below take their bit ranges as const
//! generics and reject out-of-window ranges at compile time.

use bitfield_struct::bitfield;
use bitflags::bitflags;
use kernel_memory_addresses::PhysicalAddress;

bitflags! {
    /// Access rights of a mapping.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PageMappingPermissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const USER = 1 << 3;
    }
}

/// Caching behavior of a mapping, realized through the PWT/PCD/PAT bits.
///
/// Relies on the boot code programming the PAT MSR with the power-on layout
/// extended so that index 4 selects write-combining.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageMappingCacheType {
    FullyCached,
    WriteThrough,
    WriteCombining,
    Uncached,
}

/// One page-directory entry, any level.
#[bitfield(u64)]
pub struct PageEntry {
    /// Present (bit 0).
    pub present: bool,
    /// Writable (bit 1).
    pub writable: bool,
    /// User-accessible (bit 2).
    pub user: bool,
    /// Write-through (bit 3) — PAT selector bit 0.
    pub write_through: bool,
    /// Cache disable (bit 4) — PAT selector bit 1.
    pub cache_disable: bool,
    /// Accessed (bit 5), set by hardware.
    pub accessed: bool,
    /// Dirty (bit 6) on leaves; available on table links.
    pub dirty: bool,
    /// Page-size (bit 7): set on a big-page leaf; PAT selector bit 2 for
    /// small leaves.
    pub big_leaf: bool,
    /// Global (bit 8).
    pub global: bool,
    /// OS-available bits 9–11.
    #[bits(3)]
    pub available_low: u8,
    /// Physical frame bits 51:12.
    #[bits(40)]
    frame_51_12: u64,
    /// OS-available bits 52–62.
    #[bits(11)]
    pub available_high: u16,
    /// No-execute (bit 63).
    pub no_execute: bool,
}

/// PAT selector bit for a big-page leaf (bit 12, where a small leaf keeps
/// its frame bits).
const BIG_LEAF_PAT_BIT: u64 = 1 << 12;

/// Whether `start..=end` lies inside the architecturally available windows
/// for the given entry form.
const fn metadata_range_allowed(start: u32, end: u32, free_entry: bool) -> bool {
    if start > end || end > 63 {
        return false;
    }
    if free_entry {
        start >= 1 && end <= 62
    } else {
        (start == 6 && end == 6) || (start >= 8 && end <= 11) || (start >= 52 && end <= 62)
    }
}

const fn field_mask(start: u32, end: u32) -> u64 {
    (u64::MAX >> (63 - (end - start))) << start
}

impl PageEntry {
    /// Read OS metadata from bits `START..=END`.
    ///
    /// `FREE` selects the free-entry form with its wider available window;
    /// out-of-window ranges fail to compile.
    #[must_use]
    pub const fn local_metadata<const START: u32, const END: u32, const FREE: bool>(self) -> u64 {
        const {
            assert!(
                metadata_range_allowed(START, END, FREE),
                "metadata bits fall outside the architectural available windows"
            );
        }
        (self.into_bits() & field_mask(START, END)) >> START
    }

    /// Write OS metadata into bits `START..=END`.
    #[must_use]
    pub const fn with_local_metadata<const START: u32, const END: u32, const FREE: bool>(
        self,
        value: u64,
    ) -> Self {
        const {
            assert!(
                metadata_range_allowed(START, END, FREE),
                "metadata bits fall outside the architectural available windows"
            );
        }
        let mask = field_mask(START, END);
        Self::from_bits((self.into_bits() & !mask) | ((value << START) & mask))
    }

    /// Frame this entry references.
    #[must_use]
    pub const fn frame(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_51_12() << 12)
    }

    #[must_use]
    pub const fn with_frame(self, frame: PhysicalAddress) -> Self {
        self.with_frame_51_12(frame.as_u64() >> 12)
    }

    /// A link to a child table: present, writable, user-visible so leaf
    /// permissions govern.
    #[must_use]
    pub fn table_link(frame: PhysicalAddress) -> Self {
        debug_assert!(frame.is_aligned_to(4096));
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_frame(frame)
    }

    /// A mapping of one of the manager's own window pages: present,
    /// writable, global, supervisor-only.
    #[must_use]
    pub fn window_page(frame: PhysicalAddress) -> Self {
        debug_assert!(frame.is_aligned_to(4096));
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_global(true)
            .with_frame(frame)
    }

    /// A leaf mapping with the given rights and caching policy.
    #[must_use]
    pub fn leaf(
        frame: PhysicalAddress,
        big: bool,
        perms: PageMappingPermissions,
        cache: PageMappingCacheType,
    ) -> Self {
        let entry = Self::new()
            .with_present(true)
            .with_writable(perms.contains(PageMappingPermissions::WRITE))
            .with_user(perms.contains(PageMappingPermissions::USER))
            .with_no_execute(!perms.contains(PageMappingPermissions::EXECUTE))
            .with_big_leaf(big)
            .with_frame(frame);
        let (pat, pcd, pwt) = match cache {
            PageMappingCacheType::FullyCached => (false, false, false),
            PageMappingCacheType::WriteThrough => (false, false, true),
            PageMappingCacheType::Uncached => (false, true, true),
            PageMappingCacheType::WriteCombining => (true, false, false),
        };
        let entry = entry.with_cache_disable(pcd).with_write_through(pwt);
        if big {
            Self::from_bits(entry.into_bits() | if pat { BIG_LEAF_PAT_BIT } else { 0 })
        } else {
            // PAT selector bit 2 for small leaves is bit 7
            entry.with_big_leaf(pat)
        }
    }

    /// Rights of a leaf mapping.
    #[must_use]
    pub fn permissions(self) -> PageMappingPermissions {
        let mut out = PageMappingPermissions::READ;
        if self.writable() {
            out |= PageMappingPermissions::WRITE;
        }
        if !self.no_execute() {
            out |= PageMappingPermissions::EXECUTE;
        }
        if self.user() {
            out |= PageMappingPermissions::USER;
        }
        out
    }

    /// Caching policy of a leaf mapping.
    #[must_use]
    pub fn caching(self, big: bool) -> PageMappingCacheType {
        let pat = if big {
            self.into_bits() & BIG_LEAF_PAT_BIT != 0
        } else {
            self.big_leaf()
        };
        match (pat, self.cache_disable(), self.write_through()) {
            (true, _, _) => PageMappingCacheType::WriteCombining,
            (false, true, _) => PageMappingCacheType::Uncached,
            (false, false, true) => PageMappingCacheType::WriteThrough,
            (false, false, false) => PageMappingCacheType::FullyCached,
        }
    }

    /// Frame of a big leaf (masking the PAT selector out of bit 12).
    #[must_use]
    pub fn big_leaf_frame(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame().as_u64() & !BIG_LEAF_PAT_BIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trips_in_available_windows() {
        let e = PageEntry::new().with_local_metadata::<52, 61, false>(0x2AB);
        assert_eq!(e.local_metadata::<52, 61, false>(), 0x2AB);
        // neighbors untouched
        assert!(!e.no_execute());
        assert_eq!(e.available_low(), 0);

        let f = PageEntry::new().with_local_metadata::<12, 31, true>(0x9_1234);
        assert_eq!(f.local_metadata::<12, 31, true>(), 0x9_1234);
    }

    #[test]
    fn metadata_coexists_with_a_live_mapping() {
        let frame = PhysicalAddress::new(0x1234_5000);
        let e = PageEntry::table_link(frame).with_local_metadata::<52, 61, false>(77);
        assert_eq!(e.frame(), frame);
        assert!(e.present());
        assert_eq!(e.local_metadata::<52, 61, false>(), 77);
    }

    #[test]
    fn leaf_encoding_round_trips() {
        let frame = PhysicalAddress::new(0x7_F000);
        let perms = PageMappingPermissions::READ
            | PageMappingPermissions::WRITE
            | PageMappingPermissions::USER;
        let e = PageEntry::leaf(frame, false, perms, PageMappingCacheType::WriteThrough);
        assert!(e.present());
        assert_eq!(e.frame(), frame);
        assert_eq!(e.permissions(), perms);
        assert_eq!(e.caching(false), PageMappingCacheType::WriteThrough);
        assert!(e.no_execute());

        let big = PageEntry::leaf(
            PhysicalAddress::new(0x4000_0000),
            true,
            PageMappingPermissions::READ | PageMappingPermissions::EXECUTE,
            PageMappingCacheType::WriteCombining,
        );
        assert!(big.big_leaf());
        assert_eq!(big.caching(true), PageMappingCacheType::WriteCombining);
        assert_eq!(big.big_leaf_frame().as_u64(), 0x4000_0000);
        assert!(!big.no_execute());
    }

    #[test]
    fn range_validity_rules() {
        assert!(metadata_range_allowed(6, 6, false));
        assert!(metadata_range_allowed(8, 11, false));
        assert!(metadata_range_allowed(52, 62, false));
        assert!(!metadata_range_allowed(7, 7, false));
        assert!(!metadata_range_allowed(12, 31, false));
        assert!(metadata_range_allowed(12, 31, true));
        assert!(metadata_range_allowed(1, 62, true));
        assert!(!metadata_range_allowed(0, 5, true));
        assert!(!metadata_range_allowed(40, 63, true));
    }
}
