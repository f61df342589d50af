//! The two address spaces, as distinct integer newtypes.
//!
//! Both types are generated from one template so they stay method-for-method
//! identical without any common supertype a caller could use to sneak one
//! past an API expecting the other.

use crate::PageSize;
use core::fmt;
use core::ops::{Add, Sub};
use core::ptr::NonNull;

macro_rules! address_kind {
    ($(#[$docs:meta])* $name:ident, $tag:literal) => {
        $(#[$docs])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(u64);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            #[inline]
            #[must_use]
            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Byte offset of this address inside its enclosing page of
            /// size `S`.
            #[inline]
            #[must_use]
            pub const fn offset_in_page<S: PageSize>(self) -> u64 {
                self.0 % S::SIZE
            }

            /// Whether the address is a multiple of `alignment`.
            #[inline]
            #[must_use]
            pub const fn is_aligned_to(self, alignment: u64) -> bool {
                self.0 % alignment == 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "(0x{:016X})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:016X}", self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl Add<u64> for $name {
            type Output = Self;

            #[inline]
            fn add(self, bytes: u64) -> Self {
                Self(self.0 + bytes)
            }
        }

        impl Sub<$name> for $name {
            type Output = u64;

            /// Byte distance `self - rhs`.
            #[inline]
            fn sub(self, rhs: $name) -> u64 {
                self.0 - rhs.0
            }
        }
    };
}

address_kind! {
    /// An address in physical memory (RAM / MMIO).
    ///
    /// Physical addresses are plain numbers to the kernel and are never
    /// dereferenced directly; code that needs the bytes behind one goes
    /// through an explicit mapping first.
    PhysicalAddress, "PA"
}

address_kind! {
    /// A page-table translated address.
    VirtualAddress, "VA"
}

// Only virtual addresses bridge to and from pointers; a physical address
// converted this way would be exactly the confusion these types exist to
// rule out.
impl VirtualAddress {
    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    #[inline]
    #[must_use]
    pub fn from_nonnull<T>(ptr: NonNull<T>) -> Self {
        Self::from_ptr(ptr.as_ptr())
    }

    /// Reinterpret as a const pointer.
    ///
    /// The address itself is just data; dereferencing the result is only
    /// sound if the address is actually mapped in the current address space.
    #[inline]
    #[must_use]
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    /// Reinterpret as a mut pointer. See [`as_ptr`](Self::as_ptr).
    #[inline]
    #[must_use]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }
}

const _: () = assert!(
    size_of::<usize>() == size_of::<u64>(),
    "addresses assume a 64-bit platform"
);
