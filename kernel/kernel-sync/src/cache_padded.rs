use core::ops::{Deref, DerefMut};

/// Cache line size of the reference target, in bytes.
pub const CACHE_LINE_SIZE: usize = 64;

/// Pads and aligns a value to the cache line.
///
/// Arrays of per-processor state (pool bookkeeping, per-processor locks) are
/// written from different cores concurrently; without padding, two neighbors
/// would share a cache line and every update would bounce it between cores.
#[repr(align(64))]
#[derive(Default)]
pub struct CachePadded<T> {
    value: T,
}

const _: () = assert!(align_of::<CachePadded<u8>>() == CACHE_LINE_SIZE);

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_array_elements_do_not_share_lines() {
        let arr = [CachePadded::new(0u8), CachePadded::new(1u8)];
        let a = &raw const arr[0] as usize;
        let b = &raw const arr[1] as usize;
        assert!(b - a >= CACHE_LINE_SIZE);
        assert_eq!(*arr[1], 1);
    }
}
