//! # Kernel Synchronization Primitives
//!
//! Busy-wait locks for the memory-management core. There is no sleep/wake
//! primitive at this layer; every lock spins with a CPU relaxation hint until
//! it acquires. Critical sections are expected to be short.
//!
//! - [`RawSpin`]: a bare test-and-test-and-set lock with exponential
//!   backoff, for code that guards externally-owned state (e.g. one lock
//!   per processor pool).
//! - [`SpinLock`]: a value-carrying spinlock with an RAII guard.
//! - [`CachePadded`]: pads and aligns a value to the cache line so arrays of
//!   per-processor state do not false-share.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod cache_padded;
mod raw_spin;
mod spin_lock;

pub use cache_padded::CachePadded;
pub use raw_spin::RawSpin;
pub use spin_lock::{SpinLock, SpinLockGuard};
