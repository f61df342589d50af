use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

/// Upper bound on the relaxation burst between acquisition attempts.
///
/// The memory core's locks guard short pool and table edits, so a waiter is
/// usually one or two bursts away from the lock; the cap keeps the stealing
/// path's global lock from punishing latecomers under a convoy.
const BACKOFF_LIMIT: u32 = 64;

/// A bare test-and-test-and-set spinlock with exponential backoff.
///
/// `RawSpin` does not own the data it protects, which makes it suitable for
/// guarding state that lives in caller-managed buffers (such as the
/// per-processor page pools, where one lock in a padded array covers a set
/// of raw-pointer-backed structures). For state the lock can own, prefer
/// [`SpinLock`](crate::SpinLock).
///
/// Waiters spin on plain loads and only retry the atomic exchange once the
/// lock is observed free, with the time between observations doubling up to
/// [`BACKOFF_LIMIT`]. This lock is not fair and not reentrant.
///
/// # Examples
///
/// ```
/// use kernel_sync::RawSpin;
///
/// let pool_lock = RawSpin::new();
/// pool_lock.with(|| {
///     // edit the pool this lock guards
/// });
/// ```
pub struct RawSpin {
    locked: AtomicBool,
}

impl Default for RawSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpin {
    /// A fresh lock, not held by anyone.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Takes the lock, waiting out any current holder.
    #[inline]
    pub fn lock(&self) {
        let mut burst = 1u32;
        loop {
            if self.try_lock() {
                return;
            }
            // wait for the holder on plain loads; every failed observation
            // round doubles the relaxation burst
            while self.locked.load(Ordering::Relaxed) {
                for _ in 0..burst {
                    spin_loop();
                }
                if burst < BACKOFF_LIMIT {
                    burst <<= 1;
                }
            }
        }
    }

    /// One acquisition attempt; `true` means the caller now holds the lock.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Drops the lock.
    ///
    /// # Safety
    ///
    /// The calling thread must be the current holder; unlocking on behalf
    /// of someone else (or nobody) breaks the mutual exclusion every caller
    /// relies on.
    #[inline]
    pub unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Runs `f` with the lock held.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let out = f();
        // SAFETY: acquired right above.
        unsafe { self.unlock() };
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_lock_reports_contention() {
        let lock = RawSpin::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        unsafe { lock.unlock() };
        assert!(lock.try_lock());
        unsafe { lock.unlock() };
    }

    #[test]
    fn lock_waits_out_a_holder() {
        let lock = Arc::new(RawSpin::new());
        lock.lock();
        let contender = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                // backoff path: the lock is held when we arrive
                lock.lock();
                unsafe { lock.unlock() };
            })
        };
        thread::sleep(std::time::Duration::from_millis(10));
        unsafe { lock.unlock() };
        contender.join().unwrap();
    }

    #[test]
    fn mutual_exclusion_across_threads() {
        let lock = Arc::new(RawSpin::new());
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        lock.with(|| {
                            let v = counter.load(Ordering::Relaxed);
                            counter.store(v + 1, Ordering::Relaxed);
                        });
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 40_000);
    }
}
