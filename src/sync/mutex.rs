//! Forkable mutex - uses parking_lot's raw lock if available, an adaptive
//! spin-yield lock otherwise.
//!
//! Standard guard-based mutexes cannot express the prefork/postfork dance:
//! `fork()` requires taking every allocator lock in the parent, releasing
//! them after the fork in the parent, and reinitializing them in the child.
//! `ForkMutex` wraps a raw lock so the fork path can drive it directly,
//! and carries a witness rank checked in debug builds.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

use super::witness::{self, Rank};

#[cfg(feature = "parking_lot")]
mod raw {
    use parking_lot::lock_api::RawMutex as _;

    pub struct RawLock(parking_lot::RawMutex);

    impl RawLock {
        pub const fn new() -> Self {
            Self(parking_lot::RawMutex::INIT)
        }

        #[inline]
        pub fn lock(&self) {
            self.0.lock();
        }

        #[inline]
        pub fn try_lock(&self) -> bool {
            self.0.try_lock()
        }

        /// # Safety
        /// The lock must be held.
        #[inline]
        pub unsafe fn unlock(&self) {
            self.0.unlock();
        }

        /// Force the lock back to the unlocked state. Only valid in a
        /// freshly forked child, where no other thread exists.
        pub unsafe fn reinit(&self) {
            if self.0.is_locked() {
                self.0.unlock();
            }
        }
    }
}

#[cfg(not(feature = "parking_lot"))]
mod raw {
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Adaptive spin-then-yield lock. Spins with exponentially growing
    /// pause counts, then falls back to yielding to the scheduler.
    pub struct RawLock {
        locked: AtomicBool,
    }

    const MAX_SPIN_SHIFT: u32 = 6;

    impl RawLock {
        pub const fn new() -> Self {
            Self {
                locked: AtomicBool::new(false),
            }
        }

        #[inline]
        pub fn lock(&self) {
            if self.try_lock() {
                return;
            }
            self.lock_slow();
        }

        #[cold]
        fn lock_slow(&self) {
            let mut iteration = 0u32;
            loop {
                if !self.locked.load(Ordering::Relaxed) && self.try_lock() {
                    return;
                }
                if iteration < MAX_SPIN_SHIFT {
                    for _ in 0..(1u32 << iteration) {
                        std::hint::spin_loop();
                    }
                    iteration += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        }

        #[inline]
        pub fn try_lock(&self) -> bool {
            self.locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        }

        /// # Safety
        /// The lock must be held.
        #[inline]
        pub unsafe fn unlock(&self) {
            self.locked.store(false, Ordering::Release);
        }

        /// Force the lock back to the unlocked state. Only valid in a
        /// freshly forked child, where no other thread exists.
        pub unsafe fn reinit(&self) {
            self.locked.store(false, Ordering::Release);
        }
    }
}

use raw::RawLock;

/// A mutex that participates in the witness DAG and survives `fork()`.
pub struct ForkMutex<T> {
    lock: RawLock,
    rank: Rank,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `lock`.
unsafe impl<T: Send> Send for ForkMutex<T> {}
unsafe impl<T: Send> Sync for ForkMutex<T> {}

impl<T> ForkMutex<T> {
    /// Create a new mutex with the given witness rank.
    pub const fn new(rank: Rank, value: T) -> Self {
        Self {
            lock: RawLock::new(),
            rank,
            data: UnsafeCell::new(value),
        }
    }

    /// Lock the mutex, checking the witness rank in debug builds.
    pub fn lock(&self) -> ForkGuard<'_, T> {
        witness::acquire(self.rank);
        self.lock.lock();
        ForkGuard { mutex: self }
    }

    /// Try to lock without blocking.
    pub fn try_lock(&self) -> Option<ForkGuard<'_, T>> {
        if self.lock.try_lock() {
            witness::acquire(self.rank);
            Some(ForkGuard { mutex: self })
        } else {
            None
        }
    }

    /// Take the raw lock for the duration of a `fork()`. Bypasses the
    /// witness: the fork path holds every allocator lock at once.
    pub(crate) fn prefork(&self) {
        self.lock.lock();
    }

    /// Release a lock taken by `prefork`, in the parent.
    pub(crate) fn postfork_parent(&self) {
        // SAFETY: prefork acquired the lock on this thread.
        unsafe { self.lock.unlock() };
    }

    /// Reinitialize the lock in the child, where the parent's ownership
    /// is meaningless and no other thread exists.
    pub(crate) fn postfork_child(&self) {
        // SAFETY: single-threaded child immediately after fork.
        unsafe { self.lock.reinit() };
    }

    /// Access the data without locking.
    ///
    /// # Safety
    /// Caller must guarantee exclusive access, e.g. between prefork and
    /// postfork, or when the owner is being torn down.
    #[allow(dead_code)]
    pub(crate) unsafe fn data_unsynchronized(&self) -> &mut T {
        &mut *self.data.get()
    }
}

/// Guard for a locked [`ForkMutex`].
pub struct ForkGuard<'a, T> {
    mutex: &'a ForkMutex<T>,
}

impl<T> Deref for ForkGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the lock is held.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for ForkGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the lock is held.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for ForkGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the guard exists, so the lock is held.
        unsafe { self.mutex.lock.unlock() };
        witness::release(self.mutex.rank);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_basic_locking() {
        let m = ForkMutex::new(Rank::Control, 0u32);
        *m.lock() += 1;
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    fn test_contended_counter() {
        let m = Arc::new(ForkMutex::new(Rank::Control, 0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = Arc::clone(&m);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *m.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 40_000);
    }

    #[test]
    fn test_try_lock() {
        let m = ForkMutex::new(Rank::Control, ());
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn test_prefork_postfork_parent() {
        let m = ForkMutex::new(Rank::Control, 7u32);
        m.prefork();
        m.postfork_parent();
        assert_eq!(*m.lock(), 7);
    }
}
