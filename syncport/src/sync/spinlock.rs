// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Spin locks
//!
//! A CAS-based binary lock over a single word. This is the only primitive in this module that
//! needs nothing from the platform, which is exactly why it exists: the bookkeeping sections of
//! [`Semaphore`](super::Semaphore) and [`Condvar`](super::Condvar) need a critical section that
//! can be entered before any platform object has been allocated, and whose hold times are a few
//! dozen instructions.

use core::cell::UnsafeCell;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

const UNLOCKED: usize = 0;
const LOCKED: usize = 1;

/// A busy-waiting mutual exclusion lock.
///
/// Holders are expected to keep their critical sections short; there is no parking, only
/// spinning. For anything that can block, use [`Mutex`](super::Mutex) instead.
pub struct SpinLock<T: ?Sized> {
    state: AtomicUsize,
    data: UnsafeCell<T>,
}

// SAFETY: `SpinLock<T>` inherits `Send` from `T`.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
// SAFETY: `SpinLock` provides mutually exclusive access to `T`, so it's OK to share a reference
// to it between threads as long as `T` can be _sent_ between threads.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Returns a new, unlocked spin lock wrapping the given value.
    #[inline]
    pub const fn new(val: T) -> Self {
        Self {
            state: AtomicUsize::new(UNLOCKED),
            data: UnsafeCell::new(val),
        }
    }

    /// Consumes this lock, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires this lock, spinning until it is able to do so.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
        SpinLockGuard { lock: self }
    }

    #[cold]
    fn lock_contended(&self) {
        loop {
            // Only `load` while waiting, to be easier on the caches; CAS again once the lock
            // looks free.
            while self.state.load(Relaxed) != UNLOCKED {
                core::hint::spin_loop();
            }
            if self
                .state
                .compare_exchange_weak(UNLOCKED, LOCKED, Acquire, Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Attempts to acquire this lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this function borrows `self` mutably, it is guaranteed that no other thread has
    /// borrowed it, thus no actual locking needs to take place.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// An RAII implementation of a "scoped lock" of a spin lock. When this structure is dropped
/// (falls out of scope), the lock will be unlocked.
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> core::ops::Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Access to the guard means that the current thread is the only thread with
        // access
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> core::ops::DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: Access to the guard means that the current thread is the only thread with
        // access
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(UNLOCKED, Release);
    }
}
