// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Mutual exclusion
//!
//! The lock word protocol here is derived from the tri-state futex mutex in Rust's `std`, with
//! one substitution: the park/unpark edge is a platform auto-reset event rather than a futex.
//! An auto-reset event releases exactly one waiter per signal and a pending signal does not
//! evaporate, so the classic "swap to contended, then sleep" choreography carries over without
//! a compare-and-sleep primitive. The event is allocated lazily on first contention, so a mutex
//! that is never fought over never owns a kernel object.

use core::cell::UnsafeCell;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use core::sync::atomic::{AtomicU32, AtomicU64};
use core::time::Duration;

use once_cell::race::OnceBox;
use thiserror::Error;

use crate::platform::{
    Instant as _, RawEvent as _, RawEventProvider, ThreadIdProvider as _, UnblockedOrTimedOut,
};

use super::RawSyncPrimitivesProvider;

/// Lock word values.
///
/// 0: unlocked
/// 1: locked, no other threads waiting
/// 2: locked, and other threads waiting (contended)
const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// An event-backed lock word; the common engine under [`Mutex`] and [`CheckedMutex`].
pub(super) struct RawEventMutex<Platform: RawSyncPrimitivesProvider> {
    platform: &'static Platform,
    state: AtomicU32,
    /// Parking spot for contended lockers; allocated the first time anyone has to sleep.
    event: OnceBox<<Platform as RawEventProvider>::RawEvent>,
}

impl<Platform: RawSyncPrimitivesProvider> RawEventMutex<Platform> {
    pub(super) fn new(platform: &'static Platform) -> Self {
        Self {
            platform,
            state: AtomicU32::new(UNLOCKED),
            event: OnceBox::new(),
        }
    }

    pub(super) fn platform(&self) -> &'static Platform {
        self.platform
    }

    fn event(&self) -> &<Platform as RawEventProvider>::RawEvent {
        self.event
            .get_or_init(|| alloc::boxed::Box::new(self.platform.new_raw_event()))
    }

    /// Attempts to acquire this mutex without blocking. Returns `true` if the lock was
    /// successfully acquired and `false` otherwise.
    #[inline]
    #[must_use]
    pub(super) fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
            .is_ok()
    }

    /// Acquires this mutex, blocking the current thread until it is able to do so.
    #[inline]
    pub(super) fn lock(&self) {
        if !self.try_lock() {
            self.lock_contended();
        }
    }

    /// Could not _immediately_ acquire the mutex, there might be some contention to account
    /// for.
    #[cold]
    fn lock_contended(&self) {
        // Spin first to speed things up if the lock is released quickly.
        let mut state = self.spin();

        // If it's unlocked now, attempt to take the lock without marking it as contended.
        if state == UNLOCKED {
            match self
                .state
                .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
            {
                Ok(_) => return, // Locked!
                Err(s) => state = s,
            }
        }

        loop {
            // Put the lock in contended state.
            // We avoid an unnecessary write if it was already set to 2,
            // to be friendlier for the caches.
            if state != CONTENDED && self.state.swap(CONTENDED, Acquire) == UNLOCKED {
                // We changed it from 0 to 2, so we just successfully locked it.
                return;
            }

            // Park until an unlocker signals the event. Because the event is auto-reset, a
            // signal sent between our swap above and this wait is not lost; it just makes this
            // wait return immediately.
            self.event().wait();

            // Spin again after waking up
            state = self.spin();
        }
    }

    /// Timed variant of [`lock`](Self::lock). Returns `false` if `timeout` elapsed without the
    /// lock being acquired.
    #[must_use]
    pub(super) fn lock_timeout(&self, timeout: Duration) -> bool {
        if self.try_lock() {
            return true;
        }
        self.lock_contended_timeout(timeout)
    }

    #[cold]
    fn lock_contended_timeout(&self, timeout: Duration) -> bool {
        let deadline = self.platform.now().checked_add(timeout);

        let mut state = self.spin();
        if state == UNLOCKED {
            match self
                .state
                .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
            {
                Ok(_) => return true,
                Err(s) => state = s,
            }
        }

        loop {
            if state != CONTENDED && self.state.swap(CONTENDED, Acquire) == UNLOCKED {
                return true;
            }

            let Some(deadline) = deadline else {
                // The deadline is beyond the clock's range; degrade to an untimed wait.
                self.event().wait();
                state = self.spin();
                continue;
            };
            let now = self.platform.now();
            let Some(remaining) = deadline.checked_duration_since(&now) else {
                // Out of time: one last grab. Leaving a stale contended marker (or a stale
                // event signal) behind is fine; parked threads recheck the word when woken.
                return self.try_lock();
            };
            match self.event().wait_timeout(remaining) {
                UnblockedOrTimedOut::Unblocked => {}
                UnblockedOrTimedOut::TimedOut => return self.try_lock(),
            }

            state = self.spin();
        }
    }

    /// Spin for a little while to see if quick release is possible.
    ///
    /// Returns the state of the lock word as soon as it is unlocked (0) or contended (2), or
    /// when it has spun for long enough.
    fn spin(&self) -> u32 {
        let mut spin = 100;
        loop {
            // We only use `load` (and not `swap` or `compare_exchange`)
            // while spinning, to be easier on the caches.
            let state = self.state.load(Relaxed);

            // We stop spinning when the mutex is unlocked (0),
            // but also when it's contended (2)
            //
            // Or if we run out of fuel to spin.
            if state != LOCKED || spin == 0 {
                return state;
            }

            core::hint::spin_loop();
            spin -= 1;
        }
    }

    /// Unlocks this mutex.
    ///
    /// # Safety
    ///
    /// This method may only be called if the mutex is held in the current context, i.e. it must
    /// be paired with a successful call to `lock`, `try_lock`, ...
    #[inline]
    pub(super) unsafe fn unlock(&self) {
        if self.state.swap(UNLOCKED, Release) == CONTENDED {
            // We only wake up one thread. When that thread locks the mutex, it
            // will mark the mutex as contended (2) (see lock_contended above),
            // which makes sure that any other waiting threads will also be
            // woken up eventually.
            self.event().signal();
        }
    }
}

/// An RAII implementation of a "scoped lock" of a mutex. When this structure is dropped (falls
/// out of scope), the lock will be unlocked.
///
/// The data protected by the mutex can be accessed through this guard via its `Deref` and
/// `DerefMut` implementations.
///
/// This structure is created by [`Mutex::lock`].
pub struct MutexGuard<'a, Platform: RawSyncPrimitivesProvider, T: ?Sized + 'a> {
    mutex: &'a Mutex<Platform, T>,
}

impl<'a, Platform: RawSyncPrimitivesProvider, T: ?Sized> MutexGuard<'a, Platform, T> {
    /// The mutex this guard is holding; used by [`Condvar`](super::Condvar) to relock after a
    /// wait.
    pub(super) fn mutex_ref(this: &Self) -> &'a Mutex<Platform, T> {
        this.mutex
    }
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> core::ops::Deref
    for MutexGuard<'_, Platform, T>
{
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Access to the guard means that the current thread is the only thread with
        // access
        unsafe { &*self.mutex.data.get() }
    }
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> core::ops::DerefMut
    for MutexGuard<'_, Platform, T>
{
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: Access to the guard means that the current thread is the only thread with
        // access
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> Drop for MutexGuard<'_, Platform, T> {
    fn drop(&mut self) {
        // SAFETY: Access to the guard means that the current thread is the only thread with
        // access
        unsafe {
            self.mutex.raw.unlock();
        }
    }
}

/// A mutual exclusion primitive useful for protecting shared data, roughly analogous to Rust's
/// [`std::sync::Mutex`](https://doc.rust-lang.org/std/sync/struct.Mutex.html).
///
/// A notable difference from Rust's `std` is that this `Mutex` does not maintain any poisoning
/// information, thus its [`lock`](Self::lock) functionality directly returns a locked guard.
pub struct Mutex<Platform: RawSyncPrimitivesProvider, T: ?Sized> {
    raw: RawEventMutex<Platform>,
    data: UnsafeCell<T>,
}

// SAFETY: `Mutex<T>` inherits `Send` from `T`.
unsafe impl<Platform: RawSyncPrimitivesProvider, T: ?Sized + Send> Send for Mutex<Platform, T> {}
// SAFETY: `Mutex` provides mutually exclusive access to `T`, so it's OK to
// share a reference to it between threads as long as `T` can be _sent_ between
// threads.
unsafe impl<Platform: RawSyncPrimitivesProvider, T: ?Sized + Send> Sync for Mutex<Platform, T> {}

impl<Platform: RawSyncPrimitivesProvider, T> Mutex<Platform, T> {
    /// Returns a new mutex wrapping the given value.
    #[inline]
    pub fn new(platform: &'static Platform, val: T) -> Self {
        Self {
            raw: RawEventMutex::new(platform),
            data: UnsafeCell::new(val),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> Mutex<Platform, T> {
    /// Acquires this mutex, blocking the current thread until it is able to do so.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, Platform, T> {
        self.raw.lock();
        MutexGuard { mutex: self }
    }

    /// Attempts to acquire this mutex without blocking.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Platform, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Acquires this mutex, giving up once `timeout` has elapsed.
    #[inline]
    pub fn lock_timeout(&self, timeout: Duration) -> Option<MutexGuard<'_, Platform, T>> {
        if self.raw.lock_timeout(timeout) {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// This is safe because we have `&mut self`, so no other threads can access
    /// the data.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: We have &mut self, so no other threads can have access to the data.
        unsafe { &mut *self.data.get() }
    }
}

/// Mutex flavor selector for [`CheckedMutex`]; the POSIX mutex-kind analogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutexKind {
    /// No owner bookkeeping. Relocking from the owning thread blocks forever, and unlocking
    /// from a non-owning thread corrupts the lock protocol; both are caller bugs this kind
    /// cannot detect.
    #[default]
    Normal,
    /// Tracks the owning thread: relocking reports [`MutexError::WouldDeadlock`] and a foreign
    /// unlock reports [`MutexError::NotOwner`] instead of misbehaving.
    ErrorCheck,
    /// Tracks the owning thread and a recursion depth; the owner may relock, and the lock is
    /// released when unlocks balance locks.
    Recursive,
}

/// Errors reported by [`CheckedMutex`] operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexError {
    /// The lock is held by another thread (try-lock only).
    #[error("mutex is held by another thread")]
    Busy,
    /// The timeout elapsed before the lock could be acquired.
    #[error("timed out waiting for mutex")]
    TimedOut,
    /// An error-checking mutex was relocked by its owner.
    #[error("relocking a mutex already held by this thread would deadlock")]
    WouldDeadlock,
    /// The calling thread does not hold the mutex (or holds it at the wrong recursion depth
    /// for the requested operation).
    #[error("mutex is not held (at depth one) by the calling thread")]
    NotOwner,
    /// A recursive mutex reached its maximum recursion depth.
    #[error("recursion depth limit reached")]
    DepthOverflow,
}

/// A data-less mutex with POSIX ownership semantics, selectable per [`MutexKind`].
///
/// Unlike [`Mutex`], this protects a protocol rather than data: it exists for shim layers that
/// must expose error-checking and recursive mutex behavior. The `ErrorCheck` and `Recursive`
/// kinds track the owner's thread id and can therefore detect self-deadlock and foreign
/// unlocks; the `Normal` kind tracks nothing, exactly like its POSIX counterpart.
pub struct CheckedMutex<Platform: RawSyncPrimitivesProvider> {
    raw: RawEventMutex<Platform>,
    kind: MutexKind,
    /// Owning thread id for the `ErrorCheck`/`Recursive` kinds; 0 when unheld.
    owner: AtomicU64,
    /// Recursion depth; only written by the owner while `owner` holds its id.
    depth: AtomicU32,
}

impl<Platform: RawSyncPrimitivesProvider> CheckedMutex<Platform> {
    /// Returns a new, unheld mutex of the given kind.
    pub fn new(platform: &'static Platform, kind: MutexKind) -> Self {
        Self {
            raw: RawEventMutex::new(platform),
            kind,
            owner: AtomicU64::new(0),
            depth: AtomicU32::new(0),
        }
    }

    /// The kind selected at construction.
    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    fn current_thread_raw(&self) -> u64 {
        self.raw.platform().current_thread_id().get()
    }

    fn held_by_current_thread(&self) -> bool {
        self.owner.load(Relaxed) == self.current_thread_raw()
    }

    fn take_ownership(&self) {
        self.owner.store(self.current_thread_raw(), Relaxed);
        self.depth.store(1, Relaxed);
    }

    /// Bump the recursion depth; only meaningful for the `Recursive` kind with the lock held
    /// by the calling thread.
    fn relock_recursive(&self) -> Result<(), MutexError> {
        let depth = self.depth.load(Relaxed);
        if depth == u32::MAX {
            return Err(MutexError::DepthOverflow);
        }
        self.depth.store(depth + 1, Relaxed);
        Ok(())
    }

    /// Acquires the mutex, blocking until it is available.
    ///
    /// Errors are only possible for the owner-tracking kinds: `WouldDeadlock` (ErrorCheck
    /// relock) and `DepthOverflow` (Recursive).
    pub fn lock(&self) -> Result<(), MutexError> {
        match self.kind {
            MutexKind::Normal => {
                self.raw.lock();
                Ok(())
            }
            MutexKind::ErrorCheck => {
                if self.held_by_current_thread() {
                    return Err(MutexError::WouldDeadlock);
                }
                self.raw.lock();
                self.take_ownership();
                Ok(())
            }
            MutexKind::Recursive => {
                if self.held_by_current_thread() {
                    return self.relock_recursive();
                }
                self.raw.lock();
                self.take_ownership();
                Ok(())
            }
        }
    }

    /// Attempts to acquire the mutex without blocking; `Busy` if it is held elsewhere.
    pub fn try_lock(&self) -> Result<(), MutexError> {
        match self.kind {
            MutexKind::Normal => {
                if self.raw.try_lock() {
                    Ok(())
                } else {
                    Err(MutexError::Busy)
                }
            }
            MutexKind::ErrorCheck => {
                if self.held_by_current_thread() {
                    return Err(MutexError::WouldDeadlock);
                }
                if self.raw.try_lock() {
                    self.take_ownership();
                    Ok(())
                } else {
                    Err(MutexError::Busy)
                }
            }
            MutexKind::Recursive => {
                if self.held_by_current_thread() {
                    return self.relock_recursive();
                }
                if self.raw.try_lock() {
                    self.take_ownership();
                    Ok(())
                } else {
                    Err(MutexError::Busy)
                }
            }
        }
    }

    /// Acquires the mutex, giving up with `TimedOut` once `timeout` has elapsed.
    pub fn lock_timeout(&self, timeout: Duration) -> Result<(), MutexError> {
        match self.kind {
            MutexKind::Normal => {
                if self.raw.lock_timeout(timeout) {
                    Ok(())
                } else {
                    Err(MutexError::TimedOut)
                }
            }
            MutexKind::ErrorCheck => {
                if self.held_by_current_thread() {
                    return Err(MutexError::WouldDeadlock);
                }
                if self.raw.lock_timeout(timeout) {
                    self.take_ownership();
                    Ok(())
                } else {
                    Err(MutexError::TimedOut)
                }
            }
            MutexKind::Recursive => {
                if self.held_by_current_thread() {
                    return self.relock_recursive();
                }
                if self.raw.lock_timeout(timeout) {
                    self.take_ownership();
                    Ok(())
                } else {
                    Err(MutexError::TimedOut)
                }
            }
        }
    }

    /// Releases the mutex.
    ///
    /// For the owner-tracking kinds, a foreign unlock reports `NotOwner`; a recursive unlock
    /// only releases the lock once unlocks balance locks. For the `Normal` kind the caller must
    /// hold the mutex; unlocking an unheld normal mutex corrupts the lock protocol (though it
    /// cannot corrupt memory, as this mutex protects none).
    pub fn unlock(&self) -> Result<(), MutexError> {
        match self.kind {
            MutexKind::Normal => {
                // SAFETY: caller contract (documented above); nothing is protected by this
                // lock, so a protocol violation here cannot cause memory unsafety.
                unsafe { self.raw.unlock() };
                Ok(())
            }
            MutexKind::ErrorCheck => {
                if !self.held_by_current_thread() {
                    return Err(MutexError::NotOwner);
                }
                self.owner.store(0, Relaxed);
                self.depth.store(0, Relaxed);
                // SAFETY: the owner check above proves the pairing.
                unsafe { self.raw.unlock() };
                Ok(())
            }
            MutexKind::Recursive => {
                if !self.held_by_current_thread() {
                    return Err(MutexError::NotOwner);
                }
                let depth = self.depth.load(Relaxed);
                if depth > 1 {
                    self.depth.store(depth - 1, Relaxed);
                    return Ok(());
                }
                self.owner.store(0, Relaxed);
                self.depth.store(0, Relaxed);
                // SAFETY: the owner check above proves the pairing.
                unsafe { self.raw.unlock() };
                Ok(())
            }
        }
    }

    /// Verify that a condvar wait may proceed: the calling thread must hold the mutex at
    /// recursion depth one (a deeper recursive hold cannot be atomically released).
    pub(super) fn check_owned_for_wait(&self) -> Result<(), MutexError> {
        match self.kind {
            // Nothing to check; holding the lock is the (unverifiable) caller contract.
            MutexKind::Normal => Ok(()),
            MutexKind::ErrorCheck => {
                if self.held_by_current_thread() {
                    Ok(())
                } else {
                    Err(MutexError::NotOwner)
                }
            }
            MutexKind::Recursive => {
                if self.held_by_current_thread() && self.depth.load(Relaxed) == 1 {
                    Ok(())
                } else {
                    Err(MutexError::NotOwner)
                }
            }
        }
    }

    /// Fully release the mutex on behalf of a condvar wait. Must follow a successful
    /// [`check_owned_for_wait`](Self::check_owned_for_wait) with no intervening operations by
    /// this thread.
    pub(super) fn release_for_wait(&self) {
        if !matches!(self.kind, MutexKind::Normal) {
            self.owner.store(0, Relaxed);
            self.depth.store(0, Relaxed);
        }
        // SAFETY: ownership was verified by `check_owned_for_wait` (or is the caller contract
        // for the Normal kind), and only the owner can have reached here.
        unsafe { self.raw.unlock() };
    }

    /// Reacquire the mutex after a condvar wait, restoring ownership bookkeeping.
    pub(super) fn reacquire_after_wait(&self) {
        self.raw.lock();
        if !matches!(self.kind, MutexKind::Normal) {
            self.take_ownership();
        }
    }
}
