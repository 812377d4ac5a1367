// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A reader-writer lock
//!
//! This type of lock allows a number of readers or at most one writer at any point in time. The
//! write portion of this lock typically allows modification of the underlying data (exclusive
//! access) and the read portion of this lock typically allows for read-only access (shared
//! access).
//!
//! Unlike the futex-based designs that pack everything into one word, this lock is layered on
//! the [`Mutex`]/[`Condvar`] pair, which is the natural construction when the host only offers
//! waitable objects. Writers are preferred: once a writer is queued, new readers wait, so a
//! steady stream of readers cannot starve writers indefinitely.

use core::cell::UnsafeCell;
use core::time::Duration;

use crate::platform::{Instant as _, TimeProvider};

use super::RawSyncPrimitivesProvider;
use super::condvar::Condvar;
use super::mutex::Mutex;

struct RwState {
    /// Number of read guards currently outstanding.
    active_readers: u32,
    /// Whether a write guard is currently outstanding.
    writer_active: bool,
    /// Writers blocked (or about to block) on `writer_go`. New readers queue behind these.
    queued_writers: u32,
}

/// A reader-writer lock useful for protecting shared data, roughly analogous to Rust's
/// [`std::sync::RwLock`](https://doc.rust-lang.org/std/sync/struct.RwLock.html).
///
/// A notable difference from Rust's `std` is that this `RwLock` does not maintain any poisoning
/// information.
pub struct RwLock<Platform: RawSyncPrimitivesProvider, T: ?Sized> {
    platform: &'static Platform,
    state: Mutex<Platform, RwState>,
    /// Readers wait here while a writer is active or queued.
    readers_go: Condvar<Platform>,
    /// Writers wait here, one woken at a time.
    writer_go: Condvar<Platform>,
    data: UnsafeCell<T>,
}

// SAFETY: `RwLock<T>` inherits `Send` from `T`.
unsafe impl<Platform: RawSyncPrimitivesProvider, T: ?Sized + Send> Send for RwLock<Platform, T> {}
// SAFETY: `RwLock<T>` is `Sync` when `T` is `Send+Sync`. Note that this is a
// different bound from `Mutex<T>`--the `Send` bound is still necessary since a
// writer can transfer `T` between threads, but the `Sync` bound is necessary,
// too, since readers on multiple threads can share `T` simultaneously.
unsafe impl<Platform: RawSyncPrimitivesProvider, T: ?Sized + Send + Sync> Sync
    for RwLock<Platform, T>
{
}

impl<Platform: RawSyncPrimitivesProvider, T> RwLock<Platform, T> {
    /// Returns a new reader-writer lock wrapping the given value.
    pub fn new(platform: &'static Platform, val: T) -> Self {
        Self {
            platform,
            state: Mutex::new(
                platform,
                RwState {
                    active_readers: 0,
                    writer_active: false,
                    queued_writers: 0,
                },
            ),
            readers_go: Condvar::new(platform),
            writer_go: Condvar::new(platform),
            data: UnsafeCell::new(val),
        }
    }

    /// Consumes this `RwLock`, returning the underlying data.
    ///
    /// Since this function consumes `self`, it is guaranteed that no other thread has borrowed
    /// it or has unreleased locks.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> RwLock<Platform, T> {
    /// Locks this lock with shared read access, blocking the current thread until it can be
    /// acquired.
    pub fn read(&self) -> RwLockReadGuard<'_, Platform, T> {
        let mut state = self.state.lock();
        while state.writer_active || state.queued_writers > 0 {
            state = self.readers_go.wait(state);
        }
        state.active_readers += 1;
        drop(state);
        RwLockReadGuard { rwlock: self }
    }

    /// Attempts to acquire shared read access without waiting for writers.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, Platform, T>> {
        let mut state = self.state.lock();
        if state.writer_active || state.queued_writers > 0 {
            return None;
        }
        state.active_readers += 1;
        drop(state);
        Some(RwLockReadGuard { rwlock: self })
    }

    /// Timed variant of [`read`](Self::read); gives up once `timeout` has elapsed.
    pub fn read_timeout(&self, timeout: Duration) -> Option<RwLockReadGuard<'_, Platform, T>> {
        let deadline = self.platform.now().checked_add(timeout);
        let mut state = self.state.lock();
        while state.writer_active || state.queued_writers > 0 {
            let Some(remaining) = remaining_time::<Platform>(self.platform, deadline) else {
                return None;
            };
            let (guard, result) = self.readers_go.wait_timeout(state, remaining);
            state = guard;
            if result.timed_out() && (state.writer_active || state.queued_writers > 0) {
                return None;
            }
        }
        state.active_readers += 1;
        drop(state);
        Some(RwLockReadGuard { rwlock: self })
    }

    /// Locks this lock with exclusive write access, blocking the current thread until it can
    /// be acquired.
    pub fn write(&self) -> RwLockWriteGuard<'_, Platform, T> {
        let mut state = self.state.lock();
        state.queued_writers += 1;
        while state.writer_active || state.active_readers > 0 {
            state = self.writer_go.wait(state);
        }
        state.queued_writers -= 1;
        state.writer_active = true;
        drop(state);
        RwLockWriteGuard { rwlock: self }
    }

    /// Attempts to acquire exclusive write access without waiting.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, Platform, T>> {
        let mut state = self.state.lock();
        if state.writer_active || state.active_readers > 0 {
            return None;
        }
        state.writer_active = true;
        drop(state);
        Some(RwLockWriteGuard { rwlock: self })
    }

    /// Timed variant of [`write`](Self::write); gives up once `timeout` has elapsed.
    pub fn write_timeout(&self, timeout: Duration) -> Option<RwLockWriteGuard<'_, Platform, T>> {
        let deadline = self.platform.now().checked_add(timeout);
        let mut state = self.state.lock();
        state.queued_writers += 1;
        while state.writer_active || state.active_readers > 0 {
            let remaining = remaining_time::<Platform>(self.platform, deadline);
            let timed_out = match remaining {
                None => true,
                Some(remaining) => {
                    let (guard, result) = self.writer_go.wait_timeout(state, remaining);
                    state = guard;
                    result.timed_out() && (state.writer_active || state.active_readers > 0)
                }
            };
            if timed_out {
                // Retract our queue position; if we were the last queued writer, the readers
                // we were blocking must be let through.
                state.queued_writers -= 1;
                if state.queued_writers == 0 && !state.writer_active {
                    drop(state);
                    self.readers_go.notify_all();
                }
                return None;
            }
        }
        state.queued_writers -= 1;
        state.writer_active = true;
        drop(state);
        Some(RwLockWriteGuard { rwlock: self })
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this function borrows `self` mutably, it is guaranteed that no other thread has
    /// borrowed it, or has unreleased locks. Thus, no actual locking needs to take place---the
    /// mutable borrow statically guarantees exclusivity.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: We have &mut self, so no other threads can have access to the data.
        unsafe { &mut *self.data.get() }
    }
}

/// The remaining time until `deadline`, or `None` if it has passed. An unrepresentable
/// deadline never passes.
fn remaining_time<Platform: RawSyncPrimitivesProvider>(
    platform: &'static Platform,
    deadline: Option<<Platform as TimeProvider>::Instant>,
) -> Option<Duration> {
    match deadline {
        None => Some(Duration::MAX),
        Some(deadline) => {
            let now = platform.now();
            deadline.checked_duration_since(&now)
        }
    }
}

/// RAII structure used to release the shared read access of a lock when dropped.
pub struct RwLockReadGuard<'a, Platform: RawSyncPrimitivesProvider, T: ?Sized> {
    rwlock: &'a RwLock<Platform, T>,
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> core::ops::Deref
    for RwLockReadGuard<'_, Platform, T>
{
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the read lock is held, so no writer can have exclusive access.
        unsafe { &*self.rwlock.data.get() }
    }
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> Drop for RwLockReadGuard<'_, Platform, T> {
    fn drop(&mut self) {
        let mut state = self.rwlock.state.lock();
        state.active_readers -= 1;
        if state.active_readers == 0 && state.queued_writers > 0 {
            drop(state);
            self.rwlock.writer_go.notify_one();
        }
    }
}

/// RAII structure used to release the exclusive write access of a lock when dropped.
pub struct RwLockWriteGuard<'a, Platform: RawSyncPrimitivesProvider, T: ?Sized> {
    rwlock: &'a RwLock<Platform, T>,
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> core::ops::Deref
    for RwLockWriteGuard<'_, Platform, T>
{
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the write lock is held, so this thread has exclusive access.
        unsafe { &*self.rwlock.data.get() }
    }
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> core::ops::DerefMut
    for RwLockWriteGuard<'_, Platform, T>
{
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the write lock is held, so this thread has exclusive access.
        unsafe { &mut *self.rwlock.data.get() }
    }
}

impl<Platform: RawSyncPrimitivesProvider, T: ?Sized> Drop for RwLockWriteGuard<'_, Platform, T> {
    fn drop(&mut self) {
        let mut state = self.rwlock.state.lock();
        state.writer_active = false;
        let wake_writer = state.queued_writers > 0;
        drop(state);
        if wake_writer {
            self.rwlock.writer_go.notify_one();
        } else {
            self.rwlock.readers_go.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::platform::mock::MockPlatform;
    use alloc::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::Duration;
    use std::vec::Vec;

    #[test]
    fn readers_share_writers_exclude() {
        let platform = MockPlatform::new();
        let lock = RwLock::new(platform, 7);

        let r1 = lock.read();
        let r2 = lock.read();
        assert_eq!((*r1, *r2), (7, 7));
        assert!(lock.try_write().is_none());
        drop((r1, r2));

        let mut w = lock.write();
        *w += 1;
        assert!(lock.try_read().is_none());
        assert!(lock.try_write().is_none());
        drop(w);

        assert_eq!(*lock.read(), 8);
    }

    #[test]
    fn writes_are_serialized() {
        const THREADS: u32 = 4;
        const INCREMENTS: u32 = 2_000;

        let platform = MockPlatform::new();
        let lock = Arc::new(RwLock::new(platform, 0u32));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..INCREMENTS {
                        *lock.write() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.read(), THREADS * INCREMENTS);
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        let platform = MockPlatform::new();
        let lock = Arc::new(RwLock::new(platform, ()));
        let writer_queued = Arc::new(AtomicU32::new(0));

        let reader = lock.read();
        let writer = {
            let lock = Arc::clone(&lock);
            let writer_queued = Arc::clone(&writer_queued);
            thread::spawn(move || {
                writer_queued.store(1, Ordering::Release);
                let _w = lock.write();
            })
        };
        while writer_queued.load(Ordering::Acquire) == 0 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20)); // let the writer actually queue up

        // Writer preference: with a writer waiting, a new reader does not get in.
        assert!(lock.try_read().is_none());

        drop(reader);
        writer.join().unwrap();
        assert!(lock.try_read().is_some());
    }

    #[test]
    fn timed_acquisitions_expire() {
        let platform = MockPlatform::new();
        let lock = Arc::new(RwLock::new(platform, ()));

        let writer = lock.write();
        assert!(lock.read_timeout(Duration::from_millis(20)).is_none());
        assert!(lock.write_timeout(Duration::from_millis(20)).is_none());
        drop(writer);

        // A timed-out writer must not leave readers blocked behind a ghost queue entry.
        assert!(lock.read_timeout(Duration::from_millis(20)).is_some());
        assert!(lock.write_timeout(Duration::from_millis(20)).is_some());
    }
}
