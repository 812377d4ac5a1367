// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Condition variables
//!
//! This is the gate-and-queue condition variable: two counting semaphores and three counters,
//! in the lineage of the semaphore-based designs used by hosted pthread runtimes. The hosted
//! world forces this shape: without a compare-and-sleep primitive there is no way to atomically
//! "unlock the mutex and sleep", so fairness between a broadcast and concurrently arriving
//! waiters has to be manufactured with an admission gate instead.
//!
//! How the pieces fit together:
//!
//! - `queue` is the semaphore waiters actually sleep on. A notification posts permits to it.
//! - `gate` is a binary semaphore admitting new waiters. A notifier that starts draining the
//!   current set of waiters closes the gate first, so waiters arriving *after* the
//!   notification cannot slip into the batch and steal a permit from a waiter the
//!   notification was promised to. The last waiter of the drained batch reopens the gate.
//! - `wait_state` counts `blocked` (waiters asleep on `queue`), `to_unblock` (permits issued
//!   by an in-progress drain that have not yet been consumed), and `gone` (timed-out waiters
//!   that left without consuming anything, and are still counted in `blocked`). The `gone`
//!   ledger is what lets a timed-out waiter leave in O(1) instead of having to fish its own
//!   permit back out of the queue.

use core::time::Duration;

use crate::platform::UnblockedOrTimedOut;

use super::RawSyncPrimitivesProvider;
use super::mutex::{CheckedMutex, MutexError, MutexGuard};
use super::semaphore::Semaphore;
use super::spinlock::SpinLock;

/// How many abandoned (timed-out) waiters may accumulate in the `gone` ledger before a waiter
/// folds them back out of the `blocked` count. Large enough to be hit only under pathological
/// timeout churn; small enough that the counters stay far from their limits.
const GONE_HIGH_WATER: u32 = 1 << 20;

struct WaitState {
    /// Threads currently blocked (or committed to blocking) on `queue`.
    blocked: u32,
    /// Permits issued by an in-progress unblock generation, not yet consumed.
    to_unblock: u32,
    /// Timed-out waiters that left `queue` without consuming a permit and are still counted in
    /// `blocked`.
    gone: u32,
}

/// Whether a [`Condvar::wait_timeout`] returned due to the timeout elapsing.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeoutResult {
    timed_out: bool,
}

impl WaitTimeoutResult {
    /// True if the wait timed out before a notification reached this thread.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }
}

/// A condition variable with fair signaling, roughly analogous to Rust's
/// [`std::sync::Condvar`](https://doc.rust-lang.org/std/sync/struct.Condvar.html).
///
/// "Fair" here means: a notification unblocks only threads that were already waiting when it
/// was issued, never a thread that starts waiting afterwards. (Which of the eligible waiters
/// run first is still up to the scheduler.)
///
/// As with every condition variable, waits should be wrapped in a predicate loop; the POSIX
/// contract allows spurious wakeups, and this implementation can produce them when a timed
/// wait abandons a permit that a later waiter then picks up.
pub struct Condvar<Platform: RawSyncPrimitivesProvider> {
    /// Binary admission gate; held closed while a generation of waiters is being drained.
    gate: Semaphore<Platform>,
    /// The semaphore the waiters sleep on.
    queue: Semaphore<Platform>,
    wait_state: SpinLock<WaitState>,
}

impl<Platform: RawSyncPrimitivesProvider> Condvar<Platform> {
    /// Returns a new condition variable with no waiters.
    pub fn new(platform: &'static Platform) -> Self {
        Self {
            gate: Semaphore::new(platform, 1),
            queue: Semaphore::new(platform, 0),
            wait_state: SpinLock::new(WaitState {
                blocked: 0,
                to_unblock: 0,
                gone: 0,
            }),
        }
    }

    /// Blocks the current thread until this condition variable receives a notification.
    ///
    /// The mutex held by `guard` is atomically-enough released: any notifier that acquires that
    /// mutex after this call started is guaranteed to see this thread as a waiter. The mutex is
    /// reacquired before this function returns.
    pub fn wait<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, Platform, T>,
    ) -> MutexGuard<'a, Platform, T> {
        let mutex = MutexGuard::mutex_ref(&guard);
        self.enter_wait();
        drop(guard);
        let _ = self.sleep(None);
        mutex.lock()
    }

    /// Like [`wait`](Self::wait), but gives up once `timeout` has elapsed.
    ///
    /// The mutex is reacquired before returning even on timeout, so the returned guard is
    /// always valid; the result records whether the timeout fired.
    pub fn wait_timeout<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, Platform, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, Platform, T>, WaitTimeoutResult) {
        let mutex = MutexGuard::mutex_ref(&guard);
        self.enter_wait();
        drop(guard);
        let outcome = self.sleep(Some(timeout));
        (
            mutex.lock(),
            WaitTimeoutResult {
                timed_out: outcome.timed_out(),
            },
        )
    }

    /// [`wait`](Self::wait) for a [`CheckedMutex`], enforcing the POSIX ownership rules: the
    /// calling thread must hold `mutex` at recursion depth one.
    pub fn wait_checked(&self, mutex: &CheckedMutex<Platform>) -> Result<(), MutexError> {
        mutex.check_owned_for_wait()?;
        self.enter_wait();
        mutex.release_for_wait();
        let _ = self.sleep(None);
        mutex.reacquire_after_wait();
        Ok(())
    }

    /// [`wait_timeout`](Self::wait_timeout) for a [`CheckedMutex`].
    pub fn wait_timeout_checked(
        &self,
        mutex: &CheckedMutex<Platform>,
        timeout: Duration,
    ) -> Result<WaitTimeoutResult, MutexError> {
        mutex.check_owned_for_wait()?;
        self.enter_wait();
        mutex.release_for_wait();
        let outcome = self.sleep(Some(timeout));
        mutex.reacquire_after_wait();
        Ok(WaitTimeoutResult {
            timed_out: outcome.timed_out(),
        })
    }

    /// Wakes up one blocked thread on this condvar, if any.
    pub fn notify_one(&self) {
        self.unblock(false);
    }

    /// Wakes up all threads blocked on this condvar at the time of the call.
    pub fn notify_all(&self) {
        self.unblock(true);
    }

    /// Register the calling thread as a waiter.
    ///
    /// Must be called while still holding the mutex the caller is about to release, so that a
    /// notifier serialized after us (through that mutex) observes `blocked` already
    /// incremented.
    fn enter_wait(&self) {
        self.gate.wait();
        self.wait_state.lock().blocked += 1;
        self.gate
            .post()
            .expect("gate permit count is bounded by one");
    }

    /// Park on the queue, then settle the bookkeeping for however the sleep ended.
    fn sleep(&self, timeout: Option<Duration>) -> UnblockedOrTimedOut {
        let outcome = match timeout {
            None => {
                self.queue.wait();
                UnblockedOrTimedOut::Unblocked
            }
            Some(timeout) => self.queue.wait_timeout(timeout),
        };

        let signals_left = {
            let mut ws = self.wait_state.lock();
            let signals_left = ws.to_unblock;
            if signals_left != 0 {
                // A drain is in progress and counted us into it. Consume one slot, even if we
                // actually timed out: our unconsumed queue permit then surfaces as a spurious
                // (POSIX-legal) wakeup for some later waiter, rather than as a lost signal.
                ws.to_unblock = signals_left - 1;
            } else if ws.gone == GONE_HIGH_WATER - 1 {
                // The abandoned-waiter ledger is about to saturate: close the gate and fold it
                // back out of the blocked count. The spinlock must not be held while we sleep
                // on the gate (incoming waiters take it between gate passes).
                ws.gone += 1;
                drop(ws);
                self.gate.wait();
                {
                    let mut ws = self.wait_state.lock();
                    ws.blocked -= ws.gone;
                    ws.gone = 0;
                }
                self.gate
                    .post()
                    .expect("gate permit count is bounded by one");
            } else {
                ws.gone += 1;
            }
            signals_left
        };

        // The last waiter of a drained generation reopens the gate the notifier closed.
        if signals_left == 1 {
            self.gate
                .post()
                .expect("gate permit count is bounded by one");
        }

        outcome
    }

    /// The common engine under [`notify_one`](Self::notify_one) and
    /// [`notify_all`](Self::notify_all).
    fn unblock(&self, all: bool) {
        let to_issue: u32;
        {
            let mut ws = self.wait_state.lock();
            if ws.to_unblock != 0 {
                // A drain is already in progress (and the gate is already closed by whoever
                // started it). Top up that generation rather than starting another.
                if ws.blocked == 0 {
                    // Every remaining "waiter" already timed out; nothing to wake.
                    return;
                }
                if all {
                    to_issue = ws.blocked;
                    ws.to_unblock += to_issue;
                    ws.blocked = 0;
                } else {
                    to_issue = 1;
                    ws.to_unblock += 1;
                    ws.blocked -= 1;
                }
            } else if ws.blocked > ws.gone {
                // There are real waiters and no drain in progress: start a generation. That
                // requires closing the gate, which we must not do while holding the spinlock
                // (incoming waiters hold the gate while taking the spinlock).
                drop(ws);
                self.gate.wait();
                let mut ws = self.wait_state.lock();
                // Holding the gate guarantees no drain can be in progress.
                debug_assert_eq!(ws.to_unblock, 0);
                if ws.gone != 0 {
                    // Fold the abandoned waiters out before counting the batch.
                    ws.blocked -= ws.gone;
                    ws.gone = 0;
                }
                if ws.blocked > 0 {
                    if all {
                        to_issue = ws.blocked;
                        ws.to_unblock = to_issue;
                        ws.blocked = 0;
                    } else {
                        to_issue = 1;
                        ws.to_unblock = 1;
                        ws.blocked -= 1;
                    }
                    // The gate stays closed; the last waiter of this generation reopens it.
                } else {
                    // The waiters evaporated (timed out) while we took the gate.
                    drop(ws);
                    self.gate
                        .post()
                        .expect("gate permit count is bounded by one");
                    return;
                }
            } else {
                // No waiters: a notification with nobody to receive it is forgotten, per
                // POSIX. Crucially, no permit is posted, so nothing accumulates.
                return;
            }
        }
        self.queue
            .post_many(to_issue)
            .expect("queue permits are bounded by the number of waiters");
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::platform::mock::MockPlatform;
    use crate::sync::{Mutex, MutexKind};
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn notify_one_wakes_a_waiter() {
        let platform = MockPlatform::new();
        let pair = Arc::new((Mutex::new(platform, false), Condvar::new(platform)));

        let waiter = {
            let pair = Arc::clone(&pair);
            thread::spawn(move || {
                let (mutex, condvar) = &*pair;
                let mut ready = mutex.lock();
                while !*ready {
                    ready = condvar.wait(ready);
                }
            })
        };

        thread::sleep(Duration::from_millis(20));
        {
            let (mutex, condvar) = &*pair;
            *mutex.lock() = true;
            condvar.notify_one();
        }
        waiter.join().unwrap();
    }

    #[test]
    fn notify_all_wakes_every_current_waiter() {
        const WAITERS: u32 = 5;

        let platform = MockPlatform::new();
        let pair = Arc::new((Mutex::new(platform, false), Condvar::new(platform)));
        let woken = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..WAITERS)
            .map(|_| {
                let pair = Arc::clone(&pair);
                let woken = Arc::clone(&woken);
                thread::spawn(move || {
                    let (mutex, condvar) = &*pair;
                    let mut go = mutex.lock();
                    while !*go {
                        go = condvar.wait(go);
                    }
                    woken.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(30));
        {
            let (mutex, condvar) = &*pair;
            *mutex.lock() = true;
            condvar.notify_all();
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::Relaxed), WAITERS);
    }

    #[test]
    fn notification_without_waiters_is_forgotten() {
        let platform = MockPlatform::new();
        let pair = Arc::new((Mutex::new(platform, ()), Condvar::new(platform)));
        let (mutex, condvar) = &*pair;

        // Neither of these may leave a stored-up permit behind...
        condvar.notify_one();
        condvar.notify_all();

        // ...so a subsequent timed wait must actually time out.
        let (guard, result) = condvar.wait_timeout(mutex.lock(), Duration::from_millis(30));
        drop(guard);
        assert!(result.timed_out());
    }

    #[test]
    fn wait_timeout_reports_wakeup_when_notified() {
        let platform = MockPlatform::new();
        let pair = Arc::new((Mutex::new(platform, false), Condvar::new(platform)));

        let waiter = {
            let pair = Arc::clone(&pair);
            thread::spawn(move || {
                let (mutex, condvar) = &*pair;
                let mut ready = mutex.lock();
                let mut timed_out = false;
                while !*ready && !timed_out {
                    let (guard, result) = condvar.wait_timeout(ready, Duration::from_secs(10));
                    ready = guard;
                    timed_out = result.timed_out();
                }
                timed_out
            })
        };

        thread::sleep(Duration::from_millis(20));
        {
            let (mutex, condvar) = &*pair;
            *mutex.lock() = true;
            condvar.notify_one();
        }
        assert!(!waiter.join().unwrap(), "the waiter must see the wakeup");
    }

    #[test]
    fn producer_consumer_queue() {
        const ITEMS: u32 = 1_000;

        let platform = MockPlatform::new();
        let queue = Arc::new((
            Mutex::new(platform, alloc::collections::VecDeque::new()),
            Condvar::new(platform),
        ));

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let (mutex, condvar) = &*queue;
                let mut received = Vec::new();
                while received.len() < ITEMS as usize {
                    let mut items = mutex.lock();
                    while items.is_empty() {
                        items = condvar.wait(items);
                    }
                    while let Some(item) = items.pop_front() {
                        received.push(item);
                    }
                }
                received
            })
        };

        {
            let (mutex, condvar) = &*queue;
            for i in 0..ITEMS {
                mutex.lock().push_back(i);
                condvar.notify_one();
            }
        }

        let received = consumer.join().unwrap();
        assert_eq!(received, (0..ITEMS).collect::<Vec<_>>());
    }

    #[test]
    fn broadcast_does_not_wake_later_waiters() {
        // A waiter that arrives after a notify_all must not consume one of its permits: each
        // round's broadcast wakes exactly that round's waiters. Run a few rounds back-to-back
        // to give a generation-unfair implementation a chance to trip over itself.
        const WAITERS: u32 = 4;
        const ROUNDS: u32 = 20;

        let platform = MockPlatform::new();
        let state = Arc::new((Mutex::new(platform, 0u32), Condvar::new(platform)));

        for round in 1..=ROUNDS {
            let handles: Vec<_> = (0..WAITERS)
                .map(|_| {
                    let state = Arc::clone(&state);
                    thread::spawn(move || {
                        let (mutex, condvar) = &*state;
                        let mut generation = mutex.lock();
                        while *generation < round {
                            generation = condvar.wait(generation);
                        }
                    })
                })
                .collect();

            thread::sleep(Duration::from_millis(10));
            {
                let (mutex, condvar) = &*state;
                *mutex.lock() = round;
                condvar.notify_all();
            }
            for handle in handles {
                handle.join().unwrap();
            }
        }
    }

    #[test]
    fn checked_wait_requires_ownership() {
        let platform = MockPlatform::new();
        let mutex = CheckedMutex::new(platform, MutexKind::ErrorCheck);
        let condvar = Condvar::new(platform);

        // Not held at all.
        assert_eq!(condvar.wait_checked(&mutex), Err(MutexError::NotOwner));

        // Held too deep for a recursive mutex.
        let recursive = CheckedMutex::new(platform, MutexKind::Recursive);
        recursive.lock().unwrap();
        recursive.lock().unwrap();
        assert_eq!(
            condvar.wait_timeout_checked(&recursive, Duration::from_millis(5)),
            Err(MutexError::NotOwner)
        );
        recursive.unlock().unwrap();
        recursive.unlock().unwrap();
    }

    #[test]
    fn checked_wait_roundtrip() {
        let platform = MockPlatform::new();
        let shared = Arc::new((
            CheckedMutex::new(platform, MutexKind::ErrorCheck),
            Condvar::new(platform),
            AtomicU32::new(0),
        ));

        let waiter = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let (mutex, condvar, value) = &*shared;
                mutex.lock().unwrap();
                while value.load(Ordering::Relaxed) == 0 {
                    condvar.wait_checked(mutex).unwrap();
                }
                mutex.unlock().unwrap();
            })
        };

        thread::sleep(Duration::from_millis(20));
        {
            let (mutex, condvar, value) = &*shared;
            mutex.lock().unwrap();
            value.store(1, Ordering::Relaxed);
            mutex.unlock().unwrap();
            condvar.notify_one();
        }
        waiter.join().unwrap();
    }

    #[test]
    fn timed_out_waiter_does_not_eat_a_later_notification() {
        let platform = MockPlatform::new();
        let pair = Arc::new((Mutex::new(platform, false), Condvar::new(platform)));

        // First waiter times out and leaves (its departure lands in the `gone` ledger).
        {
            let (mutex, condvar) = &*pair;
            let (guard, result) = condvar.wait_timeout(mutex.lock(), Duration::from_millis(20));
            drop(guard);
            assert!(result.timed_out());
        }

        // Second waiter must still receive a notify_one issued while it waits.
        let waiter = {
            let pair = Arc::clone(&pair);
            thread::spawn(move || {
                let (mutex, condvar) = &*pair;
                let mut ready = mutex.lock();
                let mut timed_out = false;
                while !*ready && !timed_out {
                    let (guard, result) = condvar.wait_timeout(ready, Duration::from_secs(5));
                    ready = guard;
                    timed_out = result.timed_out();
                }
                timed_out
            })
        };
        thread::sleep(Duration::from_millis(20));
        {
            let (mutex, condvar) = &*pair;
            *mutex.lock() = true;
            condvar.notify_one();
        }
        assert!(!waiter.join().unwrap());
    }
}
