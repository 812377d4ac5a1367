// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Counting semaphores
//!
//! A user-side permit counter fronts the platform's kernel semaphore object, so that the kernel
//! object is only touched when a thread must actually sleep or be woken. A negative counter
//! value records how many threads are (or are about to be) asleep on the kernel object; posts
//! release exactly that many kernel permits and keep the rest in the counter.

use core::time::Duration;

use thiserror::Error;

use crate::platform::{RawSemaphore as _, RawSemaphoreProvider, UnblockedOrTimedOut};

use super::spinlock::SpinLock;

/// A counting semaphore, roughly analogous to a POSIX `sem_t`.
pub struct Semaphore<Platform: RawSemaphoreProvider> {
    /// Logical permit count. Negative values count sleepers on `raw`.
    value: SpinLock<i64>,
    /// The kernel object sleepers actually park on. Its internal count never exceeds the number
    /// of sleepers that have been (or are being) woken.
    raw: Platform::RawSemaphore,
}

/// The largest permit count a [`Semaphore`] will hold (the `SEM_VALUE_MAX` analogue).
pub const MAX_PERMITS: i64 = i32::MAX as i64;

/// Potential errors that can be returned by [`Semaphore::post`] and [`Semaphore::post_many`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SemaphoreError {
    #[error("posting would overflow the semaphore's maximum permit count")]
    Overflow,
}

/// A zero-sized struct indicating that [`Semaphore::try_wait`] found no available permit.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("semaphore has no available permit")]
pub struct NoPermit;

impl<Platform: RawSemaphoreProvider> Semaphore<Platform> {
    /// Returns a new semaphore holding `initial` permits.
    pub fn new(platform: &'static Platform, initial: u32) -> Self {
        Self {
            value: SpinLock::new(i64::from(initial)),
            // The kernel object starts empty regardless of `initial`; the logical count lives
            // in `value`, and kernel permits exist only to wake sleepers.
            raw: platform.new_raw_semaphore(0),
        }
    }

    /// Consume one permit, blocking until one is available.
    pub fn wait(&self) {
        {
            let mut value = self.value.lock();
            *value -= 1;
            if *value >= 0 {
                return;
            }
        }
        self.raw.wait();
    }

    /// Consume one permit if one is immediately available.
    pub fn try_wait(&self) -> Result<(), NoPermit> {
        let mut value = self.value.lock();
        if *value > 0 {
            *value -= 1;
            Ok(())
        } else {
            Err(NoPermit)
        }
    }

    /// Consume one permit, blocking for at most `timeout` for one to become available.
    pub fn wait_timeout(&self, timeout: Duration) -> UnblockedOrTimedOut {
        {
            let mut value = self.value.lock();
            *value -= 1;
            if *value >= 0 {
                return UnblockedOrTimedOut::Unblocked;
            }
        }
        match self.raw.wait_timeout(timeout) {
            UnblockedOrTimedOut::Unblocked => UnblockedOrTimedOut::Unblocked,
            UnblockedOrTimedOut::TimedOut => {
                // Undo our reservation, unless a racing post already counted us and committed a
                // kernel permit on our behalf; that permit must be consumed here, not leaked to
                // a future waiter.
                let mut value = self.value.lock();
                if *value < 0 {
                    *value += 1;
                    UnblockedOrTimedOut::TimedOut
                } else {
                    drop(value);
                    // Returns immediately: the permit was already released.
                    self.raw.wait();
                    UnblockedOrTimedOut::Unblocked
                }
            }
        }
    }

    /// Release one permit.
    pub fn post(&self) -> Result<(), SemaphoreError> {
        self.post_many(1)
    }

    /// Release `n` permits, unblocking up to `n` sleepers.
    pub fn post_many(&self, n: u32) -> Result<(), SemaphoreError> {
        if n == 0 {
            return Ok(());
        }
        let to_release = {
            let mut value = self.value.lock();
            let new = *value + i64::from(n);
            if new > MAX_PERMITS {
                return Err(SemaphoreError::Overflow);
            }
            let sleepers = (-*value).max(0);
            *value = new;
            sleepers.min(i64::from(n))
        };
        if to_release > 0 {
            self.raw.post(u32::try_from(to_release).unwrap());
        }
        Ok(())
    }

    /// The current logical permit count (zero while there are sleepers).
    pub fn value(&self) -> u32 {
        u32::try_from((*self.value.lock()).max(0)).unwrap()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::platform::mock::MockPlatform;
    use alloc::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use std::vec::Vec;

    #[test]
    fn initial_permits_are_consumable_without_blocking() {
        let platform = MockPlatform::new();
        let sem = Semaphore::new(platform, 2);
        assert_eq!(sem.value(), 2);
        sem.wait();
        assert!(sem.try_wait().is_ok());
        assert_eq!(sem.try_wait(), Err(NoPermit));
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn post_unblocks_sleeper() {
        let platform = MockPlatform::new();
        let sem = Arc::new(Semaphore::new(platform, 0));

        let sleeper = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || sem.wait())
        };
        thread::sleep(Duration::from_millis(20)); // give the sleeper time to block
        sem.post().unwrap();
        sleeper.join().unwrap();
    }

    #[test]
    fn post_many_unblocks_all_sleepers() {
        let platform = MockPlatform::new();
        let sem = Arc::new(Semaphore::new(platform, 0));

        let sleepers: Vec<_> = (0..3)
            .map(|_| {
                let sem = Arc::clone(&sem);
                thread::spawn(move || sem.wait())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        sem.post_many(3).unwrap();
        for sleeper in sleepers {
            sleeper.join().unwrap();
        }
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn wait_timeout_expires_without_post() {
        let platform = MockPlatform::new();
        let sem = Semaphore::new(platform, 0);
        assert!(
            sem.wait_timeout(Duration::from_millis(30)).timed_out(),
            "no post ever arrives; the wait must time out"
        );
        // The reservation must have been rolled back: a later post is not silently eaten.
        sem.post().unwrap();
        assert_eq!(sem.value(), 1);
    }

    #[test]
    fn wait_timeout_consumes_a_prior_post() {
        let platform = MockPlatform::new();
        let sem = Semaphore::new(platform, 1);
        assert_eq!(
            sem.wait_timeout(Duration::from_millis(30)),
            UnblockedOrTimedOut::Unblocked
        );
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn post_overflow_is_reported() {
        let platform = MockPlatform::new();
        let sem = Semaphore::new(platform, u32::try_from(MAX_PERMITS).unwrap());
        assert_eq!(sem.post(), Err(SemaphoreError::Overflow));
    }
}
