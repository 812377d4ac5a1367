// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Crate-local test-only mock platform for easily running tests in the various modules.

// Pull in `std` for the test-only world, so that we have a nicer/easier time writing tests
extern crate std;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar as StdCondvar, Mutex as StdMutex};
use std::time::Duration;

use super::*;

/// A mock platform that is a [`platform::Provider`](Provider), useful purely for testing within
/// this crate.
///
/// The raw semaphores and events are emulated with `std`'s own locking; this is fine, since the
/// mock only has to honor the waitable-object contracts, not be fast. Time is real time, so that
/// timed-wait tests exercise actual deadlines.
pub(crate) struct MockPlatform {
    next_thread_id: AtomicU64,
}

impl MockPlatform {
    pub(crate) fn new() -> &'static Self {
        // Since this is used entirely for tests, leaking a bit of memory is perfectly fine in
        // order to give ourselves a statically lived platform easily.
        alloc::boxed::Box::leak(alloc::boxed::Box::new(MockPlatform {
            next_thread_id: AtomicU64::new(1),
        }))
    }
}

impl Provider for MockPlatform {}

pub(crate) struct MockRawSemaphore {
    permits: StdMutex<u64>,
    cond: StdCondvar,
}

impl RawSemaphore for MockRawSemaphore {
    fn post(&self, n: u32) {
        let mut permits = self.permits.lock().unwrap();
        *permits += u64::from(n);
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    fn wait(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.cond.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    fn wait_timeout(&self, timeout: Duration) -> UnblockedOrTimedOut {
        let Some(deadline) = std::time::Instant::now().checked_add(timeout) else {
            // The deadline is beyond the clock's range; degrade to an untimed wait.
            self.wait();
            return UnblockedOrTimedOut::Unblocked;
        };
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            let now = std::time::Instant::now();
            if now >= deadline {
                return UnblockedOrTimedOut::TimedOut;
            }
            let (guard, _) = self.cond.wait_timeout(permits, deadline - now).unwrap();
            permits = guard;
        }
        *permits -= 1;
        UnblockedOrTimedOut::Unblocked
    }
}

impl RawSemaphoreProvider for MockPlatform {
    type RawSemaphore = MockRawSemaphore;

    fn new_raw_semaphore(&self, initial: u32) -> Self::RawSemaphore {
        MockRawSemaphore {
            permits: StdMutex::new(u64::from(initial)),
            cond: StdCondvar::new(),
        }
    }
}

pub(crate) struct MockRawEvent {
    signaled: StdMutex<bool>,
    cond: StdCondvar,
}

impl RawEvent for MockRawEvent {
    fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        // Signaling an already-signaled auto-reset event has no additional effect.
        *signaled = true;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap();
        }
        *signaled = false;
    }

    fn wait_timeout(&self, timeout: Duration) -> UnblockedOrTimedOut {
        let Some(deadline) = std::time::Instant::now().checked_add(timeout) else {
            self.wait();
            return UnblockedOrTimedOut::Unblocked;
        };
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            let now = std::time::Instant::now();
            if now >= deadline {
                return UnblockedOrTimedOut::TimedOut;
            }
            let (guard, _) = self.cond.wait_timeout(signaled, deadline - now).unwrap();
            signaled = guard;
        }
        *signaled = false;
        UnblockedOrTimedOut::Unblocked
    }
}

impl RawEventProvider for MockPlatform {
    type RawEvent = MockRawEvent;

    fn new_raw_event(&self) -> Self::RawEvent {
        MockRawEvent {
            signaled: StdMutex::new(false),
            cond: StdCondvar::new(),
        }
    }
}

std::thread_local! {
    static MOCK_THREAD_ID: core::cell::Cell<u64> = const { core::cell::Cell::new(0) };
}

impl ThreadIdProvider for MockPlatform {
    fn current_thread_id(&self) -> ThreadId {
        let raw = MOCK_THREAD_ID.with(|id| {
            if id.get() == 0 {
                id.set(self.next_thread_id.fetch_add(1, Ordering::Relaxed));
            }
            id.get()
        });
        ThreadId::new(raw).expect("mock thread ids start at 1")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct MockInstant(std::time::Instant);

impl Instant for MockInstant {
    fn checked_duration_since(&self, earlier: &Self) -> Option<Duration> {
        self.0.checked_duration_since(earlier.0)
    }

    fn checked_add(&self, duration: Duration) -> Option<Self> {
        Some(MockInstant(self.0.checked_add(duration)?))
    }
}

impl TimeProvider for MockPlatform {
    type Instant = MockInstant;

    fn now(&self) -> Self::Instant {
        MockInstant(std::time::Instant::now())
    }
}

impl DebugLogProvider for MockPlatform {
    fn debug_log_print(&self, msg: &str) {
        std::eprint!("{msg}");
    }
}
