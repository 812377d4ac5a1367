// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A [Syncport platform](../syncport/platform/index.html) for running Syncport on userland
//! Linux.
//!
//! Linux has no kernel semaphore or event objects in the Win32 sense, but both are small
//! state machines over a futex word, so this platform emulates them: a semaphore is an atomic
//! permit count whose sleepers park on the word, and an auto-reset event is an atomic flag
//! with the same parking arrangement. The emulations only have to uphold the platform
//! contracts (permits are never lost; an event signal releases exactly one waiter), not mimic
//! Win32 scheduling behavior.

// Restrict this crate to only work on Linux.
#![cfg(target_os = "linux")]

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::SeqCst;
use std::time::Duration;

use syncport::platform::UnblockedOrTimedOut;

/// The userland Linux platform.
///
/// This implements the main [`syncport::platform::Provider`] trait, i.e., implements all
/// platform traits.
pub struct LinuxUserland {
    _private: (),
}

impl core::fmt::Debug for LinuxUserland {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LinuxUserland").finish_non_exhaustive()
    }
}

impl LinuxUserland {
    /// Create a new userland-Linux platform for use in Syncport.
    pub fn new() -> &'static Self {
        Box::leak(Box::new(Self { _private: () }))
    }
}

impl syncport::platform::Provider for LinuxUserland {}

/// Operations currently supported by [`futex`], the safer variant of the Linux futex syscall.
#[repr(i32)]
enum FutexOperation {
    Wait = libc::FUTEX_WAIT,
    Wake = libc::FUTEX_WAKE,
}

/// Safer invocation of the Linux futex syscall.
#[expect(clippy::similar_names, reason = "sec/nsec are as needed by libc")]
fn futex(
    uaddr: &AtomicU32,
    futex_op: FutexOperation,
    val: u32,
    timeout: Option<Duration>,
) -> Result<usize, syscalls::Errno> {
    let uaddr: *const AtomicU32 = uaddr as _;
    let futex_op: i32 = futex_op as _;
    let timeout = timeout.map(|t| {
        const TEN_POWER_NINE: u128 = 1_000_000_000;
        let nanos: u128 = t.as_nanos();
        let tv_sec = nanos
            .checked_div(TEN_POWER_NINE)
            .unwrap()
            .try_into()
            .unwrap_or(libc::time_t::MAX);
        let tv_nsec = nanos
            .checked_rem(TEN_POWER_NINE)
            .unwrap()
            .try_into()
            .unwrap();
        libc::timespec { tv_sec, tv_nsec }
    });
    unsafe {
        syscalls::syscall4(
            syscalls::Sysno::futex,
            uaddr as usize,
            usize::try_from(futex_op).unwrap(),
            val as usize,
            if let Some(t) = timeout.as_ref() {
                core::ptr::from_ref(t) as usize
            } else {
                0 // No timeout
            },
        )
    }
}

/// Park on `word` while it holds `expected`, for at most `timeout`.
///
/// Any return is fine for the callers in this crate: they re-examine their own state and, if
/// necessary, park again against a freshly read word.
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    match futex(word, FutexOperation::Wait, expected, timeout) {
        Ok(_) => {}
        Err(
            // Word already differed, wait interrupted, or the timeout fired; the caller's
            // recheck loop handles all three identically.
            syscalls::Errno::EAGAIN | syscalls::Errno::EINTR | syscalls::Errno::ETIMEDOUT,
        ) => {}
        Err(e) => panic!("Unexpected errno={e} for FUTEX_WAIT"),
    }
}

/// Wake up to `n` threads parked on `word`.
fn futex_wake(word: &AtomicU32, n: u32) {
    futex(word, FutexOperation::Wake, n, None).expect("FUTEX_WAKE cannot fail on a valid word");
}

/// The remaining time until `deadline`, or `None` if it has already passed.
fn remaining_until(deadline: std::time::Instant) -> Option<Duration> {
    deadline.checked_duration_since(std::time::Instant::now())
}

/// A counting semaphore emulated over a futex word.
pub struct RawSemaphore {
    /// The number of available permits; sleepers park on this word while it reads zero.
    permits: AtomicU32,
    /// The number of threads that are (or are about to be) parked; wakes are skipped while
    /// this is zero.
    sleepers: AtomicU32,
}

impl RawSemaphore {
    /// Consume a permit if any is available.
    fn try_acquire(&self) -> bool {
        self.permits
            .fetch_update(SeqCst, SeqCst, |p| p.checked_sub(1))
            .is_ok()
    }

    fn wait_with_deadline(&self, deadline: Option<std::time::Instant>) -> UnblockedOrTimedOut {
        loop {
            if self.try_acquire() {
                return UnblockedOrTimedOut::Unblocked;
            }
            let timeout = match deadline {
                None => None,
                Some(deadline) => match remaining_until(deadline) {
                    None => {
                        // Out of time: one last grab, since a post may have landed between our
                        // failed acquire and now.
                        return if self.try_acquire() {
                            UnblockedOrTimedOut::Unblocked
                        } else {
                            UnblockedOrTimedOut::TimedOut
                        };
                    }
                    Some(remaining) => Some(remaining),
                },
            };
            self.sleepers.fetch_add(1, SeqCst);
            futex_wait(&self.permits, 0, timeout);
            self.sleepers.fetch_sub(1, SeqCst);
        }
    }
}

impl syncport::platform::RawSemaphore for RawSemaphore {
    fn post(&self, n: u32) {
        if n == 0 {
            return;
        }
        self.permits.fetch_add(n, SeqCst);
        if self.sleepers.load(SeqCst) > 0 {
            futex_wake(&self.permits, n);
        }
    }

    fn wait(&self) {
        let _ = self.wait_with_deadline(None);
    }

    fn wait_timeout(&self, timeout: Duration) -> UnblockedOrTimedOut {
        match std::time::Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_with_deadline(Some(deadline)),
            // The deadline is beyond the clock's range; degrade to an untimed wait.
            None => self.wait_with_deadline(None),
        }
    }
}

impl syncport::platform::RawSemaphoreProvider for LinuxUserland {
    type RawSemaphore = RawSemaphore;

    fn new_raw_semaphore(&self, initial: u32) -> Self::RawSemaphore {
        RawSemaphore {
            permits: AtomicU32::new(initial),
            sleepers: AtomicU32::new(0),
        }
    }
}

/// An auto-reset event emulated over a futex word (0: unset, 1: set).
pub struct RawEvent {
    state: AtomicU32,
}

const EVENT_UNSET: u32 = 0;
const EVENT_SET: u32 = 1;

impl RawEvent {
    fn wait_with_deadline(&self, deadline: Option<std::time::Instant>) -> UnblockedOrTimedOut {
        loop {
            // Consuming the signal and resetting the event are one atomic step.
            if self.state.swap(EVENT_UNSET, SeqCst) == EVENT_SET {
                return UnblockedOrTimedOut::Unblocked;
            }
            let timeout = match deadline {
                None => None,
                Some(deadline) => match remaining_until(deadline) {
                    None => {
                        return if self.state.swap(EVENT_UNSET, SeqCst) == EVENT_SET {
                            UnblockedOrTimedOut::Unblocked
                        } else {
                            UnblockedOrTimedOut::TimedOut
                        };
                    }
                    Some(remaining) => Some(remaining),
                },
            };
            futex_wait(&self.state, EVENT_UNSET, timeout);
        }
    }
}

impl syncport::platform::RawEvent for RawEvent {
    fn signal(&self) {
        // Signaling an already-set event collapses into the pending signal.
        if self.state.swap(EVENT_SET, SeqCst) == EVENT_UNSET {
            futex_wake(&self.state, 1);
        }
    }

    fn wait(&self) {
        let _ = self.wait_with_deadline(None);
    }

    fn wait_timeout(&self, timeout: Duration) -> UnblockedOrTimedOut {
        match std::time::Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_with_deadline(Some(deadline)),
            None => self.wait_with_deadline(None),
        }
    }
}

impl syncport::platform::RawEventProvider for LinuxUserland {
    type RawEvent = RawEvent;

    fn new_raw_event(&self) -> Self::RawEvent {
        RawEvent {
            state: AtomicU32::new(EVENT_UNSET),
        }
    }
}

impl syncport::platform::ThreadIdProvider for LinuxUserland {
    fn current_thread_id(&self) -> syncport::platform::ThreadId {
        // SAFETY: gettid takes no arguments and cannot fail.
        let tid = unsafe { syscalls::syscall0(syscalls::Sysno::gettid) }
            .expect("gettid cannot fail");
        syncport::platform::ThreadId::new(u64::try_from(tid).unwrap())
            .expect("Linux thread ids are never zero")
    }
}

/// A monotonic instant; `std`'s clock is already the right one on Linux (`CLOCK_MONOTONIC`).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(std::time::Instant);

impl syncport::platform::Instant for Instant {
    fn checked_duration_since(&self, earlier: &Self) -> Option<Duration> {
        self.0.checked_duration_since(earlier.0)
    }

    fn checked_add(&self, duration: Duration) -> Option<Self> {
        Some(Instant(self.0.checked_add(duration)?))
    }
}

impl syncport::platform::TimeProvider for LinuxUserland {
    type Instant = Instant;

    fn now(&self) -> Self::Instant {
        Instant(std::time::Instant::now())
    }
}

impl syncport::platform::DebugLogProvider for LinuxUserland {
    fn debug_log_print(&self, msg: &str) {
        use std::io::Write;
        let _ = std::io::stderr().write_all(msg.as_bytes());
    }
}
