// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The underlying platform upon which Syncport resides.
//!
//! The top-level trait that denotes something is a valid Syncport platform is [`Provider`]. This
//! trait is merely a collection of subtraits that could be composed independently from various
//! other crates that implement them upon various types.
//!
//! The waitable objects demanded here are deliberately Win32-shaped (counting semaphores and
//! auto-reset events) rather than futex-shaped: the primitives in [`crate::sync`] are built so
//! that they remain correct on hosts whose kernels only offer handle-based waiting, and a
//! futex-capable host can trivially emulate both objects.

#[cfg(test)]
pub(crate) mod mock;

/// A provider of a platform upon which Syncport can execute.
///
/// Ideally, a [`Provider`] is zero-sized, and only exists to provide access to functionality
/// provided by it. _However_, most of the provided APIs within the provider act upon an `&self`
/// to allow storage of any useful "globals" within it necessary.
pub trait Provider:
    RawSemaphoreProvider + RawEventProvider + ThreadIdProvider + TimeProvider + DebugLogProvider
{
}

/// A provider of raw counting semaphores.
pub trait RawSemaphoreProvider {
    type RawSemaphore: RawSemaphore;
    /// Allocate a new [`RawSemaphore`] holding `initial` permits.
    fn new_raw_semaphore(&self, initial: u32) -> Self::RawSemaphore;
}

/// A raw counting semaphore; expected to roughly match (or even be implemented using) a kernel
/// semaphore object.
///
/// Contract: permits are never lost; a wait returns only by consuming a permit (i.e., no
/// spurious wakeups at this layer); and a post may land before, during, or after the waiter it
/// ends up unblocking.
pub trait RawSemaphore: Send + Sync {
    /// Release `n` permits, unblocking up to `n` current or future waiters.
    fn post(&self, n: u32);

    /// Block until a permit can be consumed.
    fn wait(&self);

    /// Block until a permit can be consumed, or until `timeout` has passed without one becoming
    /// available.
    fn wait_timeout(&self, timeout: core::time::Duration) -> UnblockedOrTimedOut;
}

/// A provider of raw auto-reset events.
pub trait RawEventProvider {
    type RawEvent: RawEvent;
    /// Allocate a new, unsignaled [`RawEvent`].
    fn new_raw_event(&self) -> Self::RawEvent;
}

/// A raw auto-reset event in the Win32 sense.
///
/// Contract: [`signal`](Self::signal) releases exactly one current-or-future waiter, and
/// signaling an already-signaled event has no additional effect (the signal does not
/// accumulate). A wait returns only by consuming a signal.
pub trait RawEvent: Send + Sync {
    /// Signal the event, releasing exactly one current or future waiter.
    fn signal(&self);

    /// Block until the event is signaled, consuming the signal.
    fn wait(&self);

    /// Block until the event is signaled, or until `timeout` has passed without a signal.
    fn wait_timeout(&self, timeout: core::time::Duration) -> UnblockedOrTimedOut;
}

/// Named-boolean to indicate whether a timed wait consumed a permit/signal or timed out.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockedOrTimedOut {
    /// Unblocked by a post/signal.
    Unblocked,
    /// Sufficient time elapsed without a post/signal.
    TimedOut,
}

impl UnblockedOrTimedOut {
    /// Returns true for [`UnblockedOrTimedOut::TimedOut`].
    pub fn timed_out(self) -> bool {
        matches!(self, UnblockedOrTimedOut::TimedOut)
    }
}

/// An interface to identifying threads.
pub trait ThreadIdProvider {
    /// Returns an identifier for the calling thread, unique among all live threads.
    fn current_thread_id(&self) -> ThreadId;
}

/// An opaque, non-zero thread identifier.
///
/// The zero value is reserved so that owner-tracking primitives can use a plain atomic integer
/// with `0` meaning "unowned".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(core::num::NonZeroU64);

impl ThreadId {
    /// Wrap a raw identifier; returns `None` for the reserved zero value.
    pub const fn new(raw: u64) -> Option<Self> {
        match core::num::NonZeroU64::new(raw) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// The raw (non-zero) identifier.
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

/// An interface to understanding time.
pub trait TimeProvider {
    type Instant: Instant;
    /// Returns an instant corresponding to "now".
    fn now(&self) -> Self::Instant;
}

/// An opaque measurement of a monotonically nondecreasing clock.
pub trait Instant: Copy {
    /// Returns the amount of time elapsed from another instant to this one, or `None` if that
    /// instant is later than this one.
    fn checked_duration_since(&self, earlier: &Self) -> Option<core::time::Duration>;

    /// Returns the amount of time elapsed from another instant to this one, or zero duration if
    /// that instant is later than this one.
    fn duration_since(&self, earlier: &Self) -> core::time::Duration {
        self.checked_duration_since(earlier)
            .unwrap_or(core::time::Duration::from_secs(0))
    }

    /// Returns this instant advanced by `duration`, or `None` if the result is not
    /// representable.
    fn checked_add(&self, duration: core::time::Duration) -> Option<Self>
    where
        Self: Sized;
}

/// An interface to dumping debug output for tracing purposes.
pub trait DebugLogProvider {
    /// Print `msg` to the debug log
    ///
    /// Newlines are *not* automatically appended to `msg`, thus the caller must make sure to
    /// include newlines if necessary.
    fn debug_log_print(&self, msg: &str);
}
