// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Higher-level synchronization primitives
//!
//! The locking protocol of [`Mutex`] is derived from the tri-state mutex in Rust's `std`,
//! modified to park contended lockers on a platform auto-reset event rather than a futex. The
//! [`Condvar`] implements the classic gate-and-queue fair-signaling design (two counting
//! semaphores plus three counters) used by hosted pthread runtimes; [`RwLock`], [`Barrier`],
//! and [`Once`] are layered on the mutex/condvar pair, as is conventional for such runtimes.

use crate::platform;

mod barrier;
mod condvar;
mod mutex;
mod once;
mod rwlock;
mod semaphore;
mod spinlock;

pub use barrier::{Barrier, BarrierWaitResult};
pub use condvar::{Condvar, WaitTimeoutResult};
pub use mutex::{CheckedMutex, Mutex, MutexError, MutexGuard, MutexKind};
pub use once::Once;
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::{MAX_PERMITS, NoPermit, Semaphore, SemaphoreError};
pub use spinlock::{SpinLock, SpinLockGuard};

/// A convenience name for specific requirements from the platform
pub trait RawSyncPrimitivesProvider:
    platform::RawSemaphoreProvider
    + platform::RawEventProvider
    + platform::ThreadIdProvider
    + platform::TimeProvider
    + Sync
    + 'static
{
}
impl<Platform> RawSyncPrimitivesProvider for Platform where
    Platform: platform::RawSemaphoreProvider
        + platform::RawEventProvider
        + platform::ThreadIdProvider
        + platform::TimeProvider
        + Sync
        + 'static
{
}
