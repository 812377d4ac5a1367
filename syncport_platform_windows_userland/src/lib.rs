// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A [Syncport platform](../syncport/platform/index.html) for running Syncport on userland
//! Windows.
//!
//! The waitable objects demanded by the platform interface map one-to-one onto kernel objects
//! here: counting semaphores are `CreateSemaphoreW` handles and auto-reset events are
//! `CreateEventW` handles, both waited on with `WaitForSingleObject`.

// Restrict this crate to only work on Windows; the platform interface is implemented entirely
// in terms of Win32 kernel objects.
#![cfg(target_os = "windows")]

use core::time::Duration;
use std::os::raw::c_void;
use std::os::windows::io::{AsRawHandle as _, FromRawHandle as _, OwnedHandle};

use syncport::platform::UnblockedOrTimedOut;
use syncport::utils::TruncateExt as _;

use windows_sys::Win32::Foundation::{GetLastError, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::System::Threading::{
    self as Win32_Threading, CreateEventW, CreateSemaphoreW, GetCurrentThreadId,
    ReleaseSemaphore, SetEvent, WaitForSingleObject,
};
use windows_sys::Win32::System::WindowsProgramming::QueryUnbiasedInterruptTimePrecise;

/// The userland Windows platform.
///
/// This implements the main [`syncport::platform::Provider`] trait, i.e., implements all
/// platform traits.
pub struct WindowsUserland {
    _private: (),
}

impl core::fmt::Debug for WindowsUserland {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WindowsUserland").finish_non_exhaustive()
    }
}

impl WindowsUserland {
    /// Create a new userland-Windows platform for use in Syncport.
    pub fn new() -> &'static Self {
        Box::leak(Box::new(Self { _private: () }))
    }
}

impl syncport::platform::Provider for WindowsUserland {}

/// Block on `handle` until it is signaled or `timeout` (if any) elapses.
///
/// # Panics
///
/// Panics on any wait outcome other than success or timeout; abandoned-mutex and failure
/// states cannot legitimately arise for semaphore and event handles owned by this crate.
fn wait_on_handle(handle: &OwnedHandle, timeout: Option<Duration>) -> UnblockedOrTimedOut {
    let timeout_ms = match timeout {
        None => Win32_Threading::INFINITE,
        Some(timeout) => {
            let ms = timeout.as_millis();
            ms.min(u128::from(Win32_Threading::INFINITE - 1)).truncate()
        }
    };
    let result = unsafe { WaitForSingleObject(handle.as_raw_handle(), timeout_ms) };
    match result {
        WAIT_OBJECT_0 => UnblockedOrTimedOut::Unblocked,
        WAIT_TIMEOUT => UnblockedOrTimedOut::TimedOut,
        e => {
            panic!("Unexpected result={e} from WaitForSingleObject, error={}", unsafe {
                GetLastError()
            });
        }
    }
}

/// A counting semaphore backed by a Win32 semaphore object.
pub struct RawSemaphore {
    handle: OwnedHandle,
}

impl syncport::platform::RawSemaphore for RawSemaphore {
    fn post(&self, n: u32) {
        if n == 0 {
            return;
        }
        let ok = unsafe {
            ReleaseSemaphore(
                self.handle.as_raw_handle(),
                i32::try_from(n).unwrap(),
                core::ptr::null_mut(),
            ) != 0
        };
        assert!(ok, "ReleaseSemaphore failed with error: {}", unsafe {
            GetLastError()
        });
    }

    fn wait(&self) {
        let _ = wait_on_handle(&self.handle, None);
    }

    fn wait_timeout(&self, timeout: Duration) -> UnblockedOrTimedOut {
        wait_on_handle(&self.handle, Some(timeout))
    }
}

impl syncport::platform::RawSemaphoreProvider for WindowsUserland {
    type RawSemaphore = RawSemaphore;

    fn new_raw_semaphore(&self, initial: u32) -> Self::RawSemaphore {
        let handle = unsafe {
            CreateSemaphoreW(
                core::ptr::null(),
                i32::try_from(initial).unwrap(),
                i32::MAX,
                core::ptr::null(),
            )
        };
        assert!(
            !handle.is_null(),
            "CreateSemaphoreW failed with error: {}",
            unsafe { GetLastError() }
        );
        RawSemaphore {
            // SAFETY: we just created this handle and are its sole owner.
            handle: unsafe { OwnedHandle::from_raw_handle(handle.cast::<c_void>()) },
        }
    }
}

/// An auto-reset event backed by a Win32 event object.
pub struct RawEvent {
    handle: OwnedHandle,
}

impl syncport::platform::RawEvent for RawEvent {
    fn signal(&self) {
        let ok = unsafe { SetEvent(self.handle.as_raw_handle()) != 0 };
        assert!(ok, "SetEvent failed with error: {}", unsafe {
            GetLastError()
        });
    }

    fn wait(&self) {
        let _ = wait_on_handle(&self.handle, None);
    }

    fn wait_timeout(&self, timeout: Duration) -> UnblockedOrTimedOut {
        wait_on_handle(&self.handle, Some(timeout))
    }
}

impl syncport::platform::RawEventProvider for WindowsUserland {
    type RawEvent = RawEvent;

    fn new_raw_event(&self) -> Self::RawEvent {
        let handle = unsafe {
            CreateEventW(
                core::ptr::null(),
                /* bManualReset */ 0,
                /* bInitialState */ 0,
                core::ptr::null(),
            )
        };
        assert!(
            !handle.is_null(),
            "CreateEventW failed with error: {}",
            unsafe { GetLastError() }
        );
        RawEvent {
            // SAFETY: we just created this handle and are its sole owner.
            handle: unsafe { OwnedHandle::from_raw_handle(handle.cast::<c_void>()) },
        }
    }
}

impl syncport::platform::ThreadIdProvider for WindowsUserland {
    fn current_thread_id(&self) -> syncport::platform::ThreadId {
        let id = unsafe { GetCurrentThreadId() };
        syncport::platform::ThreadId::new(u64::from(id))
            .expect("Windows thread ids are never zero")
    }
}

impl syncport::platform::TimeProvider for WindowsUserland {
    type Instant = Instant;

    fn now(&self) -> Self::Instant {
        let mut ts = 0;
        unsafe { QueryUnbiasedInterruptTimePrecise(&mut ts) };
        Instant(ts)
    }
}

/// 100ns units returned by `QueryUnbiasedInterruptTimePrecise`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(u64);

impl syncport::platform::Instant for Instant {
    fn checked_duration_since(&self, earlier: &Self) -> Option<Duration> {
        let diff = self.0.checked_sub(earlier.0)?;
        // Convert from 100ns intervals to nanoseconds. This won't overflow in
        // our lifetimes.
        Some(Duration::from_nanos(diff * 100))
    }

    fn checked_add(&self, duration: Duration) -> Option<Self> {
        let duration_100ns: u64 = (duration.as_nanos() / 100).try_into().ok()?;
        let new = self.0.checked_add(duration_100ns)?;
        Some(Instant(new))
    }
}

impl syncport::platform::DebugLogProvider for WindowsUserland {
    fn debug_log_print(&self, msg: &str) {
        use std::io::Write;
        let _ = std::io::stderr().write_all(msg.as_bytes());
    }
}
