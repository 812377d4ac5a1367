// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! One-time initialization
//!
//! The `pthread_once` analogue: many threads race to run an initializer, exactly one wins, and
//! everyone returns only after the initializer has completed. If the winning initializer
//! panics, the slot reverts to uninitialized and a blocked contender takes over, matching the
//! POSIX behavior for an init routine that never completes.

use crate::utils::defer;

use super::RawSyncPrimitivesProvider;
use super::condvar::Condvar;
use super::mutex::Mutex;

#[derive(Clone, Copy, PartialEq, Eq)]
enum OnceState {
    Incomplete,
    Running,
    Complete,
}

/// A one-time initialization cell, roughly analogous to Rust's
/// [`std::sync::Once`](https://doc.rust-lang.org/std/sync/struct.Once.html).
pub struct Once<Platform: RawSyncPrimitivesProvider> {
    state: Mutex<Platform, OnceState>,
    changed: Condvar<Platform>,
}

impl<Platform: RawSyncPrimitivesProvider> Once<Platform> {
    /// Returns a new, incomplete `Once`.
    pub fn new(platform: &'static Platform) -> Self {
        Self {
            state: Mutex::new(platform, OnceState::Incomplete),
            changed: Condvar::new(platform),
        }
    }

    /// Runs `f` if this `Once` has never completed; otherwise blocks until the in-flight
    /// initializer completes, then returns without running `f`.
    pub fn call_once(&self, f: impl FnOnce()) {
        let mut state = self.state.lock();
        loop {
            match *state {
                OnceState::Complete => return,
                OnceState::Running => {
                    state = self.changed.wait(state);
                }
                OnceState::Incomplete => {
                    *state = OnceState::Running;
                    drop(state);

                    // If `f` panics, revert to Incomplete and hand the job to a waiter.
                    let poison = defer(|| {
                        *self.state.lock() = OnceState::Incomplete;
                        self.changed.notify_one();
                    });
                    f();
                    core::mem::forget(poison);

                    *self.state.lock() = OnceState::Complete;
                    self.changed.notify_all();
                    return;
                }
            }
        }
    }

    /// True once an initializer has run to completion.
    pub fn is_completed(&self) -> bool {
        *self.state.lock() == OnceState::Complete
    }
}
