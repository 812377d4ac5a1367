// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Thread barriers
//!
//! A reusable rendezvous point for a fixed-size group of threads, layered on the
//! [`Mutex`](super::Mutex)/[`Condvar`](super::Condvar) pair. Each full rendezvous is a "cycle";
//! the cycle counter is what keeps a late-waking thread from confusing this cycle's broadcast
//! with the next one's.

use super::RawSyncPrimitivesProvider;
use super::condvar::Condvar;
use super::mutex::Mutex;

struct BarrierState {
    /// Threads that have arrived in the current cycle.
    arrived: u32,
    /// Completed-cycle counter; bumped when the last thread of a cycle arrives.
    cycle: u64,
}

/// A barrier enabling multiple threads to synchronize the beginning of some computation,
/// roughly analogous to Rust's
/// [`std::sync::Barrier`](https://doc.rust-lang.org/std/sync/struct.Barrier.html).
pub struct Barrier<Platform: RawSyncPrimitivesProvider> {
    total: u32,
    state: Mutex<Platform, BarrierState>,
    all_here: Condvar<Platform>,
}

/// Returned by [`Barrier::wait`] when all threads in the [`Barrier`] have rendezvoused.
#[must_use]
pub struct BarrierWaitResult(bool);

impl BarrierWaitResult {
    /// True for exactly one thread per barrier cycle (the `SERIAL_THREAD` analogue).
    pub fn is_leader(&self) -> bool {
        self.0
    }
}

impl<Platform: RawSyncPrimitivesProvider> Barrier<Platform> {
    /// Returns a new barrier that releases its waiters in groups of `n`.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero; a zero-width barrier could never release anyone.
    pub fn new(platform: &'static Platform, n: u32) -> Self {
        assert!(n > 0, "a barrier must rendezvous at least one thread");
        Self {
            total: n,
            state: Mutex::new(platform, BarrierState { arrived: 0, cycle: 0 }),
            all_here: Condvar::new(platform),
        }
    }

    /// Blocks the current thread until all threads have rendezvoused here.
    ///
    /// Barriers are re-usable after all threads have rendezvoused once, and can be used
    /// continuously.
    pub fn wait(&self) -> BarrierWaitResult {
        let mut state = self.state.lock();
        let cycle = state.cycle;
        state.arrived += 1;
        if state.arrived == self.total {
            // Last one in starts the next cycle and releases everyone else.
            state.arrived = 0;
            state.cycle = state.cycle.wrapping_add(1);
            drop(state);
            self.all_here.notify_all();
            BarrierWaitResult(true)
        } else {
            while state.cycle == cycle {
                state = self.all_here.wait(state);
            }
            BarrierWaitResult(false)
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
    use std::vec::Vec;

    #[test]
    fn exactly_one_leader_per_cycle() {
        const THREADS: u32 = 4;
        const CYCLES: u32 = 10;

        let platform = MockPlatform::new();
        let barrier = Arc::new(Barrier::new(platform, THREADS));
        let leaders = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let leaders = Arc::clone(&leaders);
                thread::spawn(move || {
                    for _ in 0..CYCLES {
                        if barrier.wait().is_leader() {
                            leaders.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(leaders.load(Ordering::Relaxed), CYCLES);
    }

    #[test]
    fn single_thread_barrier_never_blocks() {
        let platform = MockPlatform::new();
        let barrier = Barrier::new(platform, 1);
        assert!(barrier.wait().is_leader());
        assert!(barrier.wait().is_leader());
    }

    #[test]
    #[should_panic(expected = "at least one thread")]
    fn zero_width_barrier_is_rejected() {
        let platform = MockPlatform::new();
        let _ = Barrier::new(platform, 0);
    }
}
