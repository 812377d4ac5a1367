// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! # Syncport
//!
//! > POSIX-style synchronization primitives, re-hosted on a pluggable platform.
//!
//! Syncport exposes a pthread-flavored set of synchronization objects (mutexes, condition
//! variables, reader-writer locks, barriers, counting semaphores) "above" when it is provided a
//! `Platform` interface "below".
//!
//! To use Syncport, you must provide a type that implements the [`platform::Provider`] trait
//! (or at least the subset captured by [`sync::RawSyncPrimitivesProvider`]); then, one obtains
//! the primitives via the [`sync`] module. The platform only needs to supply two kinds of
//! waitable kernel objects (counting semaphores and auto-reset events), a thread identifier,
//! and a monotonic clock; everything else, including the fair-signaling condition variable
//! machinery, is built on top of those in this crate.

#![no_std]

extern crate alloc;

pub mod platform;
pub mod sync;
pub mod utils;
