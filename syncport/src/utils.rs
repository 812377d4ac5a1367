// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Miscellaneous "kitchen sink" for use in the various Syncport crates.
//!
//! Note: while we do not anticipate significant API changes in these utilities, these utilities
//! do not (necessarily) come with the API stability guarantees of the rest of Syncport's
//! modules.

/// An extension trait that adds `truncate` to truncate integers to a specific size of the same
/// signedness.
pub trait TruncateExt<To> {
    /// Truncate `self` to `To`, taking only lower-order bits.
    fn truncate(self) -> To;
}

macro_rules! impl_truncate {
    ($from:ty, $to:ty) => {
        impl TruncateExt<$to> for $from {
            #[inline(always)]
            fn truncate(self) -> $to {
                <$to>::from_le_bytes(
                    self.to_le_bytes()[..const { core::mem::size_of::<$to>() }]
                        .try_into()
                        .expect("guaranteed to be optimized out"),
                )
            }
        }
    };
}

impl_truncate! { usize, u32 }
impl_truncate! { u128, u64 }
impl_truncate! { u128, u32 }
impl_truncate! { u64, u32 }

/// An object that will run a closure when it goes out of scope.
pub struct Defer<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// Returns an object that will run `f` when it goes out of scope.
///
/// This is useful for cleaning up custom resources or for restoring invariants while calling
/// user-provided closures that may panic.
///
/// Caution: the returned object must be bound to a variable to ensure the closure runs at scope
/// end. In particular, binding to `_` will not work; use a named variable or a variable with a
/// name starting with `_` (e.g., `_defer`) instead.
#[must_use = "Must be bound to a variable to defer until scope end; variable name cannot be just '_' (but '_foo' is fine)."]
pub fn defer(f: impl FnOnce()) -> Defer<impl FnOnce()> {
    Defer(Some(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defer_runs_at_scope_end() {
        let n = core::cell::Cell::new(0);
        {
            let _defer = defer(|| n.set(n.get() + 1));
            assert_eq!(n.get(), 0);
        }
        assert_eq!(n.get(), 1);
    }

    #[test]
    fn truncate_takes_low_bits() {
        let x: u64 = 0x1_0000_0002;
        let y: u32 = x.truncate();
        assert_eq!(y, 2);
    }
}
