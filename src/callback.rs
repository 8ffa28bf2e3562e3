//! Managed callbacks.
//!
//! A [`Callback`] is a closure plus its captured state, boxed inside a
//! managed object so it can sit in a wrapper's slot and be retained by a
//! trampoline for the duration of one invocation. Callbacks are `Fn` so a
//! re-entrant invocation (a callback that restarts its own handle) never
//! needs exclusive access to itself.

use crate::heap::{Heap, Managed};
use std::fmt;

/// Boxed closure stored inside a [`Callback`]
pub struct CallbackFn<A, R = ()> {
    f: Box<dyn Fn(A) -> R + Send + Sync>,
}

impl<A, R> CallbackFn<A, R> {
    /// Invoke the closure
    pub fn call(&self, args: A) -> R {
        (self.f)(args)
    }
}

impl<A, R> fmt::Debug for CallbackFn<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallbackFn")
    }
}

/// Managed closure taking `A` and returning `R`
pub type Callback<A, R = ()> = Managed<CallbackFn<A, R>>;

/// Close notification; runs once after the handle is torn down
pub type CloseCb = Callback<()>;

impl Heap {
    /// Wrap a closure as a managed callback
    pub fn callback<A, R, F>(&self, f: F) -> Callback<A, R>
    where
        A: 'static,
        R: 'static,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        self.allocate_tracked("callback", CallbackFn { f: Box::new(f) }, |_| {})
    }
}
