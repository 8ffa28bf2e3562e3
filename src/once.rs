//! One-time initialisation.
//!
//! A [`Once`] is a managed flag shared by every clone of its wrapper. The
//! first [`call_once`](Managed::call_once) runs its callback; every other
//! caller, on any thread, waits for that callback to return and then skips
//! its own.

use crate::callback::Callback;
use crate::heap::{Heap, Managed};
use once_cell::sync::OnceCell;
use tracing::trace;

/// Initialisation callback
pub type OnceCb = Callback<()>;

/// Managed one-time guard
#[derive(Debug, Default)]
pub struct Once {
    done: OnceCell<()>,
}

impl Once {
    /// Allocate a guard that has not run yet
    pub fn make(heap: &Heap) -> Managed<Once> {
        heap.allocate_plain("once")
    }
}

impl Managed<Once> {
    /// Run `cb` unless a callback already ran through this guard.
    ///
    /// Returns whether this call ran `cb`. The callback is released before
    /// returning in both cases.
    pub fn call_once(&self, cb: OnceCb) -> bool {
        let mut ran = false;
        self.done.get_or_init(|| {
            trace!(id = %self.id(), "Running one-time initialiser");
            cb.call(());
            ran = true;
        });
        ran
    }

    /// Whether a callback has completed
    pub fn is_completed(&self) -> bool {
        self.done.get().is_some()
    }
}
