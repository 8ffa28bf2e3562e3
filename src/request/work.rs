//! Thread pool work.
//!
//! The work callback runs on a pool thread and may stash a value on the
//! request with [`Managed::store_result`]; the after-work callback runs on
//! the loop thread and picks it up with [`Managed::take_result`].

use super::{status_trampoline, submit, AsRequest, RequestCore, StatusCb};
use crate::callback::Callback;
use crate::engine::RequestKind;
use crate::error::Status;
use crate::event_loop::EventLoop;
use crate::heap::{Heap, Managed};
use crate::slot::Slot;
use std::any::Any;

/// Body run on the pool
pub type WorkCb = Callback<Managed<Work>>;

/// Completion run on the loop thread; `Canceled` if the work never started
pub type AfterWorkCb = StatusCb<Work>;

/// Managed work request
#[derive(Debug, Default)]
pub struct Work {
    core: RequestCore,
    result: Slot<Box<dyn Any + Send + Sync>>,
}

impl AsRequest for Work {
    const KIND: RequestKind = RequestKind::Work;

    fn request_core(&self) -> &RequestCore {
        &self.core
    }
}

impl Work {
    /// Allocate a work request
    pub fn make(heap: &Heap) -> Managed<Work> {
        heap.allocate_plain("work")
    }
}

impl Managed<Work> {
    /// Queue `work` on the pool of `lp`
    pub fn queue(&self, lp: &Managed<EventLoop>, work: WorkCb, after: Option<AfterWorkCb>) -> Status {
        let request = self.clone();
        submit(self, lp, after, Vec::new(), move |native, data| {
            native.queue_work(
                data,
                Box::new(move || work.call(request)),
                status_trampoline::<Work>,
            )
        })
    }

    /// Stash a value for the after-work callback
    pub fn store_result<T: Any + Send + Sync>(&self, value: T) {
        self.result.install(Box::new(value));
    }

    /// Take the stashed value if it has type `T`
    pub fn take_result<T: Any + Send + Sync>(&self) -> Option<T> {
        let stored = self.result.take()?;
        match stored.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.result.install(other);
                None
            }
        }
    }
}
