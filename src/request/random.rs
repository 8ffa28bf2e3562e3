//! Random byte requests.

use super::{status_trampoline, submit, AsRequest, RequestCore, StatusCb};
use crate::buf::{BufRef, GatherList};
use crate::engine::RequestKind;
use crate::error::Status;
use crate::event_loop::EventLoop;
use crate::heap::{Heap, Managed};

/// Fill completion callback
pub type RandomCb = StatusCb<Random>;

/// Managed random-bytes request
#[derive(Debug, Default)]
pub struct Random {
    core: RequestCore,
}

impl AsRequest for Random {
    const KIND: RequestKind = RequestKind::Random;

    fn request_core(&self) -> &RequestCore {
        &self.core
    }
}

impl Random {
    /// Allocate a random request
    pub fn make(heap: &Heap) -> Managed<Random> {
        heap.allocate_plain("random")
    }

    /// Fill `buf` on the calling thread
    pub fn fill_sync(lp: &Managed<EventLoop>, buf: BufRef) -> Status {
        let list = GatherList::build(std::slice::from_ref(&buf))?;
        // SAFETY: `buf` is held across the call.
        let status = unsafe { lp.native().random_sync(list.as_slice()) };
        drop(buf);
        status
    }
}

impl Managed<Random> {
    /// Fill `buf` on the pool; the array stays alive until `cb` returns
    pub fn fill(&self, lp: &Managed<EventLoop>, buf: BufRef, cb: Option<RandomCb>) -> Status {
        let list = GatherList::build(std::slice::from_ref(&buf))?;
        submit(self, lp, cb, vec![buf], |native, data| {
            // SAFETY: `data` owns the array until the trampoline has called back.
            unsafe { native.random(data, list.as_slice(), status_trampoline::<Random>) }
        })
    }
}
