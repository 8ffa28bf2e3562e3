//! Stream writes.
//!
//! The gather list handed to the engine is scratch: it is built for the
//! call and poisoned as soon as the call returns. The byte arrays it points
//! into travel with the request and are released after the callback.

use super::{status_trampoline, submit, AsRequest, RequestCore, StatusCb};
use crate::buf::{BufRef, GatherList};
use crate::engine::RequestKind;
use crate::error::Status;
use crate::handle::{AsHandle, Pipe};
use crate::heap::{Heap, Managed};

/// Write completion callback
pub type WriteCb = StatusCb<Write>;

/// Managed write request
#[derive(Debug, Default)]
pub struct Write {
    core: RequestCore,
}

impl AsRequest for Write {
    const KIND: RequestKind = RequestKind::Write;

    fn request_core(&self) -> &RequestCore {
        &self.core
    }
}

impl Write {
    /// Allocate a write request
    pub fn make(heap: &Heap) -> Managed<Write> {
        heap.allocate_plain("write")
    }
}

impl Managed<Write> {
    /// Queue `bufs` on `stream` in order
    pub fn write(&self, stream: &Managed<Pipe>, bufs: Vec<BufRef>, cb: Option<WriteCb>) -> Status {
        let (lp, id) = stream.handle_core().open()?;
        let list = GatherList::build(&bufs)?;
        submit(self, &lp, cb, bufs, |native, data| {
            // SAFETY: `data` owns every array in `list` until the trampoline
            // has called back.
            unsafe { native.write(data, id, list.as_slice(), status_trampoline::<Write>) }
        })
    }
}
