//! Pipe connects.

use super::{status_trampoline, submit, AsRequest, RequestCore, StatusCb};
use crate::engine::RequestKind;
use crate::error::Status;
use crate::handle::{AsHandle, Pipe};
use crate::heap::{Heap, Managed};

/// Connect completion callback
pub type ConnectCb = StatusCb<Connect>;

/// Managed connect request
#[derive(Debug, Default)]
pub struct Connect {
    core: RequestCore,
}

impl AsRequest for Connect {
    const KIND: RequestKind = RequestKind::Connect;

    fn request_core(&self) -> &RequestCore {
        &self.core
    }
}

impl Connect {
    /// Allocate a connect request
    pub fn make(heap: &Heap) -> Managed<Connect> {
        heap.allocate_plain("connect")
    }
}

impl Managed<Connect> {
    /// Connect `pipe` to the listener bound at `name`.
    ///
    /// The callback sees `NotFound` when nothing listens at `name` and
    /// `ConnectionRefused` when the listener's backlog is full.
    pub fn connect(&self, pipe: &Managed<Pipe>, name: &str, cb: Option<ConnectCb>) -> Status {
        let (lp, id) = pipe.handle_core().open()?;
        submit(self, &lp, cb, Vec::new(), |native, data| {
            native.pipe_connect(data, id, name, status_trampoline::<Connect>)
        })
    }
}
