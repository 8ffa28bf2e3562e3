//! Request wrappers.
//!
//! A request is a one-shot operation. Submitting one moves an [`OpData`]
//! into the engine request's data slot: an owned reference to the request
//! wrapper, the completion callback, and every buffer the operation reads
//! from or writes into. The engine owns that bundle until the completion
//! trampoline takes it back out, which empties the slot before the callback
//! runs. The callback is invoked exactly once, so the bundle's buffers are
//! released only after it returns.
//!
//! When submission fails the engine never stores the bundle; it is dropped
//! on the way out and the callback is released without being invoked.

pub mod connect;
pub mod dns;
pub mod fs;
pub mod random;
pub mod shutdown;
pub mod work;
pub mod write;

pub use connect::{Connect, ConnectCb};
pub use dns::{AddrInfoCb, GetAddrInfo};
pub use fs::{Fs, FsCb, FsOp};
pub use random::{Random, RandomCb};
pub use shutdown::{Shutdown, ShutdownCb};
pub use work::{AfterWorkCb, Work, WorkCb};
pub use write::{Write, WriteCb};

use crate::buf::BufRef;
use crate::callback::Callback;
use crate::engine::{self, Data, ReqId, RequestKind};
use crate::error::{Errno, Status};
use crate::event_loop::EventLoop;
use crate::heap::Managed;
use parking_lot::Mutex;
use std::fmt;
use tracing::trace;

/// State shared by every request wrapper
#[derive(Default)]
pub struct RequestCore {
    inflight: Mutex<Option<(Managed<EventLoop>, ReqId)>>,
}

impl RequestCore {
    fn inflight(&self) -> Option<(Managed<EventLoop>, ReqId)> {
        self.inflight.lock().clone()
    }
}

impl fmt::Debug for RequestCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let req = self.inflight.lock().as_ref().map(|(_, req)| *req);
        f.debug_struct("RequestCore").field("inflight", &req).finish()
    }
}

/// Implemented by every request wrapper
pub trait AsRequest: Send + Sync + Sized + 'static {
    /// Engine kind backing the wrapper
    const KIND: RequestKind;

    /// Shared request state
    fn request_core(&self) -> &RequestCore;
}

/// Everything the engine holds for one in-flight request
pub(crate) struct OpData<R: AsRequest, C> {
    pub(crate) request: Managed<R>,
    pub(crate) callback: Option<C>,
    pub(crate) bufs: Vec<BufRef>,
}

/// Submit `request` on `lp` through `engine_call`.
///
/// `Busy` while a previous submission of the same wrapper is in flight.
pub(crate) fn submit<R, C>(
    request: &Managed<R>,
    lp: &Managed<EventLoop>,
    callback: Option<C>,
    bufs: Vec<BufRef>,
    engine_call: impl FnOnce(&engine::Loop, Data) -> Result<ReqId, Errno>,
) -> Status
where
    R: AsRequest,
    C: Send + Sync + 'static,
{
    let mut inflight = request.request_core().inflight.lock();
    if inflight.is_some() {
        return Err(Errno::Busy);
    }
    let data: Data = Some(Box::new(OpData {
        request: request.clone(),
        callback,
        bufs,
    }));
    let req = engine_call(lp.native(), data)?;
    trace!(%req, kind = %R::KIND, "Request submitted");
    *inflight = Some((lp.clone(), req));
    Ok(())
}

/// Take the bundle back out of a completed request
pub(crate) fn complete<R, C>(native: &engine::Loop, req: ReqId) -> Option<OpData<R, C>>
where
    R: AsRequest,
    C: Send + Sync + 'static,
{
    let data = native.take_request_data(req)?;
    let op = *data.downcast::<OpData<R, C>>().ok()?;
    let previous = op.request.request_core().inflight.lock().take();
    drop(previous);
    Some(op)
}

/// Completion callback carrying only a status
pub type StatusCb<R> = Callback<(Managed<R>, Status)>;

/// Completion trampoline shared by requests whose result is a bare status
pub(crate) fn status_trampoline<R: AsRequest>(native: &engine::Loop, req: ReqId, status: Status) {
    let Some(op) = complete::<R, StatusCb<R>>(native, req) else {
        return;
    };
    let OpData {
        request,
        callback,
        bufs,
    } = op;
    if let Some(cb) = callback {
        cb.call((request, status));
    }
    drop(bufs);
}

impl<R: AsRequest> Managed<R> {
    /// Engine kind
    pub fn req_type(&self) -> RequestKind {
        R::KIND
    }

    /// Engine id of the in-flight submission
    pub fn request_id(&self) -> Option<ReqId> {
        self.request_core().inflight.lock().as_ref().map(|(_, req)| *req)
    }

    /// Whether a submission is in flight
    pub fn is_pending(&self) -> bool {
        self.request_core().inflight.lock().is_some()
    }

    /// Whether the engine still holds this request's callback bundle
    pub fn has_pending_callback(&self) -> bool {
        match self.request_core().inflight() {
            Some((lp, req)) => lp.native().request_has_data(req),
            None => false,
        }
    }

    /// Cancel a queued pool request; the callback then sees `Canceled`.
    ///
    /// `Busy` once the work has started, `InvalidArgument` for requests that
    /// are not pooled or not in flight.
    pub fn cancel(&self) -> Status {
        let (lp, req) = self
            .request_core()
            .inflight()
            .ok_or(Errno::InvalidArgument)?;
        lp.native().cancel(req)
    }
}
