//! Stream shutdown.

use super::{status_trampoline, submit, AsRequest, RequestCore, StatusCb};
use crate::engine::RequestKind;
use crate::error::Status;
use crate::handle::{AsHandle, Pipe};
use crate::heap::{Heap, Managed};

/// Shutdown completion callback
pub type ShutdownCb = StatusCb<Shutdown>;

/// Managed shutdown request
#[derive(Debug, Default)]
pub struct Shutdown {
    core: RequestCore,
}

impl AsRequest for Shutdown {
    const KIND: RequestKind = RequestKind::Shutdown;

    fn request_core(&self) -> &RequestCore {
        &self.core
    }
}

impl Shutdown {
    /// Allocate a shutdown request
    pub fn make(heap: &Heap) -> Managed<Shutdown> {
        heap.allocate_plain("shutdown")
    }
}

impl Managed<Shutdown> {
    /// Close the write side of `stream` once queued writes have drained
    pub fn shutdown(&self, stream: &Managed<Pipe>, cb: Option<ShutdownCb>) -> Status {
        let (lp, id) = stream.handle_core().open()?;
        submit(self, &lp, cb, Vec::new(), |native, data| {
            native.shutdown(data, id, status_trampoline::<Shutdown>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufRef;
    use crate::config::{BridgeConfig, ClockMode};
    use crate::engine::RunMode;
    use crate::error::Errno;
    use crate::event_loop::EventLoop;
    use crate::request::Write;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_peer_sees_data_then_eof() {
        let heap = Heap::instrumented();
        let lp = EventLoop::new(&heap, BridgeConfig::default().with_clock(ClockMode::Manual)).unwrap();
        let a = Pipe::make(&heap);
        a.init(&lp).unwrap();
        let b = Pipe::make(&heap);
        b.init(&lp).unwrap();
        a.link(&b).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let alloc_heap = heap.clone();
        b.read_start(
            heap.callback(move |(_, size): (Managed<Pipe>, usize)| Some(BufRef::whole(alloc_heap.bytes(size)))),
            heap.callback(move |(pipe, result): (Managed<Pipe>, Result<BufRef, Errno>)| match result {
                Ok(region) => seen.lock().push(String::from_utf8(region.to_vec().unwrap()).unwrap()),
                Err(e) => {
                    seen.lock().push(e.name().to_string());
                    pipe.close(None).unwrap();
                }
            }),
        )
        .unwrap();

        Write::make(&heap)
            .write(&a, vec![BufRef::whole(heap.bytes_from(b"bye"))], None)
            .unwrap();
        let shutdown = Shutdown::make(&heap);
        let done = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&done);
        shutdown
            .shutdown(
                &a,
                Some(heap.callback(move |(_, status): (Managed<Shutdown>, Status)| seen.lock().push(status))),
            )
            .unwrap();
        assert!(!a.is_writable());
        assert_eq!(
            Write::make(&heap).write(&a, vec![BufRef::whole(heap.bytes(1))], None),
            Err(Errno::BrokenPipe)
        );

        for _ in 0..3 {
            lp.run(RunMode::NoWait);
        }
        assert_eq!(*done.lock(), vec![Ok(())]);
        assert_eq!(*events.lock(), vec!["bye".to_string(), "EOF".to_string()]);
        assert!(b.is_closing());
    }
}
