//! Pipe stream handles.
//!
//! Reads go through two trampolines. The allocation trampoline asks the
//! wrapper's allocation callback for a [`BufRef`], keeps it in the wrapper
//! and hands the engine a one-entry gather vector into it. The read
//! trampoline takes the kept buffer back, recovers the region's offset from
//! the engine's pointer and passes the filled region to the read callback.

use super::{make, recover, AsHandle, HandleCore};
use crate::buf::{BufRef, GatherList, IoVec};
use crate::callback::Callback;
use crate::engine::{self, HandleId, HandleKind};
use crate::error::{Errno, Status};
use crate::event_loop::EventLoop;
use crate::heap::{Heap, Managed};
use crate::slot::Slot;
use tracing::trace;

/// Allocation callback: `(pipe, suggested_size)` to a destination region
pub type AllocCb = Callback<(Managed<Pipe>, usize), Option<BufRef>>;

/// Read callback: the filled region, `Eof`, or an error
pub type ReadCb = Callback<(Managed<Pipe>, Result<BufRef, Errno>)>;

/// Connection callback for a listening pipe
pub type ConnectionCb = Callback<(Managed<Pipe>, Status)>;

/// Managed pipe handle
#[derive(Debug)]
pub struct Pipe {
    core: HandleCore,
    alloc_cb: Slot<AllocCb>,
    read_cb: Slot<ReadCb>,
    connection_cb: Slot<ConnectionCb>,
    read_buf: Slot<BufRef>,
}

impl AsHandle for Pipe {
    const KIND: HandleKind = HandleKind::NamedPipe;

    fn handle_core(&self) -> &HandleCore {
        &self.core
    }

    fn release_callbacks(&self) {
        self.alloc_cb.clear();
        self.read_cb.clear();
        self.connection_cb.clear();
        self.read_buf.clear();
    }
}

impl Pipe {
    /// Allocate an uninitialised pipe
    pub fn make(heap: &Heap) -> Managed<Pipe> {
        make(
            heap,
            Pipe {
                core: HandleCore::new(),
                alloc_cb: Slot::new(),
                read_cb: Slot::new(),
                connection_cb: Slot::new(),
                read_buf: Slot::new(),
            },
        )
    }
}

fn alloc_trampoline(native: &engine::Loop, id: HandleId, suggested: usize) -> IoVec {
    let Some(pipe) = recover::<Pipe>(native, id) else {
        return IoVec::EMPTY;
    };
    let Some(cb) = pipe.alloc_cb.retained() else {
        return IoVec::EMPTY;
    };
    let Some(buf) = cb.call((pipe.clone(), suggested)) else {
        return IoVec::EMPTY;
    };
    let iov = match GatherList::build(std::slice::from_ref(&buf)) {
        Ok(list) => list.as_slice().first().copied().unwrap_or(IoVec::EMPTY),
        Err(e) => {
            trace!(%id, error = %e, "Allocated region out of bounds");
            return IoVec::EMPTY;
        }
    };
    pipe.read_buf.install(buf);
    iov
}

fn read_trampoline(native: &engine::Loop, id: HandleId, nread: Result<usize, Errno>, iov: IoVec) {
    let Some(pipe) = recover::<Pipe>(native, id) else {
        return;
    };
    let held = pipe.read_buf.take();
    let Some(cb) = pipe.read_cb.retained() else {
        return;
    };
    let result = nread.and_then(|n| {
        let buf = held.ok_or(Errno::NoBufferSpace)?;
        let offset = iov.offset_in(&buf.bytes).ok_or(Errno::NoBufferSpace)?;
        Ok(BufRef::new(buf.bytes, offset, n))
    });
    cb.call((pipe, result));
}

fn connection_trampoline(native: &engine::Loop, id: HandleId, status: Status) {
    let Some(pipe) = recover::<Pipe>(native, id) else {
        return;
    };
    let Some(cb) = pipe.connection_cb.retained() else {
        return;
    };
    cb.call((pipe, status));
}

impl Managed<Pipe> {
    /// Bind the pipe to `lp`
    pub fn init(&self, lp: &Managed<EventLoop>) -> Status {
        self.core.register(lp, |native| native.pipe_init())
    }

    /// Bind to `name`; `AddressInUse` if another pipe holds it
    pub fn bind(&self, name: &str) -> Status {
        let (lp, id) = self.core.open()?;
        lp.native().pipe_bind(id, name)
    }

    /// Listen for connections on a bound pipe
    pub fn listen(&self, backlog: usize, cb: ConnectionCb) -> Status {
        let (lp, id) = self.core.open()?;
        lp.native().listen(id, backlog, connection_trampoline)?;
        self.connection_cb.install(cb);
        self.mark_armed(lp.native(), id)
    }

    /// Pair the oldest pending connection with `client`
    pub fn accept(&self, client: &Managed<Pipe>) -> Status {
        let (lp, server) = self.core.open()?;
        let (client_lp, client_id) = client.core.open()?;
        if !Managed::ptr_eq(&lp, &client_lp) {
            return Err(Errno::InvalidArgument);
        }
        lp.native().accept(server, client_id)
    }

    /// Connect directly to another unconnected pipe on the same loop
    pub fn link(&self, peer: &Managed<Pipe>) -> Status {
        let (lp, id) = self.core.open()?;
        let (peer_lp, peer_id) = peer.core.open()?;
        if !Managed::ptr_eq(&lp, &peer_lp) {
            return Err(Errno::InvalidArgument);
        }
        lp.native().pipe_link(id, peer_id)
    }

    /// Start reading; `alloc_cb` supplies each destination region
    pub fn read_start(&self, alloc_cb: AllocCb, read_cb: ReadCb) -> Status {
        let (lp, id) = self.core.open()?;
        // SAFETY: the alloc trampoline parks each region's owner in
        // `read_buf`, and only the read trampoline takes it back out.
        unsafe { lp.native().read_start(id, alloc_trampoline, read_trampoline)? };
        self.alloc_cb.install(alloc_cb);
        self.read_cb.install(read_cb);
        self.mark_armed(lp.native(), id)
    }

    /// Stop reading and release the read callbacks; idempotent
    pub fn read_stop(&self) -> Status {
        let (lp, id) = self.core.open()?;
        lp.native().read_stop(id)?;
        self.alloc_cb.clear();
        self.read_cb.clear();
        self.read_buf.clear();
        Ok(())
    }

    /// Whether the pipe can deliver bytes
    pub fn is_readable(&self) -> bool {
        self.core
            .with_native(|native, id| native.is_readable(id))
            .unwrap_or(false)
    }

    /// Whether the pipe accepts writes
    pub fn is_writable(&self) -> bool {
        self.core
            .with_native(|native, id| native.is_writable(id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, ClockMode};
    use crate::engine::{ReqId, RunMode};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn setup() -> (Heap, Managed<EventLoop>) {
        let heap = Heap::instrumented();
        let lp = EventLoop::new(&heap, BridgeConfig::default().with_clock(ClockMode::Manual)).unwrap();
        (heap, lp)
    }

    fn ignore(_: &engine::Loop, _: ReqId, _: Status) {}

    fn send(lp: &Managed<EventLoop>, from: &Managed<Pipe>, bytes: &[u8]) {
        let payload = lp.heap().bytes_from(bytes);
        let list = GatherList::build(&[BufRef::whole(payload.clone())]).unwrap();
        let id = from.handle_id().unwrap();
        // SAFETY: `payload` outlives the run that completes the write.
        unsafe { lp.native().write(None, id, list.as_slice(), ignore) }.unwrap();
        drop(list);
        lp.run(RunMode::NoWait);
        drop(payload);
    }

    #[derive(Default)]
    struct Received {
        bytes: Vec<u8>,
        eof: usize,
    }

    fn reader(heap: &Heap, chunk: usize) -> (AllocCb, ReadCb, Arc<Mutex<Received>>) {
        let received = Arc::new(Mutex::new(Received::default()));
        let alloc_heap = heap.clone();
        let alloc: AllocCb = heap.callback(move |(_, suggested): (Managed<Pipe>, usize)| {
            let bytes = alloc_heap.bytes(suggested.min(chunk) + 2);
            let len = bytes.len() - 2;
            Some(BufRef::new(bytes, 2, len))
        });
        let seen = Arc::clone(&received);
        let read: ReadCb = heap.callback(move |(_, result): (Managed<Pipe>, Result<BufRef, Errno>)| {
            let mut received = seen.lock();
            match result {
                Ok(region) => {
                    assert_eq!(region.offset, 2);
                    received.bytes.extend(region.to_vec().unwrap());
                }
                Err(Errno::Eof) => received.eof += 1,
                Err(e) => panic!("read failed: {e}"),
            }
        });
        (alloc, read, received)
    }

    #[test]
    fn test_read_recovers_region_offsets() {
        let (heap, lp) = setup();
        let a = Pipe::make(&heap);
        a.init(&lp).unwrap();
        let b = Pipe::make(&heap);
        b.init(&lp).unwrap();
        assert!(!b.is_readable());
        a.link(&b).unwrap();
        assert!(b.is_readable());

        let (alloc, read, received) = reader(&heap, 3);
        b.read_start(alloc, read).unwrap();
        send(&lp, &a, b"abcdefgh");
        for _ in 0..4 {
            lp.run(RunMode::NoWait);
        }
        assert_eq!(received.lock().bytes, b"abcdefgh");
        assert_eq!(received.lock().eof, 0);
        assert!(b.read_buf.is_empty());

        b.read_stop().unwrap();
        b.read_stop().unwrap();
        assert!(b.alloc_cb.is_empty());
    }

    #[test]
    fn test_declined_allocation_reports_no_buffer_space() {
        let (heap, lp) = setup();
        let a = Pipe::make(&heap);
        a.init(&lp).unwrap();
        let b = Pipe::make(&heap);
        b.init(&lp).unwrap();
        a.link(&b).unwrap();

        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&errors);
        b.read_start(
            heap.callback(|_: (Managed<Pipe>, usize)| None),
            heap.callback(move |(pipe, result): (Managed<Pipe>, Result<BufRef, Errno>)| {
                seen.lock().push(result.map(|r| r.len));
                pipe.read_stop().unwrap();
            }),
        )
        .unwrap();
        send(&lp, &a, b"zz");
        lp.run(RunMode::NoWait);
        assert_eq!(*errors.lock(), vec![Err(Errno::NoBufferSpace)]);
    }

    #[test]
    fn test_listen_and_accept_in_callback() {
        let (heap, lp) = setup();
        let server = Pipe::make(&heap);
        server.init(&lp).unwrap();
        assert_eq!(
            server.listen(4, heap.callback(|_: (Managed<Pipe>, Status)| {})),
            Err(Errno::InvalidArgument)
        );
        server.bind("bridge-accept-test").unwrap();

        let accepted = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&accepted);
        server
            .listen(
                4,
                heap.callback(move |(server, status): (Managed<Pipe>, Status)| {
                    assert_eq!(status, Ok(()));
                    let lp = server.event_loop().unwrap();
                    let conn = Pipe::make(lp.heap());
                    conn.init(&lp).unwrap();
                    server.accept(&conn).unwrap();
                    seen.lock().push(conn);
                }),
            )
            .unwrap();

        let client = Pipe::make(&heap);
        client.init(&lp).unwrap();
        let client_id = client.handle_id().unwrap();
        lp.native()
            .pipe_connect(None, client_id, "bridge-accept-test", ignore)
            .unwrap();
        lp.run(RunMode::NoWait);

        let conns = accepted.lock();
        assert_eq!(conns.len(), 1);
        assert!(conns[0].is_writable());
        assert!(client.is_writable());
    }

    #[test]
    fn test_close_releases_read_callbacks() {
        let (heap, lp) = setup();
        let a = Pipe::make(&heap);
        let a_id = a.id();
        a.init(&lp).unwrap();
        let b = Pipe::make(&heap);
        b.init(&lp).unwrap();
        a.link(&b).unwrap();

        let (alloc, read, _) = reader(&heap, 8);
        let (alloc_id, read_id) = (alloc.id(), read.id());
        a.read_start(alloc, read).unwrap();
        a.close(None).unwrap();
        lp.run(RunMode::NoWait);

        assert!(heap.ledger().stats(alloc_id).unwrap().is_balanced());
        assert!(heap.ledger().stats(read_id).unwrap().is_balanced());
        assert!(!b.is_writable());
        drop(a);
        assert!(heap.ledger().stats(a_id).unwrap().is_balanced());
    }
}
