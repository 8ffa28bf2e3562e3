//! In-memory named pipes.
//!
//! A pipe end is a handle record holding an inbox of bytes written by its
//! peer. Servers bind a name and listen; clients connect by name and are
//! parked on the server's backlog until accepted. Writes and shutdowns queue
//! as stream operations and are carried out during poll, in submission order
//! per stream.

use super::{Data, Detail, HandleId, Loop, LoopState, Pending, ReqCb, ReqId, RequestKind, ACTIVE};
use crate::buf::{self, IoVec};
use crate::error::{Errno, Status};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, trace};

/// Allocation trampoline: `(loop, stream, suggested_size)` to a destination
pub type AllocCb = fn(&Loop, HandleId, usize) -> IoVec;

/// Read trampoline: bytes read (or `Eof`/error) and the buffer from the allocation
pub type ReadCb = fn(&Loop, HandleId, Result<usize, Errno>, IoVec);

/// Connection trampoline for a listening pipe
pub type ConnectionCb = fn(&Loop, HandleId, Status);

#[derive(Default)]
pub(crate) struct PipeState {
    peer: Option<HandleId>,
    peer_shut: bool,
    write_shut: bool,
    reading: Option<(AllocCb, ReadCb)>,
    listener: Option<ConnectionCb>,
    backlog_limit: usize,
    backlog: VecDeque<HandleId>,
    awaiting: Option<HandleId>,
    name: Option<String>,
    inbox: VecDeque<u8>,
    eof_delivered: bool,
}

impl PipeState {
    fn connected(&self) -> bool {
        self.peer.is_some() || self.awaiting.is_some()
    }

    fn read_ready(&self) -> bool {
        self.reading.is_some() && (!self.inbox.is_empty() || (self.peer_shut && !self.eof_delivered))
    }
}

pub(crate) enum StreamOp {
    Write {
        req: ReqId,
        stream: HandleId,
        iov: Vec<IoVec>,
    },
    Shutdown {
        req: ReqId,
        stream: HandleId,
    },
}

impl StreamOp {
    fn req(&self) -> ReqId {
        match self {
            StreamOp::Write { req, .. } | StreamOp::Shutdown { req, .. } => *req,
        }
    }

    fn stream(&self) -> HandleId {
        match self {
            StreamOp::Write { stream, .. } | StreamOp::Shutdown { stream, .. } => *stream,
        }
    }
}

fn pipe(st: &LoopState, id: HandleId) -> Option<&PipeState> {
    match st.handles.get(id.0) {
        Some(rec) if !rec.is_closing() => match &rec.detail {
            Detail::Pipe(pipe) => Some(pipe),
            _ => None,
        },
        _ => None,
    }
}

fn pipe_mut(st: &mut LoopState, id: HandleId) -> Result<(&mut PipeState, &mut u8), Errno> {
    let rec = st.handles.get_mut(id.0).ok_or(Errno::InvalidArgument)?;
    if rec.is_closing() {
        return Err(Errno::InvalidArgument);
    }
    match &mut rec.detail {
        Detail::Pipe(pipe) => Ok((pipe, &mut rec.flags)),
        _ => Err(Errno::InvalidArgument),
    }
}

fn link(st: &mut LoopState, a: HandleId, b: HandleId) -> Status {
    {
        let (pa, _) = pipe_mut(st, a)?;
        pa.peer = Some(b);
        pa.awaiting = None;
    }
    let (pb, _) = pipe_mut(st, b)?;
    pb.peer = Some(a);
    pb.awaiting = None;
    Ok(())
}

/// Sever a pipe end that is closing or being discarded
pub(crate) fn detach_pipe(st: &mut LoopState, id: HandleId) {
    let (peer, name, backlog, awaiting) = match st.handles.get_mut(id.0).map(|r| &mut r.detail) {
        Some(Detail::Pipe(pipe)) => {
            pipe.reading = None;
            pipe.listener = None;
            pipe.inbox.clear();
            (
                pipe.peer.take(),
                pipe.name.take(),
                std::mem::take(&mut pipe.backlog),
                pipe.awaiting.take(),
            )
        }
        _ => return,
    };

    if let Some(name) = name {
        st.pipe_names.remove(&name);
    }
    for client in backlog.into_iter().chain(peer) {
        if let Some(Detail::Pipe(other)) = st.handles.get_mut(client.0).map(|r| &mut r.detail) {
            other.peer = None;
            other.awaiting = None;
            other.peer_shut = true;
        }
    }
    if let Some(server) = awaiting {
        if let Some(Detail::Pipe(server)) = st.handles.get_mut(server.0).map(|r| &mut r.detail) {
            server.backlog.retain(|h| *h != id);
        }
    }

    let ops = std::mem::take(&mut st.stream_ops);
    for op in ops {
        if op.stream() == id {
            st.pending.push_back(Pending::Request {
                req: op.req(),
                status: Err(Errno::Canceled),
            });
        } else {
            st.stream_ops.push_back(op);
        }
    }
}

impl Loop {
    /// Register an unconnected pipe end
    pub fn pipe_init(&self) -> Result<HandleId, Errno> {
        self.handle_init(super::HandleKind::NamedPipe)
    }

    /// Bind a pipe to `name`
    pub fn pipe_bind(&self, id: HandleId, name: &str) -> Status {
        if name.is_empty() {
            return Err(Errno::InvalidArgument);
        }
        let mut st = self.state.lock();
        if st.pipe_names.contains_key(name) {
            return Err(Errno::AddressInUse);
        }
        let (pipe, _) = pipe_mut(&mut st, id)?;
        if pipe.name.is_some() || pipe.connected() {
            return Err(Errno::InvalidArgument);
        }
        pipe.name = Some(name.to_string());
        st.pipe_names.insert(name.to_string(), id);
        debug!(loop_id = %self.id, %id, name, "Pipe bound");
        Ok(())
    }

    /// Accept connections on a bound pipe
    pub fn listen(&self, id: HandleId, backlog: usize, cb: ConnectionCb) -> Status {
        let mut st = self.state.lock();
        let (pipe, flags) = pipe_mut(&mut st, id)?;
        if pipe.name.is_none() {
            return Err(Errno::InvalidArgument);
        }
        pipe.listener = Some(cb);
        pipe.backlog_limit = backlog.max(1);
        *flags |= ACTIVE;
        Ok(())
    }

    /// Pair the oldest pending connection on `server` with `client`
    pub fn accept(&self, server: HandleId, client: HandleId) -> Status {
        let mut st = self.state.lock();
        {
            let (target, _) = pipe_mut(&mut st, client)?;
            if target.connected() || target.name.is_some() {
                return Err(Errno::InvalidArgument);
            }
        }
        let (listener, _) = pipe_mut(&mut st, server)?;
        if listener.listener.is_none() {
            return Err(Errno::InvalidArgument);
        }
        let incoming = listener.backlog.pop_front().ok_or(Errno::WouldBlock)?;
        link(&mut st, client, incoming)?;
        trace!(loop_id = %self.id, %server, %client, %incoming, "Connection accepted");
        Ok(())
    }

    /// Connect two unconnected pipe ends directly
    pub fn pipe_link(&self, a: HandleId, b: HandleId) -> Status {
        if a == b {
            return Err(Errno::InvalidArgument);
        }
        let mut st = self.state.lock();
        for id in [a, b] {
            let (pipe, _) = pipe_mut(&mut st, id)?;
            if pipe.connected() || pipe.name.is_some() {
                return Err(Errno::InvalidArgument);
            }
        }
        link(&mut st, a, b)
    }

    /// Connect `client` to the pipe bound at `name`.
    ///
    /// The completion fires with `NotFound` when nothing listens there and
    /// `ConnectionRefused` when the listener's backlog is full.
    pub fn pipe_connect(
        &self,
        mut data: Data,
        client: HandleId,
        name: &str,
        cb: ReqCb,
    ) -> Result<ReqId, Errno> {
        let mut st = self.state.lock();
        {
            let (pipe, _) = pipe_mut(&mut st, client)?;
            if pipe.connected() || pipe.name.is_some() {
                return Err(Errno::InvalidArgument);
            }
        }
        let req = self.insert_request(&mut st, RequestKind::Connect, &mut data, Some(cb), None)?;

        let server = st.pipe_names.get(name).copied();
        let status = match server {
            None => Err(Errno::NotFound),
            Some(server) => match pipe_mut(&mut st, server) {
                Ok((listener, _)) if listener.listener.is_some() => {
                    if listener.backlog.len() >= listener.backlog_limit {
                        Err(Errno::ConnectionRefused)
                    } else {
                        listener.backlog.push_back(client);
                        Ok(server)
                    }
                }
                _ => Err(Errno::NotFound),
            },
        };
        match status {
            Ok(server) => {
                if let Ok((pipe, _)) = pipe_mut(&mut st, client) {
                    pipe.awaiting = Some(server);
                }
                st.pending.push_back(Pending::Connection {
                    server,
                    status: Ok(()),
                });
                st.pending.push_back(Pending::Request { req, status: Ok(()) });
            }
            Err(e) => st.pending.push_back(Pending::Request { req, status: Err(e) }),
        }
        Ok(req)
    }

    /// Start delivering incoming bytes
    ///
    /// # Safety
    ///
    /// Every `IoVec` that `alloc_cb` returns must describe live memory until
    /// `read_cb` has been called with it.
    pub unsafe fn read_start(&self, id: HandleId, alloc_cb: AllocCb, read_cb: ReadCb) -> Status {
        let mut st = self.state.lock();
        let (pipe, flags) = pipe_mut(&mut st, id)?;
        if pipe.reading.is_some() {
            return Err(Errno::AlreadyInProgress);
        }
        if !pipe.connected() && pipe.inbox.is_empty() && !pipe.peer_shut {
            return Err(Errno::NotConnected);
        }
        pipe.reading = Some((alloc_cb, read_cb));
        *flags |= ACTIVE;
        Ok(())
    }

    /// Stop delivering incoming bytes; idempotent
    pub fn read_stop(&self, id: HandleId) -> Status {
        let mut st = self.state.lock();
        let (pipe, flags) = pipe_mut(&mut st, id)?;
        pipe.reading = None;
        if pipe.listener.is_none() {
            *flags &= !ACTIVE;
        }
        Ok(())
    }

    /// Whether the stream can deliver bytes
    pub fn is_readable(&self, id: HandleId) -> bool {
        let st = self.state.lock();
        pipe(&st, id).map_or(false, |p| p.connected() || !p.inbox.is_empty())
    }

    /// Whether the stream accepts writes
    pub fn is_writable(&self, id: HandleId) -> bool {
        let st = self.state.lock();
        pipe(&st, id).map_or(false, |p| p.connected() && !p.write_shut)
    }

    fn check_writable(st: &mut LoopState, stream: HandleId) -> Status {
        let (pipe, _) = pipe_mut(st, stream)?;
        if pipe.write_shut {
            return Err(Errno::BrokenPipe);
        }
        if !pipe.connected() {
            return Err(if pipe.peer_shut {
                Errno::BrokenPipe
            } else {
                Errno::NotConnected
            });
        }
        Ok(())
    }

    /// Queue a write of everything `iov` describes.
    ///
    /// The engine keeps its own copy of the entries.
    ///
    /// # Safety
    ///
    /// The memory described by `iov` must stay alive and unaliased by writers
    /// until `cb` fires for the returned request.
    pub unsafe fn write(
        &self,
        mut data: Data,
        stream: HandleId,
        iov: &[IoVec],
        cb: ReqCb,
    ) -> Result<ReqId, Errno> {
        if iov.iter().any(IoVec::is_poisoned) {
            return Err(Errno::InvalidArgument);
        }
        let mut st = self.state.lock();
        Self::check_writable(&mut st, stream)?;
        let req = self.insert_request(&mut st, RequestKind::Write, &mut data, Some(cb), None)?;
        st.stream_ops.push_back(StreamOp::Write {
            req,
            stream,
            iov: iov.to_vec(),
        });
        Ok(req)
    }

    /// Shut down the write side; the peer sees `Eof` once queued writes drain
    pub fn shutdown(&self, mut data: Data, stream: HandleId, cb: ReqCb) -> Result<ReqId, Errno> {
        let mut st = self.state.lock();
        Self::check_writable(&mut st, stream)?;
        let req = self.insert_request(&mut st, RequestKind::Shutdown, &mut data, Some(cb), None)?;
        if let Ok((pipe, _)) = pipe_mut(&mut st, stream) {
            pipe.write_shut = true;
        }
        st.stream_ops.push_back(StreamOp::Shutdown { req, stream });
        Ok(req)
    }

    fn op_ready(st: &LoopState, op: &StreamOp) -> bool {
        match pipe(st, op.stream()) {
            Some(p) => p.awaiting.is_none(),
            None => true,
        }
    }

    pub(crate) fn streams_ready(st: &LoopState) -> bool {
        st.stream_ops.iter().any(|op| Self::op_ready(st, op))
            || st.handles.iter().any(|(_, rec)| match &rec.detail {
                Detail::Pipe(p) => !rec.is_closing() && p.read_ready(),
                _ => false,
            })
    }

    pub(crate) fn run_streams(&self) -> usize {
        let mut events = self.run_stream_ops();
        events += self.run_reads();
        events
    }

    fn run_stream_ops(&self) -> usize {
        let done: Vec<(ReqId, Status)> = {
            let mut st = self.state.lock();
            let ops = std::mem::take(&mut st.stream_ops);
            let mut blocked = HashSet::new();
            let mut done = Vec::new();
            for op in ops {
                let stream = op.stream();
                if blocked.contains(&stream) || !Self::op_ready(&st, &op) {
                    blocked.insert(stream);
                    st.stream_ops.push_back(op);
                    continue;
                }
                let status = Self::perform(&mut st, &op);
                done.push((op.req(), status));
            }
            done
        };
        let count = done.len();
        for (req, status) in done {
            self.deliver_request(req, status, None);
        }
        count
    }

    fn perform(st: &mut LoopState, op: &StreamOp) -> Status {
        let stream = op.stream();
        let peer = match pipe(st, stream) {
            Some(p) => p.peer,
            None => return Err(Errno::Canceled),
        };
        match op {
            StreamOp::Write { iov, .. } => {
                let peer = peer.ok_or(Errno::BrokenPipe)?;
                // SAFETY: the write request's data slot keeps the arrays alive
                // until its completion is delivered.
                let bytes = unsafe { buf::gather(iov) };
                let (target, _) = pipe_mut(st, peer).map_err(|_| Errno::BrokenPipe)?;
                target.inbox.extend(bytes);
                Ok(())
            }
            StreamOp::Shutdown { .. } => {
                if let Some(peer) = peer {
                    if let Ok((target, _)) = pipe_mut(st, peer) {
                        target.peer_shut = true;
                    }
                }
                Ok(())
            }
        }
    }

    fn run_reads(&self) -> usize {
        let ready: Vec<HandleId> = {
            let st = self.state.lock();
            st.handles
                .iter()
                .filter_map(|(key, rec)| match &rec.detail {
                    Detail::Pipe(p) if !rec.is_closing() && p.read_ready() => Some(HandleId(key)),
                    _ => None,
                })
                .collect()
        };
        let mut events = 0;
        for id in ready {
            if self.read_once(id) {
                events += 1;
            }
        }
        events
    }

    fn read_once(&self, id: HandleId) -> bool {
        let (alloc_cb, read_cb, eof) = {
            let mut st = self.state.lock();
            let Ok((pipe, _)) = pipe_mut(&mut st, id) else {
                return false;
            };
            let Some((alloc_cb, read_cb)) = pipe.reading else {
                return false;
            };
            let eof = pipe.inbox.is_empty() && pipe.peer_shut && !pipe.eof_delivered;
            if eof {
                pipe.eof_delivered = true;
            }
            (alloc_cb, read_cb, eof)
        };

        if eof {
            self.metrics.record_trampoline("read");
            read_cb(self, id, Err(Errno::Eof), IoVec::EMPTY);
            return true;
        }

        self.metrics.record_trampoline("alloc");
        let dest = alloc_cb(self, id, self.settings.read_buffer_size);
        if dest.is_empty() || dest.is_poisoned() {
            self.metrics.record_trampoline("read");
            read_cb(self, id, Err(Errno::NoBufferSpace), IoVec::EMPTY);
            return true;
        }

        let nread = {
            let mut st = self.state.lock();
            let Ok((pipe, _)) = pipe_mut(&mut st, id) else {
                return false;
            };
            if pipe.reading.is_none() {
                return false;
            }
            let n = dest.len().min(pipe.inbox.len());
            let chunk: Vec<u8> = pipe.inbox.drain(..n).collect();
            // SAFETY: the allocation trampoline's caller keeps the destination
            // alive until the read trampoline has run.
            unsafe { buf::scatter(&[dest], &chunk) };
            n
        };
        self.metrics.record_trampoline("read");
        read_cb(self, id, Ok(nread), dest);
        true
    }

    pub(crate) fn deliver_connection(&self, server: HandleId, status: Status) {
        let cb = {
            let st = self.state.lock();
            pipe(&st, server).and_then(|p| p.listener)
        };
        if let Some(cb) = cb {
            self.metrics.record_trampoline("connection");
            cb(self, server, status);
        }
    }
}
