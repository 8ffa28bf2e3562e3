//! In-process event-loop engine.
//!
//! The engine plays the part of the native library behind the bridge. It
//! owns handle and request records keyed by generational ids, calls back
//! through plain `fn` trampolines, and treats the opaque data slot of every
//! record as a black box. Callbacks are always invoked with the loop state
//! unlocked so a trampoline may call straight back into the engine, and
//! values taken out of records are dropped only after the lock is released.
//!
//! One iteration runs the phases in this order: update time, timers,
//! pending callbacks, idle, prepare, poll (thread-pool completions, async
//! wakeups, stream I/O, process exits), check, closing.

mod arena;
pub mod fs;
mod pool;
pub mod process;
mod stream;
pub mod sync;
mod timer;

pub use fs::{DirEntry, FileKind, FileStat, FsOutcome, NativeFsOp, OpenFlags};
pub use pool::Outcome;
pub use process::{ExitCb, ProcessOptions};
pub use stream::{AllocCb, ConnectionCb, ReadCb};

use crate::config::{BridgeConfig, ClockMode, ConfigError};
use crate::error::{Errno, Status};
use crate::metrics::LoopMetrics;
use arena::{Arena, Key};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use pool::{Completion, JobState, Shared};
use process::ProcessState;
use std::any::Any;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use stream::{PipeState, StreamOp};
use timer::{TimerKey, TimerState};
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

/// Opaque per-record data slot
pub type Data = Option<Box<dyn Any + Send + Sync>>;

/// Handle trampoline (timer, idle, prepare, check, async)
pub type HandleCb = fn(&Loop, HandleId);

/// Close trampoline
pub type CloseCb = fn(&Loop, HandleId);

/// Request completion trampoline
pub type ReqCb = fn(&Loop, ReqId, Status);

/// Id of a handle record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(Key);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}.{}", self.0.index, self.0.generation)
    }
}

/// Id of a request record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReqId(Key);

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}.{}", self.0.index, self.0.generation)
    }
}

/// Handle kinds known to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Cross-thread wakeup
    Async,
    /// Runs after poll
    Check,
    /// Filesystem event watcher
    FsEvent,
    /// Filesystem stat poller
    FsPoll,
    /// Runs every iteration before prepare
    Idle,
    /// Stream over a named in-memory pipe
    NamedPipe,
    /// Descriptor poller
    Poll,
    /// Runs before poll
    Prepare,
    /// Child process
    Process,
    /// TCP stream
    Tcp,
    /// Timer
    Timer,
    /// Terminal
    Tty,
    /// UDP socket
    Udp,
    /// Signal watcher
    Signal,
}

impl HandleKind {
    /// Type name as reported by `handle_type_name`
    pub fn name(self) -> &'static str {
        match self {
            HandleKind::Async => "async",
            HandleKind::Check => "check",
            HandleKind::FsEvent => "fs_event",
            HandleKind::FsPoll => "fs_poll",
            HandleKind::Idle => "idle",
            HandleKind::NamedPipe => "pipe",
            HandleKind::Poll => "poll",
            HandleKind::Prepare => "prepare",
            HandleKind::Process => "process",
            HandleKind::Tcp => "tcp",
            HandleKind::Timer => "timer",
            HandleKind::Tty => "tty",
            HandleKind::Udp => "udp",
            HandleKind::Signal => "signal",
        }
    }

    /// Whether this engine backs the kind
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            HandleKind::Async
                | HandleKind::Check
                | HandleKind::Idle
                | HandleKind::NamedPipe
                | HandleKind::Prepare
                | HandleKind::Process
                | HandleKind::Timer
        )
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Request kinds known to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Stream connect
    Connect,
    /// Stream write
    Write,
    /// Stream shutdown
    Shutdown,
    /// Filesystem operation
    Fs,
    /// Thread-pool work
    Work,
    /// Name resolution
    GetAddrInfo,
    /// Random bytes
    Random,
}

impl RequestKind {
    /// Type name as reported by `req_type_name`
    pub fn name(self) -> &'static str {
        match self {
            RequestKind::Connect => "connect",
            RequestKind::Write => "write",
            RequestKind::Shutdown => "shutdown",
            RequestKind::Fs => "fs",
            RequestKind::Work => "work",
            RequestKind::GetAddrInfo => "getaddrinfo",
            RequestKind::Random => "random",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How `run` iterates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Until nothing keeps the loop alive
    Default,
    /// One iteration, blocking in poll if needed
    Once,
    /// One iteration without blocking
    NoWait,
}

/// Snapshot of one handle, as yielded by `walk`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleInfo {
    /// Handle id
    pub id: HandleId,
    /// Handle kind
    pub kind: HandleKind,
    /// Started and not closing
    pub active: bool,
    /// Close requested or done
    pub closing: bool,
    /// Counts towards loop liveness when active
    pub has_ref: bool,
}

pub(crate) const ACTIVE: u8 = 0b0001;
pub(crate) const REF: u8 = 0b0010;
pub(crate) const CLOSING: u8 = 0b0100;
pub(crate) const CLOSED: u8 = 0b1000;

pub(crate) enum Detail {
    Plain,
    Timer(TimerState),
    Phase(Option<HandleCb>),
    Async { cb: HandleCb, pending: bool },
    Pipe(PipeState),
    Process(ProcessState),
}

pub(crate) struct HandleRecord {
    kind: HandleKind,
    flags: u8,
    data: Data,
    close_cb: Option<CloseCb>,
    detail: Detail,
}

impl HandleRecord {
    fn is_closing(&self) -> bool {
        self.flags & (CLOSING | CLOSED) != 0
    }

    fn counts_alive(&self) -> bool {
        self.flags & (ACTIVE | REF) == (ACTIVE | REF) && !self.is_closing()
    }
}

pub(crate) struct RequestRecord {
    kind: RequestKind,
    data: Data,
    cb: Option<ReqCb>,
    outcome: Option<Outcome>,
    job: Option<Arc<JobState>>,
}

pub(crate) enum Pending {
    Request { req: ReqId, status: Status },
    Connection { server: HandleId, status: Status },
}

pub(crate) struct LoopState {
    handles: Arena<HandleRecord>,
    requests: Arena<RequestRecord>,
    timers: BTreeSet<TimerKey>,
    timer_seq: u64,
    idle: Vec<HandleId>,
    prepare: Vec<HandleId>,
    check: Vec<HandleId>,
    closing: VecDeque<HandleId>,
    pending: VecDeque<Pending>,
    stream_ops: VecDeque<StreamOp>,
    pipe_names: HashMap<String, HandleId>,
}

struct Clock {
    mode: ClockMode,
    origin: Instant,
    manual_ms: AtomicU64,
    now_ms: AtomicU64,
}

impl Clock {
    fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            origin: Instant::now(),
            manual_ms: AtomicU64::new(0),
            now_ms: AtomicU64::new(0),
        }
    }

    fn source(&self) -> u64 {
        match self.mode {
            ClockMode::Monotonic => self.origin.elapsed().as_millis() as u64,
            ClockMode::Manual => self.manual_ms.load(Ordering::SeqCst),
        }
    }

    fn update(&self) {
        self.now_ms.store(self.source(), Ordering::SeqCst);
    }

    fn now(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// One event loop
pub struct Loop {
    id: Uuid,
    settings: BridgeConfig,
    clock: Clock,
    state: Mutex<LoopState>,
    shared: Arc<Shared>,
    pool: OnceCell<tokio::runtime::Runtime>,
    stop_flag: AtomicBool,
    metrics: LoopMetrics,
}

impl Loop {
    /// Initialise a loop
    pub fn new(settings: BridgeConfig) -> Result<Self, ConfigError> {
        settings.validate()?;
        let id = Uuid::new_v4();
        info!(
            loop_id = %id,
            thread_pool_size = settings.thread_pool_size,
            clock = ?settings.clock,
            "Initializing event loop"
        );
        let clock = Clock::new(settings.clock);
        clock.update();
        Ok(Self {
            id,
            settings,
            clock,
            state: Mutex::new(LoopState {
                handles: Arena::new(),
                requests: Arena::new(),
                timers: BTreeSet::new(),
                timer_seq: 0,
                idle: Vec::new(),
                prepare: Vec::new(),
                check: Vec::new(),
                closing: VecDeque::new(),
                pending: VecDeque::new(),
                stream_ops: VecDeque::new(),
                pipe_names: HashMap::new(),
            }),
            shared: Arc::new(Shared::new()),
            pool: OnceCell::new(),
            stop_flag: AtomicBool::new(false),
            metrics: LoopMetrics::new(),
        })
    }

    /// Unique id of this loop
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Settings the loop was created with
    pub fn settings(&self) -> &BridgeConfig {
        &self.settings
    }

    /// Loop metrics
    pub fn metrics(&self) -> &LoopMetrics {
        &self.metrics
    }

    /// Cached loop time in milliseconds
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Refresh the cached loop time
    pub fn update_time(&self) {
        self.clock.update();
    }

    /// Move a manual clock forward; `NotSupported` on a monotonic clock
    pub fn advance(&self, by: Duration) -> Status {
        if self.clock.mode != ClockMode::Manual {
            return Err(Errno::NotSupported);
        }
        self.clock
            .manual_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        Ok(())
    }

    /// Make `run` return after the current iteration
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.shared.wake();
    }

    /// Whether active referenced handles, requests or pending closes remain
    pub fn alive(&self) -> bool {
        let st = self.state.lock();
        Self::alive_locked(&st)
    }

    fn alive_locked(st: &LoopState) -> bool {
        st.requests.len() > 0
            || !st.closing.is_empty()
            || st.handles.iter().any(|(_, rec)| rec.counts_alive())
    }

    /// Number of live handle records
    pub fn handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Number of in-flight requests
    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Poll timeout in milliseconds, or -1 to block indefinitely
    pub fn backend_timeout(&self) -> i64 {
        let st = self.state.lock();
        match self.poll_timeout(&st) {
            Some(d) => d.as_millis() as i64,
            None => -1,
        }
    }

    /// Tear down the loop; `Busy` while handles or requests remain
    pub fn close(&self) -> Status {
        let st = self.state.lock();
        if st.handles.len() > 0 || st.requests.len() > 0 {
            warn!(
                loop_id = %self.id,
                handles = st.handles.len(),
                requests = st.requests.len(),
                "Loop close refused while resources remain"
            );
            return Err(Errno::Busy);
        }
        info!(loop_id = %self.id, "Event loop closed");
        Ok(())
    }

    /// Visit every live handle
    pub fn walk(&self, mut f: impl FnMut(HandleInfo)) {
        let infos: Vec<HandleInfo> = {
            let st = self.state.lock();
            st.handles
                .iter()
                .map(|(key, rec)| HandleInfo {
                    id: HandleId(key),
                    kind: rec.kind,
                    active: rec.flags & ACTIVE != 0 && !rec.is_closing(),
                    closing: rec.is_closing(),
                    has_ref: rec.flags & REF != 0,
                })
                .collect()
        };
        for info in infos {
            f(info);
        }
    }

    // ---- handle records ----

    /// Register a handle of a kind that needs no start-time parameters
    pub fn handle_init(&self, kind: HandleKind) -> Result<HandleId, Errno> {
        let detail = match kind {
            HandleKind::Timer => Detail::Timer(TimerState::default()),
            HandleKind::Idle | HandleKind::Prepare | HandleKind::Check => Detail::Phase(None),
            HandleKind::NamedPipe => Detail::Pipe(PipeState::default()),
            HandleKind::Async | HandleKind::Process => return Err(Errno::InvalidArgument),
            _ => return Err(Errno::NotSupported),
        };
        self.register_handle(kind, detail, REF)
    }

    pub(crate) fn register_handle(
        &self,
        kind: HandleKind,
        detail: Detail,
        flags: u8,
    ) -> Result<HandleId, Errno> {
        if !kind.is_supported() {
            return Err(Errno::NotSupported);
        }
        let mut st = self.state.lock();
        if st.handles.len() >= self.settings.max_handles {
            drop(st);
            warn!(loop_id = %self.id, kind = %kind, "Handle limit reached");
            return Err(Errno::NoMemory);
        }
        let id = HandleId(st.handles.insert(HandleRecord {
            kind,
            flags,
            data: None,
            close_cb: None,
            detail,
        }));
        trace!(loop_id = %self.id, %id, kind = %kind, "Handle registered");
        Ok(id)
    }

    /// Kind of a live handle
    pub fn handle_kind(&self, id: HandleId) -> Option<HandleKind> {
        self.state.lock().handles.get(id.0).map(|rec| rec.kind)
    }

    /// Whether the handle is started and not closing
    pub fn is_active(&self, id: HandleId) -> bool {
        self.state
            .lock()
            .handles
            .get(id.0)
            .map(|rec| rec.flags & ACTIVE != 0 && !rec.is_closing())
            .unwrap_or(false)
    }

    /// Whether close was requested; stale ids count as closed
    pub fn is_closing(&self, id: HandleId) -> bool {
        self.state
            .lock()
            .handles
            .get(id.0)
            .map(HandleRecord::is_closing)
            .unwrap_or(true)
    }

    /// Set whether an active handle keeps the loop alive
    pub fn set_ref(&self, id: HandleId, referenced: bool) -> Status {
        let mut st = self.state.lock();
        let rec = st.handles.get_mut(id.0).ok_or(Errno::InvalidArgument)?;
        if referenced {
            rec.flags |= REF;
        } else {
            rec.flags &= !REF;
        }
        Ok(())
    }

    /// Whether the handle is referenced
    pub fn has_ref(&self, id: HandleId) -> bool {
        self.state
            .lock()
            .handles
            .get(id.0)
            .map(|rec| rec.flags & REF != 0)
            .unwrap_or(false)
    }

    /// Read the handle's data slot
    pub fn with_handle_data<R>(&self, id: HandleId, f: impl FnOnce(&Data) -> R) -> Option<R> {
        let st = self.state.lock();
        st.handles.get(id.0).map(|rec| f(&rec.data))
    }

    /// Store into the handle's data slot, handing back the previous contents
    pub fn set_handle_data(&self, id: HandleId, data: Data) -> Result<Data, Errno> {
        let mut st = self.state.lock();
        match st.handles.get_mut(id.0) {
            Some(rec) => Ok(std::mem::replace(&mut rec.data, data)),
            None => {
                drop(st);
                Err(Errno::InvalidArgument)
            }
        }
    }

    /// Take the handle's data slot, leaving it empty
    pub fn take_handle_data(&self, id: HandleId) -> Data {
        let taken = {
            let mut st = self.state.lock();
            st.handles.get_mut(id.0).and_then(|rec| rec.data.take())
        };
        taken
    }

    /// Request teardown; `close_cb` runs in the closing phase
    pub fn close_handle(&self, id: HandleId, close_cb: CloseCb) -> Status {
        let mut st = self.state.lock();
        let rec = st.handles.get_mut(id.0).ok_or(Errno::InvalidArgument)?;
        if rec.is_closing() {
            return Err(Errno::InvalidArgument);
        }
        rec.flags |= CLOSING;
        rec.flags &= !ACTIVE;
        rec.close_cb = Some(close_cb);
        let kind = rec.kind;
        Self::detach(&mut st, id);
        st.closing.push_back(id);
        debug!(loop_id = %self.id, %id, kind = %kind, "Handle closing");
        Ok(())
    }

    /// Drop a handle record that will never be closed.
    ///
    /// Returns the record's data so the caller can release it unlocked.
    pub fn discard_handle(&self, id: HandleId) -> Data {
        let removed = {
            let mut st = self.state.lock();
            if st.handles.get(id.0).is_none() {
                return None;
            }
            Self::detach(&mut st, id);
            st.closing.retain(|closing| *closing != id);
            st.handles.remove(id.0)
        };
        removed.and_then(|mut rec| {
            debug!(loop_id = %self.id, %id, kind = %rec.kind, "Handle discarded");
            rec.data.take()
        })
    }

    fn detach(st: &mut LoopState, id: HandleId) {
        let Some(rec) = st.handles.get_mut(id.0) else {
            return;
        };
        rec.flags &= !ACTIVE;
        let (timer_key, is_pipe) = match &rec.detail {
            Detail::Timer(timer) => (timer.key(id), false),
            Detail::Pipe(_) => (None, true),
            _ => (None, false),
        };
        if let Some(key) = timer_key {
            st.timers.remove(&key);
        }
        st.idle.retain(|h| *h != id);
        st.prepare.retain(|h| *h != id);
        st.check.retain(|h| *h != id);
        if is_pipe {
            stream::detach_pipe(st, id);
        }
    }

    // ---- request records ----

    pub(crate) fn insert_request(
        &self,
        st: &mut LoopState,
        kind: RequestKind,
        data: &mut Data,
        cb: Option<ReqCb>,
        job: Option<Arc<JobState>>,
    ) -> Result<ReqId, Errno> {
        if st.requests.len() >= self.settings.max_requests {
            warn!(loop_id = %self.id, kind = %kind, "Request limit reached");
            return Err(Errno::NoMemory);
        }
        let req = ReqId(st.requests.insert(RequestRecord {
            kind,
            data: data.take(),
            cb,
            outcome: None,
            job,
        }));
        trace!(loop_id = %self.id, %req, kind = %kind, "Request submitted");
        Ok(req)
    }

    /// Take the request's data slot, leaving it empty
    pub fn take_request_data(&self, req: ReqId) -> Data {
        let taken = {
            let mut st = self.state.lock();
            st.requests.get_mut(req.0).and_then(|rec| rec.data.take())
        };
        taken
    }

    /// Whether the request's data slot is populated
    pub fn request_has_data(&self, req: ReqId) -> bool {
        self.state
            .lock()
            .requests
            .get(req.0)
            .map_or(false, |rec| rec.data.is_some())
    }

    /// Take the result attached to a completed request
    pub fn take_request_outcome(&self, req: ReqId) -> Option<Outcome> {
        let mut st = self.state.lock();
        st.requests.get_mut(req.0).and_then(|rec| rec.outcome.take())
    }

    /// Kind of an in-flight request
    pub fn request_kind(&self, req: ReqId) -> Option<RequestKind> {
        self.state.lock().requests.get(req.0).map(|rec| rec.kind)
    }

    /// Run a request's completion trampoline and retire its record
    pub(crate) fn deliver_request(&self, req: ReqId, status: Status, outcome: Option<Outcome>) {
        let (kind, cb) = {
            let mut st = self.state.lock();
            let Some(rec) = st.requests.get_mut(req.0) else {
                return;
            };
            rec.outcome = outcome;
            (rec.kind, rec.cb.take())
        };
        self.metrics.record_completion(&status);
        if let Some(cb) = cb {
            self.metrics.record_trampoline(kind.name());
            cb(self, req, status);
        }
        let leftover = {
            let mut st = self.state.lock();
            st.requests.remove(req.0)
        };
        drop(leftover);
    }

    // ---- run loop ----

    /// Run the loop; returns whether it is still alive.
    ///
    /// A live loop always runs at least one iteration. The stop flag is
    /// checked after each iteration and cleared on return.
    #[instrument(level = "debug", skip(self), fields(loop_id = %self.id))]
    pub fn run(&self, mode: RunMode) -> bool {
        let mut alive = self.alive();
        if !alive {
            self.clock.update();
        }

        while alive {
            self.clock.update();
            let mut events = self.run_timers();
            events += self.run_pending();
            events += self.run_phase(HandleKind::Idle);
            events += self.run_phase(HandleKind::Prepare);

            let timeout = if mode == RunMode::NoWait {
                Some(Duration::ZERO)
            } else {
                let st = self.state.lock();
                self.poll_timeout(&st)
            };
            events += self.poll(timeout);
            events += self.run_phase(HandleKind::Check);
            events += self.run_closing();

            if mode == RunMode::Once {
                self.clock.update();
                events += self.run_timers();
            }

            self.metrics.record_iteration();
            alive = self.alive();
            if mode != RunMode::Default || self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            if events == 0 && !self.can_wake() {
                trace!(loop_id = %self.id, "Loop stalled");
                break;
            }
        }

        self.stop_flag.store(false, Ordering::SeqCst);
        alive
    }

    fn timers_can_wake(&self) -> bool {
        self.clock.mode == ClockMode::Monotonic
    }

    fn external_wakeup_possible(&self, st: &LoopState) -> bool {
        self.shared.inflight() > 0
            || st.handles.iter().any(|(_, rec)| {
                rec.counts_alive()
                    && matches!(rec.detail, Detail::Async { .. } | Detail::Process(_))
            })
    }

    fn can_wake(&self) -> bool {
        let st = self.state.lock();
        self.external_wakeup_possible(&st)
            || (self.timers_can_wake() && !st.timers.is_empty())
            || !st.pending.is_empty()
            || !st.closing.is_empty()
            || Self::streams_ready(&st)
    }

    /// `None` blocks until something is posted
    fn poll_timeout(&self, st: &LoopState) -> Option<Duration> {
        if self.stop_flag.load(Ordering::SeqCst)
            || !st.pending.is_empty()
            || !st.closing.is_empty()
            || !st.idle.is_empty()
            || Self::streams_ready(st)
        {
            return Some(Duration::ZERO);
        }

        let mut timeout = None;
        if self.timers_can_wake() {
            if let Some(first) = st.timers.first() {
                let ms = first.deadline.saturating_sub(self.clock.now());
                timeout = Some(Duration::from_millis(ms));
            }
        }

        let processes_running = st
            .handles
            .iter()
            .any(|(_, rec)| matches!(&rec.detail, Detail::Process(p) if p.is_running()));
        if processes_running {
            let interval = self.settings.process_poll_interval();
            timeout = Some(timeout.map_or(interval, |t: Duration| t.min(interval)));
        }

        if timeout.is_none() && !self.external_wakeup_possible(st) {
            return Some(Duration::ZERO);
        }
        timeout
    }

    fn run_pending(&self) -> usize {
        let pending: Vec<Pending> = {
            let mut st = self.state.lock();
            st.pending.drain(..).collect()
        };
        let count = pending.len();
        for item in pending {
            match item {
                Pending::Request { req, status } => self.deliver_request(req, status, None),
                Pending::Connection { server, status } => self.deliver_connection(server, status),
            }
        }
        count
    }

    fn phase_list(st: &mut LoopState, kind: HandleKind) -> Option<&mut Vec<HandleId>> {
        match kind {
            HandleKind::Idle => Some(&mut st.idle),
            HandleKind::Prepare => Some(&mut st.prepare),
            HandleKind::Check => Some(&mut st.check),
            _ => None,
        }
    }

    /// Start an idle, prepare or check handle
    pub fn phase_start(&self, id: HandleId, cb: HandleCb) -> Status {
        let mut st = self.state.lock();
        let rec = st.handles.get_mut(id.0).ok_or(Errno::InvalidArgument)?;
        if rec.is_closing() {
            return Err(Errno::InvalidArgument);
        }
        let kind = rec.kind;
        let Detail::Phase(slot) = &mut rec.detail else {
            return Err(Errno::InvalidArgument);
        };
        *slot = Some(cb);
        rec.flags |= ACTIVE;
        if let Some(list) = Self::phase_list(&mut st, kind) {
            if !list.contains(&id) {
                list.push(id);
            }
        }
        Ok(())
    }

    /// Stop an idle, prepare or check handle; idempotent
    pub fn phase_stop(&self, id: HandleId) -> Status {
        let mut st = self.state.lock();
        let rec = st.handles.get_mut(id.0).ok_or(Errno::InvalidArgument)?;
        let kind = rec.kind;
        let Detail::Phase(slot) = &mut rec.detail else {
            return Err(Errno::InvalidArgument);
        };
        *slot = None;
        rec.flags &= !ACTIVE;
        if let Some(list) = Self::phase_list(&mut st, kind) {
            list.retain(|h| *h != id);
        }
        Ok(())
    }

    fn run_phase(&self, kind: HandleKind) -> usize {
        let snapshot: Vec<HandleId> = {
            let mut st = self.state.lock();
            match Self::phase_list(&mut st, kind) {
                Some(list) => list.clone(),
                None => return 0,
            }
        };
        let mut count = 0;
        for id in snapshot {
            let cb = {
                let st = self.state.lock();
                match st.handles.get(id.0) {
                    Some(rec) if rec.flags & ACTIVE != 0 && !rec.is_closing() => match rec.detail {
                        Detail::Phase(cb) => cb,
                        _ => None,
                    },
                    _ => None,
                }
            };
            if let Some(cb) = cb {
                self.metrics.record_trampoline(kind.name());
                cb(self, id);
                count += 1;
            }
        }
        count
    }

    /// Register an async handle; it is active until closed
    pub fn async_init(&self, cb: HandleCb) -> Result<HandleId, Errno> {
        self.register_handle(
            HandleKind::Async,
            Detail::Async { cb, pending: false },
            ACTIVE | REF,
        )
    }

    /// Wake the loop and run the async handle's callback; callable from any thread
    pub fn async_send(&self, id: HandleId) -> Status {
        {
            let mut st = self.state.lock();
            let rec = st.handles.get_mut(id.0).ok_or(Errno::InvalidArgument)?;
            if rec.is_closing() {
                return Err(Errno::InvalidArgument);
            }
            let Detail::Async { pending, .. } = &mut rec.detail else {
                return Err(Errno::InvalidArgument);
            };
            *pending = true;
        }
        self.shared.wake();
        Ok(())
    }

    fn run_async(&self) -> usize {
        let fired: Vec<(HandleId, HandleCb)> = {
            let mut st = self.state.lock();
            st.handles
                .iter_mut()
                .filter_map(|(key, rec)| {
                    let closing = rec.is_closing();
                    match &mut rec.detail {
                        Detail::Async { cb, pending } if *pending && !closing => {
                            *pending = false;
                            Some((HandleId(key), *cb))
                        }
                        _ => None,
                    }
                })
                .collect()
        };
        for (id, cb) in &fired {
            self.metrics.record_trampoline("async");
            cb(self, *id);
        }
        fired.len()
    }

    fn poll(&self, timeout: Option<Duration>) -> usize {
        let started = Instant::now();
        let completions = self.shared.wait(timeout);
        if self.settings.metrics_idle_time && timeout != Some(Duration::ZERO) {
            self.metrics.add_idle_time(started.elapsed());
        }
        self.metrics.set_events_waiting(completions.len());

        let mut events = 0;
        for completion in completions {
            self.deliver_completion(completion);
            events += 1;
        }
        events += self.run_async();
        events += self.run_streams();
        events += self.poll_processes();
        self.metrics.record_events(events);
        events
    }

    fn deliver_completion(&self, completion: Completion) {
        let Completion {
            req,
            status,
            outcome,
        } = completion;
        self.shared.finish_one();
        self.deliver_request(req, status, outcome);
    }

    fn run_closing(&self) -> usize {
        let ids: Vec<HandleId> = {
            let mut st = self.state.lock();
            st.closing.drain(..).collect()
        };
        for id in &ids {
            let cb = {
                let mut st = self.state.lock();
                match st.handles.get_mut(id.0) {
                    Some(rec) => {
                        rec.flags |= CLOSED;
                        rec.close_cb.take()
                    }
                    None => continue,
                }
            };
            if let Some(cb) = cb {
                self.metrics.record_trampoline("close");
                cb(self, *id);
            }
            let leftover = {
                let mut st = self.state.lock();
                st.handles.remove(id.0)
            };
            drop(leftover);
        }
        ids.len()
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        if let Some(runtime) = self.pool.take() {
            runtime.shutdown_background();
        }
        debug!(loop_id = %self.id, "Event loop dropped");
    }
}

impl fmt::Debug for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop")
            .field("id", &self.id)
            .field("now", &self.now())
            .finish()
    }
}
