//! Thread pool and completion queue.
//!
//! Work runs on the blocking pool of a lazily built tokio runtime. A worker
//! never touches loop state: it pushes a [`Completion`] onto the shared
//! queue and the loop thread delivers it during poll. Each pooled request
//! carries a [`JobState`] so cancel and the worker race on one CAS and
//! exactly one of them posts the completion.

use super::fs::{self, FdTable, FsOutcome, NativeFsOp};
use super::{Data, Loop, ReqCb, ReqId, RequestKind};
use crate::buf::{self, IoVec};
use crate::error::{Errno, Status};
use parking_lot::{Condvar, Mutex};
use rand::RngCore;
use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Result attached to a completed request
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Filesystem result
    Fs(FsOutcome),
    /// Resolved addresses
    AddrInfo(Vec<SocketAddr>),
}

pub(crate) struct Completion {
    pub(crate) req: ReqId,
    pub(crate) status: Status,
    pub(crate) outcome: Option<Outcome>,
}

#[derive(Default)]
struct Inbox {
    completions: VecDeque<Completion>,
    woken: bool,
}

/// State reachable from pool workers
pub(crate) struct Shared {
    inbox: Mutex<Inbox>,
    ready: Condvar,
    inflight: AtomicUsize,
    pub(crate) files: Mutex<FdTable>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            inbox: Mutex::new(Inbox::default()),
            ready: Condvar::new(),
            inflight: AtomicUsize::new(0),
            files: Mutex::new(FdTable::default()),
        }
    }

    pub(crate) fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    pub(crate) fn finish_one(&self) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }

    fn complete(&self, completion: Completion) {
        let mut inbox = self.inbox.lock();
        inbox.completions.push_back(completion);
        self.ready.notify_one();
    }

    pub(crate) fn wake(&self) {
        let mut inbox = self.inbox.lock();
        inbox.woken = true;
        self.ready.notify_one();
    }

    /// Block for at most `timeout` (`None`: indefinitely) and drain the queue
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Vec<Completion> {
        let mut inbox = self.inbox.lock();
        if inbox.completions.is_empty() && !inbox.woken {
            match timeout {
                Some(t) if t.is_zero() => {}
                Some(t) => {
                    let _ = self.ready.wait_for(&mut inbox, t);
                }
                None => self.ready.wait(&mut inbox),
            }
        }
        inbox.woken = false;
        inbox.completions.drain(..).collect()
    }
}

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELED: u8 = 3;

/// Lifecycle of one pooled request
pub(crate) struct JobState(AtomicU8);

impl JobState {
    fn new() -> Self {
        Self(AtomicU8::new(QUEUED))
    }

    fn begin(&self) -> bool {
        self.0
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(&self) {
        self.0.store(DONE, Ordering::Release);
    }

    fn cancel(&self) -> bool {
        self.0
            .compare_exchange(QUEUED, CANCELED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

type Job = Box<dyn FnOnce(&Shared) -> (Status, Option<Outcome>) + Send>;

impl Loop {
    fn runtime(&self) -> Result<&tokio::runtime::Runtime, Errno> {
        self.pool.get_or_try_init(|| {
            debug!(
                loop_id = %self.id,
                threads = self.settings.thread_pool_size,
                "Starting thread pool"
            );
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .max_blocking_threads(self.settings.thread_pool_size)
                .thread_name("nexus-loop-pool")
                .build()
                .map_err(Errno::from)
        })
    }

    fn submit_job(
        &self,
        kind: RequestKind,
        mut data: Data,
        job: Job,
        cb: ReqCb,
    ) -> Result<ReqId, Errno> {
        let runtime = self.runtime()?;
        let state = Arc::new(JobState::new());
        let req = {
            let mut st = self.state.lock();
            self.insert_request(&mut st, kind, &mut data, Some(cb), Some(Arc::clone(&state)))?
        };
        self.shared.inflight.fetch_add(1, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        runtime.spawn_blocking(move || {
            if !state.begin() {
                trace!(%req, "Skipping canceled job");
                return;
            }
            let (status, outcome) = job(&shared);
            state.finish();
            shared.complete(Completion {
                req,
                status,
                outcome,
            });
        });
        Ok(req)
    }

    /// Best-effort cancel of a pooled request.
    ///
    /// A queued job is dropped and its completion fires with `Canceled`. A
    /// job that already started yields `Busy`; non-pooled requests yield
    /// `InvalidArgument`.
    pub fn cancel(&self, req: ReqId) -> Status {
        let state = {
            let st = self.state.lock();
            let rec = st.requests.get(req.0).ok_or(Errno::InvalidArgument)?;
            rec.job.clone().ok_or(Errno::InvalidArgument)?
        };
        if !state.cancel() {
            return Err(Errno::Busy);
        }
        debug!(loop_id = %self.id, %req, "Request canceled");
        self.shared.complete(Completion {
            req,
            status: Err(Errno::Canceled),
            outcome: None,
        });
        Ok(())
    }

    /// Run `work` on the pool, then `after` on the loop thread
    pub fn queue_work(
        &self,
        data: Data,
        work: Box<dyn FnOnce() + Send>,
        after: ReqCb,
    ) -> Result<ReqId, Errno> {
        self.submit_job(
            RequestKind::Work,
            data,
            Box::new(move |_| {
                work();
                (Ok(()), None)
            }),
            after,
        )
    }

    /// Run a filesystem operation on the pool
    ///
    /// # Safety
    ///
    /// For `Read` and `Write` the memory described by the op's `iov` must
    /// stay alive until `cb` fires. Other ops carry no raw memory.
    pub unsafe fn fs(&self, data: Data, op: NativeFsOp, cb: ReqCb) -> Result<ReqId, Errno> {
        op.validate()?;
        self.submit_job(
            RequestKind::Fs,
            data,
            Box::new(move |shared| match fs::execute(&shared.files, op) {
                Ok(outcome) => (Ok(()), Some(Outcome::Fs(outcome))),
                Err(e) => (Err(e), None),
            }),
            cb,
        )
    }

    /// Run a filesystem operation inline
    ///
    /// # Safety
    ///
    /// For `Read` and `Write` the memory described by the op's `iov` must be
    /// live for the duration of the call.
    pub unsafe fn fs_sync(&self, op: NativeFsOp) -> Result<FsOutcome, Errno> {
        op.validate()?;
        fs::execute(&self.shared.files, op)
    }

    /// Resolve `node` and `service` on the pool
    pub fn getaddrinfo(
        &self,
        data: Data,
        node: String,
        service: Option<String>,
        cb: ReqCb,
    ) -> Result<ReqId, Errno> {
        let port = parse_service(service.as_deref())?;
        self.submit_job(
            RequestKind::GetAddrInfo,
            data,
            Box::new(move |_| match resolve(&node, port) {
                Ok(addrs) => (Ok(()), Some(Outcome::AddrInfo(addrs))),
                Err(e) => (Err(e), None),
            }),
            cb,
        )
    }

    /// Fill the described memory with random bytes on the pool.
    ///
    /// # Safety
    ///
    /// The memory behind `iov` must stay alive until `cb` fires. The
    /// request's data slot is where callers usually keep it.
    pub unsafe fn random(&self, data: Data, iov: &[IoVec], cb: ReqCb) -> Result<ReqId, Errno> {
        let iov = iov.to_vec();
        self.submit_job(
            RequestKind::Random,
            data,
            Box::new(move |_| {
                fill_random(&iov);
                (Ok(()), None)
            }),
            cb,
        )
    }

    /// Fill the described memory with random bytes inline
    ///
    /// # Safety
    ///
    /// The memory behind `iov` must be live for the duration of the call.
    pub unsafe fn random_sync(&self, iov: &[IoVec]) -> Status {
        fill_random(iov);
        Ok(())
    }
}

fn fill_random(iov: &[IoVec]) {
    let total = iov.iter().map(IoVec::len).sum();
    let mut bytes = vec![0u8; total];
    rand::thread_rng().fill_bytes(&mut bytes);
    // SAFETY: the submitter keeps the described arrays alive until completion.
    unsafe { buf::scatter(iov, &bytes) };
}

fn parse_service(service: Option<&str>) -> Result<u16, Errno> {
    match service {
        None => Ok(0),
        Some(s) => s.parse::<u16>().map_err(|_| Errno::AddrInfoNoName),
    }
}

fn resolve(node: &str, port: u16) -> Result<Vec<SocketAddr>, Errno> {
    let addrs: Vec<SocketAddr> = (node, port)
        .to_socket_addrs()
        .map_err(|_| Errno::AddrInfoNoName)?
        .collect();
    if addrs.is_empty() {
        return Err(Errno::AddrInfoNoName);
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, ClockMode};
    use crate::engine::RunMode;
    use std::sync::mpsc;

    static RESULTS: parking_lot::Mutex<Vec<(uuid::Uuid, ReqId, Status)>> =
        parking_lot::const_mutex(Vec::new());

    fn record(lp: &Loop, req: ReqId, status: Status) {
        RESULTS.lock().push((lp.id(), req, status));
    }

    fn completed(lp: &Loop, req: ReqId, status: Status) -> bool {
        RESULTS.lock().contains(&(lp.id(), req, status))
    }

    fn record_addrs(lp: &Loop, req: ReqId, status: Status) {
        assert_eq!(status, Ok(()));
        match lp.take_request_outcome(req) {
            Some(Outcome::AddrInfo(addrs)) => assert!(addrs.iter().all(|a| a.port() == 80)),
            other => panic!("unexpected outcome {:?}", other),
        }
        RESULTS.lock().push((lp.id(), req, status));
    }

    fn manual() -> Loop {
        Loop::new(
            BridgeConfig::default()
                .with_clock(ClockMode::Manual)
                .with_thread_pool_size(1),
        )
        .unwrap()
    }

    #[test]
    fn test_work_then_after_on_loop_thread() {
        let lp = manual();
        let (tx, rx) = mpsc::channel();
        let req = lp
            .queue_work(
                None,
                Box::new(move || {
                    tx.send(std::thread::current().id()).unwrap();
                }),
                record,
            )
            .unwrap();

        assert!(lp.alive());
        assert!(!lp.run(RunMode::Default));
        let worker = rx.recv().unwrap();
        assert_ne!(worker, std::thread::current().id());
        assert!(completed(&lp, req, Ok(())));
        assert_eq!(lp.request_count(), 0);
    }

    #[test]
    fn test_cancel_queued_and_running() {
        let lp = manual();
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let blocker = lp
            .queue_work(
                None,
                Box::new(move || {
                    started_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                }),
                record,
            )
            .unwrap();
        started_rx.recv().unwrap();
        let queued = lp.queue_work(None, Box::new(|| {}), record).unwrap();

        assert_eq!(lp.cancel(blocker), Err(Errno::Busy));
        assert_eq!(lp.cancel(queued), Ok(()));
        assert_eq!(lp.cancel(queued), Err(Errno::Busy));

        release_tx.send(()).unwrap();
        lp.run(RunMode::Default);
        assert!(completed(&lp, blocker, Ok(())));
        assert!(completed(&lp, queued, Err(Errno::Canceled)));
    }

    #[test]
    fn test_getaddrinfo_numeric_host() {
        let lp = manual();
        let req = lp
            .getaddrinfo(None, "127.0.0.1".into(), Some("80".into()), record_addrs)
            .unwrap();
        lp.run(RunMode::Default);
        assert!(completed(&lp, req, Ok(())));
    }

    #[test]
    fn test_getaddrinfo_bad_service_fails_at_submission() {
        let lp = manual();
        let err = lp
            .getaddrinfo(None, "127.0.0.1".into(), Some("http-ish".into()), record)
            .unwrap_err();
        assert_eq!(err, Errno::AddrInfoNoName);
        assert_eq!(lp.request_count(), 0);
    }

    #[test]
    fn test_request_limit() {
        let lp = Loop::new(
            BridgeConfig::default()
                .with_clock(ClockMode::Manual)
                .with_max_requests(1),
        )
        .unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        lp.queue_work(None, Box::new(move || drop(release_rx.recv())), record)
            .unwrap();
        let err = lp.queue_work(None, Box::new(|| {}), record).unwrap_err();
        assert_eq!(err, Errno::NoMemory);
        release_tx.send(()).unwrap();
        lp.run(RunMode::Default);
    }

    #[test]
    fn test_cancel_non_pooled_request() {
        let lp = manual();
        let unknown = {
            let mut st = lp.state.lock();
            let mut data = None;
            lp.insert_request(&mut st, RequestKind::Write, &mut data, None, None)
                .unwrap()
        };
        assert_eq!(lp.cancel(unknown), Err(Errno::InvalidArgument));
    }
}
