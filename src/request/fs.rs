//! Filesystem requests.
//!
//! [`FsOp`] mirrors the engine's operation set with reads and writes
//! described by [`BufRef`] lists. For pooled submission the regions travel
//! with the request; for [`Fs::run_sync`] they only need to outlive the call.

use super::{complete, submit, AsRequest, OpData, RequestCore};
use crate::buf::{BufRef, GatherList};
use crate::callback::Callback;
use crate::engine::{self, FsOutcome, NativeFsOp, OpenFlags, Outcome, ReqId, RequestKind};
use crate::error::{Errno, Status};
use crate::event_loop::EventLoop;
use crate::heap::{Heap, Managed};
use std::path::PathBuf;
use tracing::debug;

/// Filesystem completion callback
pub type FsCb = Callback<(Managed<Fs>, Result<FsOutcome, Errno>)>;

/// A filesystem operation
#[derive(Debug, Clone)]
pub enum FsOp {
    /// Open a file; the outcome's `result` is the descriptor
    Open {
        /// Path
        path: PathBuf,
        /// Access flags
        flags: OpenFlags,
        /// Permission bits for a created file
        mode: u32,
    },
    /// Close a descriptor
    Close {
        /// Descriptor
        file: i64,
    },
    /// Read into `bufs` in order
    Read {
        /// Descriptor
        file: i64,
        /// Destination regions
        bufs: Vec<BufRef>,
        /// Position, or the file cursor
        offset: Option<u64>,
    },
    /// Write `bufs` in order
    Write {
        /// Descriptor
        file: i64,
        /// Source regions
        bufs: Vec<BufRef>,
        /// Position, or the file cursor
        offset: Option<u64>,
    },
    /// Stat a path
    Stat {
        /// Path
        path: PathBuf,
    },
    /// Stat a descriptor
    Fstat {
        /// Descriptor
        file: i64,
    },
    /// Flush a descriptor
    Fsync {
        /// Descriptor
        file: i64,
    },
    /// Remove a file
    Unlink {
        /// Path
        path: PathBuf,
    },
    /// Create a directory
    Mkdir {
        /// Path
        path: PathBuf,
        /// Permission bits
        mode: u32,
    },
    /// Remove an empty directory
    Rmdir {
        /// Path
        path: PathBuf,
    },
    /// Rename
    Rename {
        /// Source
        from: PathBuf,
        /// Destination
        to: PathBuf,
    },
    /// List a directory
    Scandir {
        /// Path
        path: PathBuf,
    },
}

impl FsOp {
    /// Split into the engine operation and the regions it points into
    fn into_native(self) -> Result<(NativeFsOp, Vec<BufRef>), Errno> {
        Ok(match self {
            FsOp::Open { path, flags, mode } => (NativeFsOp::Open { path, flags, mode }, Vec::new()),
            FsOp::Close { file } => (NativeFsOp::Close { file }, Vec::new()),
            FsOp::Read { file, bufs, offset } => {
                let iov = GatherList::build(&bufs)?.as_slice().to_vec();
                (NativeFsOp::Read { file, iov, offset }, bufs)
            }
            FsOp::Write { file, bufs, offset } => {
                let iov = GatherList::build(&bufs)?.as_slice().to_vec();
                (NativeFsOp::Write { file, iov, offset }, bufs)
            }
            FsOp::Stat { path } => (NativeFsOp::Stat { path }, Vec::new()),
            FsOp::Fstat { file } => (NativeFsOp::Fstat { file }, Vec::new()),
            FsOp::Fsync { file } => (NativeFsOp::Fsync { file }, Vec::new()),
            FsOp::Unlink { path } => (NativeFsOp::Unlink { path }, Vec::new()),
            FsOp::Mkdir { path, mode } => (NativeFsOp::Mkdir { path, mode }, Vec::new()),
            FsOp::Rmdir { path } => (NativeFsOp::Rmdir { path }, Vec::new()),
            FsOp::Rename { from, to } => (NativeFsOp::Rename { from, to }, Vec::new()),
            FsOp::Scandir { path } => (NativeFsOp::Scandir { path }, Vec::new()),
        })
    }
}

/// Managed filesystem request
#[derive(Debug, Default)]
pub struct Fs {
    core: RequestCore,
}

impl AsRequest for Fs {
    const KIND: RequestKind = RequestKind::Fs;

    fn request_core(&self) -> &RequestCore {
        &self.core
    }
}

impl Fs {
    /// Allocate a filesystem request
    pub fn make(heap: &Heap) -> Managed<Fs> {
        heap.allocate_plain("fs")
    }

    /// Run `op` on the calling thread
    pub fn run_sync(lp: &Managed<EventLoop>, op: FsOp) -> Result<FsOutcome, Errno> {
        let (native_op, bufs) = op.into_native()?;
        // SAFETY: `bufs` owns every array the op describes until after the call.
        let outcome = unsafe { lp.native().fs_sync(native_op) };
        drop(bufs);
        outcome
    }
}

fn fs_trampoline(native: &engine::Loop, req: ReqId, status: Status) {
    let outcome = native.take_request_outcome(req);
    let Some(op) = complete::<Fs, FsCb>(native, req) else {
        return;
    };
    let OpData {
        request,
        callback,
        bufs,
    } = op;
    let result = status.map(|()| match outcome {
        Some(Outcome::Fs(outcome)) => outcome,
        _ => FsOutcome::default(),
    });
    if let Some(cb) = callback {
        cb.call((request, result));
    }
    drop(bufs);
}

impl Managed<Fs> {
    /// Run `op` on the thread pool; `cb` runs on the loop thread
    pub fn submit(&self, lp: &Managed<EventLoop>, op: FsOp, cb: Option<FsCb>) -> Status {
        let (native_op, bufs) = op.into_native()?;
        debug!(op = native_op.name(), "Submitting fs request");
        submit(self, lp, cb, bufs, |native, data| {
            // SAFETY: `data` owns `bufs` until the trampoline has called back.
            unsafe { native.fs(data, native_op, fs_trampoline) }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, ClockMode};
    use crate::engine::{FileKind, RunMode};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn setup() -> (Heap, Managed<EventLoop>) {
        let heap = Heap::instrumented();
        let config = BridgeConfig::default()
            .with_clock(ClockMode::Manual)
            .with_thread_pool_size(2);
        let lp = EventLoop::new(&heap, config).unwrap();
        (heap, lp)
    }

    #[test]
    fn test_sync_write_then_scatter_read() {
        let (heap, lp) = setup();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");

        let fd = Fs::run_sync(
            &lp,
            FsOp::Open {
                path: path.clone(),
                flags: OpenFlags::write_only().with_create().with_truncate(),
                mode: 0o644,
            },
        )
        .unwrap()
        .result;
        let written = Fs::run_sync(
            &lp,
            FsOp::Write {
                file: fd,
                bufs: vec![
                    BufRef::whole(heap.bytes_from(b"scatter")),
                    BufRef::whole(heap.bytes_from(b"/gather")),
                ],
                offset: None,
            },
        )
        .unwrap();
        assert_eq!(written.result, 14);
        Fs::run_sync(&lp, FsOp::Close { file: fd }).unwrap();

        let fd = Fs::run_sync(
            &lp,
            FsOp::Open {
                path: path.clone(),
                flags: OpenFlags::read_only(),
                mode: 0,
            },
        )
        .unwrap()
        .result;
        let head = heap.bytes(4);
        let tail = heap.bytes(16);
        let read = Fs::run_sync(
            &lp,
            FsOp::Read {
                file: fd,
                bufs: vec![BufRef::whole(head.clone()), BufRef::new(tail.clone(), 2, 10)],
                offset: Some(0),
            },
        )
        .unwrap();
        assert_eq!(read.result, 14);
        assert_eq!(head.to_vec(), b"scat");
        assert_eq!(tail.read(2, 10).unwrap(), b"ter/gather");

        let stat = Fs::run_sync(&lp, FsOp::Fstat { file: fd }).unwrap().stat.unwrap();
        assert_eq!(stat.size, 14);
        assert_eq!(stat.kind, FileKind::File);
        Fs::run_sync(&lp, FsOp::Close { file: fd }).unwrap();
        assert_eq!(
            Fs::run_sync(&lp, FsOp::Close { file: fd }).unwrap_err(),
            Errno::BadDescriptor
        );
    }

    #[test]
    fn test_pooled_requests_complete_on_loop() {
        let (heap, lp) = setup();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b"), b"b").unwrap();
        std::fs::write(dir.path().join("a"), b"a").unwrap();

        let results = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&results);
        let cb: FsCb = heap.callback(move |(req, result): (Managed<Fs>, Result<FsOutcome, Errno>)| {
            assert!(!req.is_pending());
            seen.lock().push(result);
        });
        let scandir = Fs::make(&heap);
        scandir
            .submit(&lp, FsOp::Scandir { path: dir.path().to_path_buf() }, Some(cb.clone()))
            .unwrap();
        let missing = Fs::make(&heap);
        missing
            .submit(
                &lp,
                FsOp::Stat {
                    path: dir.path().join("missing"),
                },
                Some(cb),
            )
            .unwrap();
        assert!(scandir.is_pending());

        assert!(!lp.run(RunMode::Default));
        let results = results.lock();
        assert_eq!(results.len(), 2);
        let listing = results.iter().find_map(|r| r.as_ref().ok()).unwrap();
        let names: Vec<&str> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(results.contains(&Err(Errno::NotFound)));
        assert_eq!(scandir.ref_count(), 1);
    }

    #[test]
    fn test_pooled_read_holds_buffer_until_callback() {
        let (heap, lp) = setup();
        let dir = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(dir.path(), b"pooled bytes").unwrap();
        let fd = Fs::run_sync(
            &lp,
            FsOp::Open {
                path: dir.path().to_path_buf(),
                flags: OpenFlags::read_only(),
                mode: 0,
            },
        )
        .unwrap()
        .result;

        let bytes_id = {
            let target = heap.bytes(6);
            let id = target.id();
            let got = Arc::new(Mutex::new(None));
            let seen = Arc::clone(&got);
            let probe = target.clone();
            Fs::make(&heap)
                .submit(
                    &lp,
                    FsOp::Read {
                        file: fd,
                        bufs: vec![BufRef::whole(target)],
                        offset: Some(7),
                    },
                    Some(heap.callback(move |(_, result): (Managed<Fs>, Result<FsOutcome, Errno>)| {
                        *seen.lock() = Some((result.map(|o| o.result), probe.to_vec()));
                    })),
                )
                .unwrap();
            lp.run(RunMode::Default);
            assert_eq!(*got.lock(), Some((Ok(5), b"bytes\0".to_vec())));
            id
        };
        assert!(heap.ledger().stats(bytes_id).unwrap().is_balanced());
    }

    #[test]
    fn test_invalid_op_rejected_at_submission() {
        let (heap, lp) = setup();
        let req = Fs::make(&heap);
        let err = req
            .submit(&lp, FsOp::Unlink { path: PathBuf::new() }, None)
            .unwrap_err();
        assert_eq!(err, Errno::InvalidArgument);
        assert!(!req.is_pending());
        assert_eq!(lp.native().request_count(), 0);
    }
}
