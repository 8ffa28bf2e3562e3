//! Native threads.
//!
//! A [`Thread`] is a shared block like the other primitives, so it can be
//! aliased with [`Shared::copy`]. Joining consumes the join handle stored in
//! the block, and is therefore valid once across all aliases.

use crate::callback::Callback;
use crate::error::{Errno, Status};
use crate::heap::{Heap, Managed};
use crate::sync::{Primitive, Shared};
use parking_lot::Mutex;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, warn};

/// Thread entry point
pub type ThreadCb = Callback<()>;

/// Block behind a [`Thread`]
#[derive(Debug)]
pub struct ThreadBlock {
    id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Primitive for ThreadBlock {
    const NAME: &'static str = "thread";
}

/// Managed thread wrapper
pub type Thread = Shared<ThreadBlock>;

impl Shared<ThreadBlock> {
    /// Start a thread running `cb`; the callback moves into the thread
    pub fn create(heap: &Heap, cb: ThreadCb) -> Result<Managed<Thread>, Errno> {
        let handle = thread::Builder::new()
            .name("nexus-loop-thread".into())
            .spawn(move || cb.call(()))?;
        let id = handle.thread().id();
        debug!(?id, "Thread created");
        Ok(Thread::with_block(
            heap,
            ThreadBlock {
                id,
                join: Mutex::new(Some(handle)),
            },
        ))
    }

    /// Wrapper for the calling thread; it cannot be joined
    pub fn current(heap: &Heap) -> Managed<Thread> {
        Thread::with_block(
            heap,
            ThreadBlock {
                id: thread::current().id(),
                join: Mutex::new(None),
            },
        )
    }

    /// Wait for the thread to finish.
    ///
    /// `InvalidArgument` when already joined through any alias, or for a
    /// wrapper from [`current`](Self::current).
    pub fn join(&self) -> Status {
        let block = self.block()?;
        let handle = block.join.lock().take().ok_or(Errno::InvalidArgument)?;
        if handle.join().is_err() {
            warn!(id = ?block.id, "Joined thread panicked");
            return Err(Errno::Unknown);
        }
        Ok(())
    }

    /// Whether both wrappers name the same thread
    pub fn equal(&self, other: &Thread) -> Result<bool, Errno> {
        Ok(self.block()?.id == other.block()?.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_create_and_join_once() {
        let heap = Heap::instrumented();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let cb: ThreadCb = heap.callback(move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let cb_id = cb.id();

        let thread = Thread::create(&heap, cb).unwrap();
        let alias = Thread::make(&heap);
        thread.copy(&alias).unwrap();
        assert_eq!(thread.block_refs(), 2);

        alias.join().unwrap();
        assert_eq!(thread.join(), Err(Errno::InvalidArgument));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(heap.ledger().stats(cb_id).unwrap().is_balanced());
        assert!(thread.equal(&alias).unwrap());
    }

    #[test]
    fn test_current_inside_and_outside() {
        let heap = Heap::instrumented();
        let here = Thread::current(&heap);
        assert!(here.equal(&Thread::current(&heap)).unwrap());
        assert_eq!(here.join(), Err(Errno::InvalidArgument));

        let inner_heap = heap.clone();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let thread = Thread::create(
            &heap,
            heap.callback(move |()| {
                *slot.lock() = Some(Thread::current(&inner_heap));
            }),
        )
        .unwrap();
        thread.join().unwrap();
        let inner = seen.lock().take().unwrap();
        assert!(inner.equal(&thread).unwrap());
        assert!(!inner.equal(&here).unwrap());
    }

    #[test]
    fn test_wrappers_start_with_their_block() {
        let heap = Heap::instrumented();
        let here = Thread::current(&heap);
        let id = here.id();
        assert!(here.is_initialized());
        assert_eq!(here.block_refs(), 1);
        assert_eq!(here.install(ThreadBlock {
            id: thread::current().id(),
            join: Mutex::new(None),
        }), Err(Errno::InvalidArgument));

        let spawned = Thread::create(&heap, heap.callback(|()| {})).unwrap();
        assert!(spawned.is_initialized());
        spawned.join().unwrap();
        drop(here);
        assert!(heap.ledger().stats(id).unwrap().is_balanced());
    }

    #[test]
    fn test_uninitialised_thread() {
        let heap = Heap::instrumented();
        let thread = Thread::make(&heap);
        assert_eq!(thread.join(), Err(Errno::InvalidArgument));
        assert_eq!(thread.equal(&Thread::current(&heap)), Err(Errno::InvalidArgument));
    }
}
