//! Async handles: wake the loop from any thread.
//!
//! Sends that arrive before the loop gets to run the callback coalesce into
//! a single invocation.

use super::{make, recover, AsHandle, HandleCore};
use crate::callback::Callback;
use crate::engine::{self, HandleId, HandleKind};
use crate::error::Status;
use crate::event_loop::EventLoop;
use crate::heap::{Heap, Managed};
use crate::slot::Slot;

/// Async callback
pub type AsyncCb = Callback<Managed<Async>>;

/// Managed async handle
#[derive(Debug)]
pub struct Async {
    core: HandleCore,
    callback: Slot<AsyncCb>,
}

impl AsHandle for Async {
    const KIND: HandleKind = HandleKind::Async;

    fn handle_core(&self) -> &HandleCore {
        &self.core
    }

    fn release_callbacks(&self) {
        self.callback.clear();
    }
}

impl Async {
    /// Allocate an uninitialised async handle
    pub fn make(heap: &Heap) -> Managed<Async> {
        make(
            heap,
            Async {
                core: HandleCore::new(),
                callback: Slot::new(),
            },
        )
    }
}

fn async_trampoline(native: &engine::Loop, id: HandleId) {
    let Some(handle) = recover::<Async>(native, id) else {
        return;
    };
    let Some(cb) = handle.callback.retained() else {
        return;
    };
    cb.call(handle);
}

impl Managed<Async> {
    /// Bind to `lp`; the handle is active, and keeps the loop alive, until closed
    pub fn init(&self, lp: &Managed<EventLoop>, cb: AsyncCb) -> Status {
        self.core
            .register(lp, |native| native.async_init(async_trampoline))?;
        self.callback.install(cb);
        let (lp, id) = self.core.bound()?;
        self.mark_armed(lp.native(), id)
    }

    /// Schedule the callback on the loop thread
    pub fn send(&self) -> Status {
        let (lp, id) = self.core.open()?;
        lp.native().async_send(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::engine::RunMode;
    use crate::error::Errno;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_send_from_other_thread() {
        let heap = Heap::instrumented();
        let lp = EventLoop::new(&heap, BridgeConfig::default()).unwrap();
        let handle = Async::make(&heap);
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let cb: AsyncCb = heap.callback(move |handle: Managed<Async>| {
            seen.fetch_add(1, Ordering::SeqCst);
            handle.close(None).unwrap();
        });
        let cb_id = cb.id();
        handle.init(&lp, cb).unwrap();
        assert!(handle.is_active());

        let sender = handle.clone();
        let worker = thread::spawn(move || sender.send().unwrap());
        worker.join().unwrap();

        assert!(!lp.run(RunMode::Default));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(heap.ledger().stats(cb_id).unwrap().is_balanced());
        assert_eq!(handle.send(), Err(Errno::InvalidArgument));
        assert_eq!(handle.ref_count(), 1);
    }

    #[test]
    fn test_sends_coalesce() {
        let heap = Heap::new();
        let lp = EventLoop::new(&heap, BridgeConfig::default()).unwrap();
        let handle = Async::make(&heap);
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        handle
            .init(
                &lp,
                heap.callback(move |_: Managed<Async>| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        for _ in 0..3 {
            handle.send().unwrap();
        }
        lp.run(RunMode::NoWait);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        handle.close(None).unwrap();
        assert!(!lp.run(RunMode::Default));
    }
}
