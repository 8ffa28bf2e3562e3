//! Timer handles.

use super::{make, recover, AsHandle, HandleCore};
use crate::callback::Callback;
use crate::engine::{self, HandleId, HandleKind};
use crate::error::{Errno, Status};
use crate::event_loop::EventLoop;
use crate::heap::{Heap, Managed};
use crate::slot::Slot;

/// Timer callback; receives the timer that fired
pub type TimerCb = Callback<Managed<Timer>>;

/// Managed timer handle
#[derive(Debug)]
pub struct Timer {
    core: HandleCore,
    callback: Slot<TimerCb>,
}

impl AsHandle for Timer {
    const KIND: HandleKind = HandleKind::Timer;

    fn handle_core(&self) -> &HandleCore {
        &self.core
    }

    fn release_callbacks(&self) {
        self.callback.clear();
    }
}

impl Timer {
    /// Allocate an uninitialised timer
    pub fn make(heap: &Heap) -> Managed<Timer> {
        make(
            heap,
            Timer {
                core: HandleCore::new(),
                callback: Slot::new(),
            },
        )
    }
}

fn timer_trampoline(native: &engine::Loop, id: HandleId) {
    let Some(timer) = recover::<Timer>(native, id) else {
        return;
    };
    let Some(cb) = timer.callback.retained() else {
        return;
    };
    cb.call(timer);
}

impl Managed<Timer> {
    /// Bind the timer to `lp`
    pub fn init(&self, lp: &Managed<EventLoop>) -> Status {
        self.core.register(lp, |native| native.timer_init())
    }

    /// Fire `cb` after `timeout` ms and then every `repeat` ms (0 for one shot).
    ///
    /// Replaces any previously installed callback.
    pub fn start(&self, cb: TimerCb, timeout: u64, repeat: u64) -> Status {
        let (lp, id) = self.core.open()?;
        lp.native().timer_start(id, timer_trampoline, timeout, repeat)?;
        self.callback.install(cb);
        self.mark_armed(lp.native(), id)
    }

    /// Disarm the timer and release its callback
    pub fn stop(&self) -> Status {
        let (lp, id) = self.core.open()?;
        lp.native().timer_stop(id)?;
        self.callback.clear();
        Ok(())
    }

    /// Re-arm with the repeat interval as timeout
    pub fn again(&self) -> Status {
        let (lp, id) = self.core.open()?;
        if self.callback.is_empty() {
            return Err(Errno::InvalidArgument);
        }
        lp.native().timer_again(id)
    }

    /// Change the repeat interval
    pub fn set_repeat(&self, repeat: u64) -> Status {
        let (lp, id) = self.core.open()?;
        lp.native().timer_set_repeat(id, repeat)
    }

    /// Repeat interval in ms
    pub fn repeat(&self) -> Result<u64, Errno> {
        let (lp, id) = self.core.bound()?;
        lp.native().timer_get_repeat(id)
    }

    /// Milliseconds until the next expiry
    pub fn due_in(&self) -> Result<u64, Errno> {
        let (lp, id) = self.core.bound()?;
        lp.native().timer_get_due_in(id)
    }

    /// Whether a callback is installed
    pub fn has_callback(&self) -> bool {
        !self.callback.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CloseCb;
    use crate::config::{BridgeConfig, ClockMode};
    use crate::engine::RunMode;
    use crate::handle::HandleState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Heap, Managed<EventLoop>) {
        let heap = Heap::instrumented();
        let lp = EventLoop::new(&heap, BridgeConfig::default().with_clock(ClockMode::Manual)).unwrap();
        (heap, lp)
    }

    fn counting(heap: &Heap) -> (TimerCb, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let cb = heap.callback(move |_timer: Managed<Timer>| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (cb, hits)
    }

    #[test]
    fn test_repeating_timer_scenario() {
        let (heap, lp) = setup();
        let timer = Timer::make(&heap);
        timer.init(&lp).unwrap();
        let (cb, hits) = counting(&heap);
        let cb_id = cb.id();

        timer.start(cb, 100, 50).unwrap();
        let timer_refs = timer.ref_count();
        let loop_refs = lp.ref_count();
        let cb_live = heap.ledger().stats(cb_id).unwrap().live();

        lp.advance(Duration::from_millis(310)).unwrap();
        lp.run(RunMode::NoWait);

        assert_eq!(hits.load(Ordering::SeqCst), 5);
        assert_eq!(timer.ref_count(), timer_refs);
        assert_eq!(lp.ref_count(), loop_refs);
        assert_eq!(heap.ledger().stats(cb_id).unwrap().live(), cb_live);
        assert_eq!(timer.due_in().unwrap(), 40);
        assert_eq!(lp.metrics().trampolines("timer"), 5);
    }

    #[test]
    fn test_callback_stops_its_own_timer() {
        let (heap, lp) = setup();
        let timer = Timer::make(&heap);
        timer.init(&lp).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let cb: TimerCb = heap.callback(move |timer: Managed<Timer>| {
            if seen.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                timer.stop().unwrap();
            }
        });
        let cb_id = cb.id();
        timer.start(cb, 10, 10).unwrap();

        lp.advance(Duration::from_millis(1000)).unwrap();
        lp.run(RunMode::NoWait);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(!timer.is_active());
        assert!(!timer.has_callback());
        assert!(heap.ledger().stats(cb_id).unwrap().is_balanced());
    }

    #[test]
    fn test_restart_replaces_callback() {
        let (heap, lp) = setup();
        let timer = Timer::make(&heap);
        timer.init(&lp).unwrap();
        let (first, first_hits) = counting(&heap);
        let first_id = first.id();
        let (second, second_hits) = counting(&heap);

        timer.start(first, 5, 0).unwrap();
        timer.start(second, 5, 0).unwrap();
        assert!(heap.ledger().stats(first_id).unwrap().is_balanced());

        lp.advance(Duration::from_millis(5)).unwrap();
        lp.run(RunMode::Default);
        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
        assert_eq!(timer.handle_state(), HandleState::Armed);
    }

    #[test]
    fn test_full_lifecycle_is_balanced() {
        let (heap, lp) = setup();
        let timer = Timer::make(&heap);
        let timer_id = timer.id();
        timer.init(&lp).unwrap();
        let (cb, hits) = counting(&heap);
        let cb_id = cb.id();
        timer.start(cb, 20, 20).unwrap();

        lp.advance(Duration::from_millis(40)).unwrap();
        lp.run(RunMode::NoWait);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let closed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&closed);
        let close_cb: CloseCb = heap.callback(move |()| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        timer.close(Some(close_cb)).unwrap();
        assert_eq!(timer.start(counting(&heap).0, 1, 0), Err(Errno::InvalidArgument));
        lp.run(RunMode::Default);

        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(heap.ledger().stats(cb_id).unwrap().is_balanced());
        assert_eq!(timer.ref_count(), 1);
        drop(timer);
        assert!(heap.ledger().stats(timer_id).unwrap().is_balanced());
        assert_eq!(lp.ref_count(), 1);
    }

    #[test]
    fn test_again_requires_callback() {
        let (heap, lp) = setup();
        let timer = Timer::make(&heap);
        timer.init(&lp).unwrap();
        assert_eq!(timer.again(), Err(Errno::InvalidArgument));

        let (cb, _) = counting(&heap);
        timer.start(cb, 100, 0).unwrap();
        timer.set_repeat(30).unwrap();
        assert_eq!(timer.repeat().unwrap(), 30);
        timer.again().unwrap();
        assert_eq!(timer.due_in().unwrap(), 30);

        timer.stop().unwrap();
        assert_eq!(timer.again(), Err(Errno::InvalidArgument));
    }
}
