//! Timer heap.
//!
//! Timers live in a `BTreeSet` ordered by deadline, then by start sequence.
//! A repeating timer re-arms at `previous deadline + repeat`, so one tick that
//! moves the clock across several periods fires once per period.

use super::{Detail, HandleCb, HandleId, Loop, LoopState, ACTIVE};
use crate::error::{Errno, Status};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    pub(crate) deadline: u64,
    seq: u64,
    id: HandleId,
}

#[derive(Debug, Default)]
pub(crate) struct TimerState {
    cb: Option<HandleCb>,
    repeat: u64,
    armed: Option<(u64, u64)>,
}

impl TimerState {
    pub(crate) fn key(&self, id: HandleId) -> Option<TimerKey> {
        self.armed.map(|(deadline, seq)| TimerKey { deadline, seq, id })
    }
}

fn timer_mut(st: &mut LoopState, id: HandleId) -> Result<(&mut TimerState, &mut u8), Errno> {
    let rec = st.handles.get_mut(id.0).ok_or(Errno::InvalidArgument)?;
    if rec.is_closing() {
        return Err(Errno::InvalidArgument);
    }
    match &mut rec.detail {
        Detail::Timer(timer) => Ok((timer, &mut rec.flags)),
        _ => Err(Errno::InvalidArgument),
    }
}

fn arm(st: &mut LoopState, id: HandleId, deadline: u64) -> Status {
    st.timer_seq += 1;
    let seq = st.timer_seq;
    let (timer, flags) = timer_mut(st, id)?;
    let previous = timer.key(id);
    timer.armed = Some((deadline, seq));
    *flags |= ACTIVE;
    if let Some(previous) = previous {
        st.timers.remove(&previous);
    }
    st.timers.insert(TimerKey { deadline, seq, id });
    Ok(())
}

impl Loop {
    /// Register a timer
    pub fn timer_init(&self) -> Result<HandleId, Errno> {
        self.handle_init(super::HandleKind::Timer)
    }

    /// Arm a timer to fire after `timeout` ms, then every `repeat` ms
    pub fn timer_start(&self, id: HandleId, cb: HandleCb, timeout: u64, repeat: u64) -> Status {
        let now = self.now();
        let mut st = self.state.lock();
        {
            let (timer, _) = timer_mut(&mut st, id)?;
            timer.cb = Some(cb);
            timer.repeat = repeat;
        }
        arm(&mut st, id, now.saturating_add(timeout))
    }

    /// Disarm a timer; idempotent
    pub fn timer_stop(&self, id: HandleId) -> Status {
        let mut st = self.state.lock();
        let (timer, flags) = timer_mut(&mut st, id)?;
        let key = timer.key(id);
        timer.armed = None;
        *flags &= !ACTIVE;
        if let Some(key) = key {
            st.timers.remove(&key);
        }
        Ok(())
    }

    /// Restart a repeating timer with its repeat interval as timeout
    pub fn timer_again(&self, id: HandleId) -> Status {
        let now = self.now();
        let mut st = self.state.lock();
        let (timer, _) = timer_mut(&mut st, id)?;
        if timer.cb.is_none() || timer.repeat == 0 {
            return Err(Errno::InvalidArgument);
        }
        let repeat = timer.repeat;
        arm(&mut st, id, now.saturating_add(repeat))
    }

    /// Change the repeat interval; takes effect at the next expiry
    pub fn timer_set_repeat(&self, id: HandleId, repeat: u64) -> Status {
        let mut st = self.state.lock();
        let (timer, _) = timer_mut(&mut st, id)?;
        timer.repeat = repeat;
        Ok(())
    }

    /// Repeat interval in ms
    pub fn timer_get_repeat(&self, id: HandleId) -> Result<u64, Errno> {
        let mut st = self.state.lock();
        let (timer, _) = timer_mut(&mut st, id)?;
        Ok(timer.repeat)
    }

    /// Milliseconds until the timer fires; 0 when disarmed or overdue
    pub fn timer_get_due_in(&self, id: HandleId) -> Result<u64, Errno> {
        let now = self.now();
        let mut st = self.state.lock();
        let (timer, _) = timer_mut(&mut st, id)?;
        Ok(timer
            .armed
            .map(|(deadline, _)| deadline.saturating_sub(now))
            .unwrap_or(0))
    }

    pub(crate) fn run_timers(&self) -> usize {
        let now = self.now();
        let mut fired = 0;
        loop {
            let next = {
                let mut st = self.state.lock();
                let Some(key) = st.timers.first().copied() else {
                    break;
                };
                if key.deadline > now {
                    break;
                }
                st.timers.remove(&key);
                let Ok((timer, flags)) = timer_mut(&mut st, key.id) else {
                    continue;
                };
                let cb = timer.cb;
                let repeat = timer.repeat;
                timer.armed = None;
                if repeat == 0 {
                    *flags &= !ACTIVE;
                } else {
                    let deadline = key.deadline.saturating_add(repeat);
                    if let Err(e) = arm(&mut st, key.id, deadline) {
                        warn!(id = %key.id, error = %e, "Failed to re-arm repeating timer");
                    }
                }
                cb.map(|cb| (key.id, cb))
            };
            if let Some((id, cb)) = next {
                self.metrics.record_trampoline("timer");
                cb(self, id);
                fired += 1;
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, ClockMode};
    use crate::engine::RunMode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    static FIRES: AtomicUsize = AtomicUsize::new(0);
    static ORDER: parking_lot::Mutex<Vec<u64>> = parking_lot::const_mutex(Vec::new());

    fn on_fire(_: &Loop, _: HandleId) {
        FIRES.fetch_add(1, Ordering::SeqCst);
    }

    fn record_now(lp: &Loop, _: HandleId) {
        ORDER.lock().push(lp.now());
    }

    fn manual() -> Loop {
        Loop::new(BridgeConfig::default().with_clock(ClockMode::Manual)).unwrap()
    }

    #[test]
    fn test_repeating_timer_catches_up_in_one_tick() {
        let lp = manual();
        let id = lp.timer_init().unwrap();
        lp.timer_start(id, on_fire, 100, 50).unwrap();

        lp.advance(Duration::from_millis(310)).unwrap();
        lp.run(RunMode::NoWait);
        assert_eq!(FIRES.load(Ordering::SeqCst), 5);
        assert_eq!(lp.timer_get_due_in(id).unwrap(), 40);
    }

    #[test]
    fn test_one_shot_timer_deactivates() {
        let lp = manual();
        let id = lp.timer_init().unwrap();
        lp.timer_start(id, record_now, 10, 0).unwrap();
        assert!(lp.is_active(id));
        assert!(lp.alive());

        lp.run(RunMode::Default);
        assert!(ORDER.lock().is_empty());
        lp.advance(Duration::from_millis(10)).unwrap();
        assert!(!lp.run(RunMode::Default));
        assert_eq!(*ORDER.lock(), vec![10]);
        assert!(!lp.is_active(id));
    }

    #[test]
    fn test_again_and_repeat() {
        let lp = manual();
        let id = lp.timer_init().unwrap();
        assert_eq!(lp.timer_again(id), Err(Errno::InvalidArgument));

        lp.timer_start(id, on_fire, 1000, 0).unwrap();
        assert_eq!(lp.timer_again(id), Err(Errno::InvalidArgument));
        lp.timer_set_repeat(id, 25).unwrap();
        assert_eq!(lp.timer_get_repeat(id).unwrap(), 25);
        lp.timer_again(id).unwrap();
        assert_eq!(lp.timer_get_due_in(id).unwrap(), 25);

        lp.timer_stop(id).unwrap();
        lp.timer_stop(id).unwrap();
        assert_eq!(lp.timer_get_due_in(id).unwrap(), 0);
        assert!(!lp.alive());
    }

    #[test]
    fn test_maximal_repeat_saturates() {
        static SATURATED: AtomicUsize = AtomicUsize::new(0);
        fn on_saturated(_: &Loop, _: HandleId) {
            SATURATED.fetch_add(1, Ordering::SeqCst);
        }

        let lp = manual();
        let id = lp.timer_init().unwrap();
        lp.timer_start(id, on_saturated, 10, u64::MAX).unwrap();
        lp.advance(Duration::from_millis(10)).unwrap();
        lp.run(RunMode::NoWait);
        assert_eq!(SATURATED.load(Ordering::SeqCst), 1);
        assert!(lp.is_active(id));
        assert_eq!(lp.timer_get_due_in(id).unwrap(), u64::MAX - 10);

        lp.advance(Duration::from_millis(1000)).unwrap();
        lp.run(RunMode::NoWait);
        assert_eq!(SATURATED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timer_on_wrong_kind() {
        let lp = manual();
        let idle = lp.handle_init(crate::engine::HandleKind::Idle).unwrap();
        assert_eq!(lp.timer_start(idle, on_fire, 1, 0), Err(Errno::InvalidArgument));
    }
}
