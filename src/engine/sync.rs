//! Native synchronization primitives.
//!
//! These stand in for the engine's mutex, rwlock, condition variable,
//! semaphore and barrier. Lock operations are explicit (`lock`/`unlock`
//! rather than guards) because a bridged caller holds a lock across calls.

use crate::error::{Errno, Status};
use parking_lot::{Condvar, Mutex};
use std::time::Duration;
use tracing::trace;

/// Non-recursive mutex with explicit unlock
#[derive(Debug, Default)]
pub struct NativeMutex {
    locked: Mutex<bool>,
    released: Condvar,
}

impl NativeMutex {
    /// Create an unlocked mutex
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the mutex is acquired
    pub fn lock(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.released.wait(&mut locked);
        }
        *locked = true;
    }

    /// Acquire without blocking; `Busy` if held
    pub fn try_lock(&self) -> Status {
        let mut locked = self.locked.lock();
        if *locked {
            return Err(Errno::Busy);
        }
        *locked = true;
        Ok(())
    }

    /// Release the mutex; `InvalidArgument` if it was not held
    pub fn unlock(&self) -> Status {
        let mut locked = self.locked.lock();
        if !*locked {
            return Err(Errno::InvalidArgument);
        }
        *locked = false;
        self.released.notify_one();
        Ok(())
    }
}

impl Drop for NativeMutex {
    fn drop(&mut self) {
        trace!("mutex destroyed");
    }
}

#[derive(Debug, Default)]
struct RwState {
    readers: usize,
    writer: bool,
}

/// Reader-writer lock with explicit unlock
#[derive(Debug, Default)]
pub struct NativeRwLock {
    state: Mutex<RwState>,
    changed: Condvar,
}

impl NativeRwLock {
    /// Create an unlocked rwlock
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire shared access
    pub fn read_lock(&self) {
        let mut st = self.state.lock();
        while st.writer {
            self.changed.wait(&mut st);
        }
        st.readers += 1;
    }

    /// Acquire shared access without blocking
    pub fn try_read_lock(&self) -> Status {
        let mut st = self.state.lock();
        if st.writer {
            return Err(Errno::Busy);
        }
        st.readers += 1;
        Ok(())
    }

    /// Release shared access
    pub fn read_unlock(&self) -> Status {
        let mut st = self.state.lock();
        if st.readers == 0 {
            return Err(Errno::InvalidArgument);
        }
        st.readers -= 1;
        if st.readers == 0 {
            self.changed.notify_all();
        }
        Ok(())
    }

    /// Acquire exclusive access
    pub fn write_lock(&self) {
        let mut st = self.state.lock();
        while st.writer || st.readers > 0 {
            self.changed.wait(&mut st);
        }
        st.writer = true;
    }

    /// Acquire exclusive access without blocking
    pub fn try_write_lock(&self) -> Status {
        let mut st = self.state.lock();
        if st.writer || st.readers > 0 {
            return Err(Errno::Busy);
        }
        st.writer = true;
        Ok(())
    }

    /// Release exclusive access
    pub fn write_unlock(&self) -> Status {
        let mut st = self.state.lock();
        if !st.writer {
            return Err(Errno::InvalidArgument);
        }
        st.writer = false;
        self.changed.notify_all();
        Ok(())
    }
}

impl Drop for NativeRwLock {
    fn drop(&mut self) {
        trace!("rwlock destroyed");
    }
}

/// Condition variable paired with a [`NativeMutex`]
#[derive(Debug, Default)]
pub struct NativeCond {
    generation: Mutex<u64>,
    signaled: Condvar,
}

impl NativeCond {
    /// Create a condition variable
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake one waiter
    pub fn signal(&self) {
        *self.generation.lock() += 1;
        self.signaled.notify_one();
    }

    /// Wake every waiter
    pub fn broadcast(&self) {
        *self.generation.lock() += 1;
        self.signaled.notify_all();
    }

    /// Release `mutex`, wait for a signal, reacquire `mutex`
    pub fn wait(&self, mutex: &NativeMutex) -> Status {
        let mut generation = self.generation.lock();
        let seen = *generation;
        mutex.unlock()?;
        while *generation == seen {
            self.signaled.wait(&mut generation);
        }
        drop(generation);
        mutex.lock();
        Ok(())
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout` with `TimedOut`
    pub fn timed_wait(&self, mutex: &NativeMutex, timeout: Duration) -> Status {
        let mut generation = self.generation.lock();
        let seen = *generation;
        mutex.unlock()?;
        let deadline = std::time::Instant::now() + timeout;
        let mut timed_out = false;
        while *generation == seen {
            if self.signaled.wait_until(&mut generation, deadline).timed_out() {
                timed_out = *generation == seen;
                break;
            }
        }
        drop(generation);
        mutex.lock();
        if timed_out {
            Err(Errno::TimedOut)
        } else {
            Ok(())
        }
    }
}

impl Drop for NativeCond {
    fn drop(&mut self) {
        trace!("cond destroyed");
    }
}

/// Counting semaphore
#[derive(Debug, Default)]
pub struct NativeSem {
    count: Mutex<u32>,
    posted: Condvar,
}

impl NativeSem {
    /// Create a semaphore holding `value` permits
    pub fn new(value: u32) -> Self {
        Self {
            count: Mutex::new(value),
            posted: Condvar::new(),
        }
    }

    /// Add a permit
    pub fn post(&self) {
        *self.count.lock() += 1;
        self.posted.notify_one();
    }

    /// Take a permit, blocking until one is available
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.posted.wait(&mut count);
        }
        *count -= 1;
    }

    /// Take a permit without blocking; `WouldBlock` if none
    pub fn try_wait(&self) -> Status {
        let mut count = self.count.lock();
        if *count == 0 {
            return Err(Errno::WouldBlock);
        }
        *count -= 1;
        Ok(())
    }

    /// Permits currently available
    pub fn value(&self) -> u32 {
        *self.count.lock()
    }
}

impl Drop for NativeSem {
    fn drop(&mut self) {
        trace!("sem destroyed");
    }
}

#[derive(Debug)]
struct BarrierState {
    waiting: u32,
    generation: u64,
}

/// Reusable barrier; one waiter per round is told it was last
#[derive(Debug)]
pub struct NativeBarrier {
    count: u32,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl NativeBarrier {
    /// Create a barrier for `count` threads; `InvalidArgument` for zero
    pub fn new(count: u32) -> Result<Self, Errno> {
        if count == 0 {
            return Err(Errno::InvalidArgument);
        }
        Ok(Self {
            count,
            state: Mutex::new(BarrierState {
                waiting: 0,
                generation: 0,
            }),
            released: Condvar::new(),
        })
    }

    /// Block until `count` threads arrive; returns true for the last arrival
    pub fn wait(&self) -> bool {
        let mut st = self.state.lock();
        st.waiting += 1;
        if st.waiting == self.count {
            st.waiting = 0;
            st.generation += 1;
            self.released.notify_all();
            return true;
        }
        let generation = st.generation;
        while st.generation == generation {
            self.released.wait(&mut st);
        }
        false
    }
}

impl Drop for NativeBarrier {
    fn drop(&mut self) {
        trace!("barrier destroyed");
    }
}
