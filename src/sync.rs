//! Shared synchronization primitives.
//!
//! Each wrapper is a managed object holding an optional `Arc` block around
//! one native primitive. Several wrappers can alias the same block through
//! [`Shared::copy`], so one lock stays reachable from independent owners on
//! different threads. The block is torn down when the last alias releases
//! it, independently of any single wrapper's lifetime.

use crate::engine::sync::{NativeBarrier, NativeCond, NativeMutex, NativeRwLock, NativeSem};
use crate::error::{Errno, Status};
use crate::heap::{Heap, Managed};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// A native primitive that can live in a shared block
pub trait Primitive: Send + Sync + 'static {
    /// Name used for ledger accounting and tracing
    const NAME: &'static str;
}

impl Primitive for NativeMutex {
    const NAME: &'static str = "mutex";
}

impl Primitive for NativeRwLock {
    const NAME: &'static str = "rwlock";
}

impl Primitive for NativeCond {
    const NAME: &'static str = "cond";
}

impl Primitive for NativeSem {
    const NAME: &'static str = "sem";
}

impl Primitive for NativeBarrier {
    const NAME: &'static str = "barrier";
}

/// Managed wrapper around an optional shared block
pub struct Shared<P> {
    block: Mutex<Option<Arc<P>>>,
}

/// Shared mutex
pub type SharedMutex = Shared<NativeMutex>;
/// Shared reader-writer lock
pub type SharedRwLock = Shared<NativeRwLock>;
/// Shared condition variable
pub type SharedCond = Shared<NativeCond>;
/// Shared counting semaphore
pub type SharedSem = Shared<NativeSem>;
/// Shared barrier
pub type SharedBarrier = Shared<NativeBarrier>;

impl<P> Default for Shared<P> {
    fn default() -> Self {
        Self {
            block: Mutex::new(None),
        }
    }
}

impl<P> fmt::Debug for Shared<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let refs = self.block.lock().as_ref().map(Arc::strong_count);
        f.debug_struct("Shared").field("block_refs", &refs).finish()
    }
}

impl<P: Primitive> Shared<P> {
    /// Allocate an uninitialised wrapper
    pub fn make(heap: &Heap) -> Managed<Self> {
        Self::allocate(heap, Shared::default())
    }

    /// Allocate a wrapper already holding `primitive`
    pub(crate) fn with_block(heap: &Heap, primitive: P) -> Managed<Self> {
        Self::allocate(
            heap,
            Shared {
                block: Mutex::new(Some(Arc::new(primitive))),
            },
        )
    }

    fn allocate(heap: &Heap, shared: Shared<P>) -> Managed<Self> {
        heap.allocate_tracked(P::NAME, shared, |shared: &mut Shared<P>| {
            if let Some(block) = shared.block.get_mut().take() {
                let remaining = Arc::strong_count(&block) - 1;
                trace!(primitive = P::NAME, remaining, "Releasing shared block");
            }
        })
    }

    /// Install a fresh block; `InvalidArgument` if one is already held
    pub(crate) fn install(&self, primitive: P) -> Status {
        let mut block = self.block.lock();
        if block.is_some() {
            return Err(Errno::InvalidArgument);
        }
        *block = Some(Arc::new(primitive));
        Ok(())
    }

    /// The block; `InvalidArgument` before `init`
    pub(crate) fn block(&self) -> Result<Arc<P>, Errno> {
        self.block.lock().clone().ok_or(Errno::InvalidArgument)
    }

    /// Alias `other` onto this wrapper's block, releasing whatever `other` held
    pub fn copy(&self, other: &Shared<P>) -> Status {
        let block = self.block()?;
        if std::ptr::eq(self, other) {
            return Ok(());
        }
        let previous = other.block.lock().replace(block);
        drop(previous);
        Ok(())
    }

    /// Number of wrappers sharing the block, 0 before `init`
    pub fn block_refs(&self) -> usize {
        self.block.lock().as_ref().map_or(0, Arc::strong_count)
    }

    /// Whether a block is installed
    pub fn is_initialized(&self) -> bool {
        self.block.lock().is_some()
    }
}

impl Shared<NativeMutex> {
    /// Create the native mutex
    pub fn init(&self) -> Status {
        self.install(NativeMutex::new())
    }

    /// Block until acquired
    pub fn lock(&self) -> Status {
        self.block()?.lock();
        Ok(())
    }

    /// Acquire without blocking; `Busy` if held
    pub fn try_lock(&self) -> Status {
        self.block()?.try_lock()
    }

    /// Release
    pub fn unlock(&self) -> Status {
        self.block()?.unlock()
    }
}

impl Shared<NativeRwLock> {
    /// Create the native rwlock
    pub fn init(&self) -> Status {
        self.install(NativeRwLock::new())
    }

    /// Acquire shared access
    pub fn read_lock(&self) -> Status {
        self.block()?.read_lock();
        Ok(())
    }

    /// Acquire shared access; `Busy` while a writer holds it
    pub fn try_read_lock(&self) -> Status {
        self.block()?.try_read_lock()
    }

    /// Release shared access
    pub fn read_unlock(&self) -> Status {
        self.block()?.read_unlock()
    }

    /// Acquire exclusive access
    pub fn write_lock(&self) -> Status {
        self.block()?.write_lock();
        Ok(())
    }

    /// Acquire exclusive access; `Busy` while held
    pub fn try_write_lock(&self) -> Status {
        self.block()?.try_write_lock()
    }

    /// Release exclusive access
    pub fn write_unlock(&self) -> Status {
        self.block()?.write_unlock()
    }
}

impl Shared<NativeCond> {
    /// Create the native condition variable
    pub fn init(&self) -> Status {
        self.install(NativeCond::new())
    }

    /// Wake one waiter
    pub fn signal(&self) -> Status {
        self.block()?.signal();
        Ok(())
    }

    /// Wake every waiter
    pub fn broadcast(&self) -> Status {
        self.block()?.broadcast();
        Ok(())
    }

    /// Release `mutex`, wait for a signal, reacquire
    pub fn wait(&self, mutex: &SharedMutex) -> Status {
        let cond = self.block()?;
        let mutex = mutex.block()?;
        cond.wait(&mutex)
    }

    /// Like [`wait`](Self::wait); `TimedOut` after `timeout`
    pub fn timed_wait(&self, mutex: &SharedMutex, timeout: Duration) -> Status {
        let cond = self.block()?;
        let mutex = mutex.block()?;
        cond.timed_wait(&mutex, timeout)
    }
}

impl Shared<NativeSem> {
    /// Create the native semaphore with `value` permits
    pub fn init(&self, value: u32) -> Status {
        self.install(NativeSem::new(value))
    }

    /// Add a permit
    pub fn post(&self) -> Status {
        self.block()?.post();
        Ok(())
    }

    /// Take a permit, blocking until available
    pub fn wait(&self) -> Status {
        self.block()?.wait();
        Ok(())
    }

    /// Take a permit; `WouldBlock` if none
    pub fn try_wait(&self) -> Status {
        self.block()?.try_wait()
    }

    /// Permits available
    pub fn value(&self) -> Result<u32, Errno> {
        Ok(self.block()?.value())
    }
}

impl Shared<NativeBarrier> {
    /// Create the native barrier for `count` threads
    pub fn init(&self, count: u32) -> Status {
        self.install(NativeBarrier::new(count)?)
    }

    /// Wait for the round; `true` for exactly one arrival per round
    pub fn wait(&self) -> Result<bool, Errno> {
        Ok(self.block()?.wait())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_teardown_on_last_alias() {
        let heap = Heap::instrumented();
        let first = SharedMutex::make(&heap);
        first.init().unwrap();
        let weak = Arc::downgrade(&first.block().unwrap());

        let aliases: Vec<_> = (0..3).map(|_| SharedMutex::make(&heap)).collect();
        for alias in &aliases {
            first.copy(alias).unwrap();
        }
        assert_eq!(first.block_refs(), 4);

        drop(first);
        let mut aliases = aliases;
        while aliases.len() > 1 {
            aliases.pop();
            assert!(weak.upgrade().is_some());
        }
        assert_eq!(aliases[0].block_refs(), 1);
        aliases.pop();
        assert!(weak.upgrade().is_none());
        assert_eq!(heap.ledger().summary().live_objects(), 0);
    }

    #[test]
    fn test_copy_releases_previous_block() {
        let heap = Heap::instrumented();
        let a = SharedSem::make(&heap);
        a.init(1).unwrap();
        let b = SharedSem::make(&heap);
        b.init(5).unwrap();
        let old = Arc::downgrade(&b.block().unwrap());

        a.copy(&b).unwrap();
        assert!(old.upgrade().is_none());
        assert_eq!(b.value(), Ok(1));
        b.try_wait().unwrap();
        assert_eq!(a.try_wait(), Err(Errno::WouldBlock));
        a.copy(&a).unwrap();
        assert_eq!(a.block_refs(), 2);
    }

    #[test]
    fn test_uninitialised_wrapper_rejects_operations() {
        let heap = Heap::instrumented();
        let mutex = SharedMutex::make(&heap);
        let other = SharedMutex::make(&heap);
        assert!(!mutex.is_initialized());
        assert_eq!(mutex.block_refs(), 0);
        assert_eq!(mutex.lock(), Err(Errno::InvalidArgument));
        assert_eq!(mutex.copy(&other), Err(Errno::InvalidArgument));
        mutex.init().unwrap();
        assert_eq!(mutex.init(), Err(Errno::InvalidArgument));

        let barrier = SharedBarrier::make(&heap);
        assert_eq!(barrier.init(0), Err(Errno::InvalidArgument));
        assert!(!barrier.is_initialized());
    }

    #[test]
    fn test_mutex_shared_across_threads() {
        let heap = Heap::instrumented();
        let mutex = SharedMutex::make(&heap);
        mutex.init().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let alias = SharedMutex::make(&heap);
                mutex.copy(&alias).unwrap();
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..100 {
                        alias.lock().unwrap();
                        let seen = counter.load(Ordering::Relaxed);
                        counter.store(seen + 1, Ordering::Relaxed);
                        alias.unlock().unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 400);
        assert_eq!(mutex.block_refs(), 1);
    }

    #[test]
    fn test_cond_wait_and_timeout() {
        let heap = Heap::instrumented();
        let mutex = SharedMutex::make(&heap);
        mutex.init().unwrap();
        let cond = SharedCond::make(&heap);
        cond.init().unwrap();

        mutex.lock().unwrap();
        assert_eq!(
            cond.timed_wait(&mutex, Duration::from_millis(10)),
            Err(Errno::TimedOut)
        );
        assert_eq!(mutex.try_lock(), Err(Errno::Busy));
        mutex.unlock().unwrap();

        let cond_alias = SharedCond::make(&heap);
        cond.copy(&cond_alias).unwrap();
        let mutex_alias = SharedMutex::make(&heap);
        mutex.copy(&mutex_alias).unwrap();
        let ready = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ready);
        let signaller = thread::spawn(move || {
            mutex_alias.lock().unwrap();
            flag.store(1, Ordering::SeqCst);
            cond_alias.signal().unwrap();
            mutex_alias.unlock().unwrap();
        });

        mutex.lock().unwrap();
        while ready.load(Ordering::SeqCst) == 0 {
            cond.timed_wait(&mutex, Duration::from_millis(50)).ok();
        }
        mutex.unlock().unwrap();
        signaller.join().unwrap();
    }

    #[test]
    fn test_rwlock_and_barrier() {
        let heap = Heap::instrumented();
        let lock = SharedRwLock::make(&heap);
        lock.init().unwrap();
        lock.read_lock().unwrap();
        lock.try_read_lock().unwrap();
        assert_eq!(lock.try_write_lock(), Err(Errno::Busy));
        lock.read_unlock().unwrap();
        lock.read_unlock().unwrap();
        lock.write_lock().unwrap();
        assert_eq!(lock.try_read_lock(), Err(Errno::Busy));
        lock.write_unlock().unwrap();

        let barrier = SharedBarrier::make(&heap);
        barrier.init(3).unwrap();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let alias = SharedBarrier::make(&heap);
                barrier.copy(&alias).unwrap();
                thread::spawn(move || alias.wait().unwrap())
            })
            .collect();
        let mut leaders = usize::from(barrier.wait().unwrap());
        for handle in handles {
            leaders += usize::from(handle.join().unwrap());
        }
        assert_eq!(leaders, 1);
    }
}
