//! Ownership bridge between managed wrappers and the engine.
//!
//! Every object that crosses into the engine lives in a [`Managed`] box.
//! Cloning a `Managed` is a retain, dropping it is a release, and the last
//! release runs the object's finalizer exactly once before the memory is
//! reclaimed. A `&Managed<T>` is a borrowed pointer: the callee may read it
//! but must clone it to keep it past its own scope.
//!
//! The [`Ledger`] shared by all objects of a [`Heap`] counts increments and
//! decrements so tests can check that every sequence of operations leaves the
//! books balanced.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Stable identity of a managed object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Per-object reference accounting (instrumented heaps only)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStats {
    /// Object kind given at allocation
    pub kind: &'static str,
    /// Allocation plus every retain
    pub increments: u64,
    /// Every release
    pub decrements: u64,
    /// Number of times the finalizer ran
    pub finalized: u32,
}

impl ObjectStats {
    /// References still outstanding
    pub fn live(&self) -> u64 {
        self.increments.saturating_sub(self.decrements)
    }

    /// Every increment matched by a decrement and the finalizer ran once
    pub fn is_balanced(&self) -> bool {
        self.increments == self.decrements && self.finalized == 1
    }
}

/// Heap-wide totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSummary {
    /// Objects allocated
    pub allocated: u64,
    /// Objects finalized
    pub finalized: u64,
    /// Allocations plus retains
    pub increments: u64,
    /// Releases
    pub decrements: u64,
}

impl LedgerSummary {
    /// Objects not yet finalized
    pub fn live_objects(&self) -> u64 {
        self.allocated.saturating_sub(self.finalized)
    }
}

/// Retain/release accounting shared by every object of a heap
#[derive(Debug, Default)]
pub struct Ledger {
    next_id: AtomicU64,
    allocated: AtomicU64,
    finalized: AtomicU64,
    increments: AtomicU64,
    decrements: AtomicU64,
    objects: Option<DashMap<ObjectId, ObjectStats>>,
    trace: bool,
}

impl Ledger {
    fn new(instrumented: bool, trace: bool) -> Self {
        Self {
            objects: instrumented.then(DashMap::new),
            trace,
            ..Self::default()
        }
    }

    fn allocate(&self, kind: &'static str) -> ObjectId {
        let id = ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        self.increments.fetch_add(1, Ordering::Relaxed);
        if let Some(objects) = &self.objects {
            objects.insert(
                id,
                ObjectStats {
                    kind,
                    increments: 1,
                    decrements: 0,
                    finalized: 0,
                },
            );
        }
        if self.trace {
            trace!(target: "nexus_loop_bridge::refcount", %id, kind, "allocate");
        }
        id
    }

    fn retain(&self, id: ObjectId, kind: &'static str, count: usize) {
        self.increments.fetch_add(1, Ordering::Relaxed);
        if let Some(objects) = &self.objects {
            if let Some(mut stats) = objects.get_mut(&id) {
                stats.increments += 1;
            }
        }
        if self.trace {
            trace!(target: "nexus_loop_bridge::refcount", %id, kind, count, "incref");
        }
    }

    fn release(&self, id: ObjectId, kind: &'static str, count: usize) {
        self.decrements.fetch_add(1, Ordering::Relaxed);
        if let Some(objects) = &self.objects {
            if let Some(mut stats) = objects.get_mut(&id) {
                stats.decrements += 1;
            }
        }
        if self.trace {
            trace!(target: "nexus_loop_bridge::refcount", %id, kind, count, "decref");
        }
    }

    fn finalize(&self, id: ObjectId, kind: &'static str) {
        self.finalized.fetch_add(1, Ordering::Relaxed);
        if let Some(objects) = &self.objects {
            if let Some(mut stats) = objects.get_mut(&id) {
                stats.finalized += 1;
            }
        }
        if self.trace {
            trace!(target: "nexus_loop_bridge::refcount", %id, kind, "finalize");
        }
    }

    /// Accounting for one object, if the heap is instrumented
    pub fn stats(&self, id: ObjectId) -> Option<ObjectStats> {
        self.objects.as_ref()?.get(&id).map(|s| *s)
    }

    /// Ids of objects whose finalizer has not run yet (instrumented heaps only)
    pub fn live_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self
            .objects
            .iter()
            .flat_map(|objects| objects.iter())
            .filter(|entry| entry.finalized == 0)
            .map(|entry| *entry.key())
            .collect();
        ids.sort();
        ids
    }

    /// Heap-wide totals
    pub fn summary(&self) -> LedgerSummary {
        LedgerSummary {
            allocated: self.allocated.load(Ordering::Relaxed),
            finalized: self.finalized.load(Ordering::Relaxed),
            increments: self.increments.load(Ordering::Relaxed),
            decrements: self.decrements.load(Ordering::Relaxed),
        }
    }
}

/// Allocator for managed objects
#[derive(Debug, Clone)]
pub struct Heap {
    ledger: Arc<Ledger>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Heap that keeps only totals
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(Ledger::new(false, false)),
        }
    }

    /// Heap that also keeps per-object accounting
    pub fn instrumented() -> Self {
        Self {
            ledger: Arc::new(Ledger::new(true, false)),
        }
    }

    /// Same kind of heap with refcount trace events switched on or off.
    ///
    /// Builds a fresh ledger, so call it before allocating anything.
    pub fn with_tracing(self, trace: bool) -> Self {
        let instrumented = self.ledger.objects.is_some();
        Self {
            ledger: Arc::new(Ledger::new(instrumented, trace)),
        }
    }

    /// Heap matching a loop configuration's refcount tracing switch
    pub fn from_config(config: &crate::config::BridgeConfig) -> Self {
        Self::new().with_tracing(config.trace_refcounts)
    }

    /// The shared ledger
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Allocate a zeroed object with no finalizer
    pub fn allocate_plain<T>(&self, kind: &'static str) -> Managed<T>
    where
        T: Default + Send + Sync + 'static,
    {
        self.allocate(kind, T::default(), None)
    }

    /// Allocate an object whose last release runs `finalizer` first
    pub fn allocate_tracked<T, F>(&self, kind: &'static str, value: T, finalizer: F) -> Managed<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&mut T) + Send + 'static,
    {
        self.allocate(kind, value, Some(Box::new(finalizer)))
    }

    fn allocate<T>(&self, kind: &'static str, value: T, finalizer: Option<Finalizer<T>>) -> Managed<T>
    where
        T: Send + Sync + 'static,
    {
        let id = self.ledger.allocate(kind);
        Managed {
            inner: Arc::new(ManagedBox {
                id,
                kind,
                ledger: Arc::clone(&self.ledger),
                finalizer: Mutex::new(finalizer),
                value,
            }),
        }
    }
}

type Finalizer<T> = Box<dyn FnOnce(&mut T) + Send>;

struct ManagedBox<T: Send + Sync + 'static> {
    id: ObjectId,
    kind: &'static str,
    ledger: Arc<Ledger>,
    finalizer: Mutex<Option<Finalizer<T>>>,
    value: T,
}

impl<T: Send + Sync + 'static> Drop for ManagedBox<T> {
    fn drop(&mut self) {
        if let Some(finalizer) = self.finalizer.get_mut().take() {
            finalizer(&mut self.value);
        }
        self.ledger.finalize(self.id, self.kind);
    }
}

/// Owned reference to a managed object
pub struct Managed<T: Send + Sync + 'static> {
    inner: Arc<ManagedBox<T>>,
}

impl<T: Send + Sync + 'static> Managed<T> {
    /// Take an additional owned reference (incref)
    pub fn retain(&self) -> Self {
        self.clone()
    }

    /// Give up this reference (decref); the last one finalizes
    pub fn release(self) {
        drop(self)
    }

    /// Live references to the object
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Stable object id
    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    /// Kind given at allocation
    pub fn kind(&self) -> &'static str {
        self.inner.kind
    }

    /// Whether both references point at the same object
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl<T: Send + Sync + 'static> Clone for Managed<T> {
    fn clone(&self) -> Self {
        let inner = Arc::clone(&self.inner);
        inner
            .ledger
            .retain(inner.id, inner.kind, Arc::strong_count(&inner));
        Self { inner }
    }
}

impl<T: Send + Sync + 'static> Drop for Managed<T> {
    fn drop(&mut self) {
        let count = Arc::strong_count(&self.inner) - 1;
        self.inner.ledger.release(self.inner.id, self.inner.kind, count);
    }
}

impl<T: Send + Sync + 'static> Deref for Managed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner.value
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Managed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Managed")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Plain {
        value: u32,
    }

    #[test]
    fn test_allocate_plain_is_zeroed() {
        let heap = Heap::instrumented();
        let obj = heap.allocate_plain::<Plain>("plain");
        assert_eq!(obj.value, 0);
        assert_eq!(obj.ref_count(), 1);
        assert_eq!(obj.kind(), "plain");
    }

    #[test]
    fn test_retain_release_balance() {
        let heap = Heap::instrumented();
        let obj = heap.allocate_plain::<Plain>("plain");
        let id = obj.id();

        let second = obj.retain();
        let third = second.clone();
        assert_eq!(obj.ref_count(), 3);
        third.release();
        drop(second);

        let stats = heap.ledger().stats(id).unwrap();
        assert_eq!(stats.increments, 3);
        assert_eq!(stats.decrements, 2);
        assert_eq!(stats.live(), 1);

        drop(obj);
        assert!(heap.ledger().stats(id).unwrap().is_balanced());
        assert_eq!(heap.ledger().summary().live_objects(), 0);
    }

    #[test]
    fn test_finalizer_runs_once_on_last_release() {
        let heap = Heap::instrumented();
        let runs = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&runs);

        let obj = heap.allocate_tracked("tracked", Plain { value: 7 }, move |p: &mut Plain| {
            assert_eq!(p.value, 7);
            observed.fetch_add(1, Ordering::SeqCst);
        });
        let alias = obj.clone();

        drop(obj);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        drop(alias);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finalizer_can_release_nested_objects() {
        let heap = Heap::instrumented();
        let inner = heap.allocate_plain::<Plain>("inner");
        let inner_id = inner.id();

        let outer = heap.allocate_tracked("outer", Mutex::new(Some(inner)), |slot| {
            slot.get_mut().take();
        });
        let outer_id = outer.id();
        drop(outer);

        assert!(heap.ledger().stats(outer_id).unwrap().is_balanced());
        assert!(heap.ledger().stats(inner_id).unwrap().is_balanced());
    }

    #[test]
    fn test_uninstrumented_heap_keeps_totals() {
        let heap = Heap::new();
        let obj = heap.allocate_plain::<Plain>("plain");
        let id = obj.id();
        let alias = obj.clone();
        drop(alias);
        drop(obj);

        assert!(heap.ledger().stats(id).is_none());
        let summary = heap.ledger().summary();
        assert_eq!(summary.allocated, 1);
        assert_eq!(summary.increments, summary.decrements);
        assert_eq!(summary.finalized, 1);
    }

    #[test]
    fn test_live_ids() {
        let heap = Heap::instrumented();
        let a = heap.allocate_plain::<Plain>("a");
        let b = heap.allocate_plain::<Plain>("b");
        assert_eq!(heap.ledger().live_ids(), vec![a.id(), b.id()]);
        drop(a);
        assert_eq!(heap.ledger().live_ids(), vec![b.id()]);
    }
}
