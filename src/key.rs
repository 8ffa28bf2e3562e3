//! Thread-local keys.
//!
//! A [`Key`] holds at most one value per thread. A thread only ever sees
//! the value it set itself. Values stay until the same thread replaces them
//! or the key is deleted, which also happens when the last wrapper is
//! released.

use crate::error::{Errno, Status};
use crate::heap::{Heap, Managed};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::trace;

/// Managed thread-local key
pub struct Key<T> {
    created: AtomicBool,
    values: DashMap<ThreadId, Arc<T>>,
}

impl<T> Default for Key<T> {
    fn default() -> Self {
        Self {
            created: AtomicBool::new(false),
            values: DashMap::new(),
        }
    }
}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("created", &self.created.load(Ordering::SeqCst))
            .field("threads", &self.values.len())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Key<T> {
    /// Allocate a key that has not been created yet
    pub fn make(heap: &Heap) -> Managed<Key<T>> {
        heap.allocate_tracked("key", Key::default(), |key: &mut Key<T>| {
            key.remove_all();
        })
    }

    fn check(&self) -> Status {
        if self.created.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Errno::InvalidArgument)
        }
    }

    fn remove_all(&self) -> usize {
        let threads: Vec<ThreadId> = self.values.iter().map(|entry| *entry.key()).collect();
        let removed: Vec<Arc<T>> = threads
            .iter()
            .filter_map(|id| self.values.remove(id).map(|(_, value)| value))
            .collect();
        let count = removed.len();
        trace!(values = count, "Releasing thread-local values");
        count
    }
}

impl<T: Send + Sync + 'static> Managed<Key<T>> {
    /// Create the key; `InvalidArgument` if it already exists
    pub fn create(&self) -> Status {
        match self
            .created
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(()),
            Err(_) => Err(Errno::InvalidArgument),
        }
    }

    /// Value set by the calling thread
    pub fn get(&self) -> Result<Option<Arc<T>>, Errno> {
        self.check()?;
        Ok(self
            .values
            .get(&thread::current().id())
            .map(|entry| Arc::clone(entry.value())))
    }

    /// Set the calling thread's value, releasing the one it replaces
    pub fn set(&self, value: T) -> Status {
        self.check()?;
        let previous = self.values.insert(thread::current().id(), Arc::new(value));
        drop(previous);
        Ok(())
    }

    /// Delete the key and release every thread's value; idempotent
    pub fn delete(&self) {
        if self.created.swap(false, Ordering::SeqCst) {
            self.remove_all();
        }
    }

    /// Whether the key has been created and not deleted
    pub fn is_created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::Bytes;

    #[test]
    fn test_values_are_per_thread() {
        let heap = Heap::instrumented();
        let key: Managed<Key<u32>> = Key::make(&heap);
        key.create().unwrap();
        key.set(1).unwrap();

        let remote = key.clone();
        let seen = thread::spawn(move || {
            let before = remote.get().unwrap();
            remote.set(2).unwrap();
            (before, remote.get().unwrap())
        })
        .join()
        .unwrap();

        assert_eq!(seen.0, None);
        assert_eq!(seen.1.as_deref(), Some(&2));
        assert_eq!(key.get().unwrap().as_deref(), Some(&1));
        key.set(3).unwrap();
        assert_eq!(key.get().unwrap().as_deref(), Some(&3));
    }

    #[test]
    fn test_lifecycle_errors() {
        let heap = Heap::instrumented();
        let key: Managed<Key<u32>> = Key::make(&heap);
        assert_eq!(key.get(), Err(Errno::InvalidArgument));
        assert_eq!(key.set(1), Err(Errno::InvalidArgument));

        key.create().unwrap();
        assert_eq!(key.create(), Err(Errno::InvalidArgument));
        assert!(key.is_created());

        key.delete();
        key.delete();
        assert!(!key.is_created());
        assert_eq!(key.get(), Err(Errno::InvalidArgument));
    }

    #[test]
    fn test_delete_and_release_drop_values() {
        let heap = Heap::instrumented();
        let key: Managed<Key<Bytes>> = Key::make(&heap);
        key.create().unwrap();
        let bytes = heap.bytes_from(b"per-thread");
        let bytes_id = bytes.id();
        key.set(bytes).unwrap();
        key.delete();
        assert!(heap.ledger().stats(bytes_id).unwrap().is_balanced());

        key.create().unwrap();
        let bytes = heap.bytes_from(b"released with the key");
        let bytes_id = bytes.id();
        key.set(bytes).unwrap();
        assert_eq!(key.get().unwrap().unwrap().to_vec(), b"released with the key");
        drop(key);
        assert!(heap.ledger().stats(bytes_id).unwrap().is_balanced());
    }
}
