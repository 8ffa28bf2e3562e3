//! Single-owner data slots.
//!
//! A [`Slot`] holds at most one owned value. Installing a new value releases
//! the previous one and taking the value leaves the slot empty. Replaced
//! values are always dropped after the slot's lock is released so a
//! finalizer that re-enters the owning wrapper cannot deadlock.

use parking_lot::Mutex;
use std::fmt;

/// Contents of a data slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState<T> {
    /// Nothing stored
    Empty,
    /// One owned value
    Owned(T),
}

impl<T> Default for SlotState<T> {
    fn default() -> Self {
        SlotState::Empty
    }
}

impl<T> SlotState<T> {
    /// Whether the slot is empty
    pub fn is_empty(&self) -> bool {
        matches!(self, SlotState::Empty)
    }

    /// Take the value out, leaving `Empty`
    pub fn take(&mut self) -> Option<T> {
        match std::mem::take(self) {
            SlotState::Empty => None,
            SlotState::Owned(value) => Some(value),
        }
    }

    /// Store `value`, handing back the previous one
    pub fn replace(&mut self, value: T) -> Option<T> {
        match std::mem::replace(self, SlotState::Owned(value)) {
            SlotState::Empty => None,
            SlotState::Owned(previous) => Some(previous),
        }
    }

    /// Borrow the value
    pub fn as_ref(&self) -> Option<&T> {
        match self {
            SlotState::Empty => None,
            SlotState::Owned(value) => Some(value),
        }
    }

    /// Mutably borrow the value
    pub fn as_mut(&mut self) -> Option<&mut T> {
        match self {
            SlotState::Empty => None,
            SlotState::Owned(value) => Some(value),
        }
    }
}

/// Thread-safe single-owner slot
pub struct Slot<T> {
    state: Mutex<SlotState<T>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Slot<T> {
    /// Empty slot
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty),
        }
    }

    /// Store `value`, releasing whatever was there
    pub fn install(&self, value: T) {
        let previous = self.state.lock().replace(value);
        drop(previous);
    }

    /// Take the value out, leaving the slot empty
    pub fn take(&self) -> Option<T> {
        self.state.lock().take()
    }

    /// Release whatever is stored
    pub fn clear(&self) {
        let previous = self.state.lock().take();
        drop(previous);
    }

    /// Whether the slot is empty
    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    /// Run `f` against the stored value while holding the slot
    pub fn with<R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        f(self.state.lock().as_mut())
    }

    /// Exclusive access without locking (finalizers)
    pub fn get_mut(&mut self) -> &mut SlotState<T> {
        self.state.get_mut()
    }
}

impl<T: Clone> Slot<T> {
    /// Clone of the stored value; for managed values this is a retain
    pub fn retained(&self) -> Option<T> {
        self.state.lock().as_ref().cloned()
    }
}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_empty() { "Empty" } else { "Owned" };
        f.debug_tuple("Slot").field(&state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[derive(Default)]
    struct Payload;

    #[test]
    fn test_slot_state_transitions() {
        let mut state = SlotState::default();
        assert!(state.is_empty());
        assert_eq!(state.replace(1), None);
        assert_eq!(state.replace(2), Some(1));
        assert_eq!(state.as_ref(), Some(&2));
        assert_eq!(state.take(), Some(2));
        assert!(state.is_empty());
        assert_eq!(state.take(), None);
    }

    #[test]
    fn test_install_releases_previous() {
        let heap = Heap::instrumented();
        let first = heap.allocate_plain::<Payload>("cb");
        let second = heap.allocate_plain::<Payload>("cb");
        let (first_id, second_id) = (first.id(), second.id());

        let slot = Slot::new();
        slot.install(first);
        slot.install(second);
        assert!(heap.ledger().stats(first_id).unwrap().is_balanced());
        assert_eq!(heap.ledger().stats(second_id).unwrap().live(), 1);

        slot.clear();
        assert!(slot.is_empty());
        assert!(heap.ledger().stats(second_id).unwrap().is_balanced());
    }

    #[test]
    fn test_retained_increments() {
        let heap = Heap::instrumented();
        let value = heap.allocate_plain::<Payload>("cb");
        let slot = Slot::new();
        slot.install(value);

        let borrowed = slot.retained().unwrap();
        assert_eq!(borrowed.ref_count(), 2);
        drop(borrowed);
        assert_eq!(slot.take().unwrap().ref_count(), 1);
    }

    #[test]
    fn test_drop_inside_finalizer_does_not_deadlock() {
        let heap = Heap::instrumented();
        let slot = std::sync::Arc::new(Slot::new());
        let inner = std::sync::Arc::clone(&slot);
        let value = heap.allocate_tracked("cb", (), move |_| {
            // Re-enter the slot that is dropping us
            assert!(inner.is_empty());
        });
        slot.install(value);
        slot.clear();
    }
}
