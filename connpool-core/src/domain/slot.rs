//! Hot-swappable container slots.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::bounded::Bounded;

/// Holds the *current* instance of a [`Bounded`] container.
///
/// Resizing never touches the old instance: it is swapped out atomically and
/// lives on for as long as somebody still holds an `Arc` to it. Readers on the
/// hot path never take a lock.
///
/// A capacity of zero is stored as no instance at all.
#[derive(Debug)]
pub struct BoundedSlot<T> {
    current: ArcSwapOption<Bounded<T>>,
    /// Woken on every swap.
    swapped: Notify,
}

impl<T> BoundedSlot<T> {
    /// Create a slot holding a fresh container of `capacity`.
    pub fn new(capacity: usize) -> Self {
        Self {
            current: ArcSwapOption::new(Self::instance(capacity)),
            swapped: Notify::new(),
        }
    }

    fn instance(capacity: usize) -> Option<Arc<Bounded<T>>> {
        (capacity > 0).then(|| Arc::new(Bounded::new(capacity)))
    }

    /// The current instance, or `None` when the capacity is zero.
    pub fn load(&self) -> Option<Arc<Bounded<T>>> {
        self.current.load_full()
    }

    /// Capacity of the current instance.
    pub fn capacity(&self) -> usize {
        self.load().map_or(0, |c| c.capacity())
    }

    /// Number of items in the current instance.
    pub fn len(&self) -> usize {
        self.load().map_or(0, |c| c.len())
    }

    /// Whether the current instance is empty or absent.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves on the next swap.
    ///
    /// Waiters holding an instance they loaded earlier use this to notice it
    /// went stale. Call [`Notified::enable`] before [`BoundedSlot::load`] so a
    /// swap landing in between is not missed.
    pub fn swapped(&self) -> Notified<'_> {
        self.swapped.notified()
    }

    /// Swap in a fresh container of `capacity` if it differs from the current
    /// one, returning the displaced instance when there was one.
    ///
    /// Concurrent callers must be serialized externally; readers need not be.
    pub fn resize(&self, capacity: usize) -> Option<Arc<Bounded<T>>> {
        if capacity == self.capacity() {
            return None;
        }
        let displaced = self.current.swap(Self::instance(capacity));
        self.swapped.notify_waiters();
        displaced
    }
}
