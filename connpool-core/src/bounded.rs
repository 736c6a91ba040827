//! Fixed-capacity, lock-free container with cancellable blocking operations.
//!
//! The same primitive backs both the idle set (holding connections) and the
//! open-connection semaphore (holding unit tokens). Non-blocking operations
//! go straight to a `crossbeam` [`ArrayQueue`]; the blocking ones park on a
//! [`Notify`] and race it against a [`Context`].
//!
//! A capacity of `0` means the container is *absent*: nothing can ever be
//! pushed or popped and the blocking operations refuse to wait. What "absent"
//! means to the caller (no reuse, or no limit) is the caller's business.

use std::fmt;

use crossbeam_queue::ArrayQueue;
use tokio::sync::Notify;

use crate::context::{Context, ContextError};

/// Failure of a blocking container operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContainerError {
    /// The context was cancelled before the operation could complete.
    #[error("container operation canceled")]
    Canceled,

    /// The context deadline elapsed before the operation could complete.
    #[error("container operation deadline exceeded")]
    DeadlineExceeded,

    /// The container has zero capacity; blocking operations do not apply.
    #[error("container has zero capacity")]
    Absent,
}

impl From<ContextError> for ContainerError {
    fn from(reason: ContextError) -> Self {
        match reason {
            ContextError::Canceled => Self::Canceled,
            ContextError::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

/// A bounded multi-producer multi-consumer buffer.
pub struct Bounded<T> {
    /// `None` when the capacity is zero.
    slots: Option<ArrayQueue<T>>,
    /// Signalled whenever an item leaves the container.
    space: Notify,
    /// Signalled whenever an item enters the container.
    items: Notify,
}

impl<T> Bounded<T> {
    /// Create an empty container holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (capacity > 0).then(|| ArrayQueue::new(capacity)),
            space: Notify::new(),
            items: Notify::new(),
        }
    }

    /// Maximum number of items.
    pub fn capacity(&self) -> usize {
        self.slots.as_ref().map_or(0, ArrayQueue::capacity)
    }

    /// Number of items currently held.
    pub fn len(&self) -> usize {
        self.slots.as_ref().map_or(0, ArrayQueue::len)
    }

    /// Whether the container holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a push would be rejected. Always true for an absent container.
    pub fn is_full(&self) -> bool {
        self.slots.as_ref().map_or(true, ArrayQueue::is_full)
    }

    /// Push without waiting. The item is handed back if there is no room.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let Some(slots) = &self.slots else {
            return Err(item);
        };
        slots.push(item)?;
        self.items.notify_one();
        Ok(())
    }

    /// Pop without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.slots.as_ref()?.pop()?;
        self.space.notify_one();
        Some(item)
    }

    /// Push, waiting for room until `ctx` fires.
    ///
    /// On failure the item is dropped and the container is left untouched.
    pub async fn push(&self, item: T, ctx: &Context) -> Result<(), ContainerError> {
        if self.slots.is_none() {
            return Err(ContainerError::Absent);
        }
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }

        let mut item = item;
        loop {
            // Register interest before checking, otherwise a pop landing
            // between the failed push and the await is missed.
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(item) {
                Ok(()) => return Ok(()),
                Err(rejected) => item = rejected,
            }

            tokio::select! {
                biased;
                reason = ctx.done() => return Err(reason.into()),
                _ = &mut notified => {}
            }
        }
    }

    /// Pop, waiting for an item until `ctx` fires.
    pub async fn pop(&self, ctx: &Context) -> Result<T, ContainerError> {
        if self.slots.is_none() {
            return Err(ContainerError::Absent);
        }
        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }

        loop {
            let notified = self.items.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop() {
                return Ok(item);
            }

            tokio::select! {
                biased;
                reason = ctx.done() => return Err(reason.into()),
                _ = &mut notified => {}
            }
        }
    }

    /// Pop every item currently held.
    pub fn drain(&self) -> Vec<T> {
        std::iter::from_fn(|| self.try_pop())
            .take(self.capacity())
            .collect()
    }
}

impl<T> fmt::Debug for Bounded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bounded")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}
