//! Bounded queues.
//!
//! Producers on the bus see a [`Sink`]. Nodes on threads push into a
//! [`MemoryQueue`]; process nodes push into a queue that a drain thread writes
//! onto their link (see [`crate::process`]). Broker and relay code only ever
//! deals with the trait.

use std::time::Duration;

use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError,
};
use thiserror::Error;

/// Queue errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue is at capacity.
    #[error("Queue full")]
    Full,

    /// The queue holds no items.
    #[error("Queue empty")]
    Empty,

    /// The operation did not complete in time.
    #[error("Queue operation timed out")]
    Timeout,

    /// The other end is gone.
    #[error("Queue disconnected")]
    Disconnected,
}

/// Producer side of a bounded queue.
pub trait Sink<T>: Send + Sync {
    /// Push without blocking.
    ///
    /// # Errors
    ///
    /// Returns `Full` if the item cannot be taken right now.
    fn try_push(&self, item: T) -> Result<(), QueueError>;

    /// Push, waiting up to `timeout` for room.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if no room became available.
    fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), QueueError>;

    /// Approximate number of queued items.
    fn len(&self) -> usize;

    /// Whether the queue looks empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A bounded in-memory queue shared by clones.
#[derive(Debug)]
pub struct MemoryQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> Clone for MemoryQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}

impl<T> MemoryQueue<T> {
    /// Create a queue holding at most `capacity` items.
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Get the queue capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pop without blocking.
    ///
    /// # Errors
    ///
    /// Returns `Empty` if nothing is queued.
    pub fn try_pop(&self) -> Result<T, QueueError> {
        self.rx.try_recv().map_err(|e| match e {
            TryRecvError::Empty => QueueError::Empty,
            TryRecvError::Disconnected => QueueError::Disconnected,
        })
    }

    /// Pop, waiting up to `timeout` for an item.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if nothing arrived in time.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, QueueError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => QueueError::Timeout,
            RecvTimeoutError::Disconnected => QueueError::Disconnected,
        })
    }

    /// Pop everything queued right now and discard it.
    ///
    /// Returns the number of discarded items.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub(crate) fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }
}

impl<T: Send> Sink<T> for MemoryQueue<T> {
    fn try_push(&self, item: T) -> Result<(), QueueError> {
        self.tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Disconnected(_) => QueueError::Disconnected,
        })
    }

    fn push_timeout(&self, item: T, timeout: Duration) -> Result<(), QueueError> {
        self.tx.send_timeout(item, timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(_) => QueueError::Timeout,
            SendTimeoutError::Disconnected(_) => QueueError::Disconnected,
        })
    }

    fn len(&self) -> usize {
        self.rx.len()
    }
}
