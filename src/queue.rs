//! Fixed-capacity FIFO buffer between producers and the appender.
//!
//! Backed by a bounded `crossbeam_channel`. Producers hold a clone of the
//! receiving end so that, when the channel is full, they can evict the single
//! oldest entry instead of blocking. The appender is the only regular
//! consumer.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded};
use thiserror::Error;

/// Default number of entries buffered in memory.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32_768;

/// Result of a successful [`BoundedQueue::enqueue`].
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued<T> {
    /// The entry was inserted without displacing anything.
    Accepted,
    /// The queue was full; the returned oldest entry was evicted to make room.
    EvictedOldest(T),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue stayed full even after evicting the oldest entry.
    #[error("queue full; entry dropped")]
    Full,
    /// The consumer side has gone away.
    #[error("queue closed")]
    Closed,
}

/// Determines what happens to an entry evicted from a full queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueueOverflowPolicy {
    /// Discard the evicted entry.
    #[default]
    EvictOldest,
    /// Write the evicted entry to the durable overflow store.
    SpillOldest,
}

#[derive(Clone, Debug)]
pub struct BoundedQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` entries.
    ///
    /// A `capacity` of zero would turn the channel into a rendezvous
    /// channel; builders reject it before reaching here.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Insert without blocking, evicting the oldest entry once if full.
    pub fn enqueue(&self, item: T) -> Result<Enqueued<T>, QueueError> {
        let item = match self.tx.try_send(item) {
            Ok(()) => return Ok(Enqueued::Accepted),
            Err(TrySendError::Disconnected(_)) => return Err(QueueError::Closed),
            Err(TrySendError::Full(item)) => item,
        };
        let evicted = self.rx.try_recv().ok();
        match self.tx.try_send(item) {
            Ok(()) => Ok(evicted.map_or(Enqueued::Accepted, Enqueued::EvictedOldest)),
            Err(TrySendError::Full(_)) => Err(QueueError::Full),
            Err(TrySendError::Disconnected(_)) => Err(QueueError::Closed),
        }
    }

    /// Wait up to `timeout` for the next entry.
    pub fn dequeue(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take the next entry if one is immediately available.
    pub fn try_dequeue(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Receiving end, for consumers that multiplex with `select!`.
    pub(crate) fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
