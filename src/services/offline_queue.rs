//! Bounded FIFO buffer for messages produced while the broker is unreachable
//!
//! Overflow drops the oldest entry so the newest telemetry is kept during
//! long outages. Lives only in memory: a process restart loses it.

use std::collections::VecDeque;
use std::future::Future;

/// A message ready to publish
///
/// The topic is resolved when the message is produced, so a queued message
/// keeps the session id that was active at that time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl QueuedMessage {
    pub fn new(topic: String, payload: Vec<u8>) -> Self {
        Self { topic, payload }
    }
}

/// Outcome of a drain pass
#[derive(Debug)]
pub struct DrainReport<E> {
    /// Messages handed to the publish function successfully
    pub sent: usize,
    /// Error that stopped the drain early; the failed message is back at the head
    pub halted: Option<E>,
}

/// Not synchronised; callers serialise access
#[derive(Debug)]
pub struct OfflineQueue {
    buf: VecDeque<QueuedMessage>,
    capacity: usize,
}

impl OfflineQueue {
    /// Create a queue holding at most `capacity` messages (clamped to 1)
    pub fn new(capacity: usize) -> Self {
        Self { buf: VecDeque::new(), capacity: capacity.max(1) }
    }

    /// Append at the tail, dropping the head first when full
    ///
    /// Returns the dropped message, if any.
    pub fn enqueue(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        let dropped = if self.buf.len() >= self.capacity { self.buf.pop_front() } else { None };
        self.buf.push_back(message);
        dropped
    }

    /// Publish every queued message, oldest first
    ///
    /// `publish` gets ownership of each message and either succeeds or hands
    /// the message back with an error. A handed-back message is restored to
    /// the head and draining stops, keeping FIFO order for the next attempt.
    pub async fn drain<F, Fut, E>(&mut self, mut publish: F) -> DrainReport<E>
    where
        F: FnMut(QueuedMessage) -> Fut,
        Fut: Future<Output = Result<(), (QueuedMessage, E)>>,
    {
        let mut sent = 0;
        while let Some(message) = self.buf.pop_front() {
            if let Err((message, err)) = publish(message).await {
                self.buf.push_front(message);
                return DrainReport { sent, halted: Some(err) };
            }
            sent += 1;
        }
        DrainReport { sent, halted: None }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.buf.iter()
    }

    /// Discard everything, returning how many messages were lost
    pub fn clear(&mut self) -> usize {
        let n = self.buf.len();
        self.buf.clear();
        n
    }
}
