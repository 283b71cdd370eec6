use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Duration, Instant};

/// Returned by [`EventQueue::dequeue`] when nothing arrived in time.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no item arrived within the poll timeout")]
pub struct Empty;

/// Unbounded FIFO shared between any number of producers and one consumer.
///
/// Producers never block. The consumer waits on a [`Notify`] with a
/// deadline, which lets it wake periodically and re-check its own exit
/// condition.
pub struct EventQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Notify,
    unfinished: AtomicUsize,
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        EventQueue {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            unfinished: AtomicUsize::new(0),
        }
    }

    /// Append `item` at the tail and wake the consumer.
    pub fn enqueue(&self, item: T) {
        self.items.lock().push_back(item);
        self.unfinished.fetch_add(1, Ordering::AcqRel);
        self.available.notify_one();
    }

    /// Pop the oldest item, waiting up to `timeout` for one to arrive.
    /// A timeout too large to represent waits without a deadline.
    ///
    /// Cancel-safe: an item is only removed from the queue on the same poll
    /// that returns it, so dropping the future never loses an item.
    pub async fn dequeue(&self, timeout: Duration) -> Result<T, Empty> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = self.items.lock().pop_front();
            if let Some(item) = popped {
                return Ok(item);
            }

            match deadline {
                Some(deadline) => {
                    if timeout_at(deadline, notified).await.is_err() {
                        return Err(Empty);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Snapshot; may be stale by the time the caller acts on it.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Acknowledge that a dequeued item has been fully handled.
    pub fn mark_done(&self) {
        let _ = self
            .unfinished
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Items enqueued but not yet acknowledged with [`mark_done`](Self::mark_done).
    pub fn unfinished(&self) -> usize {
        self.unfinished.load(Ordering::Acquire)
    }
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
