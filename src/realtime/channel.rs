//! Bounded single-producer, single-consumer channel that never blocks the
//! producer.
//!
//! When the buffer is full the oldest item is evicted to make room for the
//! newest one: for live prices a fresh value is always worth more than a
//! stale one. Closing consumes the [`RealtimeSender`], so a channel is
//! closed exactly once and can never be written after close.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Default capacity, sized to absorb bursty delivery.
pub const DEFAULT_CAPACITY: usize = 1024;

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    closed: AtomicBool,
    evicted: AtomicU64,
    notify: Notify,
}

/// Why a push was rejected.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<T> {
    /// The buffer lock was unusable; the new item is handed back.
    Contended(T),
}

/// Why a non-blocking receive returned nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Closed,
}

/// Producing half. Dropping it closes the channel.
pub struct RealtimeSender<T> {
    shared: Arc<Shared<T>>,
}

/// Consuming half.
pub struct RealtimeReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Creates a channel holding at most `capacity` items (minimum one).
#[must_use]
pub fn channel<T>(capacity: usize) -> (RealtimeSender<T>, RealtimeReceiver<T>) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        capacity,
        closed: AtomicBool::new(false),
        evicted: AtomicU64::new(0),
        notify: Notify::new(),
    });
    (
        RealtimeSender {
            shared: Arc::clone(&shared),
        },
        RealtimeReceiver { shared },
    )
}

impl<T> RealtimeSender<T> {
    /// Appends `item`, evicting and returning the oldest buffered item if
    /// the channel is full.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Contended`] with the new item if the buffer lock
    /// is poisoned.
    pub fn try_push_evict_oldest(&self, item: T) -> Result<Option<T>, PushError<T>> {
        let evicted = {
            let Ok(mut queue) = self.shared.queue.lock() else {
                return Err(PushError::Contended(item));
            };
            let evicted = if queue.len() >= self.shared.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(item);
            evicted
        };

        if evicted.is_some() {
            self.shared.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.notify.notify_one();
        Ok(evicted)
    }

    /// Closes the channel. Buffered items stay readable.
    pub fn close(self) {
        drop(self);
    }
}

impl<T> Drop for RealtimeSender<T> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

impl<T> RealtimeReceiver<T> {
    /// Waits for the next item. Returns `None` once the channel is closed
    /// and drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.try_recv() {
                Ok(item) => return Some(item),
                Err(TryRecvError::Closed) => return None,
                Err(TryRecvError::Empty) => self.shared.notify.notified().await,
            }
        }
    }

    /// Takes the next item without waiting.
    ///
    /// # Errors
    ///
    /// [`TryRecvError::Empty`] if nothing is buffered,
    /// [`TryRecvError::Closed`] if the channel is closed and drained.
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        // Read the flag before the queue so an item pushed just before close
        // is never lost.
        let closed = self.shared.closed.load(Ordering::Acquire);
        let item = match self.shared.queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        match item {
            Some(item) => Ok(item),
            None if closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    /// Number of buffered items.
    #[must_use]
    pub fn len(&self) -> usize {
        match self.shared.queue.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once the sender has closed the channel.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Total items evicted to make room for newer ones.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.shared.evicted.load(Ordering::Relaxed)
    }
}

impl<T> fmt::Debug for RealtimeSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeSender")
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Debug for RealtimeReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeReceiver")
            .field("capacity", &self.shared.capacity)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[test]
    fn full_channel_keeps_newest() {
        let (tx, mut rx) = channel(3);
        for i in 0..3 {
            assert_eq!(tx.try_push_evict_oldest(i), Ok(None));
        }
        assert_eq!(tx.try_push_evict_oldest(3), Ok(Some(0)));

        assert_eq!(rx.len(), 3);
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Ok(2));
        assert_eq!(rx.try_recv(), Ok(3));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(rx.evicted(), 1);
    }

    #[test]
    fn close_drains_then_reports_closed() {
        let (tx, mut rx) = channel(4);
        tx.try_push_evict_oldest("last").unwrap();
        tx.close();

        assert!(rx.is_closed());
        assert_eq!(rx.try_recv(), Ok("last"));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn recv_waits_for_push() {
        let (tx, mut rx) = channel(4);
        let mut recv = task::spawn(async move { rx.recv().await });
        assert_pending!(recv.poll());

        tx.try_push_evict_oldest(7).unwrap();
        assert!(recv.is_woken());
        assert_ready_eq!(recv.poll(), Some(7));
    }

    #[test]
    fn recv_wakes_on_close() {
        let (tx, mut rx) = channel::<u8>(4);
        let mut recv = task::spawn(async move { rx.recv().await });
        assert_pending!(recv.poll());

        drop(tx);
        assert!(recv.is_woken());
        assert_ready_eq!(recv.poll(), None);
    }
}
