//! Per-symbol fan-out of realtime data.
//!
//! [`RealtimeMap`] owns one bounded [`channel`] per subscribed symbol. The
//! reader loop of a broker's realtime connection publishes into it, while
//! subscriber tasks add and remove symbols concurrently.
//!
//! Unsubscribing never closes a channel directly: the sender is moved to a
//! pending-close list and the reader loop closes it with
//! [`RealtimeMap::clear_pending_close`] before it dispatches the next
//! inbound batch. The reader is therefore the only task that ever closes a
//! channel it might also be publishing into.

pub mod channel;

use std::sync::{Mutex, MutexGuard};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

pub use channel::{DEFAULT_CAPACITY, PushError, RealtimeReceiver, RealtimeSender, TryRecvError};

use crate::{ChartfeedError, Result};

/// Concurrent symbol → channel registry for one data kind.
#[derive(Debug)]
pub struct RealtimeMap<T> {
    channels: DashMap<String, RealtimeSender<T>>,
    pending_close: Mutex<Vec<RealtimeSender<T>>>,
    capacity: usize,
}

impl<T> Default for RealtimeMap<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<T> RealtimeMap<T> {
    /// Creates an empty map whose channels hold `capacity` items each.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            pending_close: Mutex::new(Vec::new()),
            capacity,
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<RealtimeSender<T>>> {
        self.pending_close.lock().unwrap_or_else(|poisoned| {
            warn!("Pending-close list mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Opens a channel for `symbol`.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::AlreadySubscribed`] if the symbol already
    /// has a live channel.
    pub fn subscribe(&self, symbol: &str) -> Result<RealtimeReceiver<T>> {
        match self.channels.entry(symbol.to_string()) {
            Entry::Occupied(_) => Err(ChartfeedError::AlreadySubscribed(symbol.to_string())),
            Entry::Vacant(vacant) => {
                let (tx, rx) = channel::channel(self.capacity);
                vacant.insert(tx);
                debug!(symbol, "Realtime channel opened");
                Ok(rx)
            }
        }
    }

    /// Schedules the channel for `symbol` to be closed at the next safe
    /// point.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::NotSubscribed`] if the symbol has no live
    /// channel.
    pub fn unsubscribe(&self, symbol: &str) -> Result<()> {
        let (_, tx) = self
            .channels
            .remove(symbol)
            .ok_or_else(|| ChartfeedError::NotSubscribed(symbol.to_string()))?;
        self.lock_pending().push(tx);
        debug!(symbol, "Realtime channel scheduled for close");
        Ok(())
    }

    /// Closes every channel scheduled by [`unsubscribe`](Self::unsubscribe).
    pub fn clear_pending_close(&self) {
        let pending = std::mem::take(&mut *self.lock_pending());
        for tx in pending {
            tx.close();
        }
    }

    /// Publishes `data` to the subscriber of `symbol` without blocking.
    /// Unknown symbols are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ChartfeedError::Dropped`] if the item could not be buffered.
    pub fn add_new_data(&self, symbol: &str, data: T) -> Result<()> {
        let Some(tx) = self.channels.get(symbol) else {
            return Ok(());
        };
        match tx.try_push_evict_oldest(data) {
            Ok(None) => Ok(()),
            Ok(Some(_)) => {
                debug!(symbol, "Realtime channel full, dropped oldest item");
                Ok(())
            }
            Err(PushError::Contended(_)) => Err(ChartfeedError::Dropped(symbol.to_string())),
        }
    }

    /// Closes every live and pending channel and empties the map.
    pub fn clear(&self) {
        self.clear_pending_close();
        let symbols: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        for symbol in symbols {
            if let Some((_, tx)) = self.channels.remove(&symbol) {
                tx.close();
            }
        }
    }

    /// Returns `true` if `symbol` has a live channel.
    #[must_use]
    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.channels.contains_key(symbol)
    }

    /// Symbols with a live channel, in no particular order.
    #[must_use]
    pub fn symbols(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Number of channels waiting to be closed.
    #[must_use]
    pub fn pending_close_len(&self) -> usize {
        self.lock_pending().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_subscribe_fails() {
        let map = RealtimeMap::<u32>::default();
        let _rx = map.subscribe("AAPL").unwrap();
        let err = map.subscribe("AAPL").unwrap_err();
        assert!(matches!(err, ChartfeedError::AlreadySubscribed(s) if s == "AAPL"));
    }

    #[test]
    fn unsubscribe_unknown_fails() {
        let map = RealtimeMap::<u32>::default();
        let err = map.unsubscribe("MSFT").unwrap_err();
        assert!(matches!(err, ChartfeedError::NotSubscribed(s) if s == "MSFT"));
    }

    #[test]
    fn unsubscribe_defers_close() {
        let map = RealtimeMap::<u32>::default();
        let mut rx = map.subscribe("AAPL").unwrap();
        map.add_new_data("AAPL", 1).unwrap();
        map.unsubscribe("AAPL").unwrap();

        assert!(!map.is_subscribed("AAPL"));
        assert!(!rx.is_closed());
        assert_eq!(map.pending_close_len(), 1);

        map.clear_pending_close();
        assert_eq!(map.pending_close_len(), 0);
        assert_eq!(rx.try_recv(), Ok(1));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn resubscribe_after_unsubscribe() {
        let map = RealtimeMap::<u32>::default();
        let _old = map.subscribe("AAPL").unwrap();
        map.unsubscribe("AAPL").unwrap();
        let mut fresh = map.subscribe("AAPL").unwrap();

        map.clear_pending_close();
        map.add_new_data("AAPL", 9).unwrap();
        assert_eq!(fresh.try_recv(), Ok(9));
    }

    #[test]
    fn publish_to_unknown_symbol_is_ignored() {
        let map = RealtimeMap::<u32>::default();
        assert!(map.add_new_data("TSLA", 1).is_ok());
    }

    #[test]
    fn publish_under_backpressure_keeps_newest() {
        let map = RealtimeMap::<u32>::new(4);
        let mut rx = map.subscribe("AAPL").unwrap();
        for i in 0..4 {
            map.add_new_data("AAPL", i).unwrap();
        }
        map.add_new_data("AAPL", 4).unwrap();

        let received: Vec<u32> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(received, vec![1, 2, 3, 4]);
    }

    #[test]
    fn clear_closes_everything() {
        let map = RealtimeMap::<u32>::default();
        let mut aapl = map.subscribe("AAPL").unwrap();
        let mut msft = map.subscribe("MSFT").unwrap();
        let mut pending = map.subscribe("TSLA").unwrap();
        map.unsubscribe("TSLA").unwrap();

        map.clear();

        assert!(map.is_empty());
        assert!(map.symbols().is_empty());
        assert_eq!(map.pending_close_len(), 0);
        assert_eq!(aapl.try_recv(), Err(TryRecvError::Closed));
        assert_eq!(msft.try_recv(), Err(TryRecvError::Closed));
        assert_eq!(pending.try_recv(), Err(TryRecvError::Closed));
    }
}
