//! Bounded lock-free queue with automatic eviction
//!
//! Uses crossbeam_queue::ArrayQueue for lock-free concurrent access.
//! When the queue is full the oldest item is evicted; anything lost this way is
//! recovered by the next digest exchange.

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct Outbox<T> {
    queue: Arc<ArrayQueue<T>>,
    eviction_count: Arc<AtomicU64>,
}

impl<T> Outbox<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
            eviction_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Push an item, evicting the oldest one when full
    pub fn push(&self, item: T) {
        let mut item = item;
        loop {
            match self.queue.push(item) {
                Ok(()) => return,
                Err(rejected) => {
                    if self.queue.pop().is_some() {
                        self.eviction_count.fetch_add(1, Ordering::Relaxed);
                    }
                    item = rejected;
                }
            }
        }
    }

    /// Remove and return everything currently queued, oldest first
    pub fn drain(&self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.queue.len());
        while let Some(item) = self.queue.pop() {
            items.push(item);
        }
        items
    }

    /// Copy of the queue contents.
    ///
    /// Drains and repopulates; concurrent pushes during the copy may reorder items.
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        let items = self.drain();
        for item in items.iter().cloned() {
            self.push(item);
        }
        items
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn eviction_count(&self) -> u64 {
        self.eviction_count.load(Ordering::Relaxed)
    }
}

impl<T> Clone for Outbox<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            eviction_count: Arc::clone(&self.eviction_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_drain() {
        let outbox = Outbox::new(4);
        outbox.push("a");
        outbox.push("b");
        assert_eq!(outbox.drain(), vec!["a", "b"]);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_eviction_when_full() {
        let outbox = Outbox::new(2);
        outbox.push(1);
        outbox.push(2);
        outbox.push(3);
        assert_eq!(outbox.eviction_count(), 1);
        assert_eq!(outbox.drain(), vec![2, 3]);
    }

    #[test]
    fn test_snapshot_keeps_items() {
        let outbox = Outbox::new(3);
        outbox.push(7);
        outbox.push(8);
        assert_eq!(outbox.snapshot(), vec![7, 8]);
        assert_eq!(outbox.len(), 2);
    }
}
