use std::{cmp::Ordering, collections::BinaryHeap};

use parking_lot::Mutex;
use tokio::sync::mpsc;

struct Entry<T> {
    priority: i64,
    /// Insertion order, so that equal priorities pop first-in first-out.
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Heap<T> {
    entries: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

/// A max-priority queue. The lock is only held while pushing or popping.
pub struct PriorityQueue<T> {
    heap: Mutex<Heap<T>>,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        PriorityQueue {
            heap: Mutex::new(Heap {
                entries: BinaryHeap::new(),
                next_seq: 0,
            }),
        }
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T, priority: i64) {
        let mut heap = self.heap.lock();
        let seq = heap.next_seq;
        heap.next_seq += 1;
        heap.entries.push(Entry {
            priority,
            seq,
            item,
        });
    }

    pub fn pop(&self) -> Option<(T, i64)> {
        self.heap
            .lock()
            .entries
            .pop()
            .map(|e| (e.item, e.priority))
    }

    /// Pops every item, highest priority first.
    pub fn drain(&self) -> Vec<(T, i64)> {
        let entries = std::mem::take(&mut self.heap.lock().entries);
        entries
            .into_sorted_vec()
            .into_iter()
            .rev()
            .map(|e| (e.item, e.priority))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wakes a drain loop. Rings while a wake-up is already outstanding are coalesced.
#[derive(Debug, Clone)]
pub struct Doorbell {
    tx: mpsc::Sender<()>,
}

pub fn doorbell(capacity: usize) -> (Doorbell, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Doorbell { tx }, rx)
}

impl Doorbell {
    pub fn ring(&self) {
        // A full channel already guarantees a wake-up.
        let _ = self.tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_first_with_fifo_ties() {
        let queue = PriorityQueue::new();
        queue.push("newer", -20);
        queue.push("oldest", -10);
        queue.push("tie-a", -15);
        queue.push("tie-b", -15);

        let order: Vec<_> = queue.drain().into_iter().map(|(item, _)| item).collect();
        assert_eq!(order, vec!["oldest", "tie-a", "tie-b", "newer"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_returns_priority() {
        let queue = PriorityQueue::new();
        queue.push(1, -3);
        queue.push(2, -1);
        assert_eq!(queue.pop(), Some((2, -1)));
        assert_eq!(queue.pop(), Some((1, -3)));
        assert_eq!(queue.pop(), None);
    }

    #[tokio::test]
    async fn doorbell_coalesces() {
        let (bell, mut rx) = doorbell(2);
        for _ in 0..10 {
            bell.ring();
        }
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
