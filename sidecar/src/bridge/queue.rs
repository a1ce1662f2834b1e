//! Outbound dispatch queue.
//!
//! Entries leave the queue strictly in enqueue order. The concurrency gate
//! lives in the bridge; this type only keeps order and supports removing a
//! cancelled entry before it is ever transmitted.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::protocol::RequestId;

/// A message awaiting transmission.
#[derive(Debug, Clone)]
pub(crate) struct QueueEntry {
    pub id: RequestId,
    pub task_name: String,
    pub payload: Value,
    pub enqueued_at: Instant,
}

impl QueueEntry {
    pub fn new(id: RequestId, task_name: impl Into<String>, payload: Value) -> Self {
        Self {
            id,
            task_name: task_name.into(),
            payload,
            enqueued_at: Instant::now(),
        }
    }

    /// How long this entry has waited for a slot.
    pub fn wait_time(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// FIFO queue of entries awaiting transmission.
#[derive(Debug, Default)]
pub(crate) struct DispatchQueue {
    entries: VecDeque<QueueEntry>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: QueueEntry) {
        self.entries.push_back(entry);
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Removes the entry for `id`, if still queued.
    pub fn remove(&mut self, id: RequestId) -> bool {
        match self.entries.iter().position(|entry| entry.id == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64) -> QueueEntry {
        QueueEntry::new(RequestId::new(id), "summarize", Value::Null)
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = DispatchQueue::new();
        queue.push(entry(1));
        queue.push(entry(2));
        queue.push(entry(3));

        assert_eq!(queue.pop().unwrap().id, RequestId::new(1));
        assert_eq!(queue.pop().unwrap().id, RequestId::new(2));
        assert_eq!(queue.pop().unwrap().id, RequestId::new(3));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_remove_keeps_remaining_order() {
        let mut queue = DispatchQueue::new();
        for id in 1..=4 {
            queue.push(entry(id));
        }

        assert!(queue.remove(RequestId::new(2)));
        assert!(!queue.remove(RequestId::new(2)));
        assert_eq!(queue.len(), 3);

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop())
            .map(|e| e.id.value())
            .collect();
        assert_eq!(order, vec![1, 3, 4]);
    }

    #[test]
    fn test_clear() {
        let mut queue = DispatchQueue::new();
        queue.push(entry(1));
        assert!(!queue.is_empty());
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_wait_time() {
        let e = entry(1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(e.wait_time() >= Duration::from_millis(5));
    }
}
