//! Per-destination FIFO buffers for messages that could not be delivered.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::error::{ConduitError, Result};

pub(crate) struct MessageQueues {
    queues: Mutex<HashMap<String, VecDeque<Value>>>,
    max_size: usize,
}

impl MessageQueues {
    pub fn new(max_size: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Value>>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append to the tail. Returns the new depth.
    pub fn enqueue(&self, destination: &str, message: Value) -> Result<usize> {
        let mut queues = self.lock();
        if queues.get(destination).map_or(0, VecDeque::len) >= self.max_size {
            return Err(ConduitError::CapacityExceeded {
                what: format!("message queue for {}", destination),
                limit: self.max_size,
            });
        }
        let queue = queues.entry(destination.to_string()).or_default();
        queue.push_back(message);
        Ok(queue.len())
    }

    /// Put messages back at the head in their original order.
    ///
    /// Requeued messages bypass the size ceiling: they were already
    /// admitted once.
    pub fn requeue_front(&self, destination: &str, messages: Vec<Value>) {
        if messages.is_empty() {
            return;
        }
        let mut queues = self.lock();
        let queue = queues.entry(destination.to_string()).or_default();
        for message in messages.into_iter().rev() {
            queue.push_front(message);
        }
    }

    /// Remove up to `limit` messages from the head. An emptied queue is
    /// dropped.
    pub fn drain(&self, destination: &str, limit: Option<usize>) -> Vec<Value> {
        let mut queues = self.lock();
        let Some(queue) = queues.get_mut(destination) else {
            return Vec::new();
        };
        let count = limit.unwrap_or(queue.len()).min(queue.len());
        let drained: Vec<Value> = queue.drain(..count).collect();
        if queue.is_empty() {
            queues.remove(destination);
        }
        drained
    }

    pub fn depth(&self, destination: &str) -> usize {
        self.lock().get(destination).map_or(0, VecDeque::len)
    }

    pub fn depths(&self) -> HashMap<String, usize> {
        self.lock()
            .iter()
            .map(|(dest, q)| (dest.clone(), q.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fifo_drain_with_limit() {
        let queues = MessageQueues::new(10);
        for n in 0..3 {
            queues.enqueue("worker", json!({"n": n})).unwrap();
        }

        assert_eq!(queues.drain("worker", Some(2)), vec![json!({"n": 0}), json!({"n": 1})]);
        assert_eq!(queues.depth("worker"), 1);
        assert_eq!(queues.drain("worker", None), vec![json!({"n": 2})]);
        assert!(queues.depths().is_empty());
    }

    #[test]
    fn test_overflow_is_rejected() {
        let queues = MessageQueues::new(2);
        queues.enqueue("w", json!(1)).unwrap();
        assert_eq!(queues.enqueue("w", json!(2)).unwrap(), 2);
        assert!(matches!(
            queues.enqueue("w", json!(3)),
            Err(ConduitError::CapacityExceeded { limit: 2, .. })
        ));
        assert_eq!(queues.depth("w"), 2);
    }

    #[test]
    fn test_rejected_enqueue_leaves_no_queue() {
        let queues = MessageQueues::new(0);
        assert!(matches!(
            queues.enqueue("w", json!(1)),
            Err(ConduitError::CapacityExceeded { limit: 0, .. })
        ));
        assert!(queues.depths().is_empty());
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let queues = MessageQueues::new(10);
        queues.enqueue("w", json!("c")).unwrap();
        queues.requeue_front("w", vec![json!("a"), json!("b")]);
        assert_eq!(queues.drain("w", None), vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn test_drain_unknown_destination_is_empty() {
        let queues = MessageQueues::new(1);
        assert!(queues.drain("nobody", Some(5)).is_empty());
        assert!(queues.depths().is_empty());
    }
}
