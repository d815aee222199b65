//! Bounded ring buffer for captured process output.

use std::collections::VecDeque;

/// Keeps the most recent `capacity` lines; older lines are dropped.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    dropped: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Append a line, evicting the oldest one when full.
    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped = self.dropped.saturating_add(1);
        }
        self.lines.push_back(line);
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Number of lines evicted so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_beyond_capacity() {
        let mut buffer = OutputBuffer::new(3);
        for i in 0..5 {
            buffer.push(format!("line {}", i));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.tail(10), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_tail_returns_most_recent() {
        let mut buffer = OutputBuffer::new(10);
        buffer.push("a".into());
        buffer.push("b".into());
        buffer.push("c".into());

        assert_eq!(buffer.tail(2), vec!["b", "c"]);
        assert!(buffer.tail(0).is_empty());
    }
}
