//! Bounded chat history
//!
//! Append-only ring buffer of recent broadcast and private messages.
//! Inserting beyond capacity evicts the oldest entry.

use std::collections::VecDeque;

use crate::message::Envelope;

#[derive(Debug)]
pub struct ChatHistory {
    entries: VecDeque<Envelope>,
    capacity: usize,
}

impl ChatHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, envelope: Envelope) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(envelope);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The most recent `limit` entries (all when `None`), oldest first
    pub fn recent(&self, limit: Option<usize>) -> Vec<Envelope> {
        let skip = limit
            .map(|n| self.entries.len().saturating_sub(n))
            .unwrap_or(0);
        self.entries.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> Envelope {
        Envelope::broadcast("alice", n.to_string())
    }

    #[test]
    fn test_keeps_last_n_in_order() {
        let mut history = ChatHistory::new(100);
        for i in 0..105 {
            history.push(numbered(i));
        }
        assert_eq!(history.len(), 100);
        let contents: Vec<String> = history
            .recent(None)
            .iter()
            .map(|e| e.content_str().to_string())
            .collect();
        let expected: Vec<String> = (5..105).map(|i| i.to_string()).collect();
        assert_eq!(contents, expected);
    }

    #[test]
    fn test_recent_limit() {
        let mut history = ChatHistory::new(10);
        for i in 0..4 {
            history.push(numbered(i));
        }
        let last_two: Vec<String> = history
            .recent(Some(2))
            .iter()
            .map(|e| e.content_str().to_string())
            .collect();
        assert_eq!(last_two, vec!["2", "3"]);
        assert_eq!(history.recent(Some(50)).len(), 4);
    }

    #[test]
    fn test_zero_capacity() {
        let mut history = ChatHistory::new(0);
        history.push(numbered(1));
        assert!(history.is_empty());
        assert_eq!(history.capacity(), 0);
    }
}
