//! Bounded recency-ordered feeds

use std::collections::VecDeque;

/// Fixed-capacity ring buffer, most recent entry first
///
/// Pushing onto a full feed evicts the oldest entry. No deduplication is
/// performed: a redelivered entry shows up twice.
#[derive(Debug, Clone)]
pub struct Feed<T> {
    capacity: usize,
    entries: VecDeque<T>,
}

impl<T> Feed<T> {
    /// Create an empty feed. A capacity of zero is bumped to one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Insert at the front, evicting from the back when full
    pub fn push(&mut self, entry: T) -> Option<T> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_back()
        } else {
            None
        };
        self.entries.push_front(entry);
        evicted
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

    /// Newest entry
    pub fn latest(&self) -> Option<&T> {
        self.entries.front()
    }

    /// Iterate newest to oldest
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }
}

impl<T: Clone> Feed<T> {
    /// Copy out the entries, newest first
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_most_recent_capacity_entries() {
        let mut feed = Feed::with_capacity(25);
        for i in 0..40u32 {
            feed.push(i);
        }
        assert_eq!(feed.len(), 25);
        let expected: Vec<u32> = (15..40).rev().collect();
        assert_eq!(feed.to_vec(), expected);
    }

    #[test]
    fn test_sixteenth_alert_evicts_oldest() {
        let mut feed = Feed::with_capacity(15);
        for i in 1..=15u32 {
            assert_eq!(feed.push(i), None);
        }
        assert_eq!(feed.push(16), Some(1));
        assert_eq!(feed.len(), 15);
        assert_eq!(feed.latest(), Some(&16));
        assert!(!feed.iter().any(|&i| i == 1));
    }

    #[test]
    fn test_duplicates_are_kept() {
        let mut feed = Feed::with_capacity(3);
        feed.push("sale-1");
        feed.push("sale-1");
        assert_eq!(feed.to_vec(), vec!["sale-1", "sale-1"]);
    }

    #[test]
    fn test_zero_capacity_is_bumped() {
        let mut feed = Feed::with_capacity(0);
        feed.push(1);
        feed.push(2);
        assert_eq!(feed.capacity(), 1);
        assert_eq!(feed.to_vec(), vec![2]);
    }
}
