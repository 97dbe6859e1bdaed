//! Sequence number arithmetic and the duplicate-suppression window.

use std::collections::{HashSet, VecDeque};

/// True if `a` comes after `b`, treating the 32-bit space as a circle (RFC 1982 style).
pub fn is_newer(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000_0000
}

/// Next sequence number after `seq`. Zero is never issued.
pub fn next(seq: u32) -> u32 {
    match seq.wrapping_add(1) {
        0 => 1,
        n => n,
    }
}

/// Sequence numbers of reliable messages already delivered, bounded to the most recent `capacity`.
#[derive(Debug)]
pub struct ReceivedSequenceSet {
    seen: HashSet<u32>,
    order: VecDeque<u32>,
    capacity: usize,
}

impl ReceivedSequenceSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `seq`. Returns false if it was already present.
    pub fn insert(&mut self, seq: u32) -> bool {
        if !self.seen.insert(seq) {
            return false;
        }
        self.order.push_back(seq);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.seen.contains(&seq)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_across_wrap() {
        assert!(is_newer(2, 1));
        assert!(!is_newer(1, 2));
        assert!(!is_newer(7, 7));
        assert!(is_newer(3, u32::MAX - 2));
        assert!(!is_newer(u32::MAX - 2, 3));
    }

    #[test]
    fn next_skips_zero() {
        assert_eq!(next(1), 2);
        assert_eq!(next(u32::MAX), 1);
    }

    #[test]
    fn duplicate_detected() {
        let mut set = ReceivedSequenceSet::new(8);
        assert!(set.insert(5));
        assert!(!set.insert(5));
        assert!(set.contains(5));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn window_evicts_oldest() {
        let mut set = ReceivedSequenceSet::new(3);
        for seq in 1..=4 {
            set.insert(seq);
        }
        assert!(!set.contains(1));
        assert!(set.contains(2));
        assert!(set.contains(4));
        assert_eq!(set.len(), 3);
        set.clear();
        assert!(set.is_empty());
    }
}
