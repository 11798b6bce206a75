//! Index-preserving windows over the sample and event streams.
//!
//! Both windows track the absolute index of their oldest resident element.
//! Eviction only advances that index; indices are never renumbered.

use std::collections::VecDeque;
use std::ops::Range;

/// Contiguous sample bytes with sample-granular eviction.
#[derive(Debug)]
pub struct SampleWindow {
    bytes: VecDeque<u8>,
    sample_bytes: usize,
    first: u64,
    total: u64,
    capacity: Option<u64>,
}

impl SampleWindow {
    pub fn new(capacity: Option<u64>) -> Self {
        Self {
            bytes: VecDeque::new(),
            sample_bytes: 0,
            first: 0,
            total: 0,
            capacity,
        }
    }

    /// Empties the window and starts a new stream of `sample_bytes`-sized samples.
    pub fn reset(&mut self, sample_bytes: usize) {
        self.bytes.clear();
        self.sample_bytes = sample_bytes;
        self.first = 0;
        self.total = 0;
    }

    pub fn clear(&mut self) {
        self.reset(self.sample_bytes);
    }

    /// Absolute index of the oldest resident sample.
    pub fn first(&self) -> u64 {
        self.first
    }

    /// Number of samples appended since the last reset.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn resident(&self) -> u64 {
        self.total - self.first
    }

    /// Appends whole samples and evicts the oldest ones beyond capacity.
    ///
    /// Returns the number of samples evicted.
    pub fn append(&mut self, data: &[u8]) -> u64 {
        debug_assert!(self.sample_bytes > 0 && data.len() % self.sample_bytes == 0);
        let added = (data.len() / self.sample_bytes.max(1)) as u64;
        self.bytes.extend(data.iter().copied());
        self.total += added;

        let Some(capacity) = self.capacity else {
            return 0;
        };
        let excess = self.resident().saturating_sub(capacity);
        if excess > 0 {
            self.bytes.drain(..excess as usize * self.sample_bytes);
            self.first += excess;
        }
        excess
    }

    /// Copies samples `range` if every one of them is still resident.
    pub fn read(&self, range: Range<u64>) -> Option<Vec<u8>> {
        if range.start < self.first || range.end > self.total || range.start > range.end {
            return None;
        }
        let start = (range.start - self.first) as usize * self.sample_bytes;
        let end = (range.end - self.first) as usize * self.sample_bytes;
        Some(self.bytes.range(start..end).copied().collect())
    }
}

/// Bounded sequence of events addressed by absolute event index.
#[derive(Debug)]
pub struct EventWindow<T> {
    items: VecDeque<T>,
    first: u64,
    capacity: Option<usize>,
}

impl<T: Clone> EventWindow<T> {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            first: 0,
            capacity,
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.first = 0;
    }

    pub fn first(&self) -> u64 {
        self.first
    }

    pub fn total(&self) -> u64 {
        self.first + self.items.len() as u64
    }

    /// Appends one item and returns its absolute index.
    pub fn push(&mut self, item: T) -> u64 {
        let index = self.total();
        self.items.push_back(item);
        if let Some(capacity) = self.capacity {
            while self.items.len() > capacity {
                self.items.pop_front();
                self.first += 1;
            }
        }
        index
    }

    pub fn read(&self, range: Range<u64>) -> Option<Vec<T>> {
        if range.start < self.first || range.end > self.total() || range.start > range.end {
            return None;
        }
        let start = (range.start - self.first) as usize;
        let end = (range.end - self.first) as usize;
        Some(self.items.range(start..end).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_window_slides_without_renumbering() {
        let mut window = SampleWindow::new(Some(5));
        window.reset(2);
        for i in 0..7u8 {
            window.append(&[i, i]);
        }
        assert_eq!(window.total(), 7);
        assert_eq!(window.first(), 2);
        assert_eq!(window.resident(), 5);
        assert!(window.read(0..7).is_none());
        assert_eq!(window.read(2..4).unwrap(), vec![2, 2, 3, 3]);
    }

    #[test]
    fn oversized_append_keeps_only_newest_samples() {
        let mut window = SampleWindow::new(Some(2));
        window.reset(1);
        let evicted = window.append(&[1, 2, 3, 4, 5]);
        assert_eq!(evicted, 3);
        assert_eq!(window.first(), 3);
        assert_eq!(window.read(3..5).unwrap(), vec![4, 5]);
    }

    #[test]
    fn unbounded_window_never_evicts() {
        let mut window = SampleWindow::new(None);
        window.reset(1);
        window.append(&[0; 1000]);
        assert_eq!(window.first(), 0);
        assert_eq!(window.read(0..1000).unwrap().len(), 1000);
    }

    #[test]
    fn event_window_evicts_oldest_first() {
        let mut window = EventWindow::new(Some(2));
        assert_eq!(window.push("a"), 0);
        assert_eq!(window.push("b"), 1);
        assert_eq!(window.push("c"), 2);
        assert_eq!(window.first(), 1);
        assert_eq!(window.read(1..3).unwrap(), vec!["b", "c"]);
        assert!(window.read(0..3).is_none());

        window.clear();
        assert_eq!(window.total(), 0);
        assert_eq!(window.push("d"), 0);
    }
}
