use std::ops::Range;
use std::sync::Arc;

use crate::model::{Bar, OrderDetailItem, OrderQueueItem, Tick, TransactionItem};

/// One contiguous extent of a backing buffer.
///
/// The block holds its own reference to the buffer, so a slice stays valid
/// even if the owning cache later swaps its buffer for an extended one.
#[derive(Debug, Clone)]
struct Block<T> {
    data: Arc<Vec<T>>,
    range: Range<usize>,
}

impl<T> Block<T> {
    fn as_slice(&self) -> &[T] {
        &self.data[self.range.clone()]
    }
}

/// Read-only view over one or more contiguous blocks of records.
///
/// Supports negative indexing (`-1` is the last record) and range queries
/// over `[head, tail]`. Slices never own the records; cloning is cheap.
#[derive(Debug, Clone)]
pub struct Slice<T> {
    blocks: Vec<Block<T>>,
    len: usize,
}

impl<T> Default for Slice<T> {
    fn default() -> Self {
        Self { blocks: Vec::new(), len: 0 }
    }
}

pub type BarSlice = Slice<Bar>;
pub type TickSlice = Slice<Tick>;
pub type OrderQueueSlice = Slice<OrderQueueItem>;
pub type OrderDetailSlice = Slice<OrderDetailItem>;
pub type TransactionSlice = Slice<TransactionItem>;

impl<T> Slice<T> {
    pub fn empty() -> Self {
        Self::default()
    }

    /// View over `range` of a shared buffer.
    pub fn from_range(data: Arc<Vec<T>>, range: Range<usize>) -> Self {
        let range = range.start.min(data.len())..range.end.min(data.len());
        let mut slice = Self::default();
        slice.push_block(data, range);
        slice
    }

    /// Append another extent, eg/ when a query spans two loaded extents.
    pub fn push_block(&mut self, data: Arc<Vec<T>>, range: Range<usize>) {
        let range = range.start.min(data.len())..range.end.min(data.len());
        if range.is_empty() {
            return;
        }
        self.len += range.len();
        self.blocks.push(Block { data, range });
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn resolve(&self, index: isize) -> Option<usize> {
        if index >= 0 {
            let index = index as usize;
            (index < self.len).then_some(index)
        } else {
            self.len.checked_sub(index.unsigned_abs())
        }
    }

    /// Record at `index`; negative values count from the end.
    pub fn get(&self, index: isize) -> Option<&T> {
        let mut index = self.resolve(index)?;
        for block in &self.blocks {
            let slice = block.as_slice();
            if index < slice.len() {
                return Some(&slice[index]);
            }
            index -= slice.len();
        }
        None
    }

    pub fn first(&self) -> Option<&T> {
        self.get(0)
    }

    pub fn last(&self) -> Option<&T> {
        self.get(-1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.blocks.iter().flat_map(|block| block.as_slice().iter())
    }

    /// Iterate the inclusive `[head, tail]` range; either bound may be
    /// negative. An inverted or out-of-range pair yields nothing.
    pub fn range_iter(&self, head: isize, tail: isize) -> impl Iterator<Item = &T> {
        let bounds = match (self.resolve(head), self.resolve(tail)) {
            (Some(head), Some(tail)) if head <= tail => Some((head, tail)),
            _ => None,
        };
        bounds
            .into_iter()
            .flat_map(move |(head, tail)| self.iter().skip(head).take(tail - head + 1))
    }
}

impl<T: Clone> Slice<T> {
    /// Copy the inclusive `[head, tail]` range out of the view.
    pub fn extract(&self, head: isize, tail: isize) -> Vec<T> {
        self.range_iter(head, tail).cloned().collect()
    }

    /// Copy the whole view into one contiguous buffer.
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

impl Slice<Bar> {
    /// Highest high over the inclusive `[head, tail]` range.
    pub fn max_high(&self, head: isize, tail: isize) -> f64 {
        self.range_iter(head, tail)
            .map(|bar| bar.high)
            .fold(f64::MIN, f64::max)
    }

    /// Lowest low over the inclusive `[head, tail]` range.
    pub fn min_low(&self, head: isize, tail: isize) -> f64 {
        self.range_iter(head, tail)
            .map(|bar| bar.low)
            .fold(f64::MAX, f64::min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(time: u64, high: f64, low: f64) -> Bar {
        Bar { date: 20240105, time, high, low, ..Bar::default() }
    }

    fn two_block_slice() -> BarSlice {
        let first = Arc::new(vec![bar(1, 10.0, 9.0), bar(2, 11.0, 8.5), bar(3, 10.5, 9.5)]);
        let second = Arc::new(vec![bar(4, 12.0, 9.8), bar(5, 11.5, 7.0)]);
        let mut slice = BarSlice::from_range(first, 0..3);
        slice.push_block(second, 0..2);
        slice
    }

    #[test]
    fn test_negative_indexing() {
        struct TestCase {
            index: isize,
            expected_time: Option<u64>,
        }

        let slice = two_block_slice();
        let tests = vec![
            // TC0: first record
            TestCase { index: 0, expected_time: Some(1) },
            // TC1: crosses into the second block
            TestCase { index: 3, expected_time: Some(4) },
            // TC2: last record
            TestCase { index: -1, expected_time: Some(5) },
            // TC3: negative into the first block
            TestCase { index: -4, expected_time: Some(2) },
            // TC4: out of range
            TestCase { index: 5, expected_time: None },
            // TC5: negative out of range
            TestCase { index: -6, expected_time: None },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = slice.get(test.index).map(|bar| bar.time);
            assert_eq!(actual, test.expected_time, "TC{} failed", index);
        }
    }

    #[test]
    fn test_range_queries() {
        let slice = two_block_slice();

        assert_eq!(slice.len(), 5);
        assert_eq!(slice.max_high(0, -1), 12.0);
        assert_eq!(slice.min_low(0, -1), 7.0);
        // Range spanning the block boundary
        assert_eq!(slice.max_high(2, 3), 12.0);
        assert_eq!(slice.extract(3, -1).len(), 2);
        // Inverted range yields nothing
        assert!(slice.extract(-1, 0).is_empty());
    }

    #[test]
    fn test_slice_survives_cache_swap() {
        let buffer = Arc::new(vec![bar(1, 10.0, 9.0), bar(2, 11.0, 8.5)]);
        let slice = BarSlice::from_range(Arc::clone(&buffer), 0..2);
        // The cache swapping its buffer must not invalidate the view.
        drop(buffer);
        assert_eq!(slice.len(), 2);
        assert_eq!(slice.last().map(|bar| bar.time), Some(2));
    }
}
