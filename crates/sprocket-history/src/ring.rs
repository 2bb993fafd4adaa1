//! Fixed-capacity circular buffer with oldest-overwrite semantics.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("ring buffer capacity must be a positive integer")]
    InvalidCapacity,
}

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    head: usize,
    full: bool,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Result<Self, RingError> {
        if capacity == 0 {
            return Err(RingError::InvalidCapacity);
        }
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Ok(Self {
            slots,
            head: 0,
            full: false,
        })
    }

    /// Build a buffer pre-populated with `seed` in chronological order.
    /// A seed longer than the capacity keeps only its trailing `capacity`
    /// elements and the buffer starts full.
    pub fn with_seed(capacity: usize, seed: Vec<T>) -> Result<Self, RingError> {
        let mut buffer = Self::new(capacity)?;
        if seed.len() >= capacity {
            let skip = seed.len() - capacity;
            for (slot, item) in buffer.slots.iter_mut().zip(seed.into_iter().skip(skip)) {
                *slot = Some(item);
            }
            buffer.head = 0;
            buffer.full = true;
        } else {
            let len = seed.len();
            for (slot, item) in buffer.slots.iter_mut().zip(seed) {
                *slot = Some(item);
            }
            buffer.head = len;
        }
        Ok(buffer)
    }

    /// Store `item`, overwriting the oldest entry once full. Returns a
    /// reference to the stored item.
    pub fn push(&mut self, item: T) -> &T {
        let index = self.head;
        self.head = (self.head + 1) % self.slots.len();
        if self.head == 0 {
            self.full = true;
        }
        self.slots[index].insert(item)
    }

    /// The item pushed `offset` pushes ago (0 = most recent), or `None`
    /// when the offset reaches past everything stored so far.
    pub fn last(&self, offset: usize) -> Option<&T> {
        if offset >= self.len() {
            return None;
        }
        let capacity = self.slots.len();
        let index = (self.head + capacity - 1 - offset) % capacity;
        self.slots[index].as_ref()
    }

    pub fn len(&self) -> usize {
        if self.full {
            self.slots.len()
        } else {
            self.head
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<T: Clone> RingBuffer<T> {
    /// All stored items, oldest to newest.
    pub fn to_vec(&self) -> Vec<T> {
        let capacity = self.slots.len();
        let mut items = Vec::with_capacity(self.len());
        if self.full {
            for i in 0..capacity {
                if let Some(item) = &self.slots[(self.head + i) % capacity] {
                    items.push(item.clone());
                }
            }
        } else {
            for slot in &self.slots[..self.head] {
                if let Some(item) = slot {
                    items.push(item.clone());
                }
            }
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            RingBuffer::<u32>::new(0),
            Err(RingError::InvalidCapacity)
        ));
        assert!(matches!(
            RingBuffer::with_seed(0, vec![1]),
            Err(RingError::InvalidCapacity)
        ));
    }

    #[test]
    fn len_is_min_of_pushes_and_capacity() {
        for capacity in 1..=5usize {
            let mut buffer = RingBuffer::new(capacity).expect("new");
            for n in 1..=capacity + 3 {
                buffer.push(n);
                assert_eq!(buffer.len(), n.min(capacity));
            }
        }
    }

    #[test]
    fn last_and_to_vec_after_wraparound() {
        let capacity = 4;
        let mut buffer = RingBuffer::new(capacity).expect("new");
        for n in 1..=10u32 {
            buffer.push(n);
            assert_eq!(buffer.last(0), Some(&n));
        }
        assert_eq!(buffer.to_vec(), vec![7, 8, 9, 10]);
        assert_eq!(buffer.last(3), Some(&7));
        assert_eq!(buffer.last(4), None);
    }

    #[test]
    fn empty_buffer_has_no_last() {
        let buffer = RingBuffer::<u32>::new(3).expect("new");
        assert!(buffer.is_empty());
        assert_eq!(buffer.last(0), None);
    }

    #[test]
    fn single_push_then_lookback() {
        let mut buffer = RingBuffer::new(3).expect("new");
        buffer.push("only");
        assert_eq!(buffer.last(0), Some(&"only"));
        assert_eq!(buffer.last(1), None);
    }

    #[test]
    fn capacity_one_keeps_most_recent_only() {
        let mut buffer = RingBuffer::new(1).expect("new");
        buffer.push(1);
        buffer.push(2);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.last(0), Some(&2));
        assert_eq!(buffer.last(1), None);
        assert_eq!(buffer.to_vec(), vec![2]);
    }

    #[test]
    fn long_seed_keeps_trailing_elements_in_order() {
        let buffer = RingBuffer::with_seed(3, vec![1, 2, 3, 4, 5]).expect("seed");
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.to_vec(), vec![3, 4, 5]);
        assert_eq!(buffer.last(0), Some(&5));
        assert_eq!(buffer.last(2), Some(&3));
    }

    #[test]
    fn short_seed_starts_partially_filled() {
        let mut buffer = RingBuffer::with_seed(4, vec![1, 2]).expect("seed");
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.last(0), Some(&2));
        assert_eq!(buffer.last(2), None);
        buffer.push(3);
        assert_eq!(buffer.to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn exact_seed_starts_full() {
        let mut buffer = RingBuffer::with_seed(3, vec![1, 2, 3]).expect("seed");
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.to_vec(), vec![1, 2, 3]);
        buffer.push(4);
        assert_eq!(buffer.to_vec(), vec![2, 3, 4]);
    }

    #[test]
    fn to_vec_round_trips_through_reseed() {
        let mut buffer = RingBuffer::new(4).expect("new");
        for n in 1..=7u32 {
            buffer.push(n);
        }
        let exported = buffer.to_vec();
        let reseeded = RingBuffer::with_seed(4, exported.clone()).expect("seed");
        assert_eq!(reseeded.to_vec(), exported);
        assert_eq!(reseeded.len(), buffer.len());
        assert_eq!(reseeded.last(0), buffer.last(0));
    }
}
