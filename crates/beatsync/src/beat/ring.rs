/// Fixed-capacity ring buffer. Storage is allocated once at construction;
/// pushing past capacity overwrites the oldest entry.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buf: Vec<T>,
    cap: usize,
    write: usize,
    count: usize,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// A zero capacity is bumped to 1 so `push` never has to special-case it.
    pub fn new(capacity: usize) -> Self {
        let cap = capacity.max(1);
        Self {
            buf: vec![T::default(); cap],
            cap,
            write: 0,
            count: 0,
        }
    }

    /// Push a value, returning the evicted oldest value when full.
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.count == self.cap {
            Some(self.buf[self.write])
        } else {
            None
        };
        self.buf[self.write] = value;
        self.write = (self.write + 1) % self.cap;
        if self.count < self.cap {
            self.count += 1;
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.cap
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn clear(&mut self) {
        self.write = 0;
        self.count = 0;
    }

    fn start(&self) -> usize {
        (self.write + self.cap - self.count) % self.cap
    }

    /// Element `i` in chronological order (0 = oldest).
    pub fn get(&self, i: usize) -> Option<T> {
        if i >= self.count {
            return None;
        }
        Some(self.buf[(self.start() + i) % self.cap])
    }

    /// Most recently pushed value.
    pub fn last(&self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        Some(self.buf[(self.write + self.cap - 1) % self.cap])
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        let start = self.start();
        (0..self.count).map(move |i| self.buf[(start + i) % self.cap])
    }

    /// Copy the contents, oldest first, into `out` (cleared first).
    pub fn copy_into(&self, out: &mut Vec<T>) {
        out.clear();
        out.extend(self.iter());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_evicts_oldest_when_full() {
        let mut ring = RingBuffer::new(3);
        assert_eq!(ring.push(1), None);
        assert_eq!(ring.push(2), None);
        assert_eq!(ring.push(3), None);
        assert!(ring.is_full());
        assert_eq!(ring.push(4), Some(1));
        assert_eq!(ring.iter().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn get_and_last_follow_chronological_order() {
        let mut ring = RingBuffer::new(4);
        for v in 0..6 {
            ring.push(v);
        }
        assert_eq!(ring.get(0), Some(2));
        assert_eq!(ring.get(3), Some(5));
        assert_eq!(ring.get(4), None);
        assert_eq!(ring.last(), Some(5));
    }

    #[test]
    fn clear_empties_without_reallocating() {
        let mut ring = RingBuffer::<f32>::new(5);
        ring.push(1.0);
        ring.push(2.0);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.last(), None);
        assert_eq!(ring.capacity(), 5);
        ring.push(7.0);
        assert_eq!(ring.iter().collect::<Vec<_>>(), vec![7.0]);
    }

    #[test]
    fn zero_capacity_is_bumped() {
        let mut ring = RingBuffer::new(0);
        ring.push(1u8);
        ring.push(2u8);
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.last(), Some(2));
    }
}
