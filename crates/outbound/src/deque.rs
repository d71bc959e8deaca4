//! Growable double-ended ring buffer.
//!
//! Every queue in the pipeline (intake, per-destination FIFOs, completions,
//! cleanup rules) sits on this type. Capacity is always a power of two so the
//! wrap-around is a bit mask; it doubles when full and halves once the buffer
//! drops to a quarter, never going below the floor chosen at construction.

/// Smallest backing array any deque will use.
pub const MIN_CAPACITY: usize = 8;

/// Double-ended ring buffer with amortized O(1) push/pop at both ends.
#[derive(Debug, Clone)]
pub struct Deque<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
    floor: usize,
}

impl<T> Deque<T> {
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    /// Create a deque whose backing array never shrinks below `capacity`
    /// (rounded up to a power of two, at least [`MIN_CAPACITY`]).
    pub fn with_capacity(capacity: usize) -> Self {
        let floor = capacity.max(MIN_CAPACITY).next_power_of_two();
        Self {
            slots: empty_slots(floor),
            head: 0,
            len: 0,
            floor,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the backing array.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn push_back(&mut self, value: T) {
        if self.len == self.slots.len() {
            self.resize(self.slots.len() * 2);
        }
        let idx = (self.head + self.len) & self.mask();
        self.slots[idx] = Some(value);
        self.len += 1;
    }

    pub fn push_front(&mut self, value: T) {
        if self.len == self.slots.len() {
            self.resize(self.slots.len() * 2);
        }
        self.head = (self.head + self.slots.len() - 1) & self.mask();
        self.slots[self.head] = Some(value);
        self.len += 1;
    }

    /// Remove the oldest element. Returns `None` when empty.
    pub fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.head].take();
        self.head = (self.head + 1) & self.mask();
        self.len -= 1;
        self.maybe_shrink();
        value
    }

    /// Remove the newest element. Returns `None` when empty.
    pub fn pop_back(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + self.len - 1) & self.mask();
        let value = self.slots[idx].take();
        self.len -= 1;
        self.maybe_shrink();
        value
    }

    pub fn front(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.slots[self.head].as_ref()
    }

    pub fn back(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        self.slots[(self.head + self.len - 1) & self.mask()].as_ref()
    }

    /// Drop every element but keep the backing array.
    ///
    /// Walks the whole array so no slot keeps a stale value alive.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }

    /// Move up to `max` elements from the front into `out`, preserving order.
    pub fn drain_front_into(&mut self, out: &mut Vec<T>, max: usize) -> usize {
        let mut moved = 0;
        while moved < max {
            match self.pop_front() {
                Some(value) => {
                    out.push(value);
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }

    /// Iterate front to back.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |i| self.slots[(self.head + i) & self.mask()].as_ref())
    }

    fn maybe_shrink(&mut self) {
        let capacity = self.slots.len();
        if capacity > self.floor && self.len <= capacity / 4 {
            self.resize(capacity / 2);
        }
    }

    fn resize(&mut self, new_capacity: usize) {
        debug_assert!(new_capacity.is_power_of_two());
        debug_assert!(new_capacity >= self.len);

        let mut slots = empty_slots(new_capacity);
        let mask = self.mask();
        for (i, slot) in slots.iter_mut().enumerate().take(self.len) {
            *slot = self.slots[(self.head + i) & mask].take();
        }
        self.slots = slots;
        self.head = 0;
    }
}

impl<T> Default for Deque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Extend<T> for Deque<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for value in iter {
            self.push_back(value);
        }
    }
}

impl<T> FromIterator<T> for Deque<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut deque = Self::new();
        deque.extend(iter);
        deque
    }
}

fn empty_slots<T>(capacity: usize) -> Vec<Option<T>> {
    let mut slots = Vec::with_capacity(capacity);
    slots.resize_with(capacity, || None);
    slots
}
