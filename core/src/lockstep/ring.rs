//! Frame-indexed ring buffer
//!
//! Fixed capacity, slot `frame % capacity`. Each slot carries the frame it
//! was written for; a lookup only hits when the tag matches, so stale slots
//! from a previous lap read as empty.

/// Tag of a slot that has never been written. No real frame reaches it.
pub const EMPTY_TAG: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub struct FrameRing<T> {
    tags: Vec<u32>,
    values: Vec<T>,
}

impl<T: Copy + Default> FrameRing<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            tags: vec![EMPTY_TAG; capacity],
            values: vec![T::default(); capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.tags.len()
    }

    fn slot(&self, frame: u32) -> usize {
        frame as usize % self.tags.len()
    }

    /// Write `value` for `frame`, evicting whatever shared the slot.
    pub fn insert(&mut self, frame: u32, value: T) {
        let slot = self.slot(frame);
        self.tags[slot] = frame;
        self.values[slot] = value;
    }

    pub fn get(&self, frame: u32) -> Option<T> {
        let slot = self.slot(frame);
        (frame != EMPTY_TAG && self.tags[slot] == frame).then(|| self.values[slot])
    }

    pub fn contains(&self, frame: u32) -> bool {
        frame != EMPTY_TAG && self.tags[self.slot(frame)] == frame
    }

    pub fn clear(&mut self) {
        self.tags.fill(EMPTY_TAG);
        self.values.fill(T::default());
    }
}
