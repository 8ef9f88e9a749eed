//! Striped lock table.
//!
//! A fixed array of mutexes indexed by `id % N` stands in for one lock per
//! inode or per machine. Two distinct ids that land in the same slot
//! serialize against each other; that costs concurrency, not correctness.

use parking_lot::{Mutex, MutexGuard};

#[derive(Debug)]
pub struct LockTable {
    slots: Box<[Mutex<()>]>,
}

impl LockTable {
    /// Table with `stripes` slots (at least one).
    #[must_use]
    pub fn new(stripes: usize) -> Self {
        let slots = (0..stripes.max(1)).map(|_| Mutex::new(())).collect();
        Self { slots }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn slot_of(&self, key: u64) -> usize {
        // Slot count fits in u64 and the remainder fits back in usize.
        (key % self.slots.len() as u64) as usize
    }

    /// Block until the slot guarding `key` is held.
    pub fn lock(&self, key: u64) -> MutexGuard<'_, ()> {
        self.slots[self.slot_of(key)].lock()
    }
}
