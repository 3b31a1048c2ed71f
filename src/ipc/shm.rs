/*!
 * Shared Memory Segment
 * Slot array both sides of a process channel can address directly
 *
 * Slots are only ever touched through atomic load/store/swap; there is no
 * plain read-modify-write path.
 */

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Shared segment of 32-bit atomic slots
#[derive(Clone)]
pub struct SharedSegment {
    slots: Arc<[AtomicU32]>,
}

impl SharedSegment {
    /// Allocate a zeroed segment with `len` slots
    pub fn new(len: usize) -> Self {
        let slots: Vec<AtomicU32> = (0..len).map(|_| AtomicU32::new(0)).collect();
        Self {
            slots: slots.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Atomic load; `None` when the slot is out of range
    pub fn load(&self, slot: usize) -> Option<u32> {
        self.slots.get(slot).map(|s| s.load(Ordering::SeqCst))
    }

    /// Atomic store; false when the slot is out of range
    pub fn store(&self, slot: usize, value: u32) -> bool {
        match self.slots.get(slot) {
            Some(s) => {
                s.store(value, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Atomic swap returning the previous value
    pub fn swap(&self, slot: usize, value: u32) -> Option<u32> {
        self.slots.get(slot).map(|s| s.swap(value, Ordering::SeqCst))
    }

    /// True if both values address the same memory
    pub fn same_segment(&self, other: &SharedSegment) -> bool {
        Arc::ptr_eq(&self.slots, &other.slots)
    }
}

impl PartialEq for SharedSegment {
    fn eq(&self, other: &Self) -> bool {
        self.same_segment(other)
    }
}

impl fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSegment")
            .field("slots", &self.slots.len())
            .finish()
    }
}
