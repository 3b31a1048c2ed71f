/*!
 * ID Generation System
 * Monotonic generators for handles, process ids and channel ids
 */

use super::types::Handle;
use std::sync::atomic::{AtomicU64, Ordering};

/// Generic ID generator interface
pub trait IdGenerator<T> {
    /// Generate next ID
    fn next(&self) -> T;

    /// Get current counter value (for debugging)
    fn current(&self) -> T;
}

/// Atomic counter generator
///
/// # Performance
/// - Cache-line aligned to prevent false sharing
/// - Lock-free atomic operations
#[repr(C, align(64))]
#[derive(Debug)]
pub struct AtomicGenerator<T> {
    counter: AtomicU64,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> AtomicGenerator<T> {
    /// Create new generator starting at given value
    #[inline]
    pub fn new(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
            _marker: std::marker::PhantomData,
        }
    }

    /// Create new generator starting at 1
    #[inline]
    pub fn default_start() -> Self {
        Self::new(1)
    }
}

impl<T> Default for AtomicGenerator<T> {
    fn default() -> Self {
        Self::default_start()
    }
}

impl IdGenerator<u32> for AtomicGenerator<u32> {
    #[inline]
    fn next(&self) -> u32 {
        // Zero is reserved in every u32 id space we hand out
        loop {
            let id = self.counter.fetch_add(1, Ordering::SeqCst) as u32;
            if id != 0 {
                return id;
            }
        }
    }

    #[inline]
    fn current(&self) -> u32 {
        self.counter.load(Ordering::Relaxed) as u32
    }
}

impl IdGenerator<Handle> for AtomicGenerator<Handle> {
    /// Values wrap inside `1..i32::MAX`; `0` and negatives are reserved.
    #[inline]
    fn next(&self) -> Handle {
        loop {
            let raw = self.counter.fetch_add(1, Ordering::SeqCst) % i32::MAX as u64;
            if raw != 0 {
                return Handle(raw as i32);
            }
        }
    }

    #[inline]
    fn current(&self) -> Handle {
        Handle((self.counter.load(Ordering::Relaxed) % i32::MAX as u64) as i32)
    }
}

/// Handle value generator
pub type HandleGenerator = AtomicGenerator<Handle>;

/// Process ID generator
pub type PidGenerator = AtomicGenerator<u32>;

/// Channel ID generator (one per side of every process channel)
pub type ChannelGenerator = AtomicGenerator<u32>;
