use chorus_core::{ChorusError, ChorusResult};
use tracing::debug;

/// Fixed-capacity, non-blocking counting semaphore for agent slots.
///
/// `available() + in_use() == capacity()` holds after every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotManager {
    capacity: usize,
    in_use: usize,
}

impl SlotManager {
    /// A manager with `capacity` free slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: 0,
        }
    }

    /// Take a slot if one is free. Never waits.
    pub fn acquire(&mut self) -> bool {
        if self.in_use >= self.capacity {
            debug!(capacity = self.capacity, "No free slot");
            return false;
        }
        self.in_use += 1;
        true
    }

    /// Return a slot.
    ///
    /// Releasing with nothing acquired is a controller bug and fails with
    /// [`ChorusError::SlotUnderflow`].
    pub fn release(&mut self) -> ChorusResult<()> {
        if self.in_use == 0 {
            return Err(ChorusError::SlotUnderflow);
        }
        self.in_use -= 1;
        Ok(())
    }

    /// Total slots, fixed at construction.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.capacity - self.in_use
    }

    /// Slots held by running agents.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Free every slot. Only for session resets.
    pub fn reset(&mut self) {
        self.in_use = 0;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_full() {
        let mut slots = SlotManager::new(3);
        assert!(slots.acquire());
        assert!(slots.acquire());
        assert!(slots.acquire());
        assert!(!slots.acquire());
        slots.release().unwrap();
        assert!(slots.acquire());
        assert_eq!(slots.in_use(), 3);
    }

    #[test]
    fn test_release_with_nothing_in_use_fails() {
        let mut slots = SlotManager::new(2);
        let err = slots.release().unwrap_err();
        assert!(matches!(err, ChorusError::SlotUnderflow));
        assert!(err.is_programming_error());
        assert_eq!(slots.available(), 2);
    }

    #[test]
    fn test_counts_always_sum_to_capacity() {
        let mut slots = SlotManager::new(4);
        // Deterministic mix of acquires and releases.
        for step in 0..40u32 {
            if step % 3 == 2 {
                let _ = slots.release();
            } else {
                slots.acquire();
            }
            assert_eq!(slots.available() + slots.in_use(), slots.capacity());
            assert!(slots.in_use() <= slots.capacity());
        }
        slots.reset();
        assert_eq!(slots.available(), 4);
    }

    #[test]
    fn test_zero_capacity() {
        let mut slots = SlotManager::new(0);
        assert!(!slots.acquire());
        assert!(slots.release().is_err());
    }
}
