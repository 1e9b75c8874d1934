//! Explicit reference counter layered on a registry entry.

use std::sync::atomic::{AtomicI32, Ordering};

/// Lock-free counter; starts at 0 when a releaser is attached.
///
/// The counter itself never fires anything. The registry entry treats a
/// decrement that lands at or below zero as the signal to release, so a bare
/// `release` on a handle nobody retained frees it right away.
#[derive(Debug, Default)]
pub struct RefCount(AtomicI32);

impl RefCount {
    pub const fn new() -> Self {
        Self(AtomicI32::new(0))
    }

    /// Increment and return the new count.
    pub fn retain(&self) -> i32 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement and return the new count.
    pub fn release(&self) -> i32 {
        self.0.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_through_zero() {
        let rc = RefCount::new();
        assert_eq!(rc.get(), 0);
        assert_eq!(rc.retain(), 1);
        assert_eq!(rc.retain(), 2);
        assert_eq!(rc.release(), 1);
        assert_eq!(rc.release(), 0);
        assert_eq!(rc.release(), -1);
    }
}
