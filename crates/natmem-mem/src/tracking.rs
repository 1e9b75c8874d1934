//! Peak tracked-bytes watermark.
//!
//! Keep this cheap: it is updated on every admission.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct PeakTracker {
    peak_bytes: AtomicUsize,
}

impl PeakTracker {
    pub fn new() -> Self {
        Self {
            peak_bytes: AtomicUsize::new(0),
        }
    }

    /// Record a new tracked total; updates peak if higher.
    pub fn record_used(&self, used_bytes: usize) {
        let mut cur = self.peak_bytes.load(Ordering::Relaxed);
        while used_bytes > cur {
            match self.peak_bytes.compare_exchange(
                cur,
                used_bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    tracing::trace!(peak = used_bytes, "new tracked-bytes peak");
                    break;
                }
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn peak(&self) -> usize {
        self.peak_bytes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_only_grows() {
        let t = PeakTracker::new();
        t.record_used(100);
        t.record_used(40);
        assert_eq!(t.peak(), 100);
        t.record_used(250);
        assert_eq!(t.peak(), 250);
    }
}
