//! Store-wide epoch counter.

use efs_types::EpochId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing epoch.
///
/// Writers read the current epoch once per call and stamp every entry they
/// append with it. Advancing is a single atomic fetch-add, so it never waits
/// on an inode lock.
pub struct EpochCounter {
    value: AtomicU64,
}

impl std::fmt::Debug for EpochCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochCounter")
            .field("value", &self.value.load(Ordering::Relaxed))
            .finish()
    }
}

impl EpochCounter {
    #[must_use]
    pub fn new(start: EpochId) -> Self {
        Self {
            value: AtomicU64::new(start.0),
        }
    }

    /// Read the current epoch without advancing it.
    #[must_use]
    pub fn current(&self) -> EpochId {
        EpochId(self.value.load(Ordering::Acquire))
    }

    /// Advance to the next epoch, returning the new value.
    pub fn advance(&self) -> EpochId {
        EpochId(self.value.fetch_add(1, Ordering::AcqRel).saturating_add(1))
    }
}

impl Default for EpochCounter {
    fn default() -> Self {
        Self::new(EpochId(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn advance_is_monotonic() {
        let counter = EpochCounter::default();
        assert_eq!(counter.current(), EpochId(1));
        assert_eq!(counter.advance(), EpochId(2));
        assert_eq!(counter.current(), EpochId(2));
    }

    #[test]
    fn concurrent_advances_are_unique() {
        let counter = Arc::new(EpochCounter::new(EpochId(0)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    (0..100).map(|_| counter.advance().0).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 400);
        assert_eq!(counter.current(), EpochId(400));
    }
}
