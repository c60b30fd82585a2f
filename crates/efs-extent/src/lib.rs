#![forbid(unsafe_code)]
//! Logical extent index: logical page to authoritative log record.
//!
//! The index owns no data. Each mapped page points at the log position of
//! the write entry that most recently covered it; the entry itself says which
//! physical block backs the page. The whole structure can be rebuilt by
//! replaying the log.

use efs_types::{LogPosition, PageIndex};
use std::collections::BTreeMap;

/// A page whose previous owner was replaced by [`ExtentIndex::assign`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Displaced {
    pub page: PageIndex,
    pub previous: LogPosition,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentIndex {
    pages: BTreeMap<u64, LogPosition>,
}

impl ExtentIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry currently authoritative for `page`.
    #[must_use]
    pub fn get(&self, page: PageIndex) -> Option<LogPosition> {
        self.pages.get(&page.0).copied()
    }

    /// First mapped page at or after `page`.
    #[must_use]
    pub fn next_mapped(&self, page: PageIndex) -> Option<(PageIndex, LogPosition)> {
        self.pages
            .range(page.0..)
            .next()
            .map(|(p, pos)| (PageIndex(*p), *pos))
    }

    /// Number of unmapped pages starting at `page`, capped at `max`.
    #[must_use]
    pub fn hole_len(&self, page: PageIndex, max: u64) -> u64 {
        match self.next_mapped(page) {
            Some((next, _)) => (next.0 - page.0).min(max),
            None => max,
        }
    }

    /// Make `pos` authoritative for `count` pages starting at `start`.
    ///
    /// Returns every page that was previously owned by a different entry.
    pub fn assign(&mut self, start: PageIndex, count: u64, pos: LogPosition) -> Vec<Displaced> {
        let mut displaced = Vec::new();
        for page in start.0..start.0.saturating_add(count) {
            if let Some(previous) = self.pages.insert(page, pos) {
                if previous != pos {
                    displaced.push(Displaced {
                        page: PageIndex(page),
                        previous,
                    });
                }
            }
        }
        displaced
    }

    /// Number of mapped pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Mapped pages in `[start, end)`, in page order.
    pub fn range(
        &self,
        start: PageIndex,
        end: PageIndex,
    ) -> impl Iterator<Item = (PageIndex, LogPosition)> + '_ {
        self.pages
            .range(start.0..end.0.max(start.0))
            .map(|(p, pos)| (PageIndex(*p), *pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = (PageIndex, LogPosition)> + '_ {
        self.pages.iter().map(|(p, pos)| (PageIndex(*p), *pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn assign_reports_displaced_pages() {
        let mut index = ExtentIndex::new();
        assert!(index.assign(PageIndex(0), 4, LogPosition(64)).is_empty());
        let displaced = index.assign(PageIndex(2), 4, LogPosition(128));
        assert_eq!(
            displaced,
            vec![
                Displaced {
                    page: PageIndex(2),
                    previous: LogPosition(64)
                },
                Displaced {
                    page: PageIndex(3),
                    previous: LogPosition(64)
                },
            ]
        );
        assert_eq!(index.get(PageIndex(1)), Some(LogPosition(64)));
        assert_eq!(index.get(PageIndex(5)), Some(LogPosition(128)));
        assert_eq!(index.len(), 6);
    }

    #[test]
    fn reassigning_same_entry_displaces_nothing() {
        let mut index = ExtentIndex::new();
        index.assign(PageIndex(0), 2, LogPosition(64));
        assert!(index.assign(PageIndex(0), 2, LogPosition(64)).is_empty());
    }

    #[test]
    fn holes_and_next_mapped() {
        let mut index = ExtentIndex::new();
        index.assign(PageIndex(10), 2, LogPosition(64));
        assert_eq!(index.hole_len(PageIndex(0), 100), 10);
        assert_eq!(index.hole_len(PageIndex(0), 3), 3);
        assert_eq!(index.hole_len(PageIndex(12), 5), 5);
        assert_eq!(index.hole_len(PageIndex(10), 5), 0);
        assert_eq!(
            index.next_mapped(PageIndex(3)),
            Some((PageIndex(10), LogPosition(64)))
        );
        assert_eq!(index.range(PageIndex(0), PageIndex(11)).count(), 1);
    }

    proptest! {
        #[test]
        fn last_assignment_wins(ops in proptest::collection::vec((0_u64..32, 1_u64..8), 1..20)) {
            let mut index = ExtentIndex::new();
            let mut model = vec![None; 40];
            for (i, (start, count)) in ops.iter().enumerate() {
                let pos = LogPosition((i as u64 + 1) * 64);
                index.assign(PageIndex(*start), *count, pos);
                for page in *start..start + count {
                    model[page as usize] = Some(pos);
                }
            }
            for (page, expected) in model.iter().enumerate() {
                prop_assert_eq!(index.get(PageIndex(page as u64)), *expected);
            }
        }
    }
}
