//! Commit and reconciliation of appended entries.
//!
//! A mutating call ends in two phases:
//!
//! 1. [`Store::prepare_commit`] walks the records appended during the call,
//!    plans which pages they displace, reads back every entry that loses a
//!    page, and only then persists the inode record with the new tail. A
//!    broken chain or an unreadable superseded entry fails here, before
//!    anything is committed.
//! 2. [`Store::apply_reassign`] makes the new entries authoritative in the
//!    extent index and frees every displaced physical page, bumping the old
//!    entries' invalid counts.
//!
//! Blocks are only ever freed in phase 2, after the records that supersede
//! them are durable and reachable from the committed tail. Phase 2 cannot
//! fail the call: the write is already committed, so reclaim errors are
//! logged and the affected blocks stay allocated.

use crate::inode::{InodeRecord, InodeState};
use crate::Store;
use efs_alloc::BlockAlloc;
use efs_error::{EfsError, Result};
use efs_extent::{Displaced, ExtentIndex};
use efs_journal::{LogHead, TailUpdate, WriteEntry};
use efs_types::{InodeNumber, LogPosition, PageIndex};
use std::collections::BTreeMap;

/// Outcome of planning a reconciliation against the current index.
#[derive(Debug, Default)]
pub(crate) struct ReassignPlan {
    pub entries: Vec<(LogPosition, WriteEntry)>,
    pub displaced: Vec<Displaced>,
    /// Checked entries losing pages, filled in by `prepare_commit`.
    pub superseded: Vec<Superseded>,
    /// Mapped pages once the plan is applied.
    pub mapped_pages: u64,
}

/// A committed entry and the pages it loses to the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Superseded {
    pub pos: LogPosition,
    pub entry: WriteEntry,
    pub pages: Vec<PageIndex>,
}

/// What [`Store::apply_reassign`] reclaimed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ReassignReport {
    pub entries: usize,
    pub freed_blocks: u64,
    /// Entries with every page superseded.
    pub dead_entries: Vec<LogPosition>,
}

/// Replay `entries` over `index` without mutating it.
pub(crate) fn plan_reassign(
    index: &ExtentIndex,
    entries: Vec<(LogPosition, WriteEntry)>,
) -> ReassignPlan {
    let mut overlay: BTreeMap<u64, LogPosition> = BTreeMap::new();
    let mut displaced = Vec::new();
    let mut added = 0_u64;
    for (pos, entry) in &entries {
        for page in entry.pgoff.0..entry.end_page() {
            let previous = overlay
                .insert(page, *pos)
                .or_else(|| index.get(PageIndex(page)));
            match previous {
                None => added += 1,
                Some(prev) if prev != *pos => displaced.push(Displaced {
                    page: PageIndex(page),
                    previous: prev,
                }),
                Some(_) => {}
            }
        }
    }
    ReassignPlan {
        entries,
        displaced,
        superseded: Vec::new(),
        mapped_pages: index.len() as u64 + added,
    }
}

impl Store {
    /// Validate the records appended in `[begin, update.tail)` and every
    /// entry they supersede, then persist the inode record that commits
    /// them.
    pub(crate) fn prepare_commit(
        &self,
        ino: InodeNumber,
        st: &mut InodeState,
        begin: Option<LogPosition>,
        update: &TailUpdate,
        new_size: u64,
    ) -> Result<ReassignPlan> {
        let entries = match begin {
            Some(begin) => self.log.write_entries(begin, update.tail)?,
            None => Vec::new(),
        };
        let mut plan = plan_reassign(&st.index, entries);
        plan.superseded = self.check_superseded(&plan.displaced)?;
        let log = LogHead {
            head: st.log.head,
            tail: update.tail,
            alter_head: st.log.alter_head,
            alter_tail: update.alter_tail,
        };
        self.persist_inode(&InodeRecord {
            ino,
            size: new_size,
            blocks: plan.mapped_pages,
            log,
        })?;
        st.log = log;
        st.size = new_size;
        st.blocks = plan.mapped_pages;
        Ok(plan)
    }

    /// Read every entry named by `displaced` and check that it really backs
    /// the pages the index attributes to it.
    fn check_superseded(&self, displaced: &[Displaced]) -> Result<Vec<Superseded>> {
        let mut by_entry: BTreeMap<LogPosition, Vec<PageIndex>> = BTreeMap::new();
        for d in displaced {
            by_entry.entry(d.previous).or_default().push(d.page);
        }
        let mut superseded = Vec::with_capacity(by_entry.len());
        for (pos, pages) in by_entry {
            let entry = self.log.read_write_entry(pos)?;
            if let Some(page) = pages.iter().find(|page| !entry.covers(**page)) {
                return Err(EfsError::LogCorrupt {
                    position: pos.0,
                    detail: format!("index maps page {page} to an entry that does not cover it"),
                });
            }
            superseded.push(Superseded { pos, entry, pages });
        }
        Ok(superseded)
    }

    /// Make planned entries authoritative and free what they displaced.
    pub(crate) fn apply_reassign(
        &self,
        ino: InodeNumber,
        st: &mut InodeState,
        plan: ReassignPlan,
    ) -> ReassignReport {
        for (pos, entry) in &plan.entries {
            st.index
                .assign(entry.pgoff, u64::from(entry.num_pages), *pos);
        }

        let mut report = ReassignReport {
            entries: plan.entries.len(),
            ..ReassignReport::default()
        };
        for Superseded {
            pos,
            mut entry,
            pages,
        } in plan.superseded
        {
            for page in &pages {
                let block = entry.block_for(*page);
                match self.alloc.free(block, 1) {
                    Ok(()) => report.freed_blocks += 1,
                    Err(err) => tracing::error!(
                        target: "efs::reassign",
                        ino = ino.0,
                        pos = pos.0,
                        block = block.0,
                        error = %err,
                        "superseded_block_not_freed"
                    ),
                }
            }
            entry.mark_superseded(u32::try_from(pages.len()).unwrap_or(u32::MAX));
            if let Err(err) = self.log.store_write_entry(pos, &entry) {
                tracing::error!(
                    target: "efs::reassign",
                    ino = ino.0,
                    pos = pos.0,
                    error = %err,
                    "superseded_entry_not_invalidated"
                );
            }
            if entry.is_dead() {
                report.dead_entries.push(pos);
            }
        }

        self.stats
            .record_reclaim(report.freed_blocks, report.dead_entries.len() as u64);
        if report.entries > 0 {
            tracing::debug!(
                target: "efs::reassign",
                ino = ino.0,
                entries = report.entries,
                freed = report.freed_blocks,
                dead = report.dead_entries.len(),
                "reassign_applied"
            );
        }
        report
    }

    /// Free the current step's allocation and the extents of every file
    /// write entry in `[begin, end)`.
    pub(crate) fn cleanup_incomplete_write(
        &self,
        current: Option<BlockAlloc>,
        begin: Option<LogPosition>,
        end: LogPosition,
    ) -> Result<u64> {
        let mut freed = 0;
        if let Some(current) = current {
            self.alloc.free(current.start, current.count)?;
            freed += current.count;
        }
        if let Some(begin) = begin {
            for (_, entry) in self.log.write_entries(begin, end)? {
                self.alloc.free(entry.block, u64::from(entry.num_pages))?;
                freed += u64::from(entry.num_pages);
            }
        }
        Ok(freed)
    }

    /// Roll back uncommitted appends, logging rather than returning cleanup
    /// failures so the caller surfaces the original error.
    pub(crate) fn abandon_appends(&self, ino: InodeNumber, begin: Option<LogPosition>, end: LogPosition) {
        if begin.is_none() {
            return;
        }
        match self.cleanup_incomplete_write(None, begin, end) {
            Ok(freed) => tracing::debug!(
                target: "efs::reassign",
                ino = ino.0,
                freed,
                "incomplete_write_cleaned"
            ),
            Err(err) => tracing::warn!(
                target: "efs::reassign",
                ino = ino.0,
                error = %err,
                "incomplete_write_cleanup_failed"
            ),
        }
    }

    pub(crate) fn free_quietly(&self, ino: InodeNumber, alloc: BlockAlloc) {
        if let Err(err) = self.cleanup_incomplete_write(Some(alloc), None, LogPosition::NULL) {
            tracing::warn!(
                target: "efs::reassign",
                ino = ino.0,
                block = alloc.start.0,
                count = alloc.count,
                error = %err,
                "step_allocation_not_freed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use efs_types::{BlockNumber, EpochId};

    fn entry(pgoff: u64, pages: u32) -> WriteEntry {
        WriteEntry {
            epoch: EpochId(1),
            pgoff: PageIndex(pgoff),
            num_pages: pages,
            block: BlockNumber(100),
            size: 0,
            mtime: 0,
            invalid_pages: 0,
            reassigned: false,
            updating: false,
        }
    }

    #[test]
    fn plan_counts_new_and_displaced_pages() {
        let mut index = ExtentIndex::new();
        index.assign(PageIndex(0), 4, LogPosition(64));

        let plan = plan_reassign(
            &index,
            vec![(LogPosition(128), entry(2, 4)), (LogPosition(192), entry(8, 1))],
        );
        assert_eq!(plan.mapped_pages, 4 + 2 + 1);
        assert_eq!(plan.displaced.len(), 2);
        assert!(plan
            .displaced
            .iter()
            .all(|d| d.previous == LogPosition(64)));
        // The index itself is untouched.
        assert_eq!(index.get(PageIndex(2)), Some(LogPosition(64)));
    }

    #[test]
    fn plan_handles_overlap_within_one_call() {
        let index = ExtentIndex::new();
        let plan = plan_reassign(
            &index,
            vec![(LogPosition(64), entry(0, 2)), (LogPosition(128), entry(1, 2))],
        );
        assert_eq!(plan.mapped_pages, 3);
        assert_eq!(
            plan.displaced,
            vec![Displaced {
                page: PageIndex(1),
                previous: LogPosition(64)
            }]
        );
    }
}
