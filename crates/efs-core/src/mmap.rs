//! Mapping lifecycle hooks and the mmap write tracker.
//!
//! Every live mapping is kept in its inode's identity-ordered tree so faults
//! can be validated. Shared writable mappings additionally enter the write
//! tracker when the store copies mapped pages or protects data, because
//! their pages can change without passing through the write path:
//!
//! - While tracked, the range's checksums and parity are stale. An
//!   `MMAP_WRITE` record marks that in the log, reads skip verification for
//!   the covered pages, and unmapping recomputes protection.
//! - The store-wide [`MmapRegistry`] lists inodes with at least one tracked
//!   mapping, so a consistency pass only visits those inodes.
//!
//! Lock order: inode lock first, registry lock second. The registry lock is
//! held only for a set insert or remove, never across device I/O.

use crate::inode::InodeState;
use crate::resolve::{ExtentSeed, Resolved};
use crate::Store;
use efs_error::{EfsError, Result};
use efs_journal::{LogRecord, MmapEntry, TailUpdate, WriteEntry};
use efs_types::{BlockNumber, InodeNumber, LogPosition, MappingId, PageIndex};
use parking_lot::Mutex;
use std::collections::BTreeSet;

/// A memory mapping as described by the mapping subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub id: MappingId,
    pub ino: InodeNumber,
    pub page_offset: PageIndex,
    pub page_count: u64,
    pub shared: bool,
    pub writable: bool,
}

impl Mapping {
    #[must_use]
    pub fn covers(&self, page: PageIndex) -> bool {
        page.0 >= self.page_offset.0 && page.0 - self.page_offset.0 < self.page_count
    }

    #[must_use]
    pub fn is_shared_writable(&self) -> bool {
        self.shared && self.writable
    }

    fn end_page(&self) -> PageIndex {
        PageIndex(self.page_offset.0.saturating_add(self.page_count))
    }
}

/// A mapping in the write tracker, with the log record describing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TrackedMapping {
    pub mapping: Mapping,
    pub record: Option<LogPosition>,
}

/// Inodes that currently have tracked mappings.
#[derive(Debug, Default)]
pub struct MmapRegistry {
    inodes: Mutex<BTreeSet<InodeNumber>>,
}

impl MmapRegistry {
    fn insert(&self, ino: InodeNumber) -> bool {
        self.inodes.lock().insert(ino)
    }

    fn remove(&self, ino: InodeNumber) -> bool {
        self.inodes.lock().remove(&ino)
    }

    #[must_use]
    pub fn contains(&self, ino: InodeNumber) -> bool {
        self.inodes.lock().contains(&ino)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<InodeNumber> {
        self.inodes.lock().iter().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inodes.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inodes.lock().is_empty()
    }
}

impl Store {
    /// Register a new mapping.
    pub fn on_map(&self, mapping: Mapping) -> Result<()> {
        if mapping.page_count == 0 {
            return Err(EfsError::InvalidArgument(
                "mapping covers no pages".to_owned(),
            ));
        }
        let inode = self.inode(mapping.ino)?;
        let mut st = inode.state.write();
        if st.mappings.contains_key(&mapping.id) {
            return Err(EfsError::InvalidArgument(format!(
                "mapping {} already registered",
                mapping.id
            )));
        }

        let needs_tracking = mapping.is_shared_writable() && self.config.tracks_mappings();
        let record = if needs_tracking && self.config.protects_data() {
            Some(self.append_mmap_record(mapping.ino, &mut st, &mapping)?)
        } else {
            None
        };

        st.mappings.insert(mapping.id, mapping);
        if needs_tracking {
            st.tracked
                .insert(mapping.id, TrackedMapping { mapping, record });
            if st.tracked.len() == 1 {
                self.registry.insert(mapping.ino);
            }
        }
        tracing::debug!(
            target: "efs::mmap",
            ino = mapping.ino.0,
            mapping = mapping.id.0,
            pgoff = mapping.page_offset.0,
            pages = mapping.page_count,
            tracked = needs_tracking,
            "mapping_registered"
        );
        Ok(())
    }

    fn append_mmap_record(
        &self,
        ino: InodeNumber,
        st: &mut InodeState,
        mapping: &Mapping,
    ) -> Result<LogPosition> {
        let mut update = TailUpdate::from_head(&st.log);
        let record = LogRecord::MmapWrite(MmapEntry {
            epoch: self.epoch.current(),
            pgoff: mapping.page_offset,
            num_pages: mapping.page_count,
            invalid: false,
        });
        let pos = self
            .log
            .append(self.alloc.as_ref(), &mut update, &record)?;
        let size = st.size;
        let plan = self.prepare_commit(ino, st, None, &update, size)?;
        self.apply_reassign(ino, st, plan);
        Ok(pos)
    }

    /// Drop a mapping. A tracked mapping has its range re-protected and its
    /// log record invalidated before it leaves the tracker; if either step
    /// fails the mapping stays registered and the unmap can be retried.
    pub fn on_unmap(&self, mapping: &Mapping) -> Result<()> {
        let inode = self.inode(mapping.ino)?;
        let mut st = inode.state.write();
        live_mapping(&st, mapping)?;

        if let Some(tracked) = st.tracked.get(&mapping.id).copied() {
            let refreshed = self.protect_mapped_range(&st, &tracked.mapping)?;
            if let Some(pos) = tracked.record {
                self.log.invalidate_mmap_entry(pos)?;
            }
            st.tracked.remove(&mapping.id);
            if st.tracked.is_empty() {
                self.registry.remove(mapping.ino);
            }
            tracing::debug!(
                target: "efs::mmap",
                ino = mapping.ino.0,
                mapping = mapping.id.0,
                refreshed,
                "tracked_mapping_removed"
            );
        }
        st.mappings.remove(&mapping.id);
        Ok(())
    }

    /// Resolve the block behind a faulting page.
    ///
    /// A fault at or past end of file fails with `InvalidArgument`, the
    /// store's equivalent of a bus error.
    pub fn on_fault(&self, mapping: &Mapping, page: PageIndex, want_write: bool) -> Result<Resolved> {
        let inode = self.inode(mapping.ino)?;
        {
            let st = inode.state.read();
            let live = live_mapping(&st, mapping)?;
            if !live.covers(page) {
                return Err(EfsError::InvalidArgument(format!(
                    "page {page} is outside mapping {}",
                    live.id
                )));
            }
            if want_write && !live.writable {
                return Err(EfsError::InvalidArgument(format!(
                    "write fault on read-only mapping {}",
                    live.id
                )));
            }
            let start = self
                .block_size()
                .page_to_byte(page)
                .ok_or_else(|| EfsError::InvalidArgument(format!("page {page} overflows")))?;
            if start >= st.size {
                tracing::debug!(
                    target: "efs::mmap",
                    ino = mapping.ino.0,
                    page = page.0,
                    size = st.size,
                    "fault_beyond_eof"
                );
                return Err(EfsError::InvalidArgument(format!(
                    "fault at page {page} beyond end of file"
                )));
            }
        }
        self.resolve(mapping.ino, page, 1, want_write)
    }

    /// Copy a mapped page into a fresh block in the current epoch.
    ///
    /// The source page is not verified: it may legitimately have been
    /// modified through the mapping. Returns the new block.
    pub fn on_restore_after_fault(&self, mapping: &Mapping, page: PageIndex) -> Result<BlockNumber> {
        if !self.config.mmap_cow {
            return Err(EfsError::InvalidArgument(
                "copy-on-write mappings are disabled".to_owned(),
            ));
        }
        let inode = self.inode(mapping.ino)?;
        let mut st = inode.state.write();
        let live = live_mapping(&st, mapping)?;
        if !live.covers(page) {
            return Err(EfsError::InvalidArgument(format!(
                "page {page} is outside mapping {}",
                live.id
            )));
        }
        let Some(pos) = st.index.get(page) else {
            return Err(EfsError::InvalidArgument(format!(
                "page {page} has no backing block"
            )));
        };
        let entry = self.log.read_write_entry(pos)?;
        let old_block = entry.block_for(page);

        let epoch = self.epoch.current();
        let seed = ExtentSeed::Copy {
            entry,
            verify: false,
        };
        let granted = self.fork_extent(mapping.ino, &mut st, page, 1, seed, epoch)?;
        self.stats.record_mmap_cow_page();
        tracing::debug!(
            target: "efs::mmap",
            ino = mapping.ino.0,
            page = page.0,
            from = old_block.0,
            to = granted.start.0,
            "mapped_page_copied"
        );
        Ok(granted.start)
    }

    /// Recompute protection for every mapped page under every tracked
    /// mapping. Returns the number of pages refreshed.
    pub fn refresh_mapped_protection(&self) -> Result<u64> {
        if !self.config.protects_data() {
            return Ok(0);
        }
        let mut refreshed = 0;
        for ino in self.registry.snapshot() {
            let Ok(inode) = self.inode(ino) else {
                continue;
            };
            let st = inode.state.read();
            for tracked in st.tracked.values() {
                refreshed += self.protect_mapped_range(&st, &tracked.mapping)?;
            }
        }
        tracing::info!(target: "efs::mmap", refreshed, "mapped_protection_refreshed");
        Ok(refreshed)
    }

    /// The store-wide list of inodes with tracked mappings.
    #[must_use]
    pub fn mmap_registry(&self) -> &MmapRegistry {
        &self.registry
    }

    fn protect_mapped_range(&self, st: &InodeState, mapping: &Mapping) -> Result<u64> {
        if !self.protection.is_enabled() {
            return Ok(0);
        }
        let mut cached: Option<(LogPosition, WriteEntry)> = None;
        let mut refreshed = 0;
        for (page, pos) in st.index.range(mapping.page_offset, mapping.end_page()) {
            let entry = match cached {
                Some((p, e)) if p == pos => e,
                _ => {
                    let e = self.log.read_write_entry(pos)?;
                    cached = Some((pos, e));
                    e
                }
            };
            let block = entry.block_for(page);
            let data = self.device.read_block(block)?;
            self.protection.protect(block, data.as_slice())?;
            refreshed += 1;
        }
        Ok(refreshed)
    }
}

fn live_mapping(st: &InodeState, mapping: &Mapping) -> Result<Mapping> {
    st.mappings
        .get(&mapping.id)
        .copied()
        .ok_or_else(|| EfsError::NotFound(format!("mapping {}", mapping.id)))
}
