//! Logical-to-physical lookup for reads and mapping faults.
//!
//! Lookups that find what they need run under the shared inode lock. Only a
//! lookup that must allocate drops it, takes the exclusive lock and checks
//! again: another fault may have filled the same page in between, and the
//! second thread must then return that block instead of allocating again.

use crate::inode::InodeState;
use crate::Store;
use efs_alloc::{Affinity, AllocHint, BlockAlloc};
use efs_error::{EfsError, Result};
use efs_journal::{LogRecord, TailUpdate, WriteEntry};
use efs_types::{BlockNumber, EpochId, InodeNumber, LogPosition, PageIndex};

/// Physical run backing consecutive logical pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRun {
    pub block: BlockNumber,
    pub pages: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Mapped(MappedRun),
    /// `pages` unmapped pages start at the requested page.
    Hole { pages: u64 },
}

/// Contents to seed a newly allocated extent with.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ExtentSeed {
    Zero,
    /// Copy from the entry currently backing the pages.
    Copy { entry: WriteEntry, verify: bool },
}

impl Store {
    /// Map `wanted` pages starting at `page` to physical blocks.
    ///
    /// With `create`, a hole or an extent from an older epoch is replaced by
    /// freshly allocated blocks in the current epoch. Older contents are
    /// copied into the new blocks; holes are zeroed.
    pub fn resolve(
        &self,
        ino: InodeNumber,
        page: PageIndex,
        wanted: u64,
        create: bool,
    ) -> Result<Resolved> {
        if wanted == 0 {
            return Err(EfsError::InvalidArgument(
                "resolve of zero pages".to_owned(),
            ));
        }
        let inode = self.inode(ino)?;

        {
            let st = inode.state.read();
            let epoch = self.epoch.current();
            if let Some(found) = self.lookup(&st, page, wanted, create, epoch)? {
                return Ok(found);
            }
        }

        let mut st = inode.state.write();
        // The epoch may have advanced while the lock was contended.
        let epoch = self.epoch.current();
        if let Some(found) = self.lookup(&st, page, wanted, create, epoch)? {
            tracing::trace!(
                target: "efs::resolve",
                ino = ino.0,
                page = page.0,
                "resolve_filled_concurrently"
            );
            return Ok(found);
        }

        let seed = match st.index.get(page) {
            Some(pos) => {
                let entry = self.log.read_write_entry(pos)?;
                ExtentSeed::Copy {
                    entry,
                    verify: self.should_verify(&st, page, &entry),
                }
            }
            None => ExtentSeed::Zero,
        };
        let count = match seed {
            ExtentSeed::Copy { entry, .. } => entry.run_from(page).min(wanted),
            ExtentSeed::Zero => st.index.hole_len(page, wanted),
        };
        let granted = self.fork_extent(ino, &mut st, page, count, seed, epoch)?;
        self.stats.record_fault_allocation();
        tracing::debug!(
            target: "efs::resolve",
            ino = ino.0,
            page = page.0,
            block = granted.start.0,
            pages = granted.count,
            "fault_allocated"
        );
        Ok(Resolved::Mapped(MappedRun {
            block: granted.start,
            pages: granted.count,
        }))
    }

    fn lookup(
        &self,
        st: &InodeState,
        page: PageIndex,
        wanted: u64,
        create: bool,
        epoch: EpochId,
    ) -> Result<Option<Resolved>> {
        match st.index.get(page) {
            Some(pos) => {
                let entry = self.log.read_write_entry(pos)?;
                if !create || entry.epoch == epoch {
                    return Ok(Some(Resolved::Mapped(MappedRun {
                        block: entry.block_for(page),
                        pages: entry.run_from(page).min(wanted),
                    })));
                }
                Ok(None)
            }
            None if !create => Ok(Some(Resolved::Hole {
                pages: st.index.hole_len(page, wanted),
            })),
            None => Ok(None),
        }
    }

    /// Allocate up to `count` blocks for the pages at `page`, seed them,
    /// append one entry in `epoch` and commit it. The blocks previously
    /// backing those pages are freed by reconciliation.
    pub(crate) fn fork_extent(
        &self,
        ino: InodeNumber,
        st: &mut InodeState,
        page: PageIndex,
        count: u64,
        seed: ExtentSeed,
        epoch: EpochId,
    ) -> Result<BlockAlloc> {
        let count = count.clamp(1, u64::from(u32::MAX));
        let zero = matches!(seed, ExtentSeed::Zero);
        let granted = self
            .alloc
            .allocate(AllocHint::for_page(page), count, zero, Affinity::Any)?;

        let mut update = TailUpdate::from_head(&st.log);
        let pos = match self.seed_and_append(st, page, granted, seed, epoch, &mut update) {
            Ok(pos) => pos,
            Err(err) => {
                self.note_error(&err);
                self.free_quietly(ino, granted);
                return Err(err);
            }
        };

        let size = st.size;
        let plan = match self.prepare_commit(ino, st, Some(pos), &update, size) {
            Ok(plan) => plan,
            Err(err) => {
                self.abandon_appends(ino, Some(pos), update.tail);
                return Err(err);
            }
        };
        self.apply_reassign(ino, st, plan);
        Ok(granted)
    }

    fn seed_and_append(
        &self,
        st: &InodeState,
        page: PageIndex,
        granted: BlockAlloc,
        seed: ExtentSeed,
        epoch: EpochId,
        update: &mut TailUpdate,
    ) -> Result<LogPosition> {
        let bs = self.block_size();
        let mut buf = vec![0_u8; usize::try_from(granted.count).unwrap_or(usize::MAX) * bs.as_usize()];
        if let ExtentSeed::Copy { entry, verify } = seed {
            for (i, chunk) in buf.chunks_mut(bs.as_usize()).enumerate() {
                let source_page = PageIndex(page.0 + i as u64);
                let source = entry.block_for(source_page);
                let old = self.device.read_block(source)?;
                if verify {
                    self.protection
                        .verify(source, old.as_slice(), 0, bs.as_usize())?;
                }
                chunk.copy_from_slice(old.as_slice());
            }
        }
        if matches!(seed, ExtentSeed::Zero) {
            // Already zeroed by the allocator; protection still covers them.
            for (i, chunk) in buf.chunks(bs.as_usize()).enumerate() {
                self.protection
                    .protect(BlockNumber(granted.start.0 + i as u64), chunk)?;
            }
        } else {
            self.write_protected(granted.start, &buf)?;
        }

        let entry = WriteEntry {
            epoch,
            pgoff: page,
            num_pages: u32::try_from(granted.count).unwrap_or(u32::MAX),
            block: granted.start,
            size: st.size,
            mtime: crate::now_secs(),
            invalid_pages: 0,
            reassigned: false,
            updating: false,
        };
        self.log
            .append(self.alloc.as_ref(), update, &LogRecord::FileWrite(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OpenFlags, StoreConfig};
    use efs_block::{MemPmemDevice, PmemDevice};
    use efs_types::BlockSize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fault_waiting_on_the_lock_forks_into_the_newest_epoch() {
        let dev = Arc::new(MemPmemDevice::new(BlockSize::default(), 64));
        let store = Store::format(dev as Arc<dyn PmemDevice>, StoreConfig::default()).unwrap();
        let ino = store.create_file().unwrap();
        let fh = store.open(ino, OpenFlags::default()).unwrap();
        store.write(&fh, &[5_u8; 4096], 0).unwrap();
        store.advance_epoch();

        let inode = store.inode(ino).unwrap();
        let guard = inode.state.write();
        let resolved = std::thread::scope(|s| {
            let handle = s.spawn(|| store.resolve(ino, PageIndex(0), 1, true));
            std::thread::sleep(Duration::from_millis(50));
            store.advance_epoch();
            drop(guard);
            handle.join().unwrap()
        })
        .unwrap();

        let pos = inode.state.read().index.get(PageIndex(0)).unwrap();
        let entry = store.log.read_write_entry(pos).unwrap();
        assert_eq!(entry.epoch, store.current_epoch());
        // Same epoch now: a second write fault reuses the fork.
        assert_eq!(store.resolve(ino, PageIndex(0), 1, true).unwrap(), resolved);
        assert_eq!(store.stats().fault_allocations, 1);
    }
}
