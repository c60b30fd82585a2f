//! The write engine.
//!
//! One chunk loop serves both strategies. Each iteration either reuses a
//! same-epoch extent in place, allocates a fresh extent, or (in place mode)
//! does both: the reusable prefix is updated in place and the rest of the
//! iteration falls through to allocation.
//!
//! Per allocated chunk the order is: assemble the full blocks in memory
//! (stitching edges), write and persist the data, write and persist
//! protection, append the log record. After the loop the inode record is
//! persisted once and the extent index is reconciled, which is the only
//! point where superseded blocks are freed.

use crate::inode::InodeState;
use crate::stitch::{EdgeSource, Stitcher};
use crate::Store;
use efs_alloc::{Affinity, AllocHint, BlockAlloc};
use efs_error::{EfsError, Result};
use efs_journal::{LogRecord, TailUpdate, WriteEntry};
use efs_types::{BlockNumber, EpochId, InodeNumber, LogPosition, PageIndex};
use serde::{Deserialize, Serialize};

/// How a write treats extents that already back the target range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteStrategy {
    /// Always allocate new blocks.
    CopyOnWrite,
    /// Reuse extents written in the current epoch.
    InPlace,
}

struct WriteLoop<'a> {
    store: &'a Store,
    ino: InodeNumber,
    data: &'a [u8],
    pos: u64,
    epoch: EpochId,
    mtime: u32,
    update: TailUpdate,
    begin: Option<LogPosition>,
    written: usize,
    new_size: u64,
}

impl WriteLoop<'_> {
    fn done(&self) -> bool {
        self.written >= self.data.len()
    }

    fn cursor(&self) -> u64 {
        self.pos + self.written as u64
    }

    fn stitcher(&self) -> Stitcher<'_> {
        Stitcher {
            device: self.store.device.as_ref(),
            protection: &self.store.protection,
            block_size: self.store.block_size(),
        }
    }

    /// Same-epoch entry backing `page`, if any.
    fn reusable_entry(
        &self,
        st: &InodeState,
        page: PageIndex,
    ) -> Result<Option<(LogPosition, WriteEntry)>> {
        let Some(pos) = st.index.get(page) else {
            return Ok(None);
        };
        let entry = self.store.log.read_write_entry(pos)?;
        Ok((entry.epoch == self.epoch).then_some((pos, entry)))
    }

    fn edge_source(&self, st: &InodeState, page: PageIndex) -> Result<EdgeSource> {
        let Some(pos) = st.index.get(page) else {
            return Ok(EdgeSource::Hole);
        };
        let entry = self.store.log.read_write_entry(pos)?;
        Ok(EdgeSource::Block {
            block: entry.block_for(page),
            verify: self.store.should_verify(st, page, &entry),
        })
    }

    /// One loop iteration.
    fn iterate(&mut self, st: &InodeState, strategy: WriteStrategy) -> Result<()> {
        if strategy == WriteStrategy::InPlace && self.in_place_step(st)? {
            let bs = self.store.block_size();
            if self.done() || self.reusable_entry(st, bs.page_of(self.cursor()))?.is_some() {
                return Ok(());
            }
        }
        self.alloc_step(st, strategy)
    }

    /// Overwrite the contiguous same-epoch run at the cursor. Returns false
    /// when the cursor page is not eligible.
    fn in_place_step(&mut self, st: &InodeState) -> Result<bool> {
        let bs = self.store.block_size();
        let cur = self.cursor();
        let page = bs.page_of(cur);
        let offset = bs.offset_in_page(cur);
        let Some((entry_pos, entry)) = self.reusable_entry(st, page)? else {
            return Ok(false);
        };

        let remaining = self.data.len() - self.written;
        let run = entry.run_from(page).min(bs.pages_spanned(offset, remaining));
        let bytes = (usize::try_from(run).unwrap_or(usize::MAX) * bs.as_usize() - offset)
            .min(remaining);
        let block = entry.block_for(page);
        let last_page = PageIndex(page.0 + run - 1);

        let head = EdgeSource::Block {
            block,
            verify: self.store.should_verify(st, page, &entry),
        };
        let tail = EdgeSource::Block {
            block: entry.block_for(last_page),
            verify: self.store.should_verify(st, last_page, &entry),
        };
        let src = &self.data[self.written..self.written + bytes];
        let buf = self.stitcher().assemble(run, offset, src, head, tail)?;

        self.store.log.set_updating(entry_pos, true)?;
        if let Err(err) = self.store.write_protected(block, &buf) {
            self.clear_updating(entry_pos);
            return Err(err);
        }

        let new_size = self.new_size.max(cur + bytes as u64);
        if let Err(err) = self
            .store
            .log
            .update_entry_in_place(entry_pos, new_size, self.mtime)
        {
            self.clear_updating(entry_pos);
            return Err(err);
        }
        self.new_size = new_size;
        self.written += bytes;
        tracing::trace!(
            target: "efs::write",
            ino = self.ino.0,
            page = page.0,
            pages = run,
            block = block.0,
            bytes,
            "chunk_written_in_place"
        );
        Ok(true)
    }

    fn clear_updating(&self, entry_pos: LogPosition) {
        if let Err(err) = self.store.log.set_updating(entry_pos, false) {
            tracing::warn!(
                target: "efs::write",
                ino = self.ino.0,
                pos = entry_pos.0,
                error = %err,
                "updating_flag_not_cleared"
            );
        }
    }

    /// Allocate fresh blocks for the range at the cursor and append an entry.
    fn alloc_step(&mut self, st: &InodeState, strategy: WriteStrategy) -> Result<()> {
        let bs = self.store.block_size();
        let cur = self.cursor();
        let page = bs.page_of(cur);
        let offset = bs.offset_in_page(cur);
        let remaining = self.data.len() - self.written;
        let wanted = bs.pages_spanned(offset, remaining);

        let count = match strategy {
            WriteStrategy::CopyOnWrite => wanted,
            WriteStrategy::InPlace => match st.index.get(page) {
                // Stale entry: fork its run only.
                Some(pos) => self
                    .store
                    .log
                    .read_write_entry(pos)?
                    .run_from(page)
                    .min(wanted),
                // Hole: fill up to the next mapped page.
                None => st.index.hole_len(page, wanted),
            },
        }
        .clamp(1, u64::from(u32::MAX));

        let granted = self.store.alloc.allocate(
            AllocHint::for_page(page),
            count,
            false,
            Affinity::Any,
        )?;
        match self.fill_allocation(st, page, offset, remaining, granted) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.store.free_quietly(self.ino, granted);
                Err(err)
            }
        }
    }

    fn fill_allocation(
        &mut self,
        st: &InodeState,
        page: PageIndex,
        offset: usize,
        remaining: usize,
        granted: BlockAlloc,
    ) -> Result<()> {
        let bs = self.store.block_size();
        let span = usize::try_from(granted.count).unwrap_or(usize::MAX) * bs.as_usize();
        let bytes = (span - offset).min(remaining);
        let last_page = PageIndex(page.0 + granted.count - 1);

        let head = if offset > 0 {
            self.edge_source(st, page)?
        } else {
            EdgeSource::Hole
        };
        let tail = if (offset + bytes) % bs.as_usize() != 0 {
            self.edge_source(st, last_page)?
        } else {
            EdgeSource::Hole
        };
        let src = &self.data[self.written..self.written + bytes];
        let buf = self
            .stitcher()
            .assemble(granted.count, offset, src, head, tail)?;
        self.store.write_protected(granted.start, &buf)?;

        let cur = self.cursor();
        self.new_size = self.new_size.max(cur + bytes as u64);
        let entry = WriteEntry {
            epoch: self.epoch,
            pgoff: page,
            num_pages: u32::try_from(granted.count).unwrap_or(u32::MAX),
            block: granted.start,
            size: self.new_size,
            mtime: self.mtime,
            invalid_pages: 0,
            reassigned: false,
            updating: false,
        };
        let pos = self.store.log.append(
            self.store.alloc.as_ref(),
            &mut self.update,
            &LogRecord::FileWrite(entry),
        )?;
        self.begin.get_or_insert(pos);
        self.written += bytes;
        tracing::trace!(
            target: "efs::write",
            ino = self.ino.0,
            page = page.0,
            pages = granted.count,
            block = granted.start.0,
            bytes,
            "chunk_written"
        );
        Ok(())
    }
}

impl Store {
    /// Write `data` at `pos` with the inode lock held exclusively.
    pub(crate) fn write_locked(
        &self,
        ino: InodeNumber,
        st: &mut InodeState,
        data: &[u8],
        pos: u64,
        strategy: WriteStrategy,
    ) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = pos
            .checked_add(data.len() as u64)
            .ok_or_else(|| {
                EfsError::InvalidArgument(format!(
                    "write of {} bytes at {pos} overflows the file offset range",
                    data.len()
                ))
            })?;
        if strategy == WriteStrategy::CopyOnWrite && st.has_shared_writable_mapping() {
            tracing::debug!(target: "efs::write", ino = ino.0, "write_blocked_by_mapping");
            return Err(EfsError::WriteBlockedByMapping);
        }

        let mut wl = WriteLoop {
            store: self,
            ino,
            data,
            pos,
            epoch: self.epoch.current(),
            mtime: crate::now_secs(),
            update: TailUpdate::from_head(&st.log),
            begin: None,
            written: 0,
            new_size: st.size,
        };
        let mut breaks = 0_u64;
        let mut failure = None;
        while !wl.done() {
            breaks += 1;
            if let Err(err) = wl.iterate(st, strategy) {
                failure = Some(err);
                break;
            }
        }
        let (written, begin, update, new_size) = (wl.written, wl.begin, wl.update, wl.new_size);

        if let Some(err) = failure {
            self.note_error(&err);
            if written == 0 || matches!(err, EfsError::LogCorrupt { .. }) {
                self.abandon_appends(ino, begin, update.tail);
                tracing::debug!(
                    target: "efs::write",
                    ino = ino.0,
                    pos,
                    error = %err,
                    "write_failed"
                );
                return Err(err);
            }
            tracing::warn!(
                target: "efs::write",
                ino = ino.0,
                pos,
                requested = data.len(),
                written,
                error = %err,
                "short_write"
            );
        }

        let plan = match self.prepare_commit(ino, st, begin, &update, new_size) {
            Ok(plan) => plan,
            Err(err) => {
                self.abandon_appends(ino, begin, update.tail);
                return Err(err);
            }
        };
        self.apply_reassign(ino, st, plan);
        self.stats.record_write(strategy, written as u64, breaks);
        tracing::debug!(
            target: "efs::write",
            ino = ino.0,
            pos,
            end,
            written,
            breaks,
            strategy = ?strategy,
            "write_committed"
        );
        Ok(written)
    }

    /// Write fully assembled blocks starting at `start`, then protect them.
    pub(crate) fn write_protected(&self, start: BlockNumber, buf: &[u8]) -> Result<()> {
        let bs = self.block_size();
        let offset = self.device.block_offset(start)?;
        let pages = (buf.len() / bs.as_usize()) as u64;
        self.device.write_all_at(offset, buf)?;
        self.device.persist_blocks(start, pages)?;
        for (i, block) in buf.chunks(bs.as_usize()).enumerate() {
            self.protection.protect(BlockNumber(start.0 + i as u64), block)?;
        }
        Ok(())
    }
}
