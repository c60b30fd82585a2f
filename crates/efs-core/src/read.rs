//! Read path.

use crate::inode::FileHandle;
use crate::Store;
use efs_error::Result;
use efs_journal::WriteEntry;
use efs_types::LogPosition;

impl Store {
    /// Read up to `buf.len()` bytes at `pos`.
    ///
    /// Runs under the shared inode lock, clamps to end of file and reads
    /// holes as zeros. Every block touched is verified against its stored
    /// checksums unless a live writable mapping covers it or its entry is
    /// being updated in place.
    pub fn read(&self, fh: &FileHandle, buf: &mut [u8], pos: u64) -> Result<usize> {
        let inode = self.inode(fh.ino())?;
        let st = inode.state.read();
        if pos >= st.size || buf.is_empty() {
            self.stats.record_read(0);
            return Ok(0);
        }
        let len = usize::try_from(st.size - pos).map_or(buf.len(), |avail| avail.min(buf.len()));

        let bs = self.block_size();
        let mut cached: Option<(LogPosition, WriteEntry)> = None;
        let mut done = 0_usize;
        while done < len {
            let cur = pos + done as u64;
            let page = bs.page_of(cur);
            let offset = bs.offset_in_page(cur);
            let n = (bs.as_usize() - offset).min(len - done);
            let out = &mut buf[done..done + n];

            match st.index.get(page) {
                None => out.fill(0),
                Some(entry_pos) => {
                    let entry = match cached {
                        Some((p, e)) if p == entry_pos => e,
                        _ => {
                            let e = self.log.read_write_entry(entry_pos)?;
                            cached = Some((entry_pos, e));
                            e
                        }
                    };
                    let block = entry.block_for(page);
                    let data = self.device.read_block(block)?;
                    if self.should_verify(&st, page, &entry) {
                        if let Err(err) = self.protection.verify(block, data.as_slice(), offset, n) {
                            self.note_error(&err);
                            return Err(err);
                        }
                    }
                    out.copy_from_slice(&data.as_slice()[offset..offset + n]);
                }
            }
            done += n;
        }

        self.stats.record_read(len as u64);
        tracing::trace!(
            target: "efs::read",
            ino = fh.ino().0,
            pos,
            len,
            "read_done"
        );
        Ok(len)
    }
}
