//! Partial-block stitching.
//!
//! A write that starts or ends inside a page leaves part of that page
//! untouched. The new block must carry the old bytes there (or zeros for a
//! hole) so that protection can be computed over the whole block and no
//! uninitialized device memory ever becomes file content.

use efs_block::PmemDevice;
use efs_error::Result;
use efs_repair::ProtectionUnit;
use efs_types::{BlockNumber, BlockSize};
use std::ops::Range;

/// Where the untouched bytes of an edge page come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EdgeSource {
    /// No previous content: zero fill.
    Hole,
    /// Previous content lives in `block`; `verify` checks the preserved
    /// bytes against their stored checksums first.
    Block { block: BlockNumber, verify: bool },
}

pub(crate) struct Stitcher<'a> {
    pub device: &'a dyn PmemDevice,
    pub protection: &'a ProtectionUnit,
    pub block_size: BlockSize,
}

impl Stitcher<'_> {
    /// Build the full content of `pages` blocks for a write of `src` at
    /// in-page `offset` of the first block.
    pub fn assemble(
        &self,
        pages: u64,
        offset: usize,
        src: &[u8],
        head: EdgeSource,
        tail: EdgeSource,
    ) -> Result<Vec<u8>> {
        let bs = self.block_size.as_usize();
        let total = usize::try_from(pages).unwrap_or(usize::MAX).saturating_mul(bs);
        let end = offset + src.len();
        debug_assert!(end <= total);
        let mut buf = vec![0_u8; total];

        if offset > 0 {
            self.fill(&mut buf[..bs], head, 0..offset)?;
        }
        if end % bs != 0 {
            let last = (end / bs) * bs;
            self.fill(&mut buf[last..last + bs], tail, end - last..bs)?;
        }
        buf[offset..end].copy_from_slice(src);
        Ok(buf)
    }

    fn fill(&self, page: &mut [u8], source: EdgeSource, keep: Range<usize>) -> Result<()> {
        match source {
            EdgeSource::Hole => {
                page[keep].fill(0);
            }
            EdgeSource::Block { block, verify } => {
                let old = self.device.read_block(block)?;
                if verify {
                    self.protection
                        .verify(block, old.as_slice(), keep.start, keep.len())?;
                }
                page[keep.clone()].copy_from_slice(&old.as_slice()[keep]);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use efs_block::MemPmemDevice;
    use efs_error::EfsError;
    use efs_repair::ProtectionLayout;
    use std::sync::Arc;

    fn fixture() -> (Arc<MemPmemDevice>, ProtectionUnit) {
        let dev = Arc::new(MemPmemDevice::new(BlockSize::new(4096).unwrap(), 8));
        let layout = ProtectionLayout {
            data_start: BlockNumber(2),
            data_blocks: 6,
            csum_start: BlockNumber(1),
            parity_start: BlockNumber(2),
            strip_size: 512,
        };
        let unit = ProtectionUnit::new(dev.clone(), layout, true, false).unwrap();
        (dev, unit)
    }

    #[test]
    fn hole_edges_are_zero() {
        let (dev, unit) = fixture();
        let stitcher = Stitcher {
            device: dev.as_ref(),
            protection: &unit,
            block_size: dev.block_size(),
        };
        let buf = stitcher
            .assemble(1, 100, &[7; 10], EdgeSource::Hole, EdgeSource::Hole)
            .unwrap();
        assert!(buf[..100].iter().all(|b| *b == 0));
        assert!(buf[100..110].iter().all(|b| *b == 7));
        assert!(buf[110..].iter().all(|b| *b == 0));
    }

    #[test]
    fn edges_copied_from_old_blocks() {
        let (dev, unit) = fixture();
        dev.write_block(BlockNumber(3), &[0xAA; 4096]).unwrap();
        dev.write_block(BlockNumber(4), &[0xBB; 4096]).unwrap();
        let stitcher = Stitcher {
            device: dev.as_ref(),
            protection: &unit,
            block_size: dev.block_size(),
        };
        // 4000..4096 of page 0 and 0..96 of page 1.
        let buf = stitcher
            .assemble(
                2,
                4000,
                &[1; 192],
                EdgeSource::Block {
                    block: BlockNumber(3),
                    verify: false,
                },
                EdgeSource::Block {
                    block: BlockNumber(4),
                    verify: false,
                },
            )
            .unwrap();
        assert!(buf[..4000].iter().all(|b| *b == 0xAA));
        assert!(buf[4000..4192].iter().all(|b| *b == 1));
        assert!(buf[4192..].iter().all(|b| *b == 0xBB));
    }

    #[test]
    fn corrupt_preserved_bytes_fail_verification() {
        let (dev, unit) = fixture();
        let data = [0x11_u8; 4096];
        dev.write_block(BlockNumber(3), &data).unwrap();
        unit.protect(BlockNumber(3), &data).unwrap();
        dev.write_in_block(BlockNumber(3), 5, &[0x99]).unwrap();

        let stitcher = Stitcher {
            device: dev.as_ref(),
            protection: &unit,
            block_size: dev.block_size(),
        };
        let source = EdgeSource::Block {
            block: BlockNumber(3),
            verify: true,
        };
        assert!(matches!(
            stitcher.assemble(1, 100, &[0; 8], source, EdgeSource::Hole),
            Err(EfsError::DataCorrupt { block: 3, .. })
        ));
        // Overwriting the corrupt strip entirely needs no old bytes from it.
        stitcher
            .assemble(1, 0, &[0; 600], EdgeSource::Hole, source)
            .unwrap();
    }
}
