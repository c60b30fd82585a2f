//! Fixed-size log record codec.
//!
//! # Format
//!
//! Every record occupies one 64-byte slot:
//!
//! ```text
//! FILE_WRITE:
//! +--------+---------------+------+
//! | offset | field         | size |
//! +--------+---------------+------+
//! |   0    | kind (= 1)    |  1   |
//! |   1    | reassigned    |  1   |
//! |   2    | updating      |  1   |
//! |   4    | num_pages     |  4   |
//! |   8    | epoch         |  8   |
//! |  16    | pgoff         |  8   |
//! |  24    | block         |  8   |
//! |  32    | size          |  8   |
//! |  40    | mtime         |  4   |
//! |  44    | invalid_pages |  4   |
//! |  60    | crc32c        |  4   |  over bytes [0, 60)
//! +--------+---------------+------+
//!
//! MMAP_WRITE:
//! |   0    | kind (= 2)    |  1   |
//! |   1    | invalid       |  1   |
//! |   8    | epoch         |  8   |
//! |  16    | pgoff         |  8   |
//! |  24    | num_pages     |  8   |
//! |  60    | crc32c        |  4   |
//! ```
//!
//! A zeroed slot never decodes: its CRC does not match.

use efs_types::{
    read_le_u32, read_le_u64, write_le_u32, write_le_u64, BlockNumber, EpochId, PageIndex,
    ParseError,
};

/// Size of one log record slot.
pub const RECORD_SIZE: usize = 64;

pub const KIND_FILE_WRITE: u8 = 1;
pub const KIND_MMAP_WRITE: u8 = 2;

const CRC_OFFSET: usize = 60;

/// A data write: `num_pages` logical pages starting at `pgoff`, backed by
/// contiguous physical blocks starting at `block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteEntry {
    pub epoch: EpochId,
    pub pgoff: PageIndex,
    pub num_pages: u32,
    pub block: BlockNumber,
    /// File size when the entry was written or last updated in place.
    pub size: u64,
    pub mtime: u32,
    pub invalid_pages: u32,
    pub reassigned: bool,
    pub updating: bool,
}

impl WriteEntry {
    /// One past the last logical page covered.
    #[must_use]
    pub fn end_page(&self) -> u64 {
        self.pgoff.0 + u64::from(self.num_pages)
    }

    #[must_use]
    pub fn covers(&self, page: PageIndex) -> bool {
        page.0 >= self.pgoff.0 && page.0 < self.end_page()
    }

    /// Physical block backing logical `page`. The caller guarantees
    /// `self.covers(page)`.
    #[must_use]
    pub fn block_for(&self, page: PageIndex) -> BlockNumber {
        BlockNumber(self.block.0 + (page.0 - self.pgoff.0))
    }

    /// Contiguous pages, starting at `page`, that can be treated as one run.
    ///
    /// Once part of an entry has been superseded the run assumption no longer
    /// holds, so a reassigned entry yields single pages.
    #[must_use]
    pub fn run_from(&self, page: PageIndex) -> u64 {
        if !self.covers(page) {
            return 0;
        }
        if self.reassigned {
            1
        } else {
            self.end_page() - page.0
        }
    }

    /// Record that `count` more pages of the entry were superseded.
    pub fn mark_superseded(&mut self, count: u32) {
        self.reassigned = true;
        self.invalid_pages = self.invalid_pages.saturating_add(count).min(self.num_pages);
    }

    /// Every page of the entry has been superseded.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.invalid_pages >= self.num_pages
    }
}

/// Marks a range that was mapped writable while its protection was stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapEntry {
    pub epoch: EpochId,
    pub pgoff: PageIndex,
    pub num_pages: u64,
    pub invalid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecord {
    FileWrite(WriteEntry),
    MmapWrite(MmapEntry),
}

impl LogRecord {
    #[must_use]
    pub fn kind(&self) -> u8 {
        match self {
            Self::FileWrite(_) => KIND_FILE_WRITE,
            Self::MmapWrite(_) => KIND_MMAP_WRITE,
        }
    }

    #[must_use]
    pub fn as_write(&self) -> Option<&WriteEntry> {
        match self {
            Self::FileWrite(entry) => Some(entry),
            Self::MmapWrite(_) => None,
        }
    }
}

/// Encode a record into its slot image.
#[must_use]
pub fn encode_record(record: &LogRecord) -> [u8; RECORD_SIZE] {
    let mut buf = [0_u8; RECORD_SIZE];
    buf[0] = record.kind();
    match record {
        LogRecord::FileWrite(entry) => {
            buf[1] = u8::from(entry.reassigned);
            buf[2] = u8::from(entry.updating);
            write_le_u32(&mut buf, 4, entry.num_pages);
            write_le_u64(&mut buf, 8, entry.epoch.0);
            write_le_u64(&mut buf, 16, entry.pgoff.0);
            write_le_u64(&mut buf, 24, entry.block.0);
            write_le_u64(&mut buf, 32, entry.size);
            write_le_u32(&mut buf, 40, entry.mtime);
            write_le_u32(&mut buf, 44, entry.invalid_pages);
        }
        LogRecord::MmapWrite(entry) => {
            buf[1] = u8::from(entry.invalid);
            write_le_u64(&mut buf, 8, entry.epoch.0);
            write_le_u64(&mut buf, 16, entry.pgoff.0);
            write_le_u64(&mut buf, 24, entry.num_pages);
        }
    }
    let crc = crc32c::crc32c(&buf[..CRC_OFFSET]);
    write_le_u32(&mut buf, CRC_OFFSET, crc);
    buf
}

fn decode_flag(byte: u8, field: &'static str) -> Result<bool, ParseError> {
    match byte {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(ParseError::InvalidField {
            field,
            reason: "flag byte must be 0 or 1",
        }),
    }
}

/// Decode a slot image, checking its CRC first.
pub fn decode_record(bytes: &[u8]) -> Result<LogRecord, ParseError> {
    if bytes.len() < RECORD_SIZE {
        return Err(ParseError::InsufficientData {
            needed: RECORD_SIZE,
            offset: 0,
            actual: bytes.len(),
        });
    }
    let stored = read_le_u32(bytes, CRC_OFFSET)?;
    let computed = crc32c::crc32c(&bytes[..CRC_OFFSET]);
    if stored != computed {
        return Err(ParseError::ChecksumMismatch { stored, computed });
    }

    match bytes[0] {
        KIND_FILE_WRITE => {
            let num_pages = read_le_u32(bytes, 4)?;
            if num_pages == 0 {
                return Err(ParseError::InvalidField {
                    field: "num_pages",
                    reason: "write entry covers no pages",
                });
            }
            Ok(LogRecord::FileWrite(WriteEntry {
                reassigned: decode_flag(bytes[1], "reassigned")?,
                updating: decode_flag(bytes[2], "updating")?,
                num_pages,
                epoch: EpochId(read_le_u64(bytes, 8)?),
                pgoff: PageIndex(read_le_u64(bytes, 16)?),
                block: BlockNumber(read_le_u64(bytes, 24)?),
                size: read_le_u64(bytes, 32)?,
                mtime: read_le_u32(bytes, 40)?,
                invalid_pages: read_le_u32(bytes, 44)?,
            }))
        }
        KIND_MMAP_WRITE => Ok(LogRecord::MmapWrite(MmapEntry {
            invalid: decode_flag(bytes[1], "invalid")?,
            epoch: EpochId(read_le_u64(bytes, 8)?),
            pgoff: PageIndex(read_le_u64(bytes, 16)?),
            num_pages: read_le_u64(bytes, 24)?,
        })),
        _ => Err(ParseError::InvalidField {
            field: "kind",
            reason: "unknown record kind",
        }),
    }
}
