//! Inode table records and in-memory inode state.

use crate::mmap::{Mapping, TrackedMapping};
use efs_extent::ExtentIndex;
use efs_journal::LogHead;
use efs_types::{
    read_le_u32, read_le_u64, write_le_u32, write_le_u64, InodeNumber, LogPosition, MappingId,
    PageIndex, ParseError,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;

pub const INODE_RECORD_SIZE: usize = 64;

const FLAG_IN_USE: u32 = 1;
const CRC_OFFSET: usize = 60;

/// Durable per-inode metadata, written once per mutating call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeRecord {
    pub ino: InodeNumber,
    pub size: u64,
    /// Data pages currently mapped.
    pub blocks: u64,
    pub log: LogHead,
}

impl InodeRecord {
    #[must_use]
    pub fn encode(&self) -> [u8; INODE_RECORD_SIZE] {
        let mut buf = [0_u8; INODE_RECORD_SIZE];
        write_le_u64(&mut buf, 0, self.ino.0);
        write_le_u64(&mut buf, 8, self.size);
        write_le_u64(&mut buf, 16, self.blocks);
        write_le_u64(&mut buf, 24, self.log.head.0);
        write_le_u64(&mut buf, 32, self.log.tail.0);
        write_le_u64(&mut buf, 40, self.log.alter_head.0);
        write_le_u64(&mut buf, 48, self.log.alter_tail.0);
        write_le_u32(&mut buf, 56, FLAG_IN_USE);
        let crc = crc32c::crc32c(&buf[..CRC_OFFSET]);
        write_le_u32(&mut buf, CRC_OFFSET, crc);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        let stored = read_le_u32(bytes, CRC_OFFSET)?;
        let computed = crc32c::crc32c(&bytes[..CRC_OFFSET]);
        if stored != computed {
            return Err(ParseError::ChecksumMismatch { stored, computed });
        }
        if read_le_u32(bytes, 56)? & FLAG_IN_USE == 0 {
            return Err(ParseError::InvalidField {
                field: "flags",
                reason: "inode slot not in use",
            });
        }
        Ok(Self {
            ino: InodeNumber(read_le_u64(bytes, 0)?),
            size: read_le_u64(bytes, 8)?,
            blocks: read_le_u64(bytes, 16)?,
            log: LogHead {
                head: LogPosition(read_le_u64(bytes, 24)?),
                tail: LogPosition(read_le_u64(bytes, 32)?),
                alter_head: LogPosition(read_le_u64(bytes, 40)?),
                alter_tail: LogPosition(read_le_u64(bytes, 48)?),
            },
        })
    }
}

/// Mutable state guarded by the inode lock.
///
/// Writers hold the lock exclusively for a whole call, so the log tail, the
/// extent index and the mapping tree always move together.
#[derive(Debug)]
pub(crate) struct InodeState {
    pub log: LogHead,
    pub index: ExtentIndex,
    pub size: u64,
    pub blocks: u64,
    /// Every live mapping of this inode.
    pub mappings: BTreeMap<MappingId, Mapping>,
    /// Shared writable mappings that need copy-on-write or protection upkeep.
    pub tracked: BTreeMap<MappingId, TrackedMapping>,
}

impl InodeState {
    pub fn new(log: LogHead) -> Self {
        Self {
            log,
            index: ExtentIndex::new(),
            size: 0,
            blocks: 0,
            mappings: BTreeMap::new(),
            tracked: BTreeMap::new(),
        }
    }

    /// A live shared writable mapping exists.
    pub fn has_shared_writable_mapping(&self) -> bool {
        self.mappings.values().any(Mapping::is_shared_writable)
    }

    /// `page` may be changing underneath the store through a live mapping.
    pub fn page_in_writable_mapping(&self, page: PageIndex) -> bool {
        self.mappings
            .values()
            .any(|m| m.is_shared_writable() && m.covers(page))
    }
}

#[derive(Debug)]
pub(crate) struct Inode {
    pub ino: InodeNumber,
    pub state: RwLock<InodeState>,
}

impl Inode {
    pub fn new(ino: InodeNumber, log: LogHead) -> Self {
        Self {
            ino,
            state: RwLock::new(InodeState::new(log)),
        }
    }
}

/// How a file was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Every write lands at end of file, read under the inode lock.
    pub append: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle {
    ino: InodeNumber,
    flags: OpenFlags,
}

impl FileHandle {
    pub(crate) fn new(ino: InodeNumber, flags: OpenFlags) -> Self {
        Self { ino, flags }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    #[must_use]
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> InodeRecord {
        InodeRecord {
            ino: InodeNumber(3),
            size: 10_000,
            blocks: 3,
            log: LogHead {
                head: LogPosition(8192),
                tail: LogPosition(8192 + 192),
                alter_head: LogPosition(12_288),
                alter_tail: LogPosition(12_288 + 192),
            },
        }
    }

    #[test]
    fn record_round_trip() {
        let rec = record();
        assert_eq!(InodeRecord::decode(&rec.encode()).unwrap(), rec);
    }

    #[test]
    fn empty_slot_rejected() {
        assert!(InodeRecord::decode(&[0_u8; INODE_RECORD_SIZE]).is_err());
    }

    #[test]
    fn torn_record_rejected() {
        let mut bytes = record().encode();
        bytes[8] ^= 0x80;
        assert!(matches!(
            InodeRecord::decode(&bytes),
            Err(ParseError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn writable_mapping_queries() {
        let mut state = InodeState::new(LogHead::default());
        let mapping = Mapping {
            id: MappingId(1),
            ino: InodeNumber(1),
            page_offset: PageIndex(2),
            page_count: 2,
            shared: true,
            writable: false,
        };
        state.mappings.insert(mapping.id, mapping);
        assert!(!state.has_shared_writable_mapping());

        let writable = Mapping {
            id: MappingId(2),
            writable: true,
            ..mapping
        };
        state.mappings.insert(writable.id, writable);
        assert!(state.has_shared_writable_mapping());
        assert!(state.page_in_writable_mapping(PageIndex(3)));
        assert!(!state.page_in_writable_mapping(PageIndex(4)));
    }
}
