#![forbid(unsafe_code)]

use efs_block::{MemPmemDevice, PmemDevice};
use efs_core::{FileHandle, Mapping, OpenFlags, Resolved, Store, StoreConfig};
use efs_error::{EfsError, Result};
use efs_journal::LogRecord;
use efs_types::{BlockNumber, BlockSize, InodeNumber, MappingId, PageIndex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const BS: usize = 4096;

/// Memory device whose next write can be made to fail.
#[derive(Debug)]
struct FailingDevice {
    inner: MemPmemDevice,
    fail_next_write: AtomicBool,
}

impl FailingDevice {
    fn new(blocks: u64) -> Self {
        Self {
            inner: MemPmemDevice::new(BlockSize::default(), blocks),
            fail_next_write: AtomicBool::new(false),
        }
    }

    fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }
}

impl PmemDevice for FailingDevice {
    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn block_size(&self) -> BlockSize {
        self.inner.block_size()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(EfsError::Io(std::io::Error::other("injected write failure")));
        }
        self.inner.write_all_at(offset, buf)
    }

    fn persist(&self, offset: u64, len: u64) -> Result<()> {
        self.inner.persist(offset, len)
    }
}

fn setup(config: StoreConfig) -> (Arc<MemPmemDevice>, Store, InodeNumber, FileHandle) {
    let dev = Arc::new(MemPmemDevice::new(BlockSize::default(), 128));
    let store = Store::format(Arc::clone(&dev) as Arc<dyn PmemDevice>, config).unwrap();
    let ino = store.create_file().unwrap();
    let fh = store.open(ino, OpenFlags::default()).unwrap();
    (dev, store, ino, fh)
}

fn shared_writable(ino: InodeNumber, id: u64, pages: u64) -> Mapping {
    Mapping {
        id: MappingId(id),
        ino,
        page_offset: PageIndex(0),
        page_count: pages,
        shared: true,
        writable: true,
    }
}

fn checksummed() -> StoreConfig {
    StoreConfig {
        data_checksum: true,
        ..StoreConfig::default()
    }
}

fn mapped_block(resolved: Resolved) -> BlockNumber {
    match resolved {
        Resolved::Mapped(run) => run.block,
        Resolved::Hole { pages } => panic!("unexpected hole of {pages} pages"),
    }
}

fn read_at(store: &Store, fh: &FileHandle, pos: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0_u8; len];
    let n = store.read(fh, &mut buf, pos).unwrap();
    buf.truncate(n);
    buf
}

#[test]
fn copy_on_write_is_blocked_while_a_shared_writable_mapping_is_live() {
    let (_dev, store, ino, fh) = setup(checksummed());
    store.write(&fh, &[1_u8; 2 * BS], 0).unwrap();
    let mapping = shared_writable(ino, 1, 2);
    store.on_map(mapping).unwrap();

    assert!(matches!(
        store.write(&fh, b"blocked", 0),
        Err(EfsError::WriteBlockedByMapping)
    ));

    store.on_unmap(&mapping).unwrap();
    assert_eq!(store.write(&fh, b"ok", 0).unwrap(), 2);
}

#[test]
fn read_only_and_private_mappings_do_not_block_writes() {
    let (_dev, store, ino, fh) = setup(checksummed());
    store.write(&fh, &[1_u8; BS], 0).unwrap();
    store
        .on_map(Mapping {
            writable: false,
            ..shared_writable(ino, 1, 1)
        })
        .unwrap();
    store
        .on_map(Mapping {
            shared: false,
            ..shared_writable(ino, 2, 1)
        })
        .unwrap();

    assert_eq!(store.write(&fh, b"fine", 0).unwrap(), 4);
    assert!(store.mmap_registry().is_empty());
}

#[test]
fn tracked_mapping_logs_a_record_and_registers_the_inode() {
    let (_dev, store, ino, fh) = setup(checksummed());
    store.write(&fh, &[1_u8; BS], 0).unwrap();
    let mapping = shared_writable(ino, 5, 1);
    store.on_map(mapping).unwrap();

    assert!(store.mmap_registry().contains(ino));
    let records = store.entries(ino).unwrap();
    match records.last().map(|(_, r)| r) {
        Some(LogRecord::MmapWrite(entry)) => {
            assert_eq!(entry.pgoff, PageIndex(0));
            assert_eq!(entry.num_pages, 1);
            assert!(!entry.invalid);
        }
        other => panic!("expected an mmap record, got {other:?}"),
    }

    // A second mapping of the same inode keeps one registry entry.
    let second = shared_writable(ino, 6, 1);
    store.on_map(second).unwrap();
    assert_eq!(store.mmap_registry().len(), 1);

    store.on_unmap(&mapping).unwrap();
    assert!(store.mmap_registry().contains(ino));
    store.on_unmap(&second).unwrap();
    assert!(store.mmap_registry().is_empty());

    let invalidated = store
        .entries(ino)
        .unwrap()
        .into_iter()
        .filter(|(_, r)| matches!(r, LogRecord::MmapWrite(e) if e.invalid))
        .count();
    assert_eq!(invalidated, 2);
}

#[test]
fn stores_through_a_mapping_skip_verification_until_unmap() {
    let (dev, store, ino, fh) = setup(checksummed());
    store.write(&fh, &[7_u8; BS], 0).unwrap();
    let mapping = shared_writable(ino, 1, 1);
    store.on_map(mapping).unwrap();

    let block = mapped_block(store.on_fault(&mapping, PageIndex(0), true).unwrap());
    // Same epoch: the existing block is handed out, nothing is allocated.
    assert_eq!(store.stats().fault_allocations, 0);
    dev.write_all_at(block.0 * BS as u64, b"mapped!!").unwrap();

    assert_eq!(read_at(&store, &fh, 0, 8), b"mapped!!");

    store.on_unmap(&mapping).unwrap();
    // Protection was recomputed over the mapped bytes.
    assert_eq!(read_at(&store, &fh, 0, 8), b"mapped!!");
    assert_eq!(read_at(&store, &fh, 8, 8), vec![7_u8; 8]);
    assert_eq!(store.stats().corruption_detected, 0);
}

#[test]
fn refresh_pass_reprotects_live_mappings() {
    let (dev, store, ino, fh) = setup(checksummed());
    store.write(&fh, &[3_u8; 2 * BS], 0).unwrap();
    let mapping = shared_writable(ino, 1, 2);
    store.on_map(mapping).unwrap();
    let block = mapped_block(store.on_fault(&mapping, PageIndex(1), true).unwrap());
    dev.write_all_at(block.0 * BS as u64 + 100, b"xyz").unwrap();

    assert_eq!(store.refresh_mapped_protection().unwrap(), 2);

    // With the mapping gone the refreshed checksums must hold.
    store.on_unmap(&mapping).unwrap();
    assert_eq!(read_at(&store, &fh, BS as u64 + 100, 3), b"xyz");
    assert_eq!(store.refresh_mapped_protection().unwrap(), 0);
}

#[test]
fn fault_validation() {
    let (_dev, store, ino, fh) = setup(StoreConfig::default());
    store.write(&fh, b"tail", 2 * BS as u64).unwrap();
    let mapping = shared_writable(ino, 1, 4);

    assert!(matches!(
        store.on_fault(&mapping, PageIndex(0), false),
        Err(EfsError::NotFound(_))
    ));
    store.on_map(mapping).unwrap();

    // At or beyond end of file.
    assert!(matches!(
        store.on_fault(&mapping, PageIndex(3), false),
        Err(EfsError::InvalidArgument(_))
    ));
    // Outside the mapping.
    assert!(matches!(
        store.on_fault(&mapping, PageIndex(4), false),
        Err(EfsError::InvalidArgument(_))
    ));
    // Read fault on a hole inside the file.
    assert_eq!(
        store.on_fault(&mapping, PageIndex(0), false).unwrap(),
        Resolved::Hole { pages: 1 }
    );

    let read_only = Mapping {
        id: MappingId(2),
        writable: false,
        ..mapping
    };
    store.on_map(read_only).unwrap();
    assert!(matches!(
        store.on_fault(&read_only, PageIndex(0), true),
        Err(EfsError::InvalidArgument(_))
    ));

    assert!(matches!(
        store.on_unmap(&Mapping {
            id: MappingId(99),
            ..mapping
        }),
        Err(EfsError::NotFound(_))
    ));
    assert!(matches!(
        store.on_map(Mapping {
            page_count: 0,
            ..mapping
        }),
        Err(EfsError::InvalidArgument(_))
    ));
}

#[test]
fn write_fault_on_a_hole_allocates_a_protected_zero_page() {
    let (_dev, store, ino, fh) = setup(checksummed());
    store.write(&fh, b"end", 2 * BS as u64).unwrap();
    let private = Mapping {
        shared: false,
        ..shared_writable(ino, 1, 3)
    };
    store.on_map(private).unwrap();

    let block = mapped_block(store.on_fault(&private, PageIndex(1), true).unwrap());
    assert_eq!(store.stats().fault_allocations, 1);
    assert_eq!(
        mapped_block(store.resolve(ino, PageIndex(1), 1, false).unwrap()),
        block
    );
    // Verified read of the zeroed page.
    assert_eq!(read_at(&store, &fh, BS as u64, BS), vec![0_u8; BS]);
}

#[test]
fn write_fault_on_an_old_epoch_copies_contents() {
    let (_dev, store, ino, fh) = setup(checksummed());
    store.write(&fh, &[0xAB_u8; BS], 0).unwrap();
    let old = mapped_block(store.resolve(ino, PageIndex(0), 1, false).unwrap());
    let mapping = Mapping {
        shared: false,
        ..shared_writable(ino, 1, 1)
    };
    store.on_map(mapping).unwrap();

    store.advance_epoch();
    let new = mapped_block(store.on_fault(&mapping, PageIndex(0), true).unwrap());

    assert_ne!(new, old);
    assert_eq!(read_at(&store, &fh, 0, BS), vec![0xAB_u8; BS]);
    assert_eq!(store.stats().freed_blocks, 1);
}

#[test]
fn restore_after_fault_moves_the_page_to_a_fresh_block() {
    let config = StoreConfig {
        mmap_cow: true,
        ..StoreConfig::default()
    };
    let (_dev, store, ino, fh) = setup(config);
    store.write(&fh, &[0x42_u8; BS], 0).unwrap();
    let old = mapped_block(store.resolve(ino, PageIndex(0), 1, false).unwrap());
    let free_before = store.free_blocks();

    let mapping = shared_writable(ino, 1, 1);
    store.on_map(mapping).unwrap();
    // Tracked without protection: no log record.
    assert!(store.mmap_registry().contains(ino));
    assert_eq!(store.entries(ino).unwrap().len(), 1);

    let new = store.on_restore_after_fault(&mapping, PageIndex(0)).unwrap();

    assert_ne!(new, old);
    assert_eq!(
        mapped_block(store.resolve(ino, PageIndex(0), 1, false).unwrap()),
        new
    );
    assert_eq!(read_at(&store, &fh, 0, BS), vec![0x42_u8; BS]);
    assert_eq!(store.free_blocks(), free_before);
    let stats = store.stats();
    assert_eq!(stats.mmap_cow_pages, 1);
    assert_eq!(stats.dead_entries, 1);
    assert!(store.rebuild_index(ino).unwrap().matches_live);
}

#[test]
fn restore_after_fault_requires_mmap_cow() {
    let (_dev, store, ino, fh) = setup(checksummed());
    store.write(&fh, &[1_u8; BS], 0).unwrap();
    let mapping = shared_writable(ino, 1, 1);
    store.on_map(mapping).unwrap();

    assert!(matches!(
        store.on_restore_after_fault(&mapping, PageIndex(0)),
        Err(EfsError::InvalidArgument(_))
    ));
}

#[test]
fn failed_unmap_leaves_the_mapping_tracked_for_a_retry() {
    let dev = Arc::new(FailingDevice::new(128));
    let store = Store::format(Arc::clone(&dev) as Arc<dyn PmemDevice>, checksummed()).unwrap();
    let ino = store.create_file().unwrap();
    let fh = store.open(ino, OpenFlags::default()).unwrap();
    store.write(&fh, &[4_u8; BS], 0).unwrap();
    let mapping = shared_writable(ino, 1, 1);
    store.on_map(mapping).unwrap();
    let block = mapped_block(store.on_fault(&mapping, PageIndex(0), true).unwrap());
    dev.write_all_at(block.0 * BS as u64, b"via map").unwrap();

    dev.fail_next_write();
    assert!(matches!(store.on_unmap(&mapping), Err(EfsError::Io(_))));

    // Still live and tracked: copy-on-write stays blocked and reads of the
    // stale range still skip verification.
    assert!(store.mmap_registry().contains(ino));
    assert!(matches!(
        store.write(&fh, b"x", 0),
        Err(EfsError::WriteBlockedByMapping)
    ));
    assert_eq!(read_at(&store, &fh, 0, 7), b"via map");

    store.on_unmap(&mapping).unwrap();
    assert!(store.mmap_registry().is_empty());
    assert!(store
        .entries(ino)
        .unwrap()
        .iter()
        .any(|(_, r)| matches!(r, LogRecord::MmapWrite(e) if e.invalid)));
    assert_eq!(read_at(&store, &fh, 0, 7), b"via map");
    assert_eq!(store.stats().corruption_detected, 0);
    assert!(matches!(
        store.on_unmap(&mapping),
        Err(EfsError::NotFound(_))
    ));
}
