//! Index roots page: which page is the root of each index.
//!
//! Layout:
//! - `[0..4]`  magic number
//! - `[4..8]`  number of records
//! - `[8..]`   `(index_id: u32, root_page_id: u32)` records

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::{PageId, PAGE_SIZE};
use byteorder::{ByteOrder, LittleEndian};

const INDEX_ROOTS_MAGIC: u32 = 0x494E_4458;
const INDEX_ROOTS_HEADER_SIZE: usize = 8;
const RECORD_SIZE: usize = 8;

/// Well-known logical page holding the index roots record. It is the first
/// page allocated in a fresh database file.
pub const INDEX_ROOTS_PAGE_ID: PageId = PageId(0);

/// Maximum number of indexes one file can hold.
pub const INDEX_ROOTS_CAPACITY: usize = (PAGE_SIZE - INDEX_ROOTS_HEADER_SIZE) / RECORD_SIZE;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRootsPage {
    /// `None` root means the index exists but its tree is empty
    records: Vec<(u32, Option<PageId>)>,
}

impl IndexRootsPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: &[u8; PAGE_SIZE]) -> StorageResult<Self> {
        let magic = LittleEndian::read_u32(&data[0..4]);
        if magic != INDEX_ROOTS_MAGIC {
            log::error!(
                "index roots page magic mismatch: expected {:#x}, found {:#x}",
                INDEX_ROOTS_MAGIC,
                magic
            );
            return Err(StorageError::Corrupted {
                what: "index roots page",
                detail: format!("bad magic {:#x}", magic),
            });
        }

        let count = LittleEndian::read_u32(&data[4..8]) as usize;
        if count > INDEX_ROOTS_CAPACITY {
            return Err(StorageError::Corrupted {
                what: "index roots page",
                detail: format!("record count {} exceeds capacity", count),
            });
        }

        let records = data[INDEX_ROOTS_HEADER_SIZE..INDEX_ROOTS_HEADER_SIZE + count * RECORD_SIZE]
            .chunks_exact(RECORD_SIZE)
            .map(|rec| {
                (
                    LittleEndian::read_u32(&rec[0..4]),
                    PageId::from_raw(LittleEndian::read_u32(&rec[4..8])),
                )
            })
            .collect();

        Ok(Self { records })
    }

    pub fn write_to(&self, data: &mut [u8; PAGE_SIZE]) {
        data.fill(0);
        LittleEndian::write_u32(&mut data[0..4], INDEX_ROOTS_MAGIC);
        LittleEndian::write_u32(&mut data[4..8], self.records.len() as u32);
        for (i, (index_id, root)) in self.records.iter().enumerate() {
            let offset = INDEX_ROOTS_HEADER_SIZE + i * RECORD_SIZE;
            LittleEndian::write_u32(&mut data[offset..offset + 4], *index_id);
            LittleEndian::write_u32(&mut data[offset + 4..offset + 8], PageId::to_raw(*root));
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn index_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.records.iter().map(|(id, _)| *id)
    }

    pub fn contains(&self, index_id: u32) -> bool {
        self.position(index_id).is_some()
    }

    /// Returns false if the index already has a record or the page is full.
    pub fn insert(&mut self, index_id: u32, root: Option<PageId>) -> bool {
        if self.contains(index_id) || self.records.len() >= INDEX_ROOTS_CAPACITY {
            return false;
        }
        self.records.push((index_id, root));
        true
    }

    /// Returns false if the index has no record.
    pub fn update(&mut self, index_id: u32, root: Option<PageId>) -> bool {
        match self.position(index_id) {
            Some(pos) => {
                self.records[pos].1 = root;
                true
            }
            None => false,
        }
    }

    pub fn delete(&mut self, index_id: u32) -> bool {
        match self.position(index_id) {
            Some(pos) => {
                self.records.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Root of the index, or None if it is unknown or empty.
    pub fn get_root_id(&self, index_id: u32) -> Option<PageId> {
        self.position(index_id).and_then(|pos| self.records[pos].1)
    }

    fn position(&self, index_id: u32) -> Option<usize> {
        self.records.iter().position(|(id, _)| *id == index_id)
    }
}
