//! Disk file meta page: the only persisted allocator state.
//!
//! Layout:
//! - `[0..4]`   magic number
//! - `[4..8]`   total allocated data pages
//! - `[8..12]`  number of extents holding at least one page
//! - `[12..]`   used-page count of each extent, one u32 per extent

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::bitmap_page::BITMAP_CAPACITY;
use crate::storage::PAGE_SIZE;
use byteorder::{ByteOrder, LittleEndian};

const DISK_META_MAGIC: u32 = 0x5041_4744;
const DISK_META_HEADER_SIZE: usize = 12;

/// Maximum number of extents a single file can track.
pub const MAX_EXTENTS: usize = (PAGE_SIZE - DISK_META_HEADER_SIZE) / 4;

/// Hard ceiling on allocated logical pages.
pub const MAX_VALID_PAGES: u64 = MAX_EXTENTS as u64 * BITMAP_CAPACITY as u64;

#[derive(Debug, Clone)]
pub struct DiskFileMetaPage {
    num_allocated_pages: u32,
    num_extents: u32,
    extent_used_pages: Vec<u32>,
}

impl Default for DiskFileMetaPage {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskFileMetaPage {
    pub fn new() -> Self {
        Self {
            num_allocated_pages: 0,
            num_extents: 0,
            extent_used_pages: vec![0; MAX_EXTENTS],
        }
    }

    pub fn from_data(data: &[u8; PAGE_SIZE]) -> StorageResult<Self> {
        let magic = LittleEndian::read_u32(&data[0..4]);
        if magic != DISK_META_MAGIC {
            log::error!(
                "disk meta page magic mismatch: expected {:#x}, found {:#x}",
                DISK_META_MAGIC,
                magic
            );
            return Err(StorageError::Corrupted {
                what: "disk meta page",
                detail: format!("bad magic {:#x}", magic),
            });
        }

        let extent_used_pages = data[DISK_META_HEADER_SIZE..DISK_META_HEADER_SIZE + MAX_EXTENTS * 4]
            .chunks_exact(4)
            .map(LittleEndian::read_u32)
            .collect();

        Ok(Self {
            num_allocated_pages: LittleEndian::read_u32(&data[4..8]),
            num_extents: LittleEndian::read_u32(&data[8..12]),
            extent_used_pages,
        })
    }

    pub fn write_to(&self, data: &mut [u8; PAGE_SIZE]) {
        LittleEndian::write_u32(&mut data[0..4], DISK_META_MAGIC);
        LittleEndian::write_u32(&mut data[4..8], self.num_allocated_pages);
        LittleEndian::write_u32(&mut data[8..12], self.num_extents);
        for (i, used) in self.extent_used_pages.iter().enumerate() {
            let offset = DISK_META_HEADER_SIZE + i * 4;
            LittleEndian::write_u32(&mut data[offset..offset + 4], *used);
        }
    }

    pub fn num_allocated_pages(&self) -> u32 {
        self.num_allocated_pages
    }

    pub fn num_extents(&self) -> u32 {
        self.num_extents
    }

    pub fn extent_used_pages(&self, extent: usize) -> u32 {
        self.extent_used_pages.get(extent).copied().unwrap_or(0)
    }

    /// First extent, in ascending order, with room for another page.
    pub fn first_non_full_extent(&self) -> Option<usize> {
        self.extent_used_pages
            .iter()
            .position(|&used| used < BITMAP_CAPACITY)
    }

    pub fn record_allocation(&mut self, extent: usize) {
        self.num_allocated_pages += 1;
        self.extent_used_pages[extent] += 1;
        if self.extent_used_pages[extent] == 1 {
            self.num_extents += 1;
        }
    }

    pub fn record_deallocation(&mut self, extent: usize) {
        self.num_allocated_pages = self.num_allocated_pages.saturating_sub(1);
        let used = &mut self.extent_used_pages[extent];
        *used = used.saturating_sub(1);
        if *used == 0 {
            self.num_extents = self.num_extents.saturating_sub(1);
        }
    }
}
