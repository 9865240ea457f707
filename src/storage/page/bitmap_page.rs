//! Free-space bitmap for one extent of data pages.
//!
//! Layout:
//! - `[0..4]`  number of allocated pages
//! - `[4..8]`  next likely free offset (== capacity when the extent is full)
//! - `[8..]`   one bit per data page, most significant bit first, 1 = allocated

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::PAGE_SIZE;
use byteorder::{ByteOrder, LittleEndian};

const BITMAP_HEADER_SIZE: usize = 8;
const BITMAP_BYTES: usize = PAGE_SIZE - BITMAP_HEADER_SIZE;

/// Number of data pages governed by a single bitmap page.
pub const BITMAP_CAPACITY: u32 = (BITMAP_BYTES * 8) as u32;

#[derive(Debug, Clone)]
pub struct BitmapPage {
    allocated: u32,
    next_free: u32,
    bytes: Vec<u8>,
}

impl Default for BitmapPage {
    fn default() -> Self {
        Self::new()
    }
}

impl BitmapPage {
    pub fn new() -> Self {
        Self {
            allocated: 0,
            next_free: 0,
            bytes: vec![0u8; BITMAP_BYTES],
        }
    }

    /// Decode a bitmap page. An all-zero page is a valid empty bitmap.
    pub fn from_data(data: &[u8; PAGE_SIZE]) -> StorageResult<Self> {
        let allocated = LittleEndian::read_u32(&data[0..4]);
        let next_free = LittleEndian::read_u32(&data[4..8]);
        let corrupted = |detail: String| StorageError::Corrupted {
            what: "bitmap page",
            detail,
        };
        if allocated > BITMAP_CAPACITY || next_free > BITMAP_CAPACITY {
            return Err(corrupted(format!(
                "allocated={} next_free={}",
                allocated, next_free
            )));
        }

        let bitmap = Self {
            allocated,
            next_free,
            bytes: data[BITMAP_HEADER_SIZE..].to_vec(),
        };

        let set_bits: u32 = bitmap.bytes.iter().map(|b| b.count_ones()).sum();
        if set_bits != allocated {
            return Err(corrupted(format!(
                "allocated={} but {} bits are set",
                allocated, set_bits
            )));
        }
        // The hint is either a clear bit or the full marker
        let hint_ok = if next_free == BITMAP_CAPACITY {
            bitmap.is_full()
        } else {
            !bitmap.bit(next_free)
        };
        if !hint_ok {
            return Err(corrupted(format!(
                "next_free={} is not a free slot (allocated={})",
                next_free, allocated
            )));
        }

        Ok(bitmap)
    }

    pub fn write_to(&self, data: &mut [u8; PAGE_SIZE]) {
        LittleEndian::write_u32(&mut data[0..4], self.allocated);
        LittleEndian::write_u32(&mut data[4..8], self.next_free);
        data[BITMAP_HEADER_SIZE..].copy_from_slice(&self.bytes);
    }

    pub fn allocated_count(&self) -> u32 {
        self.allocated
    }

    pub fn is_full(&self) -> bool {
        self.allocated == BITMAP_CAPACITY
    }

    /// Take the hinted free slot, then move the hint forward to the next clear bit.
    pub fn allocate_page(&mut self) -> Option<u32> {
        if self.is_full() {
            return None;
        }

        let offset = if self.is_page_free(self.next_free) {
            self.next_free
        } else {
            (0..BITMAP_CAPACITY).find(|&i| !self.bit(i))?
        };
        self.set_bit(offset, true);
        self.allocated += 1;

        self.next_free = ((offset + 1)..BITMAP_CAPACITY)
            .find(|&i| !self.bit(i))
            .unwrap_or(BITMAP_CAPACITY);

        Some(offset)
    }

    /// Returns false if the slot was already free.
    pub fn deallocate_page(&mut self, offset: u32) -> bool {
        if offset >= BITMAP_CAPACITY || self.is_page_free(offset) {
            return false;
        }

        self.set_bit(offset, false);
        self.allocated -= 1;
        if offset < self.next_free {
            self.next_free = offset;
        }
        true
    }

    pub fn is_page_free(&self, offset: u32) -> bool {
        offset < BITMAP_CAPACITY && !self.bit(offset)
    }

    fn bit(&self, offset: u32) -> bool {
        let byte = self.bytes[(offset / 8) as usize];
        byte & (0x80 >> (offset % 8)) != 0
    }

    fn set_bit(&mut self, offset: u32, value: bool) {
        let byte = &mut self.bytes[(offset / 8) as usize];
        let mask = 0x80 >> (offset % 8);
        if value {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}
