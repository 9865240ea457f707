use crate::storage::PageId;
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;
use std::fmt;

/// Locator of a row: the heap page holding it and the slot within that page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowId {
    pub page_id: PageId,
    pub slot: u32,
}

impl RowId {
    /// Encoded width inside leaf pages.
    pub const SIZE: usize = 8;

    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            page_id: PageId(LittleEndian::read_u32(&bytes[0..4])),
            slot: LittleEndian::read_u32(&bytes[4..8]),
        }
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        LittleEndian::write_u32(&mut bytes[0..4], self.page_id.0);
        LittleEndian::write_u32(&mut bytes[4..8], self.slot);
    }
}

impl PartialOrd for RowId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RowId {
    fn cmp(&self, other: &Self) -> Ordering {
        // First compare by page_id, then by slot
        match self.page_id.cmp(&other.page_id) {
            Ordering::Equal => self.slot.cmp(&other.slot),
            other => other,
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot)
    }
}
