//! Header shared by B+ tree node pages.
//!
//! Layout (24 bytes):
//! - `[0]`      page type (1 = internal, 2 = leaf)
//! - `[1]`      reserved
//! - `[2..4]`   key size
//! - `[4..8]`   page id
//! - `[8..12]`  parent page id
//! - `[12..14]` max size
//! - `[14..16]` current size
//! - `[16..20]` next leaf page id (leaf only)
//! - `[20..24]` reserved
//!
//! Packed `(key, value)` pairs follow the header.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{BTreeInternalPage, BTreeLeafPage, PageId};
use crate::storage::PAGE_SIZE;
use byteorder::{ByteOrder, LittleEndian};

pub const BTREE_HEADER_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BTreePageType {
    Internal = 1,
    Leaf = 2,
}

impl BTreePageType {
    pub fn from_data(data: &[u8; PAGE_SIZE]) -> StorageResult<Self> {
        match data[0] {
            1 => Ok(Self::Internal),
            2 => Ok(Self::Leaf),
            other => Err(StorageError::Corrupted {
                what: "b+ tree page",
                detail: format!("unknown page type {}", other),
            }),
        }
    }
}

/// Decoded node header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BTreePageHeader {
    pub page_type: BTreePageType,
    pub key_size: usize,
    pub page_id: PageId,
    pub parent_page_id: Option<PageId>,
    pub max_size: usize,
    pub size: usize,
    pub next_page_id: Option<PageId>,
}

impl BTreePageHeader {
    /// Decode and sanity-check a header against the entry width of its kind.
    pub fn read(data: &[u8; PAGE_SIZE], value_size: usize) -> StorageResult<Self> {
        let page_type = BTreePageType::from_data(data)?;
        let header = Self {
            page_type,
            key_size: LittleEndian::read_u16(&data[2..4]) as usize,
            page_id: PageId(LittleEndian::read_u32(&data[4..8])),
            parent_page_id: PageId::from_raw(LittleEndian::read_u32(&data[8..12])),
            max_size: LittleEndian::read_u16(&data[12..14]) as usize,
            size: LittleEndian::read_u16(&data[14..16]) as usize,
            next_page_id: PageId::from_raw(LittleEndian::read_u32(&data[16..20])),
        };

        let pair_size = header.key_size + value_size;
        if header.key_size == 0
            || header.size > header.max_size + 1
            || BTREE_HEADER_SIZE + header.size * pair_size > PAGE_SIZE
        {
            return Err(StorageError::Corrupted {
                what: "b+ tree page",
                detail: format!(
                    "page {} key_size={} size={} max_size={}",
                    header.page_id, header.key_size, header.size, header.max_size
                ),
            });
        }
        Ok(header)
    }

    pub fn write(&self, data: &mut [u8; PAGE_SIZE]) {
        data[0] = self.page_type as u8;
        data[1] = 0;
        LittleEndian::write_u16(&mut data[2..4], self.key_size as u16);
        LittleEndian::write_u32(&mut data[4..8], self.page_id.0);
        LittleEndian::write_u32(&mut data[8..12], PageId::to_raw(self.parent_page_id));
        LittleEndian::write_u16(&mut data[12..14], self.max_size as u16);
        LittleEndian::write_u16(&mut data[14..16], self.size as u16);
        LittleEndian::write_u32(&mut data[16..20], PageId::to_raw(self.next_page_id));
        data[20..24].fill(0);
    }
}

/// Largest node size whose transient overflow state (max + 1 pairs) still
/// fits one page. Zero when not even two pairs fit.
pub fn max_pairs(key_size: usize, value_size: usize) -> usize {
    ((PAGE_SIZE - BTREE_HEADER_SIZE) / (key_size + value_size)).saturating_sub(1)
}

/// Minimum occupancy of a non-root node.
pub fn min_size_for(max_size: usize) -> usize {
    max_size.div_ceil(2)
}

/// A node page decoded into its logical form.
#[derive(Debug, Clone)]
pub enum BTreeNode {
    Internal(BTreeInternalPage),
    Leaf(BTreeLeafPage),
}

impl BTreeNode {
    pub fn from_data(data: &[u8; PAGE_SIZE]) -> StorageResult<Self> {
        match BTreePageType::from_data(data)? {
            BTreePageType::Internal => Ok(Self::Internal(BTreeInternalPage::from_data(data)?)),
            BTreePageType::Leaf => Ok(Self::Leaf(BTreeLeafPage::from_data(data)?)),
        }
    }

    pub fn write_to(&self, data: &mut [u8; PAGE_SIZE]) {
        match self {
            Self::Internal(node) => node.write_to(data),
            Self::Leaf(node) => node.write_to(data),
        }
    }

    pub fn page_id(&self) -> PageId {
        match self {
            Self::Internal(node) => node.page_id(),
            Self::Leaf(node) => node.page_id(),
        }
    }

    pub fn parent_page_id(&self) -> Option<PageId> {
        match self {
            Self::Internal(node) => node.parent_page_id(),
            Self::Leaf(node) => node.parent_page_id(),
        }
    }

    pub fn set_parent_page_id(&mut self, parent: Option<PageId>) {
        match self {
            Self::Internal(node) => node.set_parent_page_id(parent),
            Self::Leaf(node) => node.set_parent_page_id(parent),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_page_id().is_none()
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    pub fn size(&self) -> usize {
        match self {
            Self::Internal(node) => node.size(),
            Self::Leaf(node) => node.size(),
        }
    }

    pub fn key_size(&self) -> usize {
        match self {
            Self::Internal(node) => node.key_size(),
            Self::Leaf(node) => node.key_size(),
        }
    }

    pub fn max_size(&self) -> usize {
        match self {
            Self::Internal(node) => node.max_size(),
            Self::Leaf(node) => node.max_size(),
        }
    }

    pub fn min_size(&self) -> usize {
        min_size_for(self.max_size())
    }
}
