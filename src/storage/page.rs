pub mod bitmap_page;
pub mod btree_internal_page;
pub mod btree_leaf_page;
pub mod btree_page;
pub mod disk_meta_page;
pub mod index_roots_page;

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u32);

impl PageId {
    /// On-disk encoding of "no page".
    pub const INVALID_RAW: u32 = u32::MAX;

    pub fn to_raw(page_id: Option<PageId>) -> u32 {
        page_id.map(|p| p.0).unwrap_or(Self::INVALID_RAW)
    }

    pub fn from_raw(raw: u32) -> Option<PageId> {
        if raw == Self::INVALID_RAW {
            None
        } else {
            Some(PageId(raw))
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub use bitmap_page::BitmapPage;
pub use btree_internal_page::BTreeInternalPage;
pub use btree_leaf_page::BTreeLeafPage;
pub use btree_page::{BTreeNode, BTreePageType};
pub use disk_meta_page::DiskFileMetaPage;
pub use index_roots_page::{IndexRootsPage, INDEX_ROOTS_PAGE_ID};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_round_trip() {
        assert_eq!(PageId::to_raw(None), u32::MAX);
        assert_eq!(PageId::from_raw(u32::MAX), None);
        assert_eq!(PageId::from_raw(7), Some(PageId(7)));
        assert_eq!(PageId::to_raw(Some(PageId(0))), 0);
    }
}
