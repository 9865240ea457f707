use crate::access::btree::KeyManager;
use crate::access::RowId;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::btree_page::{
    max_pairs, min_size_for, BTreePageHeader, BTreePageType, BTREE_HEADER_SIZE,
};
use crate::storage::{PageId, PAGE_SIZE};
use std::cmp::Ordering;

/// Leaf node: sorted, unique `(key, RowId)` pairs plus a link to the next
/// leaf in key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BTreeLeafPage {
    page_id: PageId,
    parent_page_id: Option<PageId>,
    next_page_id: Option<PageId>,
    key_size: usize,
    max_size: usize,
    entries: Vec<(Vec<u8>, RowId)>,
}

impl BTreeLeafPage {
    pub fn new(
        page_id: PageId,
        parent_page_id: Option<PageId>,
        key_size: usize,
        max_size: usize,
    ) -> Self {
        Self {
            page_id,
            parent_page_id,
            next_page_id: None,
            key_size,
            max_size,
            entries: Vec::with_capacity(max_size + 1),
        }
    }

    /// Largest leaf size that fits a page for the given key width.
    pub fn default_max_size(key_size: usize) -> usize {
        max_pairs(key_size, RowId::SIZE)
    }

    pub fn from_data(data: &[u8; PAGE_SIZE]) -> StorageResult<Self> {
        let header = BTreePageHeader::read(data, RowId::SIZE)?;
        if header.page_type != BTreePageType::Leaf {
            return Err(StorageError::Corrupted {
                what: "b+ tree leaf page",
                detail: format!("page {} is not a leaf", header.page_id),
            });
        }

        let pair_size = header.key_size + RowId::SIZE;
        let entries = data[BTREE_HEADER_SIZE..BTREE_HEADER_SIZE + header.size * pair_size]
            .chunks_exact(pair_size)
            .map(|pair| {
                let (key, value) = pair.split_at(header.key_size);
                (key.to_vec(), RowId::from_bytes(value))
            })
            .collect();

        Ok(Self {
            page_id: header.page_id,
            parent_page_id: header.parent_page_id,
            next_page_id: header.next_page_id,
            key_size: header.key_size,
            max_size: header.max_size,
            entries,
        })
    }

    pub fn write_to(&self, data: &mut [u8; PAGE_SIZE]) {
        BTreePageHeader {
            page_type: BTreePageType::Leaf,
            key_size: self.key_size,
            page_id: self.page_id,
            parent_page_id: self.parent_page_id,
            max_size: self.max_size,
            size: self.entries.len(),
            next_page_id: self.next_page_id,
        }
        .write(data);

        let pair_size = self.key_size + RowId::SIZE;
        let mut offset = BTREE_HEADER_SIZE;
        for (key, value) in &self.entries {
            data[offset..offset + self.key_size].copy_from_slice(key);
            value.write_to(&mut data[offset + self.key_size..offset + pair_size]);
            offset += pair_size;
        }
        data[offset..].fill(0);
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn parent_page_id(&self) -> Option<PageId> {
        self.parent_page_id
    }

    pub fn set_parent_page_id(&mut self, parent: Option<PageId>) {
        self.parent_page_id = parent;
    }

    pub fn next_page_id(&self) -> Option<PageId> {
        self.next_page_id
    }

    pub fn set_next_page_id(&mut self, next: Option<PageId>) {
        self.next_page_id = next;
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn key_size(&self) -> usize {
        self.key_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn min_size(&self) -> usize {
        min_size_for(self.max_size)
    }

    pub fn key_at(&self, index: usize) -> &[u8] {
        &self.entries[index].0
    }

    pub fn value_at(&self, index: usize) -> RowId {
        self.entries[index].1
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.entries.first().map(|(k, _)| k.as_slice())
    }

    pub fn entries(&self) -> &[(Vec<u8>, RowId)] {
        &self.entries
    }

    /// Index of the first key >= `key`, or `size()` if every key is smaller.
    pub fn key_index(&self, key: &[u8], km: &KeyManager) -> usize {
        self.entries
            .partition_point(|(k, _)| km.compare(k, key) == Ordering::Less)
    }

    pub fn lookup(&self, key: &[u8], km: &KeyManager) -> Option<RowId> {
        let index = self.key_index(key, km);
        self.entries
            .get(index)
            .filter(|(k, _)| km.compare(k, key) == Ordering::Equal)
            .map(|(_, v)| *v)
    }

    /// Insert in sorted position. Returns false if the key is already present.
    pub fn insert(&mut self, key: &[u8], value: RowId, km: &KeyManager) -> bool {
        let index = self.key_index(key, km);
        if let Some((existing, _)) = self.entries.get(index) {
            if km.compare(existing, key) == Ordering::Equal {
                return false;
            }
        }
        self.entries.insert(index, (key.to_vec(), value));
        true
    }

    /// Returns false if the key is absent.
    pub fn remove(&mut self, key: &[u8], km: &KeyManager) -> bool {
        let index = self.key_index(key, km);
        match self.entries.get(index) {
            Some((existing, _)) if km.compare(existing, key) == Ordering::Equal => {
                self.entries.remove(index);
                true
            }
            _ => false,
        }
    }

    /// Split: move the upper half of the entries to the end of `recipient`.
    /// This node keeps the larger half when the size is odd.
    pub fn move_half_to(&mut self, recipient: &mut BTreeLeafPage) {
        let split_at = self.entries.len().div_ceil(2);
        recipient.entries.extend(self.entries.drain(split_at..));
    }

    /// Merge every entry into `recipient`, the left neighbour, which also
    /// takes over this node's next-leaf link.
    pub fn move_all_to(&mut self, recipient: &mut BTreeLeafPage) {
        recipient.entries.append(&mut self.entries);
        recipient.next_page_id = self.next_page_id;
    }

    /// Borrow from a right neighbour: this node's first entry becomes the
    /// last entry of `recipient`.
    pub fn move_first_to_end_of(&mut self, recipient: &mut BTreeLeafPage) {
        if !self.entries.is_empty() {
            let entry = self.entries.remove(0);
            recipient.entries.push(entry);
        }
    }

    /// Borrow from a left neighbour: this node's last entry becomes the first
    /// entry of `recipient`.
    pub fn move_last_to_front_of(&mut self, recipient: &mut BTreeLeafPage) {
        if let Some(entry) = self.entries.pop() {
            recipient.entries.insert(0, entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::BTreeInternalPage;

    fn key(v: i64) -> Vec<u8> {
        KeyManager::encode_i64(v)
    }

    fn rid(v: u32) -> RowId {
        RowId::new(PageId(v), v)
    }

    fn leaf_with(km: &KeyManager, keys: &[i64]) -> BTreeLeafPage {
        let mut leaf = BTreeLeafPage::new(PageId(1), None, km.key_size(), 8);
        for &k in keys {
            assert!(leaf.insert(&key(k), rid(k as u32), km));
        }
        leaf
    }

    #[test]
    fn test_insert_keeps_order() {
        let km = KeyManager::i64();
        let leaf = leaf_with(&km, &[30, 10, 20, -5]);

        let keys: Vec<i64> = leaf
            .entries()
            .iter()
            .map(|(k, _)| KeyManager::decode_i64(k))
            .collect();
        assert_eq!(keys, vec![-5, 10, 20, 30]);
        assert_eq!(leaf.size(), 4);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let km = KeyManager::i64();
        let mut leaf = leaf_with(&km, &[1, 2]);

        assert!(!leaf.insert(&key(2), rid(99), &km));
        assert_eq!(leaf.size(), 2);
        assert_eq!(leaf.lookup(&key(2), &km), Some(rid(2)));
    }

    #[test]
    fn test_key_index_is_lower_bound() {
        let km = KeyManager::i64();
        let leaf = leaf_with(&km, &[10, 20, 30]);

        assert_eq!(leaf.key_index(&key(5), &km), 0);
        assert_eq!(leaf.key_index(&key(10), &km), 0);
        assert_eq!(leaf.key_index(&key(15), &km), 1);
        assert_eq!(leaf.key_index(&key(30), &km), 2);
        assert_eq!(leaf.key_index(&key(31), &km), 3);
    }

    #[test]
    fn test_lookup_and_remove() {
        let km = KeyManager::i64();
        let mut leaf = leaf_with(&km, &[1, 3, 5]);

        assert_eq!(leaf.lookup(&key(3), &km), Some(rid(3)));
        assert_eq!(leaf.lookup(&key(4), &km), None);

        assert!(leaf.remove(&key(3), &km));
        assert!(!leaf.remove(&key(3), &km));
        assert!(!leaf.remove(&key(100), &km));
        assert_eq!(leaf.lookup(&key(3), &km), None);
        assert_eq!(leaf.size(), 2);
    }

    #[test]
    fn test_move_half_preserves_entries() {
        let km = KeyManager::i64();
        let mut left = leaf_with(&km, &[1, 2, 3, 4, 5]);
        let mut right = BTreeLeafPage::new(PageId(2), None, 8, 8);

        left.move_half_to(&mut right);

        assert_eq!(left.size(), 3);
        assert_eq!(right.size(), 2);
        assert_eq!(KeyManager::decode_i64(right.key_at(0)), 4);
        assert_eq!(left.size() + right.size(), 5);
    }

    #[test]
    fn test_move_all_takes_next_link() {
        let km = KeyManager::i64();
        let mut left = leaf_with(&km, &[1, 2]);
        let mut right = BTreeLeafPage::new(PageId(2), None, 8, 8);
        right.insert(&key(7), rid(7), &km);
        right.set_next_page_id(Some(PageId(9)));
        left.set_next_page_id(Some(PageId(2)));

        right.move_all_to(&mut left);

        assert_eq!(left.size(), 3);
        assert_eq!(right.size(), 0);
        assert_eq!(left.next_page_id(), Some(PageId(9)));
    }

    #[test]
    fn test_redistribute() {
        let km = KeyManager::i64();
        let mut left = leaf_with(&km, &[1, 2, 3]);
        let mut right = BTreeLeafPage::new(PageId(2), None, 8, 8);
        right.insert(&key(10), rid(10), &km);

        left.move_last_to_front_of(&mut right);
        assert_eq!(KeyManager::decode_i64(right.key_at(0)), 3);
        assert_eq!(left.size(), 2);

        right.move_first_to_end_of(&mut left);
        assert_eq!(KeyManager::decode_i64(left.key_at(2)), 3);
        assert_eq!(KeyManager::decode_i64(right.key_at(0)), 10);
    }

    #[test]
    fn test_encode_decode() -> StorageResult<()> {
        let km = KeyManager::i64();
        let mut leaf = leaf_with(&km, &[4, 8, 15, 16, 23, 42]);
        leaf.set_parent_page_id(Some(PageId(77)));
        leaf.set_next_page_id(Some(PageId(78)));

        let mut data = [0xFFu8; PAGE_SIZE];
        leaf.write_to(&mut data);
        let decoded = BTreeLeafPage::from_data(&data)?;

        assert_eq!(decoded, leaf);
        assert_eq!(decoded.min_size(), 4);
        Ok(())
    }

    #[test]
    fn test_decode_rejects_internal_page() {
        let node = BTreeInternalPage::new(PageId(3), None, 8, 4);
        let mut data = [0u8; PAGE_SIZE];
        node.write_to(&mut data);
        assert!(BTreeLeafPage::from_data(&data).is_err());
    }

    #[test]
    fn test_default_max_size_fits_overflow() {
        let max = BTreeLeafPage::default_max_size(8);
        assert!(BTREE_HEADER_SIZE + (max + 1) * (8 + RowId::SIZE) <= PAGE_SIZE);
        assert!(BTREE_HEADER_SIZE + (max + 2) * (8 + RowId::SIZE) > PAGE_SIZE);
    }
}
