use crate::access::btree::KeyManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::btree_page::{
    max_pairs, min_size_for, BTreePageHeader, BTreePageType, BTREE_HEADER_SIZE,
};
use crate::storage::{PageId, PAGE_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use std::cmp::Ordering;

const CHILD_ID_SIZE: usize = 4;

/// Internal node: `(key, child)` pairs where the key at index 0 is a
/// placeholder that is never compared. The child at index `i` holds keys in
/// `[key_i, key_{i+1})`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BTreeInternalPage {
    page_id: PageId,
    parent_page_id: Option<PageId>,
    key_size: usize,
    max_size: usize,
    entries: Vec<(Vec<u8>, PageId)>,
}

impl BTreeInternalPage {
    pub fn new(
        page_id: PageId,
        parent_page_id: Option<PageId>,
        key_size: usize,
        max_size: usize,
    ) -> Self {
        Self {
            page_id,
            parent_page_id,
            key_size,
            max_size,
            entries: Vec::with_capacity(max_size + 1),
        }
    }

    /// Largest internal size that fits a page for the given key width.
    pub fn default_max_size(key_size: usize) -> usize {
        max_pairs(key_size, CHILD_ID_SIZE)
    }

    pub fn from_data(data: &[u8; PAGE_SIZE]) -> StorageResult<Self> {
        let header = BTreePageHeader::read(data, CHILD_ID_SIZE)?;
        if header.page_type != BTreePageType::Internal {
            return Err(StorageError::Corrupted {
                what: "b+ tree internal page",
                detail: format!("page {} is not an internal node", header.page_id),
            });
        }
        if header.size == 0 {
            return Err(StorageError::Corrupted {
                what: "b+ tree internal page",
                detail: format!("page {} has no children", header.page_id),
            });
        }

        let pair_size = header.key_size + CHILD_ID_SIZE;
        let entries = data[BTREE_HEADER_SIZE..BTREE_HEADER_SIZE + header.size * pair_size]
            .chunks_exact(pair_size)
            .map(|pair| {
                let (key, child) = pair.split_at(header.key_size);
                (key.to_vec(), PageId(LittleEndian::read_u32(child)))
            })
            .collect();

        Ok(Self {
            page_id: header.page_id,
            parent_page_id: header.parent_page_id,
            key_size: header.key_size,
            max_size: header.max_size,
            entries,
        })
    }

    pub fn write_to(&self, data: &mut [u8; PAGE_SIZE]) {
        BTreePageHeader {
            page_type: BTreePageType::Internal,
            key_size: self.key_size,
            page_id: self.page_id,
            parent_page_id: self.parent_page_id,
            max_size: self.max_size,
            size: self.entries.len(),
            next_page_id: None,
        }
        .write(data);

        let pair_size = self.key_size + CHILD_ID_SIZE;
        let mut offset = BTREE_HEADER_SIZE;
        for (key, child) in &self.entries {
            data[offset..offset + self.key_size].copy_from_slice(key);
            LittleEndian::write_u32(&mut data[offset + self.key_size..offset + pair_size], child.0);
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

    pub fn set_key_at(&mut self, index: usize, key: &[u8]) {
        self.entries[index].0 = key.to_vec();
    }

    pub fn value_at(&self, index: usize) -> PageId {
        self.entries[index].1
    }

    pub fn children(&self) -> impl Iterator<Item = PageId> + '_ {
        self.entries.iter().map(|(_, child)| *child)
    }

    /// Position of `child` among this node's children.
    pub fn value_index(&self, child: PageId) -> Option<usize> {
        self.entries.iter().position(|(_, c)| *c == child)
    }

    /// Child whose range covers `key`: the rightmost index in `[1, size)`
    /// whose key is <= `key`, or 0 if `key` is below every separator.
    pub fn lookup(&self, key: &[u8], km: &KeyManager) -> PageId {
        let index = self.entries[1..]
            .partition_point(|(k, _)| km.compare(k, key) != Ordering::Greater);
        self.entries[index].1
    }

    /// Fill an empty root with the two halves of a split.
    pub fn populate_new_root(&mut self, old_child: PageId, key: &[u8], new_child: PageId) {
        self.entries.clear();
        self.entries.push((vec![0u8; self.key_size], old_child));
        self.entries.push((key.to_vec(), new_child));
    }

    /// Insert `(key, new_child)` right after `old_child`. Returns the new
    /// size, or None if `old_child` is not a child of this node.
    pub fn insert_node_after(
        &mut self,
        old_child: PageId,
        key: &[u8],
        new_child: PageId,
    ) -> Option<usize> {
        let index = self.value_index(old_child)?;
        self.entries.insert(index + 1, (key.to_vec(), new_child));
        Some(self.entries.len())
    }

    pub fn remove(&mut self, index: usize) {
        self.entries.remove(index);
    }

    /// Empty a single-child root and hand back that child.
    pub fn remove_and_return_only_child(&mut self) -> Option<PageId> {
        if self.entries.len() != 1 {
            return None;
        }
        self.entries.pop().map(|(_, child)| child)
    }

    /// Split: move the upper half to `recipient`. The recipient's key at
    /// index 0 is the separator to push up. Returns the moved children,
    /// whose parent pointers the caller must update.
    pub fn move_half_to(&mut self, recipient: &mut BTreeInternalPage) -> Vec<PageId> {
        let split_at = self.entries.len().div_ceil(2);
        let moved: Vec<_> = self.entries.drain(split_at..).collect();
        let children = moved.iter().map(|(_, c)| *c).collect();
        recipient.entries.extend(moved);
        children
    }

    /// Merge into the left neighbour `recipient`, pulling the parent's
    /// separator down as the key of this node's first child.
    pub fn move_all_to(
        &mut self,
        recipient: &mut BTreeInternalPage,
        middle_key: &[u8],
    ) -> Vec<PageId> {
        if let Some(first) = self.entries.first_mut() {
            first.0 = middle_key.to_vec();
        }
        let children = self.children().collect();
        recipient.entries.append(&mut self.entries);
        children
    }

    /// Borrow from a right neighbour: this node's first child moves to the
    /// end of `recipient` under the parent's separator. The new separator is
    /// then `self.key_at(0)`. Returns the moved child.
    pub fn move_first_to_end_of(
        &mut self,
        recipient: &mut BTreeInternalPage,
        middle_key: &[u8],
    ) -> Option<PageId> {
        if self.entries.is_empty() {
            return None;
        }
        let (_, child) = self.entries.remove(0);
        recipient.entries.push((middle_key.to_vec(), child));
        Some(child)
    }

    /// Borrow from a left neighbour: this node's last child moves to the
    /// front of `recipient`, whose old first child takes the parent's
    /// separator. The new separator is then `recipient.key_at(0)`. Returns
    /// the moved child.
    pub fn move_last_to_front_of(
        &mut self,
        recipient: &mut BTreeInternalPage,
        middle_key: &[u8],
    ) -> Option<PageId> {
        let (key, child) = self.entries.pop()?;
        if let Some(first) = recipient.entries.first_mut() {
            first.0 = middle_key.to_vec();
        }
        recipient.entries.insert(0, (key, child));
        Some(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(v: i64) -> Vec<u8> {
        KeyManager::encode_i64(v)
    }

    /// Children 100, 101, ... separated by the given keys.
    fn internal_with(separators: &[i64]) -> BTreeInternalPage {
        let mut node = BTreeInternalPage::new(PageId(1), None, 8, 8);
        node.populate_new_root(PageId(100), &key(separators[0]), PageId(101));
        for (i, &sep) in separators.iter().enumerate().skip(1) {
            let after = PageId(100 + i as u32);
            node.insert_node_after(after, &key(sep), PageId(101 + i as u32));
        }
        node
    }

    #[test]
    fn test_lookup() {
        let km = KeyManager::i64();
        let node = internal_with(&[10, 20, 30]);
        assert_eq!(node.size(), 4);

        assert_eq!(node.lookup(&key(-1), &km), PageId(100));
        assert_eq!(node.lookup(&key(9), &km), PageId(100));
        assert_eq!(node.lookup(&key(10), &km), PageId(101));
        assert_eq!(node.lookup(&key(25), &km), PageId(102));
        assert_eq!(node.lookup(&key(30), &km), PageId(103));
        assert_eq!(node.lookup(&key(1000), &km), PageId(103));
    }

    #[test]
    fn test_insert_node_after() {
        let mut node = internal_with(&[10, 30]);
        assert_eq!(node.insert_node_after(PageId(101), &key(20), PageId(200)), Some(4));
        assert_eq!(node.value_at(2), PageId(200));
        assert_eq!(node.value_index(PageId(102)), Some(3));
        assert_eq!(node.insert_node_after(PageId(999), &key(5), PageId(201)), None);
    }

    #[test]
    fn test_only_child() {
        let mut node = internal_with(&[10]);
        assert_eq!(node.remove_and_return_only_child(), None);
        node.remove(1);
        assert_eq!(node.remove_and_return_only_child(), Some(PageId(100)));
        assert_eq!(node.size(), 0);
    }

    #[test]
    fn test_move_half_to() {
        let mut left = internal_with(&[10, 20, 30, 40]);
        let mut right = BTreeInternalPage::new(PageId(2), None, 8, 8);

        let moved = left.move_half_to(&mut right);

        assert_eq!(left.size(), 3);
        assert_eq!(right.size(), 2);
        assert_eq!(moved, vec![PageId(103), PageId(104)]);
        // Separator to push up
        assert_eq!(KeyManager::decode_i64(right.key_at(0)), 30);
    }

    #[test]
    fn test_move_all_to_pulls_separator_down() {
        let km = KeyManager::i64();
        let mut left = internal_with(&[10]);
        let mut right = BTreeInternalPage::new(PageId(2), None, 8, 8);
        right.populate_new_root(PageId(200), &key(60), PageId(201));

        let moved = right.move_all_to(&mut left, &key(50));

        assert_eq!(moved, vec![PageId(200), PageId(201)]);
        assert_eq!(left.size(), 4);
        assert_eq!(right.size(), 0);
        assert_eq!(left.lookup(&key(55), &km), PageId(200));
        assert_eq!(left.lookup(&key(60), &km), PageId(201));
        assert_eq!(left.lookup(&key(49), &km), PageId(101));
    }

    #[test]
    fn test_rotations() {
        let km = KeyManager::i64();
        // Parent separator between the two nodes is 50
        let mut left = internal_with(&[10, 20]);
        let mut right = BTreeInternalPage::new(PageId(2), None, 8, 8);
        right.populate_new_root(PageId(200), &key(60), PageId(201));

        // Left lends its last child to right
        let moved = left.move_last_to_front_of(&mut right, &key(50));
        assert_eq!(moved, Some(PageId(102)));
        assert_eq!(KeyManager::decode_i64(right.key_at(0)), 20);
        assert_eq!(right.lookup(&key(49), &km), PageId(102));
        assert_eq!(right.lookup(&key(50), &km), PageId(200));

        // And takes it back, with the new separator 20 coming down
        let moved = right.move_first_to_end_of(&mut left, &key(20));
        assert_eq!(moved, Some(PageId(102)));
        assert_eq!(left.size(), 3);
        assert_eq!(KeyManager::decode_i64(right.key_at(0)), 50);
        assert_eq!(left.lookup(&key(25), &km), PageId(102));
    }

    #[test]
    fn test_encode_decode() -> StorageResult<()> {
        let mut node = internal_with(&[1, 2, 3]);
        node.set_parent_page_id(Some(PageId(5)));

        let mut data = [0u8; PAGE_SIZE];
        node.write_to(&mut data);
        let decoded = BTreeInternalPage::from_data(&data)?;

        assert_eq!(decoded, node);
        assert_eq!(decoded.children().count(), 4);
        Ok(())
    }
}
