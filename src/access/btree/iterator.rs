use crate::access::RowId;
use crate::storage::buffer::{BufferPoolManager, PageGuard};
use crate::storage::page::{BTreeLeafPage, PageId};
use anyhow::Result;

/// Current leaf of a positioned iterator. The guard keeps the leaf pinned.
struct Position {
    _guard: PageGuard,
    leaf: BTreeLeafPage,
    index: usize,
}

/// Forward cursor over the leaf chain of a [`super::BPlusTree`].
///
/// A positioned iterator pins exactly one leaf page; moving past the last
/// entry of a leaf releases it and pins the next one. The past-the-end
/// iterator pins nothing. Two iterators compare equal when they point at the
/// same slot of the same leaf, or are both at the end.
pub struct IndexIterator {
    buffer_pool: BufferPoolManager,
    position: Option<Position>,
    /// Error from a failed advance, reported on the next call to `next`
    pending_error: Option<anyhow::Error>,
}

impl IndexIterator {
    pub(crate) fn new(
        buffer_pool: BufferPoolManager,
        guard: PageGuard,
        leaf: BTreeLeafPage,
        index: usize,
    ) -> Result<Self> {
        let mut iter = Self {
            buffer_pool,
            position: Some(Position {
                _guard: guard,
                leaf,
                index,
            }),
            pending_error: None,
        };
        iter.skip_exhausted_leaves()?;
        Ok(iter)
    }

    pub(crate) fn end(buffer_pool: BufferPoolManager) -> Self {
        Self {
            buffer_pool,
            position: None,
            pending_error: None,
        }
    }

    pub fn is_end(&self) -> bool {
        self.position.is_none()
    }

    /// Leaf page the iterator currently points into.
    pub fn page_id(&self) -> Option<PageId> {
        self.position.as_ref().map(|pos| pos.leaf.page_id())
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.position.as_ref().map(|pos| pos.leaf.key_at(pos.index))
    }

    pub fn value(&self) -> Option<RowId> {
        self.position.as_ref().map(|pos| pos.leaf.value_at(pos.index))
    }

    /// Step to the next entry, crossing into the next leaf when needed.
    pub fn advance(&mut self) -> Result<()> {
        if let Some(pos) = self.position.as_mut() {
            pos.index += 1;
        }
        self.skip_exhausted_leaves()
    }

    fn skip_exhausted_leaves(&mut self) -> Result<()> {
        loop {
            let next_page_id = match &self.position {
                None => return Ok(()),
                Some(pos) if pos.index < pos.leaf.size() => return Ok(()),
                Some(pos) => pos.leaf.next_page_id(),
            };

            // Release the current leaf before pinning the next one
            self.position = None;
            let Some(next_page_id) = next_page_id else {
                return Ok(());
            };

            let guard = self.buffer_pool.fetch_page(next_page_id)?;
            let leaf = BTreeLeafPage::from_data(&guard.data())?;
            self.position = Some(Position {
                _guard: guard,
                leaf,
                index: 0,
            });
        }
    }
}

impl PartialEq for IndexIterator {
    fn eq(&self, other: &Self) -> bool {
        match (&self.position, &other.position) {
            (None, None) => true,
            (Some(a), Some(b)) => a.leaf.page_id() == b.leaf.page_id() && a.index == b.index,
            _ => false,
        }
    }
}

impl Iterator for IndexIterator {
    type Item = Result<(Vec<u8>, RowId)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.pending_error.take() {
            return Some(Err(e));
        }

        let entry = {
            let pos = self.position.as_ref()?;
            (pos.leaf.key_at(pos.index).to_vec(), pos.leaf.value_at(pos.index))
        };
        if let Err(e) = self.advance() {
            self.position = None;
            self.pending_error = Some(e);
        }
        Some(Ok(entry))
    }
}

impl std::fmt::Debug for IndexIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexIterator")
            .field("page_id", &self.page_id())
            .field("index", &self.position.as_ref().map(|pos| pos.index))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::btree::{BPlusTree, KeyManager};
    use crate::storage::disk::DiskManager;
    use crate::storage::page::{IndexRootsPage, INDEX_ROOTS_PAGE_ID};
    use tempfile::tempdir;

    fn key(v: i64) -> Vec<u8> {
        KeyManager::encode_i64(v)
    }

    #[test]
    fn test_walks_leaf_chain() -> Result<()> {
        let dir = tempdir()?;
        let buffer_pool =
            BufferPoolManager::with_lru(DiskManager::create(&dir.path().join("test.db"))?, 16);
        {
            let (page_id, mut guard) = buffer_pool.new_page()?;
            assert_eq!(page_id, INDEX_ROOTS_PAGE_ID);
            IndexRootsPage::new().write_to(&mut guard.data_mut());
        }

        let mut tree = BPlusTree::new(1, buffer_pool.clone(), KeyManager::i64(), Some(3), Some(3))?;
        for k in (0..30).rev() {
            tree.insert(&key(k), RowId::new(PageId(k as u32), 0))?;
        }

        let mut iter = tree.begin()?;
        let mut seen = Vec::new();
        let mut leaves = Vec::new();
        while !iter.is_end() {
            let page_id = iter.page_id().ok_or_else(|| anyhow::anyhow!("no page"))?;
            if leaves.last() != Some(&page_id) {
                leaves.push(page_id);
            }
            let k = KeyManager::decode_i64(iter.key().ok_or_else(|| anyhow::anyhow!("no key"))?);
            assert_eq!(iter.value(), Some(RowId::new(PageId(k as u32), 0)));
            seen.push(k);
            iter.advance()?;
        }

        assert_eq!(seen, (0..30).collect::<Vec<_>>());
        assert!(leaves.len() >= 10);
        assert!(iter == tree.end());

        // Advancing the end iterator is a no-op
        iter.advance()?;
        assert!(iter.is_end());
        assert!(iter.next().is_none());
        assert!(buffer_pool.check_all_unpinned());
        Ok(())
    }

    #[test]
    fn test_equality() -> Result<()> {
        let dir = tempdir()?;
        let buffer_pool =
            BufferPoolManager::with_lru(DiskManager::create(&dir.path().join("test.db"))?, 16);
        {
            let (_page_id, mut guard) = buffer_pool.new_page()?;
            IndexRootsPage::new().write_to(&mut guard.data_mut());
        }

        let mut tree = BPlusTree::new(1, buffer_pool, KeyManager::i64(), Some(4), Some(4))?;
        for k in 0..10 {
            tree.insert(&key(k), RowId::new(PageId(0), k as u32))?;
        }

        let mut a = tree.begin()?;
        let b = tree.begin_at(&key(2))?;
        assert!(a != b);
        a.advance()?;
        a.advance()?;
        assert!(a == b);
        assert!(a != tree.end());
        Ok(())
    }
}
