pub mod iterator;
pub mod key;

pub use self::iterator::IndexIterator;
pub use self::key::{BytewiseComparator, I64Comparator, KeyComparator, KeyManager};

use crate::access::RowId;
use crate::storage::buffer::{BufferPoolManager, PageGuard};
use crate::storage::page::{
    BTreeInternalPage, BTreeLeafPage, BTreeNode, IndexRootsPage, PageId, INDEX_ROOTS_PAGE_ID,
};
use anyhow::{anyhow, bail, ensure, Result};

/// Ordered unique-key index mapping fixed-size keys to [`RowId`]s.
///
/// Nodes are pages borrowed from the buffer pool; the tree itself only keeps
/// the root page id, which it mirrors into the index roots page whenever it
/// changes. Every page fetched during an operation is unpinned before the
/// operation returns.
pub struct BPlusTree {
    index_id: u32,
    buffer_pool: BufferPoolManager,
    key_manager: KeyManager,
    root_page_id: Option<PageId>,
    leaf_max_size: usize,
    internal_max_size: usize,
}

impl BPlusTree {
    /// Most pages a single operation pins at once, plus one frame for an
    /// open iterator.
    pub const MIN_POOL_SIZE: usize = 4;

    /// Open the index `index_id`, picking up its root from the index roots
    /// page. Fanouts of `None` use the largest size that fits a page.
    ///
    /// The fanouts only shape nodes created from now on by a new root or a
    /// fresh tree; split siblings copy the max size recorded in the node they
    /// split from. An existing tree whose root was built with another key
    /// size is rejected.
    pub fn new(
        index_id: u32,
        buffer_pool: BufferPoolManager,
        key_manager: KeyManager,
        leaf_max_size: Option<usize>,
        internal_max_size: Option<usize>,
    ) -> Result<Self> {
        ensure!(
            buffer_pool.pool_size() >= Self::MIN_POOL_SIZE,
            "Buffer pool of {} frames is too small for a B+ tree, need at least {}",
            buffer_pool.pool_size(),
            Self::MIN_POOL_SIZE
        );

        let key_size = key_manager.key_size();
        ensure!(
            key_size > 0 && key_size <= u16::MAX as usize,
            "Invalid key size {}",
            key_size
        );

        let leaf_limit = BTreeLeafPage::default_max_size(key_size);
        let internal_limit = BTreeInternalPage::default_max_size(key_size);
        let explicit_fanout = leaf_max_size.is_some() || internal_max_size.is_some();
        let leaf_max_size = leaf_max_size.unwrap_or(leaf_limit);
        let internal_max_size = internal_max_size.unwrap_or(internal_limit);
        ensure!(
            (2..=leaf_limit).contains(&leaf_max_size),
            "Leaf max size {} out of range [2, {}] for key size {}",
            leaf_max_size,
            leaf_limit,
            key_size
        );
        ensure!(
            (3..=internal_limit).contains(&internal_max_size),
            "Internal max size {} out of range [3, {}] for key size {}",
            internal_max_size,
            internal_limit,
            key_size
        );

        let root_page_id = {
            let guard = buffer_pool.fetch_page(INDEX_ROOTS_PAGE_ID)?;
            let roots = IndexRootsPage::from_data(&guard.data())?;
            roots.get_root_id(index_id)
        };

        if let Some(root_page_id) = root_page_id {
            let guard = buffer_pool.fetch_page(root_page_id)?;
            let root = BTreeNode::from_data(&guard.data())?;
            ensure!(
                root.key_size() == key_size,
                "Index {} stores {}-byte keys, not {}-byte keys",
                index_id,
                root.key_size(),
                key_size
            );

            let requested = if root.is_leaf() {
                leaf_max_size
            } else {
                internal_max_size
            };
            if explicit_fanout && root.max_size() != requested {
                log::warn!(
                    "index {}: root page {} has max size {}, existing nodes keep it instead of {}",
                    index_id,
                    root_page_id,
                    root.max_size(),
                    requested
                );
            }
        }

        Ok(Self {
            index_id,
            buffer_pool,
            key_manager,
            root_page_id,
            leaf_max_size,
            internal_max_size,
        })
    }

    pub fn index_id(&self) -> u32 {
        self.index_id
    }

    pub fn root_page_id(&self) -> Option<PageId> {
        self.root_page_id
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id.is_none()
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.key_manager
    }

    pub fn leaf_max_size(&self) -> usize {
        self.leaf_max_size
    }

    pub fn internal_max_size(&self) -> usize {
        self.internal_max_size
    }

    /// Number of levels, 0 for an empty tree.
    pub fn height(&self) -> Result<usize> {
        let mut height = 0;
        let mut next = self.root_page_id;
        while let Some(page_id) = next {
            height += 1;
            let (_guard, node) = self.fetch_node(page_id)?;
            next = match node {
                BTreeNode::Internal(internal) => Some(internal.value_at(0)),
                BTreeNode::Leaf(_) => None,
            };
        }
        Ok(height)
    }

    /// Debug check that no page is left pinned.
    pub fn check(&self) -> bool {
        self.buffer_pool.check_all_unpinned()
    }

    pub fn get_value(&self, key: &[u8]) -> Result<Option<RowId>> {
        self.key_manager.check_key(key)?;
        if self.is_empty() {
            return Ok(None);
        }

        let (_guard, leaf) = self.find_leaf(Some(key))?;
        Ok(leaf.lookup(key, &self.key_manager))
    }

    /// Insert a unique key. Returns false if the key is already present.
    pub fn insert(&mut self, key: &[u8], value: RowId) -> Result<bool> {
        self.key_manager.check_key(key)?;
        if self.is_empty() {
            self.start_new_tree(key, value)?;
            return Ok(true);
        }
        self.insert_into_leaf(key, value)
    }

    /// Remove a key. Returns false if the key is absent.
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        self.key_manager.check_key(key)?;
        if self.is_empty() {
            return Ok(false);
        }

        let (guard, mut leaf) = self.find_leaf(Some(key))?;
        if !leaf.remove(key, &self.key_manager) {
            log::warn!(
                "index {}: remove of absent key {:?}",
                self.index_id,
                key
            );
            return Ok(false);
        }

        self.coalesce_or_redistribute(guard, BTreeNode::Leaf(leaf))?;
        Ok(true)
    }

    /// Iterator positioned at the smallest key.
    pub fn begin(&self) -> Result<IndexIterator> {
        if self.is_empty() {
            return Ok(self.end());
        }
        let (guard, leaf) = self.find_leaf(None)?;
        IndexIterator::new(self.buffer_pool.clone(), guard, leaf, 0)
    }

    /// Iterator positioned at the first key >= `key`.
    pub fn begin_at(&self, key: &[u8]) -> Result<IndexIterator> {
        self.key_manager.check_key(key)?;
        if self.is_empty() {
            return Ok(self.end());
        }
        let (guard, leaf) = self.find_leaf(Some(key))?;
        let index = leaf.key_index(key, &self.key_manager);
        IndexIterator::new(self.buffer_pool.clone(), guard, leaf, index)
    }

    pub fn end(&self) -> IndexIterator {
        IndexIterator::end(self.buffer_pool.clone())
    }

    /// Free every page of the tree and drop its root record.
    pub fn destroy(&mut self) -> Result<()> {
        let mut pending: Vec<PageId> = self.root_page_id.into_iter().collect();
        let mut freed = 0usize;

        while let Some(page_id) = pending.pop() {
            {
                let (_guard, node) = self.fetch_node(page_id)?;
                if let BTreeNode::Internal(internal) = node {
                    pending.extend(internal.children());
                }
            }
            self.delete_node_page(page_id)?;
            freed += 1;
        }

        self.root_page_id = None;
        let mut guard = self.buffer_pool.fetch_page(INDEX_ROOTS_PAGE_ID)?;
        let mut roots = IndexRootsPage::from_data(&guard.data())?;
        if roots.delete(self.index_id) {
            roots.write_to(&mut guard.data_mut());
        }

        log::debug!("index {}: destroyed, freed {} pages", self.index_id, freed);
        Ok(())
    }

    fn start_new_tree(&mut self, key: &[u8], value: RowId) -> Result<()> {
        let (page_id, mut guard) = self.buffer_pool.new_page()?;
        let mut leaf =
            BTreeLeafPage::new(page_id, None, self.key_manager.key_size(), self.leaf_max_size);
        leaf.insert(key, value, &self.key_manager);
        leaf.write_to(&mut guard.data_mut());
        drop(guard);

        self.root_page_id = Some(page_id);
        self.update_root_page_id()?;
        log::debug!("index {}: started tree at page {}", self.index_id, page_id);
        Ok(())
    }

    fn insert_into_leaf(&mut self, key: &[u8], value: RowId) -> Result<bool> {
        let (mut guard, mut leaf) = self.find_leaf(Some(key))?;
        if !leaf.insert(key, value, &self.key_manager) {
            log::warn!(
                "index {}: duplicate key {:?} rejected",
                self.index_id,
                key
            );
            return Ok(false);
        }

        if leaf.size() <= leaf.max_size() {
            leaf.write_to(&mut guard.data_mut());
            return Ok(true);
        }

        // Split: the upper half moves to a fresh right sibling
        let (new_page_id, mut new_guard) = self.buffer_pool.new_page()?;
        let mut new_leaf = BTreeLeafPage::new(
            new_page_id,
            leaf.parent_page_id(),
            self.key_manager.key_size(),
            leaf.max_size(),
        );
        leaf.move_half_to(&mut new_leaf);
        new_leaf.set_next_page_id(leaf.next_page_id());
        leaf.set_next_page_id(Some(new_page_id));

        let separator = new_leaf.key_at(0).to_vec();
        leaf.write_to(&mut guard.data_mut());
        new_leaf.write_to(&mut new_guard.data_mut());
        drop(guard);
        drop(new_guard);

        log::debug!(
            "index {}: split leaf {} into {}",
            self.index_id,
            leaf.page_id(),
            new_page_id
        );
        self.insert_into_parent(leaf.page_id(), leaf.parent_page_id(), &separator, new_page_id)?;
        Ok(true)
    }

    /// Hook `new_page_id` into the tree right after `old_page_id`, whose
    /// parent is `parent_page_id`, splitting ancestors as needed.
    fn insert_into_parent(
        &mut self,
        old_page_id: PageId,
        parent_page_id: Option<PageId>,
        key: &[u8],
        new_page_id: PageId,
    ) -> Result<()> {
        let Some(parent_page_id) = parent_page_id else {
            // The old node was the root: grow by one level
            let (root_page_id, mut guard) = self.buffer_pool.new_page()?;
            let mut root = BTreeInternalPage::new(
                root_page_id,
                None,
                self.key_manager.key_size(),
                self.internal_max_size,
            );
            root.populate_new_root(old_page_id, key, new_page_id);
            root.write_to(&mut guard.data_mut());
            drop(guard);

            self.set_parent(old_page_id, Some(root_page_id))?;
            self.set_parent(new_page_id, Some(root_page_id))?;
            self.root_page_id = Some(root_page_id);
            self.update_root_page_id()?;
            log::debug!("index {}: new root {}", self.index_id, root_page_id);
            return Ok(());
        };

        let (mut guard, mut parent) = self.fetch_internal(parent_page_id)?;
        parent
            .insert_node_after(old_page_id, key, new_page_id)
            .ok_or_else(|| {
                anyhow!(
                    "Page {} is not a child of its parent {}",
                    old_page_id,
                    parent_page_id
                )
            })?;

        if parent.size() <= parent.max_size() {
            parent.write_to(&mut guard.data_mut());
            return Ok(());
        }

        let (sibling_page_id, mut sibling_guard) = self.buffer_pool.new_page()?;
        let mut sibling = BTreeInternalPage::new(
            sibling_page_id,
            parent.parent_page_id(),
            self.key_manager.key_size(),
            parent.max_size(),
        );
        let moved = parent.move_half_to(&mut sibling);
        let separator = sibling.key_at(0).to_vec();
        parent.write_to(&mut guard.data_mut());
        sibling.write_to(&mut sibling_guard.data_mut());
        drop(guard);
        drop(sibling_guard);

        for child in moved {
            self.set_parent(child, Some(sibling_page_id))?;
        }

        log::debug!(
            "index {}: split internal {} into {}",
            self.index_id,
            parent_page_id,
            sibling_page_id
        );
        self.insert_into_parent(
            parent_page_id,
            parent.parent_page_id(),
            &separator,
            sibling_page_id,
        )
    }

    /// Restore the size invariant of `node` after a removal. `node` is
    /// written back to `guard` only once every page the fix-up needs is
    /// pinned, so a full buffer pool leaves the page untouched.
    fn coalesce_or_redistribute(&mut self, mut guard: PageGuard, node: BTreeNode) -> Result<()> {
        if node.is_root() {
            node.write_to(&mut guard.data_mut());
            drop(guard);
            return self.adjust_root(node);
        }

        let parent_page_id = node
            .parent_page_id()
            .ok_or_else(|| anyhow!("Non-root page {} has no parent", node.page_id()))?;

        if node.size() >= node.min_size() {
            node.write_to(&mut guard.data_mut());
            drop(guard);
            if let BTreeNode::Leaf(leaf) = &node {
                if let Some(first_key) = leaf.first_key() {
                    self.refresh_separator(parent_page_id, leaf.page_id(), first_key)?;
                }
            }
            return Ok(());
        }

        let (parent_guard, parent) = self.fetch_internal(parent_page_id)?;
        let index = parent.value_index(node.page_id()).ok_or_else(|| {
            anyhow!(
                "Page {} is not a child of its parent {}",
                node.page_id(),
                parent_page_id
            )
        })?;
        ensure!(
            parent.size() >= 2,
            "Parent {} of page {} has a single child",
            parent_page_id,
            node.page_id()
        );

        // Prefer the right sibling
        let node_is_left = index + 1 < parent.size();
        let sibling_index = if node_is_left { index + 1 } else { index - 1 };
        let (sibling_guard, sibling) = self.fetch_node(parent.value_at(sibling_index))?;

        if node.size() + sibling.size() <= node.max_size() {
            let (left, right, right_index) = if node_is_left {
                ((guard, node), (sibling_guard, sibling), sibling_index)
            } else {
                ((sibling_guard, sibling), (guard, node), index)
            };
            self.coalesce(left, right, parent_guard, parent, right_index)
        } else {
            self.redistribute(
                (guard, node),
                (sibling_guard, sibling),
                (parent_guard, parent),
                index,
                node_is_left,
            )
        }
    }

    /// Merge `right` into `left`, drop `right` from the parent and recurse
    /// on the parent.
    fn coalesce(
        &mut self,
        (mut left_guard, left): (PageGuard, BTreeNode),
        (right_guard, right): (PageGuard, BTreeNode),
        mut parent_guard: PageGuard,
        mut parent: BTreeInternalPage,
        right_index: usize,
    ) -> Result<()> {
        let left_page_id = left.page_id();
        let right_page_id = right.page_id();

        match (left, right) {
            (BTreeNode::Leaf(mut left), BTreeNode::Leaf(mut right)) => {
                right.move_all_to(&mut left);
                left.write_to(&mut left_guard.data_mut());
                drop(left_guard);
            }
            (BTreeNode::Internal(mut left), BTreeNode::Internal(mut right)) => {
                let middle_key = parent.key_at(right_index).to_vec();
                let moved = right.move_all_to(&mut left, &middle_key);
                left.write_to(&mut left_guard.data_mut());
                drop(left_guard);
                for child in moved {
                    self.set_parent(child, Some(left_page_id))?;
                }
            }
            _ => bail!(
                "Sibling pages {} and {} are of different kinds",
                left_page_id,
                right_page_id
            ),
        }
        drop(right_guard);
        self.delete_node_page(right_page_id)?;

        parent.remove(right_index);
        parent.write_to(&mut parent_guard.data_mut());

        log::debug!(
            "index {}: merged page {} into {}",
            self.index_id,
            right_page_id,
            left_page_id
        );
        self.coalesce_or_redistribute(parent_guard, BTreeNode::Internal(parent))
    }

    /// Move one entry from `sibling` into the underflowing `node` and fix the
    /// separator between them.
    fn redistribute(
        &mut self,
        (mut guard, node): (PageGuard, BTreeNode),
        (mut sibling_guard, sibling): (PageGuard, BTreeNode),
        (mut parent_guard, mut parent): (PageGuard, BTreeInternalPage),
        index: usize,
        node_is_left: bool,
    ) -> Result<()> {
        let node_page_id = node.page_id();
        let mut moved_child = None;

        match (node, sibling) {
            (BTreeNode::Leaf(mut node), BTreeNode::Leaf(mut sibling)) => {
                if node_is_left {
                    sibling.move_first_to_end_of(&mut node);
                    parent.set_key_at(index + 1, sibling.key_at(0));
                } else {
                    sibling.move_last_to_front_of(&mut node);
                    parent.set_key_at(index, node.key_at(0));
                }
                node.write_to(&mut guard.data_mut());
                sibling.write_to(&mut sibling_guard.data_mut());
            }
            (BTreeNode::Internal(mut node), BTreeNode::Internal(mut sibling)) => {
                if node_is_left {
                    let middle_key = parent.key_at(index + 1).to_vec();
                    moved_child = sibling.move_first_to_end_of(&mut node, &middle_key);
                    parent.set_key_at(index + 1, sibling.key_at(0));
                } else {
                    let middle_key = parent.key_at(index).to_vec();
                    moved_child = sibling.move_last_to_front_of(&mut node, &middle_key);
                    parent.set_key_at(index, node.key_at(0));
                }
                node.write_to(&mut guard.data_mut());
                sibling.write_to(&mut sibling_guard.data_mut());
            }
            _ => bail!("Sibling of page {} is of a different kind", node_page_id),
        }
        parent.write_to(&mut parent_guard.data_mut());
        drop(guard);
        drop(sibling_guard);
        drop(parent_guard);

        if let Some(child) = moved_child {
            self.set_parent(child, Some(node_page_id))?;
        }
        log::trace!("index {}: redistributed into page {}", self.index_id, node_page_id);
        Ok(())
    }

    /// Shrink the root after a removal: an empty leaf root empties the tree,
    /// an internal root with one child hands the root role to that child.
    fn adjust_root(&mut self, root: BTreeNode) -> Result<()> {
        match root {
            BTreeNode::Leaf(leaf) if leaf.size() == 0 => {
                self.delete_node_page(leaf.page_id())?;
                self.root_page_id = None;
                self.update_root_page_id()?;
                log::debug!("index {}: tree is now empty", self.index_id);
            }
            BTreeNode::Internal(mut internal) if internal.size() == 1 => {
                let child = internal
                    .remove_and_return_only_child()
                    .ok_or_else(|| anyhow!("Root {} lost its only child", internal.page_id()))?;
                self.delete_node_page(internal.page_id())?;
                self.set_parent(child, None)?;
                self.root_page_id = Some(child);
                self.update_root_page_id()?;
                log::debug!("index {}: root collapsed into page {}", self.index_id, child);
            }
            _ => {}
        }
        Ok(())
    }

    /// Point the parent's separator for `child` at the child's new first key.
    fn refresh_separator(
        &self,
        parent_page_id: PageId,
        child: PageId,
        first_key: &[u8],
    ) -> Result<()> {
        let (mut guard, mut parent) = self.fetch_internal(parent_page_id)?;
        match parent.value_index(child) {
            Some(index) if index > 0 && parent.key_at(index) != first_key => {
                parent.set_key_at(index, first_key);
                parent.write_to(&mut guard.data_mut());
            }
            _ => {}
        }
        Ok(())
    }

    /// Descend to the leaf whose range covers `key`, or the leftmost leaf.
    fn find_leaf(&self, key: Option<&[u8]>) -> Result<(PageGuard, BTreeLeafPage)> {
        let mut page_id = self
            .root_page_id
            .ok_or_else(|| anyhow!("Index {} is empty", self.index_id))?;

        loop {
            let (guard, node) = self.fetch_node(page_id)?;
            match node {
                BTreeNode::Leaf(leaf) => return Ok((guard, leaf)),
                BTreeNode::Internal(internal) => {
                    page_id = match key {
                        Some(key) => internal.lookup(key, &self.key_manager),
                        None => internal.value_at(0),
                    };
                }
            }
        }
    }

    fn fetch_node(&self, page_id: PageId) -> Result<(PageGuard, BTreeNode)> {
        let guard = self.buffer_pool.fetch_page(page_id)?;
        let node = BTreeNode::from_data(&guard.data())?;
        Ok((guard, node))
    }

    fn fetch_internal(&self, page_id: PageId) -> Result<(PageGuard, BTreeInternalPage)> {
        let guard = self.buffer_pool.fetch_page(page_id)?;
        let node = BTreeInternalPage::from_data(&guard.data())?;
        Ok((guard, node))
    }

    fn set_parent(&self, page_id: PageId, parent: Option<PageId>) -> Result<()> {
        let (mut guard, mut node) = self.fetch_node(page_id)?;
        node.set_parent_page_id(parent);
        node.write_to(&mut guard.data_mut());
        Ok(())
    }

    fn delete_node_page(&self, page_id: PageId) -> Result<()> {
        if !self.buffer_pool.delete_page(page_id)? {
            bail!("Page {} is still pinned and cannot be freed", page_id);
        }
        Ok(())
    }

    fn update_root_page_id(&self) -> Result<()> {
        let mut guard = self.buffer_pool.fetch_page(INDEX_ROOTS_PAGE_ID)?;
        let mut roots = IndexRootsPage::from_data(&guard.data())?;
        if !roots.update(self.index_id, self.root_page_id)
            && !roots.insert(self.index_id, self.root_page_id)
        {
            bail!("Index roots page is full");
        }
        roots.write_to(&mut guard.data_mut());
        Ok(())
    }
}
