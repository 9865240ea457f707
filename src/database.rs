use crate::access::btree::{BPlusTree, KeyManager};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::disk::DiskManager;
use crate::storage::page::disk_meta_page::MAX_EXTENTS;
use crate::storage::page::{IndexRootsPage, INDEX_ROOTS_PAGE_ID};
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

/// Tunables for opening a database file.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Number of frames in the buffer pool, at least
    /// [`BPlusTree::MIN_POOL_SIZE`]
    pub pool_size: usize,
    /// B+ tree leaf fanout; `None` fits as many entries as a page holds
    pub leaf_max_size: Option<usize>,
    /// B+ tree internal fanout; `None` fits as many entries as a page holds
    pub internal_max_size: Option<usize>,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            pool_size: 64,
            leaf_max_size: None,
            internal_max_size: None,
        }
    }
}

/// Allocator statistics of a database file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseStats {
    pub allocated_pages: u32,
    pub extents: u32,
    /// Used pages per extent, up to the last non-empty extent
    pub extent_usage: Vec<u32>,
}

/// One open database file: its buffer pool plus the indexes stored in it.
///
/// All state belongs to this value; there is no process-wide registry of
/// open databases. Dropping it flushes dirty pages and closes the file.
pub struct Database {
    path: PathBuf,
    buffer_pool: BufferPoolManager,
    options: DatabaseOptions,
}

impl Database {
    /// Create a new database at the specified path
    pub fn create(path: &Path, options: DatabaseOptions) -> Result<Self> {
        if path.exists() {
            bail!("Database file already exists at {:?}", path);
        }
        if options.pool_size < BPlusTree::MIN_POOL_SIZE {
            bail!(
                "Buffer pool size {} is below the minimum of {}",
                options.pool_size,
                BPlusTree::MIN_POOL_SIZE
            );
        }

        let disk_manager = DiskManager::create(path)?;
        let buffer_pool = BufferPoolManager::with_lru(disk_manager, options.pool_size);

        {
            let (page_id, mut guard) = buffer_pool.new_page()?;
            if page_id != INDEX_ROOTS_PAGE_ID {
                bail!("Fresh database allocated page {} for the index roots", page_id);
            }
            IndexRootsPage::new().write_to(&mut guard.data_mut());
        }
        buffer_pool.flush_all()?;

        log::info!("created database at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            buffer_pool,
            options,
        })
    }

    /// Open an existing database
    pub fn open(path: &Path, options: DatabaseOptions) -> Result<Self> {
        if !path.exists() {
            bail!("Database file does not exist at {:?}", path);
        }
        if options.pool_size < BPlusTree::MIN_POOL_SIZE {
            bail!(
                "Buffer pool size {} is below the minimum of {}",
                options.pool_size,
                BPlusTree::MIN_POOL_SIZE
            );
        }

        let disk_manager = DiskManager::open(path)?;
        if disk_manager.num_allocated_pages() == 0 {
            bail!("Database file at {:?} has not been initialised", path);
        }
        let buffer_pool = BufferPoolManager::with_lru(disk_manager, options.pool_size);

        {
            let guard = buffer_pool.fetch_page(INDEX_ROOTS_PAGE_ID)?;
            IndexRootsPage::from_data(&guard.data()).context("Failed to read index roots")?;
        }

        log::debug!("opened database at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            buffer_pool,
            options,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    pub fn buffer_pool(&self) -> &BufferPoolManager {
        &self.buffer_pool
    }

    /// Open (or start) the index `index_id`. The tree is empty until its
    /// first insert.
    pub fn open_index(&self, index_id: u32, key_manager: KeyManager) -> Result<BPlusTree> {
        BPlusTree::new(
            index_id,
            self.buffer_pool.clone(),
            key_manager,
            self.options.leaf_max_size,
            self.options.internal_max_size,
        )
    }

    /// Free every page of an index and forget it.
    pub fn drop_index(&self, index_id: u32, key_manager: KeyManager) -> Result<()> {
        let mut tree = self.open_index(index_id, key_manager)?;
        tree.destroy()
    }

    /// Ids of every index with a root record.
    pub fn index_ids(&self) -> Result<Vec<u32>> {
        let guard = self.buffer_pool.fetch_page(INDEX_ROOTS_PAGE_ID)?;
        let roots = IndexRootsPage::from_data(&guard.data())?;
        Ok(roots.index_ids().collect())
    }

    pub fn stats(&self) -> DatabaseStats {
        self.buffer_pool.with_disk_manager(|dm| {
            let mut extent_usage: Vec<u32> = (0..MAX_EXTENTS)
                .map(|i| dm.extent_used_pages(i))
                .collect();
            while extent_usage.last() == Some(&0) {
                extent_usage.pop();
            }
            DatabaseStats {
                allocated_pages: dm.num_allocated_pages(),
                extents: dm.num_extents(),
                extent_usage,
            }
        })
    }

    /// Flush all dirty pages to disk
    pub fn flush(&self) -> Result<()> {
        Ok(self.buffer_pool.flush_all()?)
    }

    /// Debug check that every page has been unpinned.
    pub fn check(&self) -> bool {
        self.buffer_pool.check_all_unpinned()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Best effort flush on drop
        if let Err(e) = self.flush() {
            log::error!("failed to flush {}: {}", self.path.display(), e);
        }
    }
}
