use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::bitmap_page::{BitmapPage, BITMAP_CAPACITY};
use crate::storage::page::disk_meta_page::{DiskFileMetaPage, MAX_VALID_PAGES};
use crate::storage::page::PageId;
use crate::storage::PAGE_SIZE;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const META_PHYSICAL_PAGE: u64 = 0;

/// Owns the database file and translates logical page ids to physical slots.
///
/// Physical layout: page 0 is the meta page, then every extent is one bitmap
/// page followed by `BITMAP_CAPACITY` data pages.
pub struct DiskManager {
    file: File,
    path: PathBuf,
    meta: DiskFileMetaPage,
    closed: bool,
}

impl DiskManager {
    /// Create a fresh database file, truncating anything already there.
    pub fn create(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut disk_manager = Self {
            file,
            path: path.to_path_buf(),
            meta: DiskFileMetaPage::new(),
            closed: false,
        };
        disk_manager.write_meta()?;
        Ok(disk_manager)
    }

    /// Open an existing database file, or create it if it does not exist.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if !path.exists() {
            return Self::create(path);
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let is_empty = file.metadata()?.len() == 0;
        let mut disk_manager = Self {
            file,
            path: path.to_path_buf(),
            meta: DiskFileMetaPage::new(),
            closed: false,
        };

        if is_empty {
            disk_manager.write_meta()?;
        } else if let Err(e) = disk_manager.load_meta() {
            // Never write our blank meta page over a file we failed to read
            disk_manager.closed = true;
            return Err(e);
        }

        Ok(disk_manager)
    }

    fn load_meta(&mut self) -> StorageResult<()> {
        let mut buf = [0u8; PAGE_SIZE];
        self.read_physical_page(META_PHYSICAL_PAGE, &mut buf)?;
        self.meta = DiskFileMetaPage::from_data(&buf)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()> {
        Self::check_page_id(page_id)?;
        self.read_physical_page(Self::map_page_id(page_id), buf)
    }

    pub fn write_page(&mut self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> StorageResult<()> {
        Self::check_page_id(page_id)?;
        self.write_physical_page(Self::map_page_id(page_id), data)
    }

    /// First-fit allocation across extents; a new extent is opened when all
    /// existing ones are full.
    pub fn allocate_page(&mut self) -> StorageResult<PageId> {
        if self.meta.num_allocated_pages() as u64 >= MAX_VALID_PAGES {
            log::warn!("disk is full: {} pages allocated", self.meta.num_allocated_pages());
            return Err(StorageError::DiskFull {
                limit: MAX_VALID_PAGES,
            });
        }

        let extent = self
            .meta
            .first_non_full_extent()
            .ok_or(StorageError::DiskFull {
                limit: MAX_VALID_PAGES,
            })?;

        let bitmap_page_id = Self::bitmap_physical_page(extent);
        let mut buf = [0u8; PAGE_SIZE];
        self.read_physical_page(bitmap_page_id, &mut buf)?;
        let mut bitmap = BitmapPage::from_data(&buf)?;

        let offset = bitmap.allocate_page().ok_or_else(|| StorageError::Corrupted {
            what: "bitmap page",
            detail: format!(
                "extent {} is full but meta page records {} used pages",
                extent,
                self.meta.extent_used_pages(extent)
            ),
        })?;

        bitmap.write_to(&mut buf);
        self.write_physical_page(bitmap_page_id, &buf)?;

        self.meta.record_allocation(extent);
        self.write_meta()?;

        let page_id = PageId(extent as u32 * BITMAP_CAPACITY + offset);
        log::trace!("allocated page {} in extent {}", page_id, extent);
        Ok(page_id)
    }

    /// Returns `Ok(false)` if the page was already free.
    pub fn deallocate_page(&mut self, page_id: PageId) -> StorageResult<bool> {
        Self::check_page_id(page_id)?;
        let extent = (page_id.0 / BITMAP_CAPACITY) as usize;
        let offset = page_id.0 % BITMAP_CAPACITY;

        let bitmap_page_id = Self::bitmap_physical_page(extent);
        let mut buf = [0u8; PAGE_SIZE];
        self.read_physical_page(bitmap_page_id, &mut buf)?;
        let mut bitmap = BitmapPage::from_data(&buf)?;

        if !bitmap.deallocate_page(offset) {
            log::warn!("deallocate of page {} which is already free", page_id);
            return Ok(false);
        }

        bitmap.write_to(&mut buf);
        self.write_physical_page(bitmap_page_id, &buf)?;

        self.meta.record_deallocation(extent);
        self.write_meta()?;
        Ok(true)
    }

    pub fn is_page_free(&mut self, page_id: PageId) -> StorageResult<bool> {
        Self::check_page_id(page_id)?;
        let extent = (page_id.0 / BITMAP_CAPACITY) as usize;
        let mut buf = [0u8; PAGE_SIZE];
        self.read_physical_page(Self::bitmap_physical_page(extent), &mut buf)?;
        let bitmap = BitmapPage::from_data(&buf)?;
        Ok(bitmap.is_page_free(page_id.0 % BITMAP_CAPACITY))
    }

    pub fn num_allocated_pages(&self) -> u32 {
        self.meta.num_allocated_pages()
    }

    pub fn num_extents(&self) -> u32 {
        self.meta.num_extents()
    }

    pub fn extent_used_pages(&self, extent: usize) -> u32 {
        self.meta.extent_used_pages(extent)
    }

    /// Physical slot of a logical page: skip the meta page plus one bitmap
    /// page for every extent up to and including its own.
    pub fn map_page_id(page_id: PageId) -> u64 {
        let logical = page_id.0 as u64;
        logical / BITMAP_CAPACITY as u64 + 2 + logical
    }

    pub fn sync(&mut self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Persist the meta page and sync the file. Idempotent.
    pub fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Ok(());
        }
        self.write_meta()?;
        self.sync()?;
        self.closed = true;
        Ok(())
    }

    fn bitmap_physical_page(extent: usize) -> u64 {
        extent as u64 * (BITMAP_CAPACITY as u64 + 1) + 1
    }

    fn check_page_id(page_id: PageId) -> StorageResult<()> {
        if page_id.0 as u64 >= MAX_VALID_PAGES {
            return Err(StorageError::InvalidPage(page_id));
        }
        Ok(())
    }

    fn write_meta(&mut self) -> StorageResult<()> {
        let mut buf = [0u8; PAGE_SIZE];
        self.meta.write_to(&mut buf);
        self.write_physical_page(META_PHYSICAL_PAGE, &buf)
    }

    /// Reads past the end of the file zero-fill the buffer.
    fn read_physical_page(&mut self, physical: u64, buf: &mut [u8; PAGE_SIZE]) -> StorageResult<()> {
        let offset = physical * PAGE_SIZE as u64;
        let file_size = self.file.metadata()?.len();

        if offset >= file_size {
            buf.fill(0);
            return Ok(());
        }

        self.file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < PAGE_SIZE {
            let n = self.file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf[read..].fill(0);

        Ok(())
    }

    fn write_physical_page(&mut self, physical: u64, data: &[u8; PAGE_SIZE]) -> StorageResult<()> {
        let offset = physical * PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.file.flush()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("failed to close {:?}: {}", self.path, e);
        }
    }
}
