pub mod lru;
pub mod replacer;

use crate::storage::disk::DiskManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::{PageId, PAGE_SIZE};
use lru::LruReplacer;
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use replacer::{FrameId, Replacer};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

struct Frame {
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: RwLock::new(Box::new([0u8; PAGE_SIZE])),
        }
    }
}

/// In-memory bookkeeping for one frame. Never persisted.
#[derive(Debug, Default, Clone)]
struct FrameMeta {
    page_id: Option<PageId>,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameMeta {
    fn reset(&mut self) {
        self.page_id = None;
        self.pin_count = 0;
        self.is_dirty = false;
    }
}

struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    /// Frames that hold no page at all
    free_list: VecDeque<FrameId>,
    replacer: Box<dyn Replacer>,
    frame_meta: Vec<FrameMeta>,
}

/// Fixed-size page cache over a [`DiskManager`].
///
/// Pages are handed out as [`PageGuard`]s. A guard holds one pin on its page
/// and releases it when dropped, so a page cannot be evicted while any guard
/// for it is alive.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

struct BufferPoolInner {
    frames: Vec<Frame>,
    state: Mutex<PoolState>,
    disk_manager: Mutex<DiskManager>,
    pool_size: usize,
}

impl BufferPoolManager {
    pub fn new(disk_manager: DiskManager, replacer: Box<dyn Replacer>, pool_size: usize) -> Self {
        let frames = (0..pool_size).map(|_| Frame::new()).collect();
        let free_list = (0..pool_size as FrameId).collect();

        Self {
            inner: Arc::new(BufferPoolInner {
                frames,
                state: Mutex::new(PoolState {
                    page_table: HashMap::with_capacity(pool_size),
                    free_list,
                    replacer,
                    frame_meta: vec![FrameMeta::default(); pool_size],
                }),
                disk_manager: Mutex::new(disk_manager),
                pool_size,
            }),
        }
    }

    /// Buffer pool with an LRU replacer sized to the pool.
    pub fn with_lru(disk_manager: DiskManager, pool_size: usize) -> Self {
        Self::new(disk_manager, Box::new(LruReplacer::new(pool_size)), pool_size)
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    pub fn fetch_page(&self, page_id: PageId) -> StorageResult<PageGuard> {
        let mut state = self.inner.state.lock();

        // Check if page is already in buffer pool
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            state.frame_meta[frame_id as usize].pin_count += 1;
            state.replacer.pin(frame_id);
            return Ok(self.guard(frame_id, page_id));
        }

        // Page not in buffer pool, need to load from disk
        let frame_id = self.inner.acquire_frame(&mut state)?;
        {
            let mut data = self.inner.frames[frame_id as usize].data.write();
            let read = self.inner.disk_manager.lock().read_page(page_id, &mut data);
            if let Err(e) = read {
                data.fill(0);
                state.free_list.push_back(frame_id);
                return Err(e);
            }
        }

        state.page_table.insert(page_id, frame_id);
        let meta = &mut state.frame_meta[frame_id as usize];
        meta.page_id = Some(page_id);
        meta.pin_count = 1;
        meta.is_dirty = false;

        Ok(self.guard(frame_id, page_id))
    }

    /// Allocate a fresh page on disk and pin a zeroed frame for it.
    pub fn new_page(&self) -> StorageResult<(PageId, PageGuard)> {
        let mut state = self.inner.state.lock();

        if state.free_list.is_empty() && state.replacer.size() == 0 {
            return Err(StorageError::BufferPoolFull);
        }

        let page_id = self.inner.disk_manager.lock().allocate_page()?;
        let frame_id = match self.inner.acquire_frame(&mut state) {
            Ok(frame_id) => frame_id,
            Err(e) => {
                let _ = self.inner.disk_manager.lock().deallocate_page(page_id);
                return Err(e);
            }
        };

        self.inner.frames[frame_id as usize].data.write().fill(0);

        state.page_table.insert(page_id, frame_id);
        let meta = &mut state.frame_meta[frame_id as usize];
        meta.page_id = Some(page_id);
        meta.pin_count = 1;
        // The disk copy may hold bytes of an earlier, deallocated page
        meta.is_dirty = true;

        Ok((page_id, self.guard(frame_id, page_id)))
    }

    /// Release one pin. Returns false if the page is not resident or not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        self.inner.unpin_page(page_id, is_dirty)
    }

    /// Drop a page from the pool and free it on disk.
    ///
    /// Returns `Ok(true)` if the page is not resident, `Ok(false)` if it is
    /// still pinned.
    pub fn delete_page(&self, page_id: PageId) -> StorageResult<bool> {
        let mut state = self.inner.state.lock();

        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(true);
        };

        let meta = &state.frame_meta[frame_id as usize];
        if meta.pin_count != 0 {
            log::warn!(
                "delete of page {} which is still pinned (pin count {})",
                page_id,
                meta.pin_count
            );
            return Ok(false);
        }

        if meta.is_dirty {
            self.inner.write_frame(frame_id, page_id)?;
        }
        self.inner.disk_manager.lock().deallocate_page(page_id)?;

        state.page_table.remove(&page_id);
        state.frame_meta[frame_id as usize].reset();
        state.replacer.pin(frame_id);
        self.inner.frames[frame_id as usize].data.write().fill(0);
        state.free_list.push_back(frame_id);

        log::trace!("deleted page {} from frame {}", page_id, frame_id);
        Ok(true)
    }

    /// Write a resident page to disk regardless of its dirty flag.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<bool> {
        let mut state = self.inner.state.lock();

        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };

        self.inner.write_frame(frame_id, page_id)?;
        state.frame_meta[frame_id as usize].is_dirty = false;
        Ok(true)
    }

    pub fn flush_all(&self) -> StorageResult<()> {
        self.inner.flush_all()?;
        self.inner.disk_manager.lock().sync()
    }

    pub fn allocate_page(&self) -> StorageResult<PageId> {
        self.inner.disk_manager.lock().allocate_page()
    }

    pub fn deallocate_page(&self, page_id: PageId) -> StorageResult<bool> {
        self.inner.disk_manager.lock().deallocate_page(page_id)
    }

    pub fn is_page_free(&self, page_id: PageId) -> StorageResult<bool> {
        self.inner.disk_manager.lock().is_page_free(page_id)
    }

    /// Pin count of a resident page, or None if it is not in the pool.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.inner.state.lock();
        state
            .page_table
            .get(&page_id)
            .map(|&frame_id| state.frame_meta[frame_id as usize].pin_count)
    }

    /// Debug check that every frame has been unpinned. Logs each pinned frame.
    pub fn check_all_unpinned(&self) -> bool {
        let state = self.inner.state.lock();
        let mut all_unpinned = true;
        for meta in state.frame_meta.iter().filter(|m| m.pin_count != 0) {
            all_unpinned = false;
            log::error!(
                "page {:?} still pinned (pin count {})",
                meta.page_id,
                meta.pin_count
            );
        }
        all_unpinned
    }

    /// Run `f` against the disk manager, e.g. to read allocator statistics.
    pub fn with_disk_manager<R>(&self, f: impl FnOnce(&DiskManager) -> R) -> R {
        f(&self.inner.disk_manager.lock())
    }

    fn guard(&self, frame_id: FrameId, page_id: PageId) -> PageGuard {
        PageGuard {
            inner: self.inner.clone(),
            frame_id,
            page_id,
            is_dirty: false,
        }
    }
}

impl BufferPoolInner {
    /// Pick a frame for a new resident page: the free list first, then an
    /// LRU victim, whose dirty contents are written back.
    fn acquire_frame(&self, state: &mut PoolState) -> StorageResult<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = state.replacer.victim().ok_or(StorageError::BufferPoolFull)?;
        let meta = state.frame_meta[frame_id as usize].clone();

        if let Some(old_page_id) = meta.page_id {
            if meta.is_dirty {
                if let Err(e) = self.write_frame(frame_id, old_page_id) {
                    state.replacer.unpin(frame_id);
                    return Err(e);
                }
            }
            state.page_table.remove(&old_page_id);
            log::trace!("evicted page {} from frame {}", old_page_id, frame_id);
        }
        state.frame_meta[frame_id as usize].reset();

        Ok(frame_id)
    }

    fn write_frame(&self, frame_id: FrameId, page_id: PageId) -> StorageResult<()> {
        let data = self.frames[frame_id as usize].data.read();
        self.disk_manager.lock().write_page(page_id, &data)
    }

    fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut state = self.state.lock();

        let Some(&frame_id) = state.page_table.get(&page_id) else {
            log::warn!("unpin of page {} which is not resident", page_id);
            return false;
        };

        let meta = &mut state.frame_meta[frame_id as usize];
        if meta.pin_count == 0 {
            log::warn!("unpin of page {} which is not pinned", page_id);
            return false;
        }

        meta.pin_count -= 1;
        meta.is_dirty |= is_dirty;
        if meta.pin_count == 0 {
            state.replacer.unpin(frame_id);
        }
        true
    }

    fn flush_all(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        let resident: Vec<(PageId, FrameId)> =
            state.page_table.iter().map(|(&p, &f)| (p, f)).collect();

        for (page_id, frame_id) in resident {
            if state.frame_meta[frame_id as usize].is_dirty {
                self.write_frame(frame_id, page_id)?;
                state.frame_meta[frame_id as usize].is_dirty = false;
            }
        }
        Ok(())
    }
}

impl Drop for BufferPoolInner {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all() {
            log::error!("failed to flush buffer pool on shutdown: {}", e);
        }
        if let Err(e) = self.disk_manager.lock().close() {
            log::error!("failed to close disk manager: {}", e);
        }
    }
}

/// A pinned page. Dropping the guard unpins it, passing along whether the
/// page was written through [`PageGuard::data_mut`].
pub struct PageGuard {
    inner: Arc<BufferPoolInner>,
    frame_id: FrameId,
    page_id: PageId,
    is_dirty: bool,
}

impl PageGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8; PAGE_SIZE]> {
        RwLockReadGuard::map(self.inner.frames[self.frame_id as usize].data.read(), |d| {
            &**d
        })
    }

    pub fn data_mut(&mut self) -> MappedRwLockWriteGuard<'_, [u8; PAGE_SIZE]> {
        self.is_dirty = true;
        RwLockWriteGuard::map(
            self.inner.frames[self.frame_id as usize].data.write(),
            |d| &mut **d,
        )
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.inner.unpin_page(self.page_id, self.is_dirty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::{tempdir, TempDir};

    fn create_test_buffer_pool(pool_size: usize) -> Result<(BufferPoolManager, TempDir)> {
        let dir = tempdir()?;
        let disk_manager = DiskManager::create(&dir.path().join("test.db"))?;
        Ok((BufferPoolManager::with_lru(disk_manager, pool_size), dir))
    }

    #[test]
    fn test_new_page() -> Result<()> {
        let (buffer_pool, _dir) = create_test_buffer_pool(10)?;

        let (page_id, mut guard) = buffer_pool.new_page()?;
        assert_eq!(page_id, PageId(0));
        assert!(guard.data().iter().all(|&b| b == 0));

        guard.data_mut()[0] = 42;
        guard.data_mut()[1] = 43;
        drop(guard);

        let guard = buffer_pool.fetch_page(page_id)?;
        assert_eq!(guard.data()[0], 42);
        assert_eq!(guard.data()[1], 43);

        Ok(())
    }

    #[test]
    fn test_pin_counts() -> Result<()> {
        let (buffer_pool, _dir) = create_test_buffer_pool(10)?;

        let (page_id, guard1) = buffer_pool.new_page()?;
        let guard2 = buffer_pool.fetch_page(page_id)?;
        assert_eq!(buffer_pool.pin_count(page_id), Some(2));

        drop(guard1);
        assert_eq!(buffer_pool.pin_count(page_id), Some(1));
        drop(guard2);
        assert_eq!(buffer_pool.pin_count(page_id), Some(0));
        assert!(buffer_pool.check_all_unpinned());

        Ok(())
    }

    #[test]
    fn test_eviction() -> Result<()> {
        let (buffer_pool, _dir) = create_test_buffer_pool(2)?;

        // Create 3 pages (more than buffer pool capacity)
        for i in 0..3u8 {
            let (page_id, mut guard) = buffer_pool.new_page()?;
            assert_eq!(page_id, PageId(i as u32));
            guard.data_mut()[0] = i + 1;
        }

        // Page 0 was evicted and must have been written back
        assert_eq!(buffer_pool.pin_count(PageId(0)), None);
        let guard0 = buffer_pool.fetch_page(PageId(0))?;
        assert_eq!(guard0.data()[0], 1);

        let guard1 = buffer_pool.fetch_page(PageId(1))?;
        assert_eq!(guard1.data()[0], 2);

        Ok(())
    }

    #[test]
    fn test_fully_pinned_pool() -> Result<()> {
        let (buffer_pool, _dir) = create_test_buffer_pool(2)?;

        let (page_id0, guard0) = buffer_pool.new_page()?;
        let (_page_id1, _guard1) = buffer_pool.new_page()?;
        let page_id2 = buffer_pool.allocate_page()?;

        assert!(matches!(
            buffer_pool.fetch_page(page_id2),
            Err(StorageError::BufferPoolFull)
        ));
        assert!(matches!(
            buffer_pool.new_page(),
            Err(StorageError::BufferPoolFull)
        ));

        drop(guard0);
        let guard2 = buffer_pool.fetch_page(page_id2)?;
        assert_eq!(guard2.page_id(), page_id2);
        assert_eq!(buffer_pool.pin_count(page_id0), None);

        Ok(())
    }

    #[test]
    fn test_failed_new_page_does_not_leak_allocation() -> Result<()> {
        let (buffer_pool, _dir) = create_test_buffer_pool(1)?;

        let (_page_id, _guard) = buffer_pool.new_page()?;
        let allocated = buffer_pool.with_disk_manager(|dm| dm.num_allocated_pages());

        assert!(buffer_pool.new_page().is_err());
        assert_eq!(
            buffer_pool.with_disk_manager(|dm| dm.num_allocated_pages()),
            allocated
        );

        Ok(())
    }

    #[test]
    fn test_lru_victim_order() -> Result<()> {
        let (buffer_pool, _dir) = create_test_buffer_pool(3)?;

        let (p0, g0) = buffer_pool.new_page()?;
        let (p1, g1) = buffer_pool.new_page()?;
        let (p2, g2) = buffer_pool.new_page()?;

        // Unpin order: p1, p0, p2
        drop(g1);
        drop(g0);
        drop(g2);

        let (_p3, _g3) = buffer_pool.new_page()?;
        assert_eq!(buffer_pool.pin_count(p1), None);
        assert_eq!(buffer_pool.pin_count(p0), Some(0));

        // Touching p0 again moves it behind p2
        drop(buffer_pool.fetch_page(p0)?);
        let (_p4, _g4) = buffer_pool.new_page()?;
        assert_eq!(buffer_pool.pin_count(p2), None);
        assert_eq!(buffer_pool.pin_count(p0), Some(0));

        Ok(())
    }

    #[test]
    fn test_unpin_page() -> Result<()> {
        let (buffer_pool, _dir) = create_test_buffer_pool(4)?;

        let (page_id, guard) = buffer_pool.new_page()?;
        drop(guard);

        // Already at zero pins
        assert!(!buffer_pool.unpin_page(page_id, false));
        // Not resident at all
        assert!(!buffer_pool.unpin_page(PageId(77), false));

        Ok(())
    }

    #[test]
    fn test_unpin_dirty_flag_is_sticky() -> Result<()> {
        let (buffer_pool, _dir) = create_test_buffer_pool(1)?;

        let (page_id, mut guard) = buffer_pool.new_page()?;
        guard.data_mut()[10] = 7;
        drop(guard);
        buffer_pool.flush_page(page_id)?;

        // Write through one guard, release a second clean guard afterwards
        let mut writer = buffer_pool.fetch_page(page_id)?;
        let reader = buffer_pool.fetch_page(page_id)?;
        writer.data_mut()[10] = 8;
        drop(writer);
        drop(reader);

        // Force eviction; the clean unpin must not have cleared the dirty flag
        let (_other, _g) = buffer_pool.new_page()?;
        drop(_g);
        let guard = buffer_pool.fetch_page(page_id)?;
        assert_eq!(guard.data()[10], 8);

        Ok(())
    }

    #[test]
    fn test_delete_page() -> Result<()> {
        let (buffer_pool, _dir) = create_test_buffer_pool(4)?;

        let (page_id, guard) = buffer_pool.new_page()?;
        assert!(!buffer_pool.delete_page(page_id)?);
        assert!(!buffer_pool.is_page_free(page_id)?);

        drop(guard);
        assert!(buffer_pool.delete_page(page_id)?);
        assert!(buffer_pool.is_page_free(page_id)?);
        assert_eq!(buffer_pool.pin_count(page_id), None);

        // Deleting a non-resident page is a no-op
        assert!(buffer_pool.delete_page(PageId(99))?);

        // The freed id is handed out again
        let (reused, _guard) = buffer_pool.new_page()?;
        assert_eq!(reused, page_id);

        Ok(())
    }

    #[test]
    fn test_deleted_frame_is_not_evictable_twice() -> Result<()> {
        let (buffer_pool, _dir) = create_test_buffer_pool(2)?;

        let (p0, g0) = buffer_pool.new_page()?;
        drop(g0);
        buffer_pool.delete_page(p0)?;

        // Both frames are usable exactly once each
        let (_a, _ga) = buffer_pool.new_page()?;
        let (_b, _gb) = buffer_pool.new_page()?;
        assert!(buffer_pool.new_page().is_err());

        Ok(())
    }

    #[test]
    fn test_flush() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        let page_id = {
            let buffer_pool = BufferPoolManager::with_lru(DiskManager::create(&file_path)?, 10);
            let (page_id, mut guard) = buffer_pool.new_page()?;
            guard.data_mut()[0] = 99;
            drop(guard);

            assert!(buffer_pool.flush_page(page_id)?);
            assert!(!buffer_pool.flush_page(PageId(1234))?);
            page_id
        };

        let mut disk_manager = DiskManager::open(&file_path)?;
        let mut buf = [0u8; PAGE_SIZE];
        disk_manager.read_page(page_id, &mut buf)?;
        assert_eq!(buf[0], 99);

        Ok(())
    }

    #[test]
    fn test_drop_flushes_dirty_pages() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        {
            let buffer_pool = BufferPoolManager::with_lru(DiskManager::create(&file_path)?, 10);
            for i in 0..5u8 {
                let (_page_id, mut guard) = buffer_pool.new_page()?;
                guard.data_mut()[0] = i;
            }
        }

        let buffer_pool = BufferPoolManager::with_lru(DiskManager::open(&file_path)?, 10);
        for i in 0..5u8 {
            let guard = buffer_pool.fetch_page(PageId(i as u32))?;
            assert_eq!(guard.data()[0], i);
        }
        assert_eq!(
            buffer_pool.with_disk_manager(|dm| dm.num_allocated_pages()),
            5
        );

        Ok(())
    }

    #[test]
    fn test_balanced_pins_under_pressure() -> Result<()> {
        let (buffer_pool, _dir) = create_test_buffer_pool(4)?;

        let mut page_ids = Vec::new();
        for i in 0..20u32 {
            let (page_id, mut guard) = buffer_pool.new_page()?;
            guard.data_mut()[0..4].copy_from_slice(&i.to_le_bytes());
            page_ids.push(page_id);
        }

        for (i, page_id) in page_ids.iter().enumerate().rev() {
            let a = buffer_pool.fetch_page(*page_id)?;
            let b = buffer_pool.fetch_page(*page_id)?;
            assert_eq!(a.data()[0..4], (i as u32).to_le_bytes());
            assert_eq!(b.page_id(), *page_id);
        }

        assert!(buffer_pool.check_all_unpinned());
        Ok(())
    }
}
