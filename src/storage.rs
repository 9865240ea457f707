//! Storage layer implementation for pagedb.
//!
//! Everything lives in one file of fixed-size pages. Key components:
//!
//! - **DiskManager**: maps logical page ids onto the file's extent layout and
//!   tracks free/used pages with one bitmap page per extent
//! - **BufferPoolManager**: fixed pool of frames caching pages, with pin counts
//!   and LRU eviction of unpinned frames
//! - **page**: the on-disk formats (bitmap, disk meta, index roots, B+Tree nodes)
//!
//! Higher layers only ever see pages through the buffer pool.

pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;

pub use buffer::{BufferPoolManager, PageGuard};
pub use disk::DiskManager;
pub use error::{StorageError, StorageResult};
pub use page::PageId;

/// Size of every page in the file, in bytes.
pub const PAGE_SIZE: usize = 4096;
