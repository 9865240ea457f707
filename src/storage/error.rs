//! Storage layer error types.

use crate::storage::page::PageId;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Buffer pool is full: every frame is pinned")]
    BufferPoolFull,

    #[error("Disk is full: page limit of {limit} reached")]
    DiskFull { limit: u64 },

    #[error("Invalid page id: {0}")]
    InvalidPage(PageId),

    #[error("Corrupted {what}: {detail}")]
    Corrupted { what: &'static str, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
