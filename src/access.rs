//! Access layer built on top of the buffer pool.
//!
//! - **RowId**: locator of a row in the row store, the value type of indexes
//! - **BPlusTree**: ordered unique-key index whose nodes are buffer pool pages
//! - **KeyManager**: key size plus the comparator that orders index keys
//!
//! Nothing here touches the disk manager directly; every page is borrowed
//! from the buffer pool through a [`crate::storage::PageGuard`].

pub mod btree;
pub mod row_id;

pub use btree::{BPlusTree, IndexIterator, KeyComparator, KeyManager};
pub use row_id::RowId;
