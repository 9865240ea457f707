//! File layer: one file, one meta page, and extents of bitmap-tracked data pages.

pub mod disk_manager;

pub use disk_manager::DiskManager;
