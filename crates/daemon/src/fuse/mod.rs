//! FUSE filesystem integration
//!
//! Exposes an open device protocol session as a local filesystem.
//!
//! # Architecture
//!
//! - `FuserBackend`: [`MountBackend`](crate::mount::MountBackend) that mounts through fuser
//! - `DeviceFs`: FUSE operation table translating requests into session calls
//! - `InodeTable`: Bidirectional inode ↔ path mapping
//! - `FileCache`: TTL cache for attributes, listings and missing paths

mod backend;
mod cache;
mod device_fs;
mod inode_table;

pub use backend::{fuse_options, FuserBackend, FuserExit, FuserMount};
pub use cache::{CacheStats, FileCache};
pub use device_fs::{errno, DeviceFs, Listing};
pub use inode_table::InodeTable;
