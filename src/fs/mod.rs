//! Filesystem layer: the free-sector map and the extensible-file inode
//! table.

pub mod freemap;
pub mod inode;

pub use freemap::FreeMap;
pub use inode::{Inode, InodeDisk, InodeTable, MAX_FILE_SIZE};
