mod bitmap;
mod block_cache;
mod block_dev;
mod efs;
mod file;
mod layout;
mod vfs;
pub mod walker;

use crate::disk::SECTOR_SIZE;

/// 一个块就是一个扇区
pub const BLOCK_SIZE: usize = SECTOR_SIZE;
/// 同时驻留在内存中的扇区缓存数量上限
pub const BLOCK_CACHE_SIZE: usize = 64;
/// 每个设备最多同时保留的预读缓冲区
pub const PREFETCH_LIMIT: usize = 16;
/// Magic number for sanity check
pub const EASY_FS_MAGIC: u32 = 0x3b800001;
/// The max number of direct inodes
pub const INODE_DIRECT_COUNT: usize = 28;
/// The max length of inode name
pub const NAME_LENGTH_LIMIT: usize = 27;
/// The max number of indirect1 inodes
pub const INODE_INDIRECT1_COUNT: usize = BLOCK_SIZE / 4;
/// 一个扇区的 bit 数量
pub const BLOCK_BITS: usize = BLOCK_SIZE * 8;
/// 目录项的大小
pub const DIRENT_SIZE: usize = 32;

pub use bitmap::Bitmap;
pub use block_cache::{block_cache_sync_all, get_block_cache, BufferCache, CacheStats};
pub use block_dev::BlockDevice;
pub use efs::EasyFileSystem;
pub use file::File;
pub use layout::*;
pub use vfs::Inode;
