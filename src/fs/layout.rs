//! 磁盘数据结构: [`SuperBlock`], [`DiskInode`], [`DirEntry`]
//!
//! 磁盘按扇区号从小到大分成 5 个连续区域:
//!
//! - 超级块, 一个扇区, 以魔数提供合法性检查并记录其他区域的长度
//! - 索引节点位图
//! - 索引节点区域, 每个扇区放 4 个 DiskInode
//! - 数据块位图
//! - 数据块区域

use std::{
    fmt::{Debug, Formatter, Result},
    sync::Arc,
};

use super::{
    get_block_cache, BlockDevice, BLOCK_SIZE, DIRENT_SIZE, EASY_FS_MAGIC, INODE_DIRECT_COUNT,
    INODE_INDIRECT1_COUNT, NAME_LENGTH_LIMIT,
};

#[repr(C)]
pub struct SuperBlock {
    magic: u32,
    pub total_blocks: u32,
    pub inode_bitmap_blocks: u32,
    pub inode_area_blocks: u32,
    pub data_bitmap_blocks: u32,
    pub data_area_blocks: u32,
}

impl Debug for SuperBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.debug_struct("SuperBlock")
            .field("magic", &self.magic)
            .field("total_blocks", &self.total_blocks)
            .field("inode_bitmap_blocks", &self.inode_bitmap_blocks)
            .field("inode_area_blocks", &self.inode_area_blocks)
            .field("data_bitmap_blocks", &self.data_bitmap_blocks)
            .field("data_area_blocks", &self.data_area_blocks)
            .finish()
    }
}

impl SuperBlock {
    /// 各区域的扇区数由上层的 EasyFileSystem 计算好再传进来
    pub fn initialize(
        &mut self,
        total_blocks: u32,
        inode_bitmap_blocks: u32,
        inode_area_blocks: u32,
        data_bitmap_blocks: u32,
        data_area_blocks: u32,
    ) {
        *self = Self {
            magic: EASY_FS_MAGIC,
            total_blocks,
            inode_bitmap_blocks,
            inode_area_blocks,
            data_bitmap_blocks,
            data_area_blocks,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == EASY_FS_MAGIC
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
#[repr(u32)]
pub enum DiskInodeType {
    File,
    Directory,
}

/// 一级索引块: 128 个 u32, 每个指向一个数据块
type IndirectBlock = [u32; BLOCK_SIZE / 4];

type DataBlock = [u8; BLOCK_SIZE];

/// 每个文件/目录在磁盘上以一个 128 字节的 DiskInode 存储
///
/// 只有直接索引和一级间接索引, 单个文件最多 (28 + 128) 个扇区.
#[repr(C)]
pub struct DiskInode {
    /// 文件内容的字节数
    pub size: u32,
    /// 已经分配了数据块的字节数, 不小于 size
    pub alloc_size: u32,
    pub direct: [u32; INODE_DIRECT_COUNT],
    pub indirect1: u32,
    pub type_: DiskInodeType,
}

impl DiskInode {
    /// 单个文件的最大字节数
    pub const MAX_SIZE: usize = (INODE_DIRECT_COUNT + INODE_INDIRECT1_COUNT) * BLOCK_SIZE;

    pub fn initialize(&mut self, type_: DiskInodeType) {
        self.size = 0;
        self.alloc_size = 0;
        self.direct.iter_mut().for_each(|x| *x = 0);
        self.indirect1 = 0;
        self.type_ = type_;
    }

    pub fn is_dir(&self) -> bool {
        self.type_ == DiskInodeType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.type_ == DiskInodeType::File
    }

    /// 文件内部第 inner_id 个数据块在设备上的扇区号
    pub fn get_block_id(&self, inner_id: u32, block_device: &Arc<dyn BlockDevice>) -> u32 {
        let inner_id = inner_id as usize;
        if inner_id < INODE_DIRECT_COUNT {
            self.direct[inner_id]
        } else {
            get_block_cache(self.indirect1 as usize, Arc::clone(block_device))
                .lock()
                .read(0, |indirect1: &IndirectBlock| {
                    indirect1[inner_id - INODE_DIRECT_COUNT]
                })
        }
    }

    /// 容纳 alloc_size 字节需要的数据块数
    pub fn data_blocks(&self) -> u32 {
        Self::_data_blocks(self.alloc_size)
    }

    fn _data_blocks(size: u32) -> u32 {
        (size + BLOCK_SIZE as u32 - 1) / BLOCK_SIZE as u32
    }

    /// 数据块加上索引块的总数
    pub fn total_blocks(size: u32) -> u32 {
        let data_blocks = Self::_data_blocks(size);
        if data_blocks as usize > INODE_DIRECT_COUNT {
            data_blocks + 1
        } else {
            data_blocks
        }
    }

    /// 把 alloc_size 扩到 new_size 需要额外分配多少块
    pub fn blocks_num_needed(&self, new_size: u32) -> u32 {
        assert!(new_size >= self.alloc_size);
        Self::total_blocks(new_size) - Self::total_blocks(self.alloc_size)
    }

    /// 把容量扩到 new_size, new_blocks 是上层分配好的块 (先数据块, 必要时中间夹一个一级索引块)
    pub fn increase_size(
        &mut self,
        new_size: u32,
        new_blocks: Vec<u32>,
        block_device: &Arc<dyn BlockDevice>,
    ) {
        assert!(new_size as usize <= Self::MAX_SIZE);
        let mut current_blocks = self.data_blocks();
        self.alloc_size = new_size;
        self.size = self.size.max(new_size);
        let total_blocks = self.data_blocks();
        let mut new_blocks = new_blocks.into_iter();

        while current_blocks < total_blocks.min(INODE_DIRECT_COUNT as u32) {
            self.direct[current_blocks as usize] = new_blocks.next().unwrap();
            current_blocks += 1;
        }
        if total_blocks <= INODE_DIRECT_COUNT as u32 {
            return;
        }

        if current_blocks == INODE_DIRECT_COUNT as u32 {
            // 直接索引刚好填满, 第一次用到一级索引
            self.indirect1 = new_blocks.next().unwrap();
        }
        get_block_cache(self.indirect1 as usize, Arc::clone(block_device))
            .lock()
            .modify(0, |indirect1: &mut IndirectBlock| {
                while current_blocks < total_blocks {
                    indirect1[current_blocks as usize - INODE_DIRECT_COUNT] =
                        new_blocks.next().unwrap();
                    current_blocks += 1;
                }
            });
    }

    /// 把从 offset 开始的内容读到 buf, 返回实际读到的字节数 (最多到 size 为止)
    pub fn read_at(
        &self,
        offset: usize,
        buf: &mut [u8],
        block_device: &Arc<dyn BlockDevice>,
    ) -> usize {
        let end = offset.saturating_add(buf.len()).min(self.size as usize);
        self.copy_range(offset, end, block_device, |block_id, range, done| {
            get_block_cache(block_id, Arc::clone(block_device))
                .lock()
                .read(0, |data: &DataBlock| {
                    let len = range.len();
                    buf[done..done + len].copy_from_slice(&data[range]);
                });
        })
    }

    /// 把 buf 写到从 offset 开始的位置, 最多写到 alloc_size 为止; 越界的部分需要调用者先 increase_size
    pub fn write_at(
        &mut self,
        offset: usize,
        buf: &[u8],
        block_device: &Arc<dyn BlockDevice>,
    ) -> usize {
        let end = offset.saturating_add(buf.len()).min(self.alloc_size as usize);
        self.copy_range(offset, end, block_device, |block_id, range, done| {
            get_block_cache(block_id, Arc::clone(block_device))
                .lock()
                .modify(0, |data: &mut DataBlock| {
                    let len = range.len();
                    data[range].copy_from_slice(&buf[done..done + len]);
                });
        })
    }

    /// 按扇区遍历字节区间 [start, end), 对每一段调用 f(扇区号, 扇区内范围, 已经处理的字节数)
    fn copy_range(
        &self,
        mut start: usize,
        end: usize,
        block_device: &Arc<dyn BlockDevice>,
        mut f: impl FnMut(usize, std::ops::Range<usize>, usize),
    ) -> usize {
        let mut done = 0usize;
        while start < end {
            let block_end = ((start / BLOCK_SIZE + 1) * BLOCK_SIZE).min(end);
            let block_id = self.get_block_id((start / BLOCK_SIZE) as u32, block_device) as usize;
            f(
                block_id,
                start % BLOCK_SIZE..start % BLOCK_SIZE + (block_end - start),
                done,
            );
            done += block_end - start;
            start = block_end;
        }
        done
    }
}

/// 目录项: 文件名和 inode 编号的二元组, 32 字节, 每个扇区放 16 个
#[repr(C)]
pub struct DirEntry {
    /// 最后一个字节留给 '\0'
    name: [u8; NAME_LENGTH_LIMIT + 1],
    inode_id: u32,
}

impl DirEntry {
    pub fn create_empty() -> Self {
        Self {
            name: [0; NAME_LENGTH_LIMIT + 1],
            inode_id: 0,
        }
    }

    /// name 超过 NAME_LENGTH_LIMIT 字节的部分被截掉
    pub fn new(name: &str, inode_id: u32) -> Self {
        let mut name_bytes = [0; NAME_LENGTH_LIMIT + 1];
        let len = name.len().min(NAME_LENGTH_LIMIT);
        name_bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self {
            name: name_bytes,
            inode_id,
        }
    }

    // 目录的内容通过 DiskInode::read_at/write_at 读写, 所以需要把目录项看成字节切片

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, DIRENT_SIZE) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self as *mut Self as *mut u8, DIRENT_SIZE) }
    }

    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_LENGTH_LIMIT);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    pub fn inode_id(&self) -> u32 {
        self.inode_id
    }
}
