//! 磁盘块管理器, 把各个布局区域整合起来
//!
//! [`EasyFileSystem`] 知道每个区域所在的位置, 索引节点和数据块的分配都要经过它.
//! 它还维护着打开的 inode 表: 同一个 inode 编号无论被查找多少次, 得到的都是同一个内存中的 [`Inode`],
//! 这样禁止写入的计数才能在所有打开它的文件之间共享.

use std::sync::{Arc, Weak};

use log::{debug, info};
use spin::Mutex;

use super::{
    block_cache_sync_all, get_block_cache, Bitmap, BlockDevice, BufferCache, DiskInode,
    DiskInodeType, Inode, SuperBlock, BLOCK_SIZE,
};
use crate::{
    disk::DiskScheduler,
    error::{Error, Result},
};

/// Blocks: Super Block(0) -> Inode Bit Map Blocks -> Inode Blocks -> Data Bit Map Blocks -> Data Blocks
pub struct EasyFileSystem {
    /// 会被拷贝给下层的数据结构, 让它们也能直接访问块设备
    pub block_device: Arc<dyn BlockDevice>,
    pub inode_bitmap: Bitmap,
    pub data_bitmap: Bitmap,
    inode_area_start_block: u32,
    data_area_start_block: u32,
    data_area_blocks: u32,
    buffer_cache: Arc<BufferCache>,
    open_inodes: Vec<(u32, Weak<Inode>)>,
}

type DataBlock = [u8; BLOCK_SIZE];

impl EasyFileSystem {
    /// 在块设备的前 total_blocks 个扇区上创建一个空的文件系统, 只有根目录
    pub fn create(
        block_device: Arc<dyn BlockDevice>,
        total_blocks: u32,
        inode_bitmap_blocks: u32,
    ) -> Arc<Mutex<Self>> {
        assert!(total_blocks as usize <= block_device.num_blocks());
        let inode_bitmap = Bitmap::new(1, inode_bitmap_blocks as usize);
        // inode 区域要让位图中的每个 bit 都有一个实际的 inode 对应
        let inode_num = inode_bitmap.maximum();
        let inode_area_blocks =
            ((inode_num * std::mem::size_of::<DiskInode>() + BLOCK_SIZE - 1) / BLOCK_SIZE) as u32;
        let inode_total_blocks = inode_area_blocks + inode_bitmap_blocks;
        // 减去的 1 是超级块
        let data_total_blocks = total_blocks - 1 - inode_total_blocks;
        // x 个位图块最多管理 4096 * x 个数据块: data_total_blocks - x <= 4096 * x,
        // 取 x 的最小整数解
        let data_bitmap_blocks = (data_total_blocks + 4096) / 4097;
        let data_area_blocks = data_total_blocks - data_bitmap_blocks;
        let data_bitmap = Bitmap::new(
            (1 + inode_total_blocks) as usize,
            data_bitmap_blocks as usize,
        );

        let mut fs = Self {
            block_device: Arc::clone(&block_device),
            inode_bitmap,
            data_bitmap,
            inode_area_start_block: 1 + inode_bitmap_blocks,
            data_area_start_block: 1 + inode_total_blocks + data_bitmap_blocks,
            data_area_blocks,
            buffer_cache: Arc::new(BufferCache::new(Arc::clone(&block_device))),
            open_inodes: Vec::new(),
        };

        // 第一次使用, 把所有扇区清零
        for i in 0..total_blocks {
            get_block_cache(i as usize, Arc::clone(&block_device))
                .lock()
                .modify(0, |data_block: &mut DataBlock| data_block.fill(0));
        }

        get_block_cache(0, Arc::clone(&block_device)).lock().modify(
            0,
            |super_block: &mut SuperBlock| {
                super_block.initialize(
                    total_blocks,
                    inode_bitmap_blocks,
                    inode_area_blocks,
                    data_bitmap_blocks,
                    data_area_blocks,
                );
            },
        );

        // 根目录是第一个分配的 inode, 编号固定为 0
        assert_eq!(fs.alloc_inode().ok(), Some(0));
        let (root_inode_block_id, root_inode_offset) = fs.get_disk_inode_pos(0);
        get_block_cache(root_inode_block_id as usize, Arc::clone(&block_device))
            .lock()
            .modify(root_inode_offset, |disk_inode: &mut DiskInode| {
                disk_inode.initialize(DiskInodeType::Directory);
            });
        block_cache_sync_all();

        info!(
            "created easy-fs: {} blocks, {} inodes, {} data blocks",
            total_blocks, inode_num, data_area_blocks
        );
        Arc::new(Mutex::new(fs))
    }

    /// 从一个已写入了镜像的块设备上打开文件系统
    pub fn open(block_device: Arc<dyn BlockDevice>) -> Result<Arc<Mutex<Self>>> {
        get_block_cache(0, Arc::clone(&block_device))
            .lock()
            .read(0, |super_block: &SuperBlock| {
                if !super_block.is_valid() {
                    return Err(Error::BadMagic);
                }
                debug!("opening easy-fs: {:?}", super_block);
                let inode_total_blocks =
                    super_block.inode_bitmap_blocks + super_block.inode_area_blocks;
                let fs = Self {
                    block_device: Arc::clone(&block_device),
                    inode_bitmap: Bitmap::new(1, super_block.inode_bitmap_blocks as usize),
                    data_bitmap: Bitmap::new(
                        (1 + inode_total_blocks) as usize,
                        super_block.data_bitmap_blocks as usize,
                    ),
                    inode_area_start_block: 1 + super_block.inode_bitmap_blocks,
                    data_area_start_block: 1 + inode_total_blocks + super_block.data_bitmap_blocks,
                    data_area_blocks: super_block.data_area_blocks,
                    buffer_cache: Arc::new(BufferCache::new(Arc::clone(&block_device))),
                    open_inodes: Vec::new(),
                };
                Ok(Arc::new(Mutex::new(fs)))
            })
    }

    /// inode 编号 -> (所在扇区号, 扇区内偏移)
    pub fn get_disk_inode_pos(&self, inode_id: u32) -> (u32, usize) {
        let inode_size = std::mem::size_of::<DiskInode>();
        let inodes_per_block = (BLOCK_SIZE / inode_size) as u32;
        let block_id = self.inode_area_start_block + inode_id / inodes_per_block;
        (
            block_id,
            (inode_id % inodes_per_block) as usize * inode_size,
        )
    }

    pub fn alloc_inode(&mut self) -> Result<u32> {
        self.inode_bitmap
            .alloc(&self.block_device)
            .map(|id| id as u32)
            .ok_or(Error::NoSpace)
    }

    /// 返回的是数据块在设备上的扇区号, 而不是位图中的 bit 编号
    pub fn alloc_data(&mut self) -> Result<u32> {
        match self.data_bitmap.alloc(&self.block_device) {
            // 最后一个位图块可能比数据区域多出一些 bit
            Some(bit) if bit < self.data_area_blocks as usize => {
                Ok(bit as u32 + self.data_area_start_block)
            }
            _ => Err(Error::NoSpace),
        }
    }

    /// 在打开的 inode 表中查找, 没有时创建一个新的内存 Inode 并登记
    pub(super) fn open_inode(&mut self, inode_id: u32, fs: &Arc<Mutex<Self>>) -> Arc<Inode> {
        self.open_inodes.retain(|(_, inode)| inode.strong_count() > 0);
        if let Some(inode) = self
            .open_inodes
            .iter()
            .find(|(id, _)| *id == inode_id)
            .and_then(|(_, inode)| inode.upgrade())
        {
            return inode;
        }
        let (block_id, block_offset) = self.get_disk_inode_pos(inode_id);
        let inode = Arc::new(Inode::new(
            inode_id,
            block_id,
            block_offset,
            Arc::clone(fs),
            Arc::clone(&self.block_device),
            Arc::clone(&self.buffer_cache),
        ));
        self.open_inodes.push((inode_id, Arc::downgrade(&inode)));
        inode
    }

    /// 文件系统的使用者打开 efs 之后要做的第一件事情就是获取根目录的 Inode
    pub fn root_inode(fs: &Arc<Mutex<Self>>) -> Arc<Inode> {
        fs.lock().open_inode(0, fs)
    }

    pub fn buffer_cache(&self) -> &Arc<BufferCache> {
        &self.buffer_cache
    }

    /// 让文件读路径的预读经由 scheduler 完成
    pub fn attach_scheduler(&self, scheduler: Arc<DiskScheduler>) {
        self.buffer_cache.attach_scheduler(scheduler);
    }
}
