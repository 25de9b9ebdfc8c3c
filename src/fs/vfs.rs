//! 内存中的索引节点 Inode
//!
//! DiskInode 放在磁盘上比较固定的位置, 而 Inode 是放在内存中的记录文件索引节点信息的数据结构.
//! 文件系统只有一个扁平的根目录, 所有文件都在根目录下面.
//!
//! 所有暴露给使用者的操作全程持有 EasyFileSystem 的互斥锁,
//! 文件系统内部的函数 (如 find_inode_id) 假定锁已经被持有, 不会再去获取它.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use log::{error, trace};
use spin::{Mutex, MutexGuard};

use super::{
    block_cache_sync_all, efs::EasyFileSystem, get_block_cache, walker::SectorMap, BlockDevice,
    BufferCache, DirEntry, DiskInode, DiskInodeType, BLOCK_SIZE, DIRENT_SIZE,
};
use crate::error::{Error, Result};

pub struct Inode {
    inode_id: u32,
    /// 位于哪个扇区
    block_id: usize,
    /// 扇区内的偏移
    block_offset: usize,
    fs: Arc<Mutex<EasyFileSystem>>,
    block_device: Arc<dyn BlockDevice>,
    cache: Arc<BufferCache>,
    /// 有多少个打开的文件禁止了写入, 不为 0 时所有写操作都写不进任何字节
    deny_write_cnt: AtomicUsize,
}

impl Inode {
    pub fn new(
        inode_id: u32,
        block_id: u32,
        block_offset: usize,
        fs: Arc<Mutex<EasyFileSystem>>,
        block_device: Arc<dyn BlockDevice>,
        cache: Arc<BufferCache>,
    ) -> Self {
        trace!("inode {} opened", inode_id);
        Self {
            inode_id,
            block_id: block_id as usize,
            block_offset,
            fs,
            block_device,
            cache,
            deny_write_cnt: AtomicUsize::new(0),
        }
    }

    fn read_disk_inode<V>(&self, f: impl FnOnce(&DiskInode) -> V) -> V {
        get_block_cache(self.block_id, Arc::clone(&self.block_device))
            .lock()
            .read(self.block_offset, f)
    }

    fn modify_disk_inode<V>(&self, f: impl FnOnce(&mut DiskInode) -> V) -> V {
        get_block_cache(self.block_id, Arc::clone(&self.block_device))
            .lock()
            .modify(self.block_offset, f)
    }

    pub fn inode_id(&self) -> u32 {
        self.inode_id
    }

    /// 文件读路径使用的缓存
    pub fn sector_cache(&self) -> &Arc<BufferCache> {
        &self.cache
    }

    /// 再取得一个引用, 它的生命周期与原来的引用无关; drop 即关闭
    pub fn reopen(self: &Arc<Self>) -> Arc<Self> {
        trace!("inode {} reopened", self.inode_id);
        Arc::clone(self)
    }

    fn find_inode_id(&self, name: &str, disk_inode: &DiskInode) -> Option<u32> {
        assert!(disk_inode.is_dir());
        let file_count = (disk_inode.size as usize) / DIRENT_SIZE;
        let mut dir_entry = DirEntry::create_empty();
        for i in 0..file_count {
            assert_eq!(
                disk_inode.read_at(
                    DIRENT_SIZE * i,
                    dir_entry.as_bytes_mut(),
                    &self.block_device,
                ),
                DIRENT_SIZE,
            );
            if dir_entry.name() == name {
                return Some(dir_entry.inode_id());
            }
        }
        None
    }

    /// 在目录下按名字查找文件
    pub fn find(&self, name: &str) -> Option<Arc<Inode>> {
        let mut fs = self.fs.lock();
        let inode_id = self.read_disk_inode(|disk_inode| self.find_inode_id(name, disk_inode))?;
        Some(fs.open_inode(inode_id, &self.fs))
    }

    pub fn is_dir(&self) -> bool {
        let _fs = self.fs.lock();
        self.read_disk_inode(|disk_inode| disk_inode.is_dir())
    }

    /// 文件的字节数
    pub fn length(&self) -> usize {
        let _fs = self.fs.lock();
        self.read_disk_inode(|disk_inode| disk_inode.size as usize)
    }

    /// offset 所在的扇区号; offset 不在文件内时为 None
    pub fn byte_to_sector(&self, offset: usize) -> Option<usize> {
        let _fs = self.fs.lock();
        self.read_disk_inode(|disk_inode| {
            if offset < disk_inode.size as usize {
                let inner_id = (offset / BLOCK_SIZE) as u32;
                Some(disk_inode.get_block_id(inner_id, &self.block_device) as usize)
            } else {
                None
            }
        })
    }

    /// 目录下的所有文件名
    pub fn ls(&self) -> Vec<String> {
        let _fs = self.fs.lock();
        self.read_disk_inode(|disk_inode| {
            let file_count = (disk_inode.size as usize) / DIRENT_SIZE;
            let mut v: Vec<String> = Vec::new();
            for i in 0..file_count {
                let mut dir_entry = DirEntry::create_empty();
                assert_eq!(
                    disk_inode.read_at(
                        DIRENT_SIZE * i,
                        dir_entry.as_bytes_mut(),
                        &self.block_device,
                    ),
                    DIRENT_SIZE,
                );
                v.push(String::from(dir_entry.name()));
            }
            v
        })
    }

    /// 在目录下创建一个空的普通文件
    pub fn create(&self, name: &str) -> Result<Arc<Inode>> {
        let mut fs = self.fs.lock();
        let exists = self.read_disk_inode(|dir| {
            if dir.is_dir() {
                Ok(self.find_inode_id(name, dir).is_some())
            } else {
                Err(Error::NotAFile)
            }
        })?;
        if exists {
            return Err(Error::AlreadyExists(name.to_string()));
        }

        let new_inode_id = fs.alloc_inode()?;
        let (new_inode_block_id, new_inode_block_offset) = fs.get_disk_inode_pos(new_inode_id);
        get_block_cache(new_inode_block_id as usize, Arc::clone(&self.block_device))
            .lock()
            .modify(new_inode_block_offset, |new_inode: &mut DiskInode| {
                new_inode.initialize(DiskInodeType::File);
            });

        // 在目录的最后追加一个目录项
        self.modify_disk_inode(|dir| -> Result<()> {
            let file_count = (dir.size as usize) / DIRENT_SIZE;
            let new_size = (file_count + 1) * DIRENT_SIZE;
            self.increase_size(new_size, dir, &mut fs)?;
            let dir_entry = DirEntry::new(name, new_inode_id);
            dir.write_at(
                file_count * DIRENT_SIZE,
                dir_entry.as_bytes(),
                &self.block_device,
            );
            Ok(())
        })?;

        let inode = fs.open_inode(new_inode_id, &self.fs);
        block_cache_sync_all();
        Ok(inode)
    }

    /// 按需把 disk_inode 的容量扩到 new_size, 分配需要的数据块和索引块
    fn increase_size(
        &self,
        new_size: usize,
        disk_inode: &mut DiskInode,
        fs: &mut MutexGuard<EasyFileSystem>,
    ) -> Result<()> {
        if new_size > DiskInode::MAX_SIZE {
            return Err(Error::FileTooLarge {
                requested: new_size,
                max: DiskInode::MAX_SIZE,
            });
        }
        let new_size = new_size as u32;
        if new_size <= disk_inode.alloc_size {
            disk_inode.size = disk_inode.size.max(new_size);
            return Ok(());
        }
        let blocks_needed = disk_inode.blocks_num_needed(new_size);
        let mut v: Vec<u32> = Vec::new();
        for _ in 0..blocks_needed {
            v.push(fs.alloc_data()?);
        }
        disk_inode.increase_size(new_size, v, &self.block_device);
        Ok(())
    }

    /// 从 offset 开始读取, 返回实际读到的字节数
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let _fs = self.fs.lock();
        self.read_disk_inode(|disk_inode| disk_inode.read_at(offset, buf, &self.block_device))
    }

    /// 从 offset 开始写入, 不会让文件变长: 超出文件长度的部分被截掉.
    /// 写入被禁止时返回 0.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        let _fs = self.fs.lock();
        if self.is_write_denied() {
            return 0;
        }
        let size = self.modify_disk_inode(|disk_inode| {
            if !disk_inode.is_file() {
                error!("write to a non-file inode {}", self.inode_id);
                return 0;
            }
            let end = offset.saturating_add(buf.len()).min(disk_inode.size as usize);
            if offset >= end {
                return 0;
            }
            disk_inode.write_at(offset, &buf[..end - offset], &self.block_device)
        });
        block_cache_sync_all();
        size
    }

    /// 写入并按需让文件变长, 用来往镜像里装入文件内容.
    /// 打开的文件 (File) 只通过 write_at 写入.
    pub fn write(&self, offset: usize, buf: &[u8]) -> Result<usize> {
        let mut fs = self.fs.lock();
        if self.is_write_denied() {
            return Ok(0);
        }
        let size = self.modify_disk_inode(|disk_inode| -> Result<usize> {
            if !disk_inode.is_file() {
                return Err(Error::NotAFile);
            }
            let end = offset.checked_add(buf.len()).ok_or(Error::FileTooLarge {
                requested: usize::MAX,
                max: DiskInode::MAX_SIZE,
            })?;
            self.increase_size(end, disk_inode, &mut fs)?;
            Ok(disk_inode.write_at(offset, buf, &self.block_device))
        })?;
        block_cache_sync_all();
        Ok(size)
    }

    pub fn deny_write(&self) {
        let cnt = self.deny_write_cnt.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("inode {} write denied ({})", self.inode_id, cnt);
    }

    /// 每个 allow_write 必须对应之前的一个 deny_write
    pub fn allow_write(&self) {
        let prev = self
            .deny_write_cnt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cnt| cnt.checked_sub(1));
        match prev {
            Ok(prev) => trace!("inode {} write allowed ({})", self.inode_id, prev - 1),
            Err(_) => panic!("allow_write on inode {} without deny_write", self.inode_id),
        }
    }

    pub fn is_write_denied(&self) -> bool {
        self.deny_write_cnt.load(Ordering::Acquire) > 0
    }
}

impl SectorMap for Inode {
    fn byte_to_sector(&self, offset: usize) -> Option<usize> {
        Inode::byte_to_sector(self, offset)
    }

    fn length(&self) -> usize {
        Inode::length(self)
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        trace!("inode {} closed", self.inode_id);
    }
}
