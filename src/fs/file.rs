//! 打开的文件: 在 inode 之上加一个读写位置和本文件自己的禁止写入状态
//!
//! 一个 File 同一时刻只应该被一个线程使用; 需要共享时由使用者在外面加锁.

use std::sync::Arc;

use log::trace;

use super::{walker, Inode};

pub struct File {
    /// 本文件独占的一个 inode 引用, 关闭文件时释放
    inode: Arc<Inode>,
    /// 当前读写位置
    pos: usize,
    /// 是否调用过 deny_write
    deny_write: bool,
}

impl File {
    /// 打开 inode 并取得它的所有权; inode 不存在时返回 None
    pub fn open(inode: Option<Arc<Inode>>) -> Option<Self> {
        let inode = inode?;
        trace!("file opened on inode {}", inode.inode_id());
        Some(Self {
            inode,
            pos: 0,
            deny_write: false,
        })
    }

    /// 在同一个 inode 上打开另一个独立的文件, 位置从 0 开始, 不继承禁止写入
    pub fn reopen(&self) -> Option<Self> {
        Self::open(Some(self.inode.reopen()))
    }

    /// 关闭文件: 先撤销本文件的禁止写入, 再释放 inode 引用. drop 时也会做同样的事.
    pub fn close(self) {}

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// 从当前位置读取, 位置前进实际读到的字节数 (到文件尾时可能少于 buf.len())
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        // 顺序读也走扇区遍历, 这样长的顺序读一路都有预读
        let bytes_read = self.read_at(buf, self.pos);
        self.pos += bytes_read;
        bytes_read
    }

    /// 从 offset 开始读取, 不改变当前位置
    ///
    /// 逐扇区经过缓存读取, 并为每个读过的扇区的下一个扇区发出预读提示.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        walker::read_at(
            self.inode.as_ref(),
            self.inode.sector_cache().as_ref(),
            buf,
            offset,
        )
    }

    /// 在当前位置写入, 位置前进实际写入的字节数
    ///
    /// 文件不会变长, 超过文件尾的部分被截掉.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let bytes_written = self.write_at(buf, self.pos);
        self.pos += bytes_written;
        bytes_written
    }

    /// 在 offset 处写入, 不改变当前位置; 直接交给 inode 层
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        self.inode.write_at(offset, buf)
    }

    /// 禁止对底层 inode 的写入, 直到 allow_write 或关闭文件; 重复调用没有效果
    pub fn deny_write(&mut self) {
        if !self.deny_write {
            self.deny_write = true;
            self.inode.deny_write();
        }
    }

    /// 撤销本文件的禁止写入. 其他打开同一 inode 的文件可能仍然禁止着写入.
    pub fn allow_write(&mut self) {
        if self.deny_write {
            self.deny_write = false;
            self.inode.allow_write();
        }
    }

    pub fn length(&self) -> usize {
        self.inode.length()
    }

    /// 位置可以越过文件尾, 之后的读取返回 0
    pub fn seek(&mut self, new_pos: usize) {
        self.pos = new_pos;
    }

    pub fn tell(&self) -> usize {
        self.pos
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.allow_write();
        trace!("file on inode {} closed", self.inode.inode_id());
    }
}
