//! 一次待完成的扇区传输

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use spin::Mutex;

use super::{Deadline, SECTOR_SIZE};
use crate::fs::BlockDevice;

/// 请求携带的扇区缓冲区
///
/// 提交者自己保留一份 `Arc`, 调度器只持有另一份引用, 因此缓冲区的存活由提交者负责,
/// 而请求被服务完毕之后调度器的那份引用随之释放, 不可能在之后再被访问.
/// worker 完成传输后会设置 done 标记, 提交者可以据此判断数据是否已经就绪.
pub struct SectorBuf {
    data: Mutex<[u8; SECTOR_SIZE]>,
    done: AtomicBool,
}

impl SectorBuf {
    pub fn new() -> Self {
        Self {
            data: Mutex::new([0u8; SECTOR_SIZE]),
            done: AtomicBool::new(false),
        }
    }

    pub fn read<V>(&self, f: impl FnOnce(&[u8; SECTOR_SIZE]) -> V) -> V {
        f(&*self.data.lock())
    }

    pub fn modify<V>(&self, f: impl FnOnce(&mut [u8; SECTOR_SIZE]) -> V) -> V {
        f(&mut *self.data.lock())
    }

    /// 对应的请求是否已经被 worker 服务完毕
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }
}

impl Default for SectorBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// 磁盘请求
///
/// 创建之后不再修改; 入队后归调度器所有, 出队时所有权转移给 worker,
/// 服务完成后被 drop.
pub struct DiskRequest {
    sector: usize,
    is_write: bool,
    data: Arc<SectorBuf>,
    deadline: Deadline,
}

impl DiskRequest {
    pub fn new(sector: usize, is_write: bool, data: Arc<SectorBuf>, deadline: Deadline) -> Self {
        Self {
            sector,
            is_write,
            data,
            deadline,
        }
    }

    pub fn sector(&self) -> usize {
        self.sector
    }

    pub fn is_write(&self) -> bool {
        self.is_write
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// 在块设备上完成这次传输: 读请求把扇区读进缓冲区, 写请求把缓冲区写到扇区
    pub(super) fn transfer(&self, block_device: &Arc<dyn BlockDevice>) {
        if self.is_write {
            self.data
                .read(|data| block_device.write_block(self.sector, data));
        } else {
            self.data
                .modify(|data| block_device.read_block(self.sector, data));
        }
    }

    /// 标记完成并释放请求
    pub(super) fn finish(self) {
        self.data.complete();
    }
}
