//! 位图: 以 bit 为单位分配索引节点/数据块
//!
//! 每个位图由若干个扇区组成, 每个扇区 512 字节, 即 4096 bits.
//! 0 表示未分配, 1 表示已经分配.

use std::sync::Arc;

use super::{get_block_cache, BlockDevice, BLOCK_BITS};

/// 把位图区域中的一个扇区解释为 64 个 u64, 以 64 bits 为一组进行查找
type BitmapBlock = [u64; 64];

pub struct Bitmap {
    /// 位图区域的起始扇区号
    start_block_id: usize,
    /// 位图占用的扇区数
    blocks_counts: usize,
}

impl Bitmap {
    pub fn new(start_block_id: usize, blocks_counts: usize) -> Self {
        Self {
            start_block_id,
            blocks_counts,
        }
    }

    /// 分配一个 bit, 返回它在整个位图中的编号; 全部分配完时返回 None
    pub fn alloc(&self, block_device: &Arc<dyn BlockDevice>) -> Option<usize> {
        for block_id in 0..self.blocks_counts {
            let pos = get_block_cache(block_id + self.start_block_id, Arc::clone(block_device))
                .lock()
                .modify(0, |bitmap_block: &mut BitmapBlock| {
                    // 找到第一个不是全 1 的组, 再取其中最低位的 0
                    let (bits64_pos, inner_pos) = bitmap_block
                        .iter()
                        .enumerate()
                        .find(|(_, bits64)| **bits64 != u64::MAX)
                        .map(|(bits64_pos, bits64)| (bits64_pos, bits64.trailing_ones() as usize))?;
                    bitmap_block[bits64_pos] |= 1u64 << inner_pos;
                    Some(block_id * BLOCK_BITS + bits64_pos * 64 + inner_pos)
                });
            if pos.is_some() {
                return pos;
            }
        }
        None
    }

    /// 位图能管理的最大数量
    pub fn maximum(&self) -> usize {
        self.blocks_counts * BLOCK_BITS
    }
}
