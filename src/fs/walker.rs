//! 扇区遍历: 把文件上的一段字节区间 [offset, offset + len) 拆成逐个扇区的缓存访问
//!
//! 扇区大小固定, 跨扇区的读取必然是一个循环. 每一轮取三者的最小值:
//! 文件剩余字节, 当前扇区剩余字节, 请求剩余字节. 这一个 min 同时处理了文件尾截断和扇区边界.
//! 每读完一个扇区就对它的下一个扇区发一次预读提示, 这样长的顺序读在整个过程中始终领先一个扇区.

use super::BLOCK_SIZE;

/// 文件逻辑偏移到扇区的映射, 由 inode 层提供
pub trait SectorMap {
    /// offset 所在的扇区号; 超出已映射的范围时为 None (文件尾或空洞)
    fn byte_to_sector(&self, offset: usize) -> Option<usize>;
    /// 文件长度, 文件尾截断以它为准
    fn length(&self) -> usize;
}

/// 扇区缓存的读接口
pub trait SectorCache {
    /// 同步读取整个扇区的当前内容
    fn read_sector(&self, sector: usize, buf: &mut [u8; BLOCK_SIZE]);
    /// 预读提示, 只是建议: 不阻塞, 不报错, 缓存可以忽略它
    fn read_ahead(&self, sector: usize);
}

/// 从 offset 开始读取最多 buf.len() 个字节, 返回实际读到的字节数
///
/// 读到文件尾或遇到未映射的扇区时提前结束, 所以短读既可能是文件尾也可能是空洞.
pub fn read_at<M, C>(map: &M, cache: &C, buf: &mut [u8], offset: usize) -> usize
where
    M: SectorMap + ?Sized,
    C: SectorCache + ?Sized,
{
    let mut sector_buf = [0u8; BLOCK_SIZE];
    let mut cursor = offset;
    let mut read_size = 0usize;

    while read_size < buf.len() {
        let sector = match map.byte_to_sector(cursor) {
            Some(sector) => sector,
            None => break,
        };
        let sector_offset = cursor % BLOCK_SIZE;

        let inode_left = map.length().saturating_sub(cursor);
        let sector_left = BLOCK_SIZE - sector_offset;
        let chunk_size = inode_left.min(sector_left).min(buf.len() - read_size);
        if chunk_size == 0 {
            break;
        }

        // 缓存只按整扇区返回, 只取其中需要的部分
        cache.read_sector(sector, &mut sector_buf);
        buf[read_size..read_size + chunk_size]
            .copy_from_slice(&sector_buf[sector_offset..sector_offset + chunk_size]);

        cache.read_ahead(sector + 1);

        cursor += chunk_size;
        read_size += chunk_size;
    }
    read_size
}
