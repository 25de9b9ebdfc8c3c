//! 块设备仅支持以扇区为单位进行随机读写, 需要由具体的块设备驱动来实现这些方法.
//! 块缓存层和磁盘调度器会调用这些方法, 完成实际的数据传输.
//! 泛用性: 可以访问实现了 BlockDevice Trait 的块设备驱动程序.

use std::any::Any;

// 块与扇区
// 实际上, 块和扇区是两个不同的概念.
// 扇区 (Sector) 是块设备随机读写的数据单位, 通常每个扇区为 512 字节.
// 而块是文件系统存储文件时的数据单位, 每个块的大小等同于一个或多个扇区.
// 这里一个块恰好就是一个扇区, 所以 block_id 与扇区号是同一个数.

pub trait BlockDevice: Send + Sync + Any {
    // read_block 将编号为 block_id 的扇区从磁盘读入内存中的缓冲区 buf ;
    fn read_block(&self, block_id: usize, buf: &mut [u8]);

    // write_block 将内存中的缓冲区 buf 中的数据写入磁盘编号为 block_id 的扇区.
    fn write_block(&self, block_id: usize, buf: &[u8]);

    /// 设备的扇区总数, 超出范围的预读提示会被直接忽略
    fn num_blocks(&self) -> usize;
}
