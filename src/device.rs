use crate::fs::{BlockDevice, BLOCK_SIZE};
use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    sync::Mutex,
};

// std::file::File 由 Rust 标准库 std 提供，可以访问 Linux 上的一个文件。
// 我们将它包装成 BlockFile 类型来模拟一块磁盘，为它实现 BlockDevice 接口。
// 注意 File 本身仅通过 read/write 接口是不能实现随机读写的，
// 在访问一个特定的扇区的时候，我们必须先 seek 到这个扇区的开头位置
pub struct BlockFile {
    file: Mutex<File>,
    blocks: usize,
}

impl BlockFile {
    /// 创建 (或截断为) 一个 blocks 个扇区大小的镜像文件
    pub fn create(path: impl AsRef<Path>, blocks: usize) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len((blocks * BLOCK_SIZE) as u64)?;
        Ok(Self {
            file: Mutex::new(file),
            blocks,
        })
    }

    /// 打开一个已有的镜像, 扇区数由文件长度决定
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let blocks = file.metadata()?.len() as usize / BLOCK_SIZE;
        Ok(Self {
            file: Mutex::new(file),
            blocks,
        })
    }
}

impl BlockDevice for BlockFile {
    /// 读取一个扇区从文件
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("Error when seeking!");
        assert_eq!(file.read(buf).unwrap(), BLOCK_SIZE, "Not a complete block");
    }

    /// 写一个扇区到文件
    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("Error when seeking!");
        assert_eq!(file.write(buf).unwrap(), BLOCK_SIZE, "Not a complete block");
    }

    fn num_blocks(&self) -> usize {
        self.blocks
    }
}

/// 内存中的磁盘, 会记下每一次扇区访问 (扇区号, 是否为写), 测试用
#[cfg(test)]
pub struct MemDisk {
    blocks: Mutex<Vec<[u8; BLOCK_SIZE]>>,
    accesses: Mutex<Vec<(usize, bool)>>,
}

#[cfg(test)]
impl MemDisk {
    pub fn new(blocks: usize) -> Self {
        Self {
            blocks: Mutex::new(vec![[0u8; BLOCK_SIZE]; blocks]),
            accesses: Mutex::new(Vec::new()),
        }
    }

    pub fn accesses(&self) -> Vec<(usize, bool)> {
        self.accesses.lock().unwrap().clone()
    }

    /// 已经读过 block_id 多少次
    pub fn reads_of(&self, block_id: usize) -> usize {
        self.accesses
            .lock()
            .unwrap()
            .iter()
            .filter(|&&(id, is_write)| id == block_id && !is_write)
            .count()
    }
}

#[cfg(test)]
impl BlockDevice for MemDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.blocks.lock().unwrap()[block_id]);
        self.accesses.lock().unwrap().push((block_id, false));
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        self.blocks.lock().unwrap()[block_id].copy_from_slice(buf);
        self.accesses.lock().unwrap().push((block_id, true));
    }

    fn num_blocks(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }
}
