//! 统一的错误类型
//!
//! 文件尾, 未映射的扇区, 空的请求队列都不是错误, 它们以正常的返回值表示 (短读, 0, 空转重试).
//! 只有调用者无法自行恢复的情况才会以 [`Error`] 向上传播.

use std::{io, result};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("file {0} not found")]
    NotFound(String),
    #[error("file {0} already exists")]
    AlreadyExists(String),
    /// 位图中已经没有空闲的 inode 或数据块
    #[error("no free inode or data block left on the device")]
    NoSpace,
    #[error("file size {requested} B exceeds the inode limit of {max} B")]
    FileTooLarge { requested: usize, max: usize },
    #[error("bad magic number, not an easy-fs image")]
    BadMagic,
    #[error("inode is not a regular file")]
    NotAFile,
    #[error("disk scheduler has been stopped")]
    SchedulerStopped,
    /// 请求的扇区超出了设备范围, 在提交时就拒绝, 不会进入队列
    #[error("sector {sector} is out of range, the device has {blocks} sectors")]
    InvalidSector { sector: usize, blocks: usize },
    #[error("unexpected io error occurred: {0:?}")]
    Io(#[from] io::Error),
}

pub type Result<T> = result::Result<T, Error>;
