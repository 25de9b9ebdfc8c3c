//! 磁盘请求调度层
//!
//! 任何需要直接访问扇区的组件 (比如块缓存的预读) 都把一次传输描述成一个 [`DiskRequest`],
//! 交给 [`DiskScheduler`]. 调度器按照截止时间 (deadline) 从小到大的顺序 (EDF) 排队,
//! 由唯一的 worker 循环依次取出并完成实际的块设备读写.

mod request;
mod scheduler;

use std::time::Duration;

/// 扇区大小, 块设备随机读写的最小单位
pub const SECTOR_SIZE: usize = 512;
/// 模拟的单个请求服务耗时
pub const SERVICE_DELAY: Duration = Duration::from_millis(100);
/// 队列为空时 worker 休眠的间隔, 也是新请求最坏情况下多等待的时间
pub const IDLE_INTERVAL: Duration = Duration::from_millis(10);

/// 截止时间 (逻辑时间/优先级), 越小越紧急
pub type Deadline = u64;

/// 预读属于尽力而为的流量, 永远排在调用者提交的请求之后
pub const READ_AHEAD_DEADLINE: Deadline = Deadline::MAX;

pub use request::{DiskRequest, SectorBuf};
pub use scheduler::{DiskScheduler, SchedulerConfig};
