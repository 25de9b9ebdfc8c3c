//! 截止时间优先 (EDF) 的磁盘调度器
//!
//! 队列始终按 deadline 升序排列: 入队时插入排序, 出队只取队头.
//! 队列深度受限于并发 I/O 的扇出而不是数据量, 所以 O(n) 的插入可以接受, 换来 O(1) 的出队.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, trace};
use spin::Mutex;

use super::{Deadline, DiskRequest, SectorBuf, IDLE_INTERVAL, SERVICE_DELAY};
use crate::{
    error::{Error, Result},
    fs::BlockDevice,
};

/// 调度器的策略参数
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// 每个请求模拟的设备耗时
    pub service_delay: Duration,
    /// 队列为空时的休眠间隔
    pub idle_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            service_delay: SERVICE_DELAY,
            idle_interval: IDLE_INTERVAL,
        }
    }
}

pub struct DiskScheduler {
    block_device: Arc<dyn BlockDevice>,
    config: SchedulerConfig,
    /// 一把锁同时保护入队和出队, 但不会在设备传输期间持有
    queue: Mutex<VecDeque<DiskRequest>>,
    /// 只在持有队列锁时修改
    stopped: AtomicBool,
    serviced: AtomicUsize,
}

impl DiskScheduler {
    pub fn new(block_device: Arc<dyn BlockDevice>, config: SchedulerConfig) -> Self {
        Self {
            block_device,
            config,
            queue: Mutex::new(VecDeque::new()),
            stopped: AtomicBool::new(false),
            serviced: AtomicUsize::new(0),
        }
    }

    /// 提交一个请求, 按 deadline 插入到队列中合适的位置
    ///
    /// deadline 相同的请求保持提交顺序. 调度器停止之后不再接受新请求,
    /// 超出设备范围的扇区也在这里被拒绝, 不会交给 worker.
    pub fn schedule_request(
        &self,
        sector: usize,
        is_write: bool,
        data: Arc<SectorBuf>,
        deadline: Deadline,
    ) -> Result<()> {
        let blocks = self.block_device.num_blocks();
        if sector >= blocks {
            return Err(Error::InvalidSector { sector, blocks });
        }
        let request = DiskRequest::new(sector, is_write, data, deadline);
        let mut queue = self.queue.lock();
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::SchedulerStopped);
        }
        // 第一个 deadline 严格大于新请求的位置
        let pos = queue.partition_point(|req| req.deadline() <= deadline);
        queue.insert(pos, request);
        trace!(
            "queued disk {} at sector {} (deadline {}, position {}/{})",
            if is_write { "write" } else { "read" },
            sector,
            deadline,
            pos,
            queue.len()
        );
        Ok(())
    }

    /// worker 循环, 调度队列唯一的消费者
    ///
    /// 每一轮在锁内取出队头, 释放锁之后再完成传输; 队列为空时休眠 idle_interval 后重试.
    /// 调用 [`DiskScheduler::stop`] 之后, 把队列中剩余的请求全部服务完才返回.
    pub fn process(&self) {
        debug!("disk worker started");
        loop {
            let (request, stopped) = {
                let mut queue = self.queue.lock();
                (queue.pop_front(), self.stopped.load(Ordering::Acquire))
            };
            match request {
                Some(request) => self.service(request),
                None if stopped => break,
                None => thread::sleep(self.config.idle_interval),
            }
        }
        debug!(
            "disk worker stopped after {} requests",
            self.serviced.load(Ordering::Relaxed)
        );
    }

    /// 只服务一个请求, 队列为空时返回 false
    pub fn service_one(&self) -> bool {
        let request = self.queue.lock().pop_front();
        match request {
            Some(request) => {
                self.service(request);
                true
            }
            None => false,
        }
    }

    fn service(&self, request: DiskRequest) {
        debug!(
            "processing disk {} at sector {} (deadline {})",
            if request.is_write() { "write" } else { "read" },
            request.sector(),
            request.deadline()
        );
        request.transfer(&self.block_device);
        if !self.config.service_delay.is_zero() {
            thread::sleep(self.config.service_delay);
        }
        request.finish();
        self.serviced.fetch_add(1, Ordering::Relaxed);
    }

    /// 在名为 disk-worker 的线程上运行 [`DiskScheduler::process`]
    pub fn spawn(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let scheduler = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("disk-worker".into())
            .spawn(move || scheduler.process())?;
        Ok(handle)
    }

    /// 拒绝之后的请求, 并让 worker 在排空队列后退出
    pub fn stop(&self) {
        let _queue = self.queue.lock();
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// 当前排队的请求数; 锁一释放这个值就可能过时
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// 已经服务完毕的请求总数
    pub fn serviced(&self) -> usize {
        self.serviced.load(Ordering::Relaxed)
    }

    pub fn block_device(&self) -> &Arc<dyn BlockDevice> {
        &self.block_device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::MemDisk, disk::SECTOR_SIZE};

    fn quick() -> SchedulerConfig {
        SchedulerConfig {
            service_delay: Duration::ZERO,
            idle_interval: Duration::from_millis(1),
        }
    }

    fn scheduler(blocks: usize) -> (Arc<MemDisk>, Arc<DiskScheduler>) {
        let disk = Arc::new(MemDisk::new(blocks));
        let scheduler = Arc::new(DiskScheduler::new(disk.clone(), quick()));
        (disk, scheduler)
    }

    #[test]
    fn services_in_deadline_order_with_fifo_ties() {
        let (disk, scheduler) = scheduler(16);
        // 扇区号即提交顺序
        let deadlines = [50, 10, 30, 10, 99, 0, 30, 10];
        for (sector, deadline) in deadlines.iter().enumerate() {
            scheduler
                .schedule_request(sector, false, Arc::new(SectorBuf::new()), *deadline)
                .unwrap();
        }
        scheduler.stop();
        scheduler.process();

        let order: Vec<usize> = disk.accesses().into_iter().map(|(s, _)| s).collect();
        assert_eq!(order, vec![5, 1, 3, 7, 2, 6, 0, 4]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn concurrent_submitters_are_merged_in_order() {
        let (disk, scheduler) = scheduler(128);
        let submitters: Vec<_> = (0..4)
            .map(|t| {
                let scheduler = Arc::clone(&scheduler);
                thread::spawn(move || {
                    for i in 0..25 {
                        let deadline = rand::random::<u8>() as Deadline;
                        let buf = Arc::new(SectorBuf::new());
                        scheduler
                            .schedule_request(t * 25 + i, false, buf, deadline)
                            .unwrap();
                    }
                })
            })
            .collect();
        submitters.into_iter().for_each(|h| h.join().unwrap());
        assert_eq!(scheduler.len(), 100);

        // 记录队列快照中每个扇区的 deadline
        let expected: Vec<(usize, Deadline)> = scheduler
            .queue
            .lock()
            .iter()
            .map(|req| (req.sector(), req.deadline()))
            .collect();
        assert!(expected.windows(2).all(|w| w[0].1 <= w[1].1));

        scheduler.stop();
        scheduler.spawn().unwrap().join().unwrap();
        let order: Vec<usize> = disk.accesses().into_iter().map(|(s, _)| s).collect();
        assert_eq!(order, expected.iter().map(|(s, _)| *s).collect::<Vec<_>>());
    }

    #[test]
    fn worker_drains_everything_submitted_while_running() {
        let (disk, scheduler) = scheduler(64);
        let worker = scheduler.spawn().unwrap();
        let bufs: Vec<Arc<SectorBuf>> = (0..40).map(|_| Arc::new(SectorBuf::new())).collect();
        for (i, buf) in bufs.iter().enumerate() {
            scheduler
                .schedule_request(i % 64, i % 3 == 0, Arc::clone(buf), (40 - i) as Deadline)
                .unwrap();
            if i % 10 == 0 {
                thread::sleep(Duration::from_millis(2));
            }
        }
        scheduler.stop();
        worker.join().unwrap();

        assert_eq!(scheduler.serviced(), 40);
        assert_eq!(disk.accesses().len(), 40);
        assert!(scheduler.is_empty());
        assert!(bufs.iter().all(|buf| buf.is_done()));
    }

    #[test]
    fn read_fills_buffer_and_write_reaches_device() {
        let (disk, scheduler) = scheduler(8);
        let payload: Vec<u8> = (0..SECTOR_SIZE).map(|i| i as u8).collect();
        let out = Arc::new(SectorBuf::new());
        out.modify(|data| data.copy_from_slice(&payload));
        scheduler.schedule_request(3, true, out.clone(), 1).unwrap();
        let back = Arc::new(SectorBuf::new());
        scheduler.schedule_request(3, false, back.clone(), 2).unwrap();
        assert!(!out.is_done() && !back.is_done());

        assert!(scheduler.service_one());
        assert!(out.is_done());
        assert!(!back.is_done());
        assert!(scheduler.service_one());
        assert!(back.is_done());
        assert!(!scheduler.service_one());

        back.read(|data| assert_eq!(&data[..], &payload[..]));
        assert_eq!(disk.accesses(), vec![(3, true), (3, false)]);
    }

    #[test]
    fn stopped_scheduler_rejects_requests() {
        let (_disk, scheduler) = scheduler(4);
        scheduler.stop();
        assert!(scheduler.is_stopped());
        let err = scheduler
            .schedule_request(0, false, Arc::new(SectorBuf::new()), 0)
            .unwrap_err();
        assert!(matches!(err, Error::SchedulerStopped));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn out_of_range_sector_is_rejected_and_worker_keeps_going() {
        let (disk, scheduler) = scheduler(4);
        let worker = scheduler.spawn().unwrap();
        let err = scheduler
            .schedule_request(99, false, Arc::new(SectorBuf::new()), 0)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidSector {
                sector: 99,
                blocks: 4
            }
        ));
        assert!(scheduler
            .schedule_request(4, true, Arc::new(SectorBuf::new()), 0)
            .is_err());

        let buf = Arc::new(SectorBuf::new());
        scheduler.schedule_request(1, false, Arc::clone(&buf), 0).unwrap();
        scheduler.stop();
        worker.join().unwrap();
        assert!(buf.is_done());
        assert_eq!(scheduler.serviced(), 1);
        assert_eq!(disk.accesses(), vec![(1, false)]);
    }

    #[test]
    fn idle_worker_sleeps_then_picks_up_late_request() {
        let (disk, scheduler) = scheduler(4);
        let worker = scheduler.spawn().unwrap();
        thread::sleep(Duration::from_millis(5));
        assert_eq!(scheduler.serviced(), 0);
        scheduler
            .schedule_request(2, false, Arc::new(SectorBuf::new()), 7)
            .unwrap();
        scheduler.stop();
        worker.join().unwrap();
        assert_eq!(disk.accesses(), vec![(2, false)]);
    }
}
