//! 块缓存层: 在内存中缓存扇区的数据, 避免频繁读写磁盘
//!
//! 对一个扇区的所有访问都先经过全局管理器 [`BlockCacheManager`]:
//! 如果扇区已经驻留在内存中, 就直接使用已有的缓冲区; 否则从磁盘读入, 必要时替换掉一个不再使用的缓冲区.
//! 被修改过的缓冲区在被替换 (drop) 或 [`block_cache_sync_all`] 时写回磁盘.
//!
//! 在此之上, [`BufferCache`] 是给文件读路径用的门面: 整扇区读取, 以及对下一个扇区的预读提示.
//! 预读提示会变成一个低优先级的读请求交给 [`DiskScheduler`], 由 worker 读入一个单独的缓冲区;
//! 之后第一次缺失该扇区时, 管理器直接装入这份预读的数据而不再访问磁盘.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use lazy_static::*;
use log::trace;
use spin::Mutex;

use super::{walker::SectorCache, BlockDevice, BLOCK_CACHE_SIZE, BLOCK_SIZE, PREFETCH_LIMIT};
use crate::disk::{DiskScheduler, SectorBuf, READ_AHEAD_DEADLINE};

type DataBlock = [u8; BLOCK_SIZE];

/// 按 8 字节对齐的扇区数据, get_ref 会把它解释成 u32/u64 数组等磁盘数据结构
#[repr(C, align(8))]
struct CacheData([u8; BLOCK_SIZE]);

/// 不同设备上相同编号的扇区不能共用一个缓冲区, 所以用 (设备地址, 扇区号) 作为键.
/// 缓冲区和预读记录都持有设备的 Arc, 设备地址在它们存在期间不会被复用.
type CacheKey = (usize, usize);

fn cache_key(block_id: usize, block_device: &Arc<dyn BlockDevice>) -> CacheKey {
    (Arc::as_ptr(block_device) as *const () as usize, block_id)
}

/// Cached block inside memory
pub struct BlockCache {
    cache: CacheData,
    /// 这个缓存来自于磁盘中的哪个扇区
    block_id: usize,
    block_device: Arc<dyn BlockDevice>,
    /// 从磁盘载入之后有没有被修改过
    modified: bool,
}

impl BlockCache {
    /// 创建一个 BlockCache: 这将触发一次 read_block 将扇区上的数据从磁盘读到缓冲区
    pub fn new(block_id: usize, block_device: Arc<dyn BlockDevice>) -> Self {
        let mut cache = CacheData([0u8; BLOCK_SIZE]);
        block_device.read_block(block_id, &mut cache.0);
        Self {
            cache,
            block_id,
            block_device,
            modified: false,
        }
    }

    /// 用已经读好的数据 (比如预读的结果) 创建 BlockCache, 不访问磁盘
    fn with_data(block_id: usize, block_device: Arc<dyn BlockDevice>, data: &DataBlock) -> Self {
        Self {
            cache: CacheData(*data),
            block_id,
            block_device,
            modified: false,
        }
    }

    fn addr_of_offset(&self, offset: usize) -> usize {
        &self.cache.0[offset] as *const u8 as usize
    }

    /// 把缓冲区偏移 offset 处解释为一个 T 类型的磁盘数据结构, 返回它的不可变引用
    pub fn get_ref<T>(&self, offset: usize) -> &T
    where
        T: Sized,
    {
        let type_size = std::mem::size_of::<T>();
        // T 必须整个落在扇区之内
        assert!(offset + type_size <= BLOCK_SIZE);
        let addr = self.addr_of_offset(offset);
        assert_eq!(addr % std::mem::align_of::<T>(), 0);
        unsafe { &*(addr as *const T) }
    }

    /// 同 get_ref, 但会把缓冲区标记为已修改, 之后需要写回磁盘
    pub fn get_mut<T>(&mut self, offset: usize) -> &mut T
    where
        T: Sized,
    {
        let type_size = std::mem::size_of::<T>();
        assert!(offset + type_size <= BLOCK_SIZE);
        self.modified = true;
        let addr = self.addr_of_offset(offset);
        assert_eq!(addr % std::mem::align_of::<T>(), 0);
        unsafe { &mut *(addr as *mut T) }
    }

    // read/modify 构成了闭包 f 的一层执行环境, 让它绑定到缓冲区上执行,
    // 返回值与闭包的返回值相同.

    pub fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    pub fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    /// If modified, write back to disk.
    pub fn sync(&mut self) {
        if self.modified {
            self.block_device.write_block(self.block_id, &self.cache.0);
            self.modified = false;
        }
    }
}

impl Drop for BlockCache {
    /// 缓冲区被替换出内存时, 由 modified 决定是否需要写回
    fn drop(&mut self) {
        self.sync();
    }
}

/// 一个尚未被用掉的预读缓冲区
struct Prefetch {
    key: CacheKey,
    // 保证设备地址在记录存在期间不被复用
    _block_device: Arc<dyn BlockDevice>,
    buf: Arc<SectorBuf>,
    /// 发起预读的 BufferCache 的命中计数
    hits: Arc<AtomicUsize>,
}

/// 块缓存全局管理器
///
/// 使用类 FIFO 的替换算法: 新缓存从队尾加入, 替换时从队头开始找第一个不再被外部使用
/// (强引用计数为 1) 的缓存.
pub struct BlockCacheManager {
    queue: VecDeque<(CacheKey, Arc<Mutex<BlockCache>>)>,
    /// 已经交给调度器的预读, 按发起顺序排列
    prefetch: VecDeque<Prefetch>,
}

impl BlockCacheManager {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            prefetch: VecDeque::new(),
        }
    }

    fn is_resident(&self, key: CacheKey) -> bool {
        self.queue.iter().any(|pair| pair.0 == key)
    }

    /// 尝试从块缓存管理器中获取扇区 block_id 的块缓存,
    /// 如果找不到, 会从预读结果或磁盘读取到内存中, 还有可能会发生缓存替换
    pub fn get_block_cache(
        &mut self,
        block_id: usize,
        block_device: Arc<dyn BlockDevice>,
    ) -> Arc<Mutex<BlockCache>> {
        let key = cache_key(block_id, &block_device);
        if let Some(pair) = self.queue.iter().find(|pair| pair.0 == key) {
            return Arc::clone(&pair.1);
        }

        if self.queue.len() == BLOCK_CACHE_SIZE {
            if let Some((idx, _)) = self
                .queue
                .iter()
                .enumerate()
                .find(|(_, pair)| Arc::strong_count(&pair.1) == 1)
            {
                // drop 时写回
                self.queue.remove(idx);
            } else {
                // 上限足够大时不会发生: 同一时刻被使用的缓存数总是很少
                panic!("Run out of BlockCache");
            }
        }

        // 无论预读是否完成, 这条记录都到此为止: 扇区一旦驻留, 之后的修改只会出现在缓存中,
        // 留着旧的预读数据只会在将来装入过时的内容
        let block_cache = match self.take_prefetch(key) {
            Some(prefetch) if prefetch.buf.is_done() => {
                trace!("sector {} served from read-ahead", block_id);
                prefetch.hits.fetch_add(1, Ordering::Relaxed);
                prefetch.buf.read(|data| {
                    BlockCache::with_data(block_id, Arc::clone(&block_device), data)
                })
            }
            _ => BlockCache::new(block_id, Arc::clone(&block_device)),
        };
        let block_cache = Arc::new(Mutex::new(block_cache));
        self.queue.push_back((key, Arc::clone(&block_cache)));
        block_cache
    }

    fn take_prefetch(&mut self, key: CacheKey) -> Option<Prefetch> {
        let idx = self.prefetch.iter().position(|p| p.key == key)?;
        self.prefetch.remove(idx)
    }

    /// 为扇区登记一个预读缓冲区; 扇区已经驻留或已经在预读中时返回 None.
    /// 同一设备的记录数达到上限时忘掉它最早的那一个.
    fn reserve_prefetch(
        &mut self,
        block_id: usize,
        block_device: &Arc<dyn BlockDevice>,
        hits: &Arc<AtomicUsize>,
    ) -> Option<Arc<SectorBuf>> {
        let key = cache_key(block_id, block_device);
        if self.is_resident(key) || self.prefetch.iter().any(|p| p.key == key) {
            return None;
        }
        let same_device = |p: &Prefetch| p.key.0 == key.0;
        if self.prefetch.iter().filter(|p| same_device(*p)).count() == PREFETCH_LIMIT {
            if let Some(oldest) = self.prefetch.iter().position(same_device) {
                self.prefetch.remove(oldest);
            }
        }
        let buf = Arc::new(SectorBuf::new());
        self.prefetch.push_back(Prefetch {
            key,
            _block_device: Arc::clone(block_device),
            buf: Arc::clone(&buf),
            hits: Arc::clone(hits),
        });
        Some(buf)
    }
}

impl Default for BlockCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    pub static ref BLOCK_CACHE_MANAGER: Mutex<BlockCacheManager> =
        Mutex::new(BlockCacheManager::new());
}

/// 对于其他模块而言, 可以直接通过 get_block_cache 方法来请求块缓存.
///
/// 调用者需要通过 .lock() 获取里层互斥锁才能对 BlockCache 进行操作.
pub fn get_block_cache(
    block_id: usize,
    block_device: Arc<dyn BlockDevice>,
) -> Arc<Mutex<BlockCache>> {
    BLOCK_CACHE_MANAGER
        .lock()
        .get_block_cache(block_id, block_device)
}

/// 把所有被修改过的缓存写回磁盘
pub fn block_cache_sync_all() {
    // 持有缓存锁的线程可能正在等管理器的锁 (比如读一级索引块), 所以正在使用中的缓存
    // 留到释放管理器之后再写回. 它们本来就不可能被替换, 多一个引用不影响替换.
    let busy: Vec<_> = {
        let manager = BLOCK_CACHE_MANAGER.lock();
        manager
            .queue
            .iter()
            .filter_map(|(_, block_cache)| match block_cache.try_lock() {
                Some(mut cache) => {
                    cache.sync();
                    None
                }
                None => Some(Arc::clone(block_cache)),
            })
            .collect()
    };
    for block_cache in busy {
        block_cache.lock().sync();
    }
}

/// 预读相关的计数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// 收到的预读提示
    pub hints: usize,
    /// 真正交给调度器的预读请求
    pub prefetches: usize,
    /// 缺失时直接用上预读数据的次数
    pub prefetch_hits: usize,
}

/// 一个块设备上的缓存门面, 供扇区遍历 (文件读) 使用
pub struct BufferCache {
    block_device: Arc<dyn BlockDevice>,
    scheduler: Mutex<Option<Arc<DiskScheduler>>>,
    hints: AtomicUsize,
    prefetches: AtomicUsize,
    prefetch_hits: Arc<AtomicUsize>,
}

impl BufferCache {
    pub fn new(block_device: Arc<dyn BlockDevice>) -> Self {
        Self {
            block_device,
            scheduler: Mutex::new(None),
            hints: AtomicUsize::new(0),
            prefetches: AtomicUsize::new(0),
            prefetch_hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 之后的预读提示经由 scheduler 完成; 没有调度器时提示只计数不执行
    pub fn attach_scheduler(&self, scheduler: Arc<DiskScheduler>) {
        debug_assert_eq!(
            Arc::as_ptr(scheduler.block_device()) as *const () as usize,
            Arc::as_ptr(&self.block_device) as *const () as usize,
            "scheduler serves a different device"
        );
        *self.scheduler.lock() = Some(scheduler);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hints: self.hints.load(Ordering::Relaxed),
            prefetches: self.prefetches.load(Ordering::Relaxed),
            prefetch_hits: self.prefetch_hits.load(Ordering::Relaxed),
        }
    }
}

impl SectorCache for BufferCache {
    fn read_sector(&self, sector: usize, buf: &mut [u8; BLOCK_SIZE]) {
        get_block_cache(sector, Arc::clone(&self.block_device))
            .lock()
            .read(0, |data: &DataBlock| buf.copy_from_slice(data));
    }

    /// 只是提示: 不等待设备, 不报错, 不需要的提示直接丢弃
    fn read_ahead(&self, sector: usize) {
        self.hints.fetch_add(1, Ordering::Relaxed);
        let Some(scheduler) = self.scheduler.lock().clone() else {
            return;
        };
        if scheduler.is_stopped() {
            return;
        }
        if sector >= self.block_device.num_blocks() {
            trace!("read-ahead of sector {} is past the device end", sector);
            return;
        }
        // 管理器的锁只用来登记, 调用者此时不持有任何缓存锁
        let Some(buf) = BLOCK_CACHE_MANAGER.lock().reserve_prefetch(
            sector,
            &self.block_device,
            &self.prefetch_hits,
        ) else {
            return;
        };
        match scheduler.schedule_request(sector, false, buf, READ_AHEAD_DEADLINE) {
            Ok(()) => {
                self.prefetches.fetch_add(1, Ordering::Relaxed);
                trace!("read-ahead of sector {} scheduled", sector);
            }
            Err(err) => trace!("read-ahead of sector {} dropped: {}", sector, err),
        }
    }
}
