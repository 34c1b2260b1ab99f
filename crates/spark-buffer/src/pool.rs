use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::BytesMut;
use spin::Mutex;

use crate::{
    PoolError,
    pooled_block::{BlockRecycler, PooledBlock, ReclaimedBlock},
};

/// 单块默认上限：1 MiB。
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// 单块下限；`rent(0)` 也会得到至少这么长的块。
pub const MIN_BLOCK_SIZE: usize = 64;

/// `BlockPool` 定义分段管道依赖的内存块分配契约。
///
/// # 设计背景（Why）
/// - 管道把分配器当作外部协作者：它只需要“按最小长度租一块”与“还回去”两个动作，
///   以及一个单块上限用于裁剪过大的请求。
/// - 归还动作由 [`PooledBlock`] 的 `Drop` 完成，因此 trait 上只有租借侧的方法。
///
/// # 契约说明（What）
/// - `rent(min)`：返回长度满足 `min <= len <= max_block_size()` 的块；
///   `min > max_block_size()` 时返回 [`PoolError::Oversized`]；不得无限期阻塞。
/// - 实现必须支持来自不相关写端/读端实例的并发租借与归还。
pub trait BlockPool: Send + Sync + 'static {
    /// 租借一块长度不少于 `min_size` 的内存。
    fn rent(&self, min_size: usize) -> Result<PooledBlock, PoolError>;

    /// 单块长度上限。
    fn max_block_size(&self) -> usize;

    /// 统计快照。
    fn statistics(&self) -> PoolStats;

    /// 释放自由链表中缓存的内存，返回释放的字节数。
    fn shrink_to_fit(&self) -> usize {
        0
    }
}

/// 池的统计快照。
///
/// - `allocated_bytes`：累计向系统申请的字节数（扣除已丢弃的部分）；
/// - `available_bytes`：自由链表中待复用的字节数；
/// - `active_leases`：尚未归还的块数量，测试可据此断言无泄漏。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated_bytes: usize,
    pub resident_bytes: usize,
    pub available_bytes: usize,
    pub active_leases: usize,
    pub total_rented: u64,
    pub total_returned: u64,
    pub failed_acquisitions: u64,
    pub free_slots: usize,
}

/// `SlabBlockPool` 是基于自由链表的默认 [`BlockPool`] 实现。
///
/// # 核心机制（How）
/// - 内部维护 `spin::Mutex<Vec<BytesMut>>` 作为自由链表，租借时优先复用长度足够的块；
/// - 复用的块会被清零后再交付，避免上一任持有者的数据泄漏到下一次租借；
/// - `PoolMetrics` 以原子计数跟踪分配、驻留、可用字节与活跃租约，`statistics` 读取快照。
///
/// # 设计权衡（Trade-offs）
/// - 自由链表按首个满足条件的块复用，可能把大块借给小请求；段尺寸在一个管道内基本一致，
///   实际浪费有限；
/// - `shrink_to_fit` 直接清空自由链表，便于压测后归还峰值内存。
#[derive(Clone)]
pub struct SlabBlockPool {
    inner: Arc<PoolInner>,
}

impl Default for SlabBlockPool {
    fn default() -> Self {
        Self::with_max_block_size(DEFAULT_MAX_BLOCK_SIZE)
    }
}

impl SlabBlockPool {
    /// 使用默认单块上限创建空池。
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定单块上限创建空池；上限不会低于 [`MIN_BLOCK_SIZE`]。
    pub fn with_max_block_size(max_block_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner::new(max_block_size.max(MIN_BLOCK_SIZE))),
        }
    }
}

impl BlockPool for SlabBlockPool {
    fn rent(&self, min_size: usize) -> Result<PooledBlock, PoolError> {
        let buffer = self.inner.acquire_buffer(min_size)?;
        let recycler: Arc<dyn BlockRecycler> = self.inner.clone();
        Ok(PooledBlock::new(buffer, recycler))
    }

    fn max_block_size(&self) -> usize {
        self.inner.max_block_size
    }

    fn statistics(&self) -> PoolStats {
        self.inner.snapshot()
    }

    fn shrink_to_fit(&self) -> usize {
        self.inner.shrink_free_list()
    }
}

struct PoolInner {
    max_block_size: usize,
    free_list: Mutex<Vec<BytesMut>>,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn new(max_block_size: usize) -> Self {
        Self {
            max_block_size,
            free_list: Mutex::new(Vec::new()),
            metrics: PoolMetrics::default(),
        }
    }

    /// 从自由链表或堆上获取一个满足长度的块，交付前保证全部字节已初始化。
    fn acquire_buffer(&self, min_size: usize) -> Result<BytesMut, PoolError> {
        if min_size > self.max_block_size {
            self.metrics.failed_acquisitions.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::Oversized {
                requested: min_size,
                max: self.max_block_size,
            });
        }
        let wanted = min_size.max(MIN_BLOCK_SIZE);

        let reused = {
            let mut list = self.free_list.lock();
            // 最佳适配：取满足请求的最小空闲块，避免小请求占用并清零大块。
            let best = list
                .iter()
                .enumerate()
                .filter(|(_, buf)| buf.len() >= wanted)
                .min_by_key(|(_, buf)| buf.len())
                .map(|(index, _)| index);
            best.map(|index| list.swap_remove(index))
        };

        let buffer = match reused {
            Some(mut buf) => {
                self.metrics.decrease_available(buf.len());
                buf.fill(0);
                buf
            }
            None => {
                let buf = BytesMut::zeroed(wanted);
                self.metrics.increase_on_new_allocation(buf.len());
                buf
            }
        };
        self.metrics.increase_active_leases();
        tracing::trace!(requested = min_size, len = buffer.len(), "block rented");
        Ok(buffer)
    }

    fn shrink_free_list(&self) -> usize {
        let mut list = self.free_list.lock();
        let reclaimed: usize = list.iter().map(BytesMut::len).sum();
        list.clear();
        self.metrics.decrease_on_shrink(reclaimed);
        reclaimed
    }

    fn snapshot(&self) -> PoolStats {
        let free_slots = self.free_list.lock().len();
        PoolStats {
            allocated_bytes: self.metrics.allocated_bytes.load(Ordering::Relaxed),
            resident_bytes: self.metrics.resident_bytes.load(Ordering::Relaxed),
            available_bytes: self.metrics.available_bytes.load(Ordering::Relaxed),
            active_leases: self.metrics.active_leases.load(Ordering::Relaxed),
            total_rented: self.metrics.total_rented.load(Ordering::Relaxed),
            total_returned: self.metrics.total_returned.load(Ordering::Relaxed),
            failed_acquisitions: self.metrics.failed_acquisitions.load(Ordering::Relaxed),
            free_slots,
        }
    }
}

impl BlockRecycler for PoolInner {
    fn reclaim(&self, reclaimed: ReclaimedBlock) {
        self.metrics.decrease_active_leases();
        let capacity = reclaimed.capacity();
        self.metrics.increase_available(capacity);
        self.free_list.lock().push(reclaimed.into_buffer());
        tracing::trace!(len = capacity, "block returned");
    }
}

#[derive(Default)]
struct PoolMetrics {
    allocated_bytes: AtomicUsize,
    resident_bytes: AtomicUsize,
    available_bytes: AtomicUsize,
    active_leases: AtomicUsize,
    total_rented: AtomicU64,
    total_returned: AtomicU64,
    failed_acquisitions: AtomicU64,
}

impl PoolMetrics {
    fn increase_on_new_allocation(&self, capacity: usize) {
        self.allocated_bytes.fetch_add(capacity, Ordering::Relaxed);
        self.resident_bytes.fetch_add(capacity, Ordering::Relaxed);
    }

    fn increase_available(&self, capacity: usize) {
        self.available_bytes.fetch_add(capacity, Ordering::Relaxed);
    }

    fn decrease_available(&self, capacity: usize) {
        saturating_sub(&self.available_bytes, capacity);
    }

    fn decrease_on_shrink(&self, capacity: usize) {
        self.decrease_available(capacity);
        saturating_sub(&self.allocated_bytes, capacity);
        saturating_sub(&self.resident_bytes, capacity);
    }

    fn increase_active_leases(&self) {
        self.active_leases.fetch_add(1, Ordering::Relaxed);
        self.total_rented.fetch_add(1, Ordering::Relaxed);
    }

    fn decrease_active_leases(&self) {
        saturating_sub(&self.active_leases, 1);
        self.total_returned.fetch_add(1, Ordering::Relaxed);
    }
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}
