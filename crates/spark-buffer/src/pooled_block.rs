use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use bytes::BytesMut;

/// `BlockRecycler` 描述内存块在租借结束时的回收入口。
///
/// # 设计初衷（Why）
/// - [`BlockPool`](crate::BlockPool) 只负责“租借”侧；块何时、如何归还由块自身的生命周期决定。
/// - 把回收动作收敛到 [`PooledBlock`] 的 `Drop` 中，上层的段链无需记住“哪一块还没还”，
///   所有权转移即归还语义。
///
/// # 契约定义（What）
/// - 实现必须线程安全，且 `reclaim` 过程中不得 panic：它运行在 `Drop` 路径上。
/// - 每个 [`PooledBlock`] 只会触发一次 `reclaim`。
pub trait BlockRecycler: Send + Sync + 'static {
    /// 接收一块已归还的内存。
    fn reclaim(&self, reclaimed: ReclaimedBlock);
}

/// 一次回收动作携带的上下文。
///
/// - `capacity`：块在租借期间对外暴露的长度，池据此更新统计；
/// - `buffer`：底层 `BytesMut`，池可以直接放回自由链表复用。
#[derive(Debug)]
pub struct ReclaimedBlock {
    capacity: usize,
    buffer: BytesMut,
}

impl ReclaimedBlock {
    /// 构造回收上下文。
    pub fn new(capacity: usize, buffer: BytesMut) -> Self {
        Self { capacity, buffer }
    }

    /// 本次归还的容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 取回底层内存。
    pub fn into_buffer(self) -> BytesMut {
        self.buffer
    }
}

/// 从池中租借的一块定长内存。
///
/// # 角色定位（Why）
/// - 分段管道需要在块内任意偏移处写入、再按子区间读出，因此块在交付时已经完全初始化
///   （长度等于容量），调用方可以直接以 `&mut [u8]` 访问，无需 `unsafe`。
/// - 归还由 `Drop` 驱动：块只能被一个所有者持有，移动即转交，销毁即归还，
///   “恰好归还一次”由类型系统保证。
///
/// # 契约（What）
/// - `len()` 固定不变，等于租借时池给出的块长度；
/// - 块内容在归还前不会被池触碰；归还后池可能复用同一内存，调用方不得保留任何切片。
pub struct PooledBlock {
    buffer: Option<BytesMut>,
    recycler: Arc<dyn BlockRecycler>,
}

impl PooledBlock {
    /// 用一块已初始化的内存与回收器构造租约。
    pub fn new(buffer: BytesMut, recycler: Arc<dyn BlockRecycler>) -> Self {
        Self {
            buffer: Some(buffer),
            recycler,
        }
    }

    /// 块长度（字节）。
    pub fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, BytesMut::len)
    }

    /// 块是否为零长度。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 显式归还，等价于 `drop(block)`。
    pub fn release(self) {}
}

impl Deref for PooledBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self.buffer.as_mut() {
            Some(buffer) => buffer.as_mut(),
            None => &mut [],
        }
    }
}

impl Drop for PooledBlock {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let capacity = buffer.len();
            self.recycler.reclaim(ReclaimedBlock::new(capacity, buffer));
        }
    }
}

impl fmt::Debug for PooledBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBlock")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRecycler {
        events: Mutex<Vec<usize>>,
    }

    impl BlockRecycler for RecordingRecycler {
        fn reclaim(&self, reclaimed: ReclaimedBlock) {
            self.events
                .lock()
                .expect("mutex poisoned")
                .push(reclaimed.capacity());
        }
    }

    #[test]
    fn drop_reclaims_exactly_once() {
        let recycler = Arc::new(RecordingRecycler::default());
        let mut block = PooledBlock::new(BytesMut::zeroed(16), recycler.clone());
        block[..3].copy_from_slice(b"abc");
        assert_eq!(&block[..3], b"abc");
        assert_eq!(block.len(), 16);
        block.release();
        assert_eq!(*recycler.events.lock().expect("mutex poisoned"), vec![16]);
    }
}
