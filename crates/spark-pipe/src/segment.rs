use std::fmt;

use spark_buffer::PooledBlock;

use crate::error::{PipeError, Result};

/// `Segment` 是管道搬运字节的基本单位：一块独占的池化内存加上区间簿记。
///
/// # 设计背景（Why）
/// - 写端与读端都把字节组织成一条有序的段链；每个段只属于一条链，
///   链本身（`VecDeque<Segment>`）即所有者，段在链之间只能移动，不能共享。
/// - 段只记录 `[start, end)` 有效区间与 `running_index`，不承担任何并发控制，
///   排他性由当前持有它的写端/读端保证。
///
/// # 契约说明（What）
/// - `0 <= start <= end <= capacity`；
/// - `running_index` 为 `start` 在整条流中的逻辑偏移，链上相邻段满足
///   `next.running_index == prev.running_index + prev.len()`；
/// - `sealed` 段不可再追加，写端在换用新尾段时封存旧尾段，读端据此决定是否需要新段；
/// - 内存块在 [`SegmentPool::release`](crate::segment_pool::SegmentPool::release) 或 `Drop` 时归还，恰好一次。
#[derive(Default)]
pub(crate) struct Segment {
    block: Option<PooledBlock>,
    start: usize,
    end: usize,
    running_index: u64,
    sealed: bool,
}

impl Segment {
    /// 装入新租借的内存块，区间清零。
    pub(crate) fn assign(&mut self, block: PooledBlock, running_index: u64) {
        self.block = Some(block);
        self.start = 0;
        self.end = 0;
        self.running_index = running_index;
        self.sealed = false;
    }

    pub(crate) fn capacity(&self) -> usize {
        self.block.as_ref().map_or(0, |block| block.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.end - self.start
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub(crate) fn running_index(&self) -> u64 {
        self.running_index
    }

    /// 尾部剩余可写字节；封存段恒为 0。
    pub(crate) fn writable_bytes(&self) -> usize {
        if self.sealed {
            0
        } else {
            self.capacity() - self.end
        }
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    /// 尾部可写区域。
    pub(crate) fn writable_mut(&mut self) -> &mut [u8] {
        if self.sealed {
            return &mut [];
        }
        let end = self.end;
        match self.block.as_mut() {
            Some(block) => &mut block[end..],
            None => &mut [],
        }
    }

    /// 已写入的有效字节 `[start, end)`。
    pub(crate) fn bytes(&self) -> &[u8] {
        match self.block.as_ref() {
            Some(block) => &block[self.start..self.end],
            None => &[],
        }
    }

    /// 把 `count` 字节计入有效区间；仅允许在未封存的尾段上调用。
    pub(crate) fn append(&mut self, count: usize) -> Result<()> {
        if self.sealed {
            return Err(PipeError::invalid_state("append on a sealed segment"));
        }
        let available = self.capacity() - self.end;
        if count > available {
            return Err(PipeError::OutOfRange {
                requested: count,
                available,
            });
        }
        self.end += count;
        Ok(())
    }

    /// 从区间头部丢弃 `count` 字节，`running_index` 同步前移。
    pub(crate) fn consume(&mut self, count: usize) {
        let count = count.min(self.len());
        self.start += count;
        self.running_index += count as u64;
    }

    /// 交出内存块并清空所有字段，描述符本身可以复用。
    pub(crate) fn reset(&mut self) -> Option<PooledBlock> {
        self.start = 0;
        self.end = 0;
        self.running_index = 0;
        self.sealed = false;
        self.block.take()
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("capacity", &self.capacity())
            .field("start", &self.start)
            .field("end", &self.end)
            .field("running_index", &self.running_index)
            .field("sealed", &self.sealed)
            .finish()
    }
}
