use std::sync::Arc;

use spark_buffer::BlockPool;

use crate::{error::Result, segment::Segment};

/// 段池适配器：向外部分配器租借内存块，并缓存空闲的段描述符。
///
/// # 设计背景（Why）
/// - 内存块的复用由外部 [`BlockPool`] 负责；这里只缓存“描述符”（`Segment` 本身），
///   避免段链频繁增删时反复构造簿记结构。
/// - 缓存有上限，超过上限的描述符直接丢弃。
///
/// # 契约说明（What）
/// - `rent(size, running_index)`：`size` 会被截断到分配器的单块上限；
/// - `release(segment)`：内存块立即归还分配器，描述符进入缓存。
pub(crate) struct SegmentPool {
    blocks: Arc<dyn BlockPool>,
    cache: Vec<Segment>,
    cache_limit: usize,
}

impl SegmentPool {
    pub(crate) fn new(blocks: Arc<dyn BlockPool>, cache_limit: usize) -> Self {
        Self {
            blocks,
            cache: Vec::new(),
            cache_limit,
        }
    }

    pub(crate) fn max_block_size(&self) -> usize {
        self.blocks.max_block_size()
    }

    pub(crate) fn block_pool(&self) -> &Arc<dyn BlockPool> {
        &self.blocks
    }

    pub(crate) fn rent(&mut self, size: usize, running_index: u64) -> Result<Segment> {
        let size = size.min(self.blocks.max_block_size());
        let block = self.blocks.rent(size)?;
        let mut segment = self.cache.pop().unwrap_or_default();
        tracing::trace!(requested = size, len = block.len(), running_index, "segment rented");
        segment.assign(block, running_index);
        Ok(segment)
    }

    pub(crate) fn release(&mut self, mut segment: Segment) {
        if let Some(block) = segment.reset() {
            tracing::trace!(len = block.len(), "segment released");
            block.release();
        }
        if self.cache.len() < self.cache_limit {
            self.cache.push(segment);
        }
    }

    /// 当前缓存的空闲描述符数量。
    #[cfg(test)]
    pub(crate) fn cached_descriptors(&self) -> usize {
        self.cache.len()
    }
}
