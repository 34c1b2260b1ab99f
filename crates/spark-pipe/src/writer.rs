use std::{collections::VecDeque, fmt, sync::Arc};

use spark_buffer::{BlockPool, SlabBlockPool};

use crate::{
    cancellation::{Cancellation, CancellationCoordinator, Canceller, Outcome, run_cancellable},
    error::{PipeError, Result, StreamOp},
    options::PipeOptions,
    segment::Segment,
    segment_pool::SegmentPool,
    stream::ByteSink,
};

/// 一次 `commit` 的结果：取消不是错误，而是与“成功”并列的结果值。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushResult {
    canceled: bool,
    completed: bool,
}

impl FlushResult {
    fn canceled() -> Self {
        Self {
            canceled: true,
            completed: false,
        }
    }

    fn completed() -> Self {
        Self {
            canceled: false,
            completed: true,
        }
    }

    /// 本次提交被取消；待提交字节保持原样，可直接重试。
    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// 写端已经终结，不会再有任何 IO。
    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

/// `StreamPipeWriter` 把应用写入累积到池化段链中，并在 `commit` 时按序写入底层字节汇。
///
/// # 设计背景（Why）
/// - 应用以“取缓冲区 → 填字节 → `advance`”的方式零拷贝写入，IO 只发生在 `commit`；
/// - 段链采用“首段部分提交”模型：提交成功后，尾段若仍有空间则保留继续写入，
///   已提交的前缀通过前移段起点丢弃，不会在下一次提交中重复发送。
///
/// # 逻辑解析（How）
/// - `chain` 是从“最后提交点”到“当前写入点”的有序段链；首段的 `start` 即提交游标
///   （`commitIndex`），尾段是唯一可写的段；
/// - `get_write_buffer` 在尾段容量不足时封存旧尾段并租借新段，新段长度为
///   `max(minimum_segment_size, size_hint)`，截断到分配器单块上限；
/// - `commit` 让整条链的写入与 `flush` 作为一个 Future，与取消信号赛跑；
///   只有成功提交后才归还段，取消或失败时待提交字节原样保留。
///
/// # 契约说明（What）
/// - 单写者约束：同一实例上最多一个 `commit` 与一对 `get_write_buffer`/`advance` 在进行中，
///   由 `&mut self` 在编译期保证；跨任务取消使用 [`flush_canceller`](Self::flush_canceller)；
/// - 字节到达底层汇的顺序与 `advance` 的调用顺序一致；
/// - `complete(error)` 之后不再有 IO；若附带错误，之后每一次操作都返回该错误。
pub struct StreamPipeWriter<S> {
    sink: S,
    segments: SegmentPool,
    chain: VecDeque<Segment>,
    pending_len: usize,
    committed_len: u64,
    lease: Option<usize>,
    coordinator: Arc<CancellationCoordinator>,
    options: PipeOptions,
    completed: bool,
    error: Option<PipeError>,
}

impl<S> StreamPipeWriter<S> {
    /// 使用默认配置与独立的 [`SlabBlockPool`] 创建写端。
    pub fn new(sink: S) -> Self {
        Self::build(sink, PipeOptions::default(), Arc::new(SlabBlockPool::new()))
    }

    /// 使用自定义配置与共享分配器创建写端；配置非法时返回 `InvalidOptions`。
    pub fn with_options(sink: S, options: PipeOptions, pool: Arc<dyn BlockPool>) -> Result<Self> {
        options.validate()?;
        Ok(Self::build(sink, options, pool))
    }

    fn build(sink: S, options: PipeOptions, pool: Arc<dyn BlockPool>) -> Self {
        Self {
            sink,
            segments: SegmentPool::new(pool, options.descriptor_cache_limit()),
            chain: VecDeque::new(),
            pending_len: 0,
            committed_len: 0,
            lease: None,
            coordinator: Arc::new(CancellationCoordinator::default()),
            options,
            completed: false,
            error: None,
        }
    }

    /// 返回至少 `size_hint` 字节的可写区域；`size_hint == 0` 时返回任意非空区域。
    ///
    /// 未调用 `advance` 前重复调用是幂等的：返回的区域长度不变。
    /// `size_hint` 超过分配器单块上限时按上限截断。
    pub fn get_write_buffer(&mut self, size_hint: usize) -> Result<&mut [u8]> {
        self.ensure_open()?;
        let hint = size_hint.min(self.segments.max_block_size());
        let reuse_tail = self.chain.back().is_some_and(|tail| {
            let writable = tail.writable_bytes();
            writable > 0 && writable >= hint
        });
        if !reuse_tail {
            self.append_segment(hint)?;
        }
        match self.chain.back_mut() {
            Some(tail) => {
                let buffer = tail.writable_mut();
                self.lease = Some(buffer.len());
                Ok(buffer)
            }
            None => Err(PipeError::invalid_state("write chain is empty")),
        }
    }

    /// 把最近一次 `get_write_buffer` 返回区域中紧接上次 `advance` 之后的 `count` 字节计为待提交。
    ///
    /// 同一块区域可以分多次 `advance`，累计不得超过区域长度；区域用尽后租约失效。
    pub fn advance(&mut self, count: usize) -> Result<()> {
        self.ensure_open()?;
        let leased = self.lease.ok_or_else(|| {
            PipeError::invalid_state("advance called without a preceding get_write_buffer")
        })?;
        if count > leased {
            return Err(PipeError::OutOfRange {
                requested: count,
                available: leased,
            });
        }
        let tail = self
            .chain
            .back_mut()
            .ok_or_else(|| PipeError::invalid_state("write chain is empty"))?;
        tail.append(count)?;
        self.lease = (count < leased).then(|| leased - count);
        self.pending_len += count;
        Ok(())
    }

    /// 把字节复制进段链但不提交，按需跨越多个段。
    pub fn write_buffered(&mut self, bytes: &[u8]) -> Result<()> {
        let mut rest = bytes;
        while !rest.is_empty() {
            let buffer = self.get_write_buffer(0)?;
            let count = buffer.len().min(rest.len());
            buffer[..count].copy_from_slice(&rest[..count]);
            self.advance(count)?;
            rest = &rest[count..];
        }
        Ok(())
    }

    /// 请求取消下一次（或当前进行中的）`commit`，立即返回且不获取任何锁。
    pub fn cancel_pending_flush(&self) {
        tracing::debug!(pending = self.pending_len, "pipe flush cancellation requested");
        self.coordinator.request();
    }

    /// 可跨任务持有的取消句柄，效果等同于 [`cancel_pending_flush`](Self::cancel_pending_flush)。
    pub fn flush_canceller(&self) -> Canceller {
        Canceller::new(Arc::clone(&self.coordinator))
    }

    /// 终结写端并立即归还所有段；未提交的字节被丢弃。重复调用时以第一次为准。
    pub fn complete(&mut self, error: Option<PipeError>) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.lease = None;
        let discarded = self.pending_len;
        let segments = self.release_all();
        match &error {
            Some(err) => tracing::debug!(
                code = err.code(),
                discarded,
                segments,
                "pipe writer completed with error"
            ),
            None => tracing::debug!(discarded, segments, "pipe writer completed"),
        }
        self.error = error;
    }

    /// 自上次成功提交以来写入的字节数。
    pub fn pending_len(&self) -> usize {
        self.pending_len
    }

    /// 累计成功提交到底层汇的字节数。
    pub fn committed_len(&self) -> u64 {
        self.committed_len
    }

    pub fn segment_count(&self) -> usize {
        self.chain.len()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn options(&self) -> &PipeOptions {
        &self.options
    }

    /// 写端使用的分配器。
    pub fn block_pool(&self) -> &Arc<dyn BlockPool> {
        self.segments.block_pool()
    }

    pub fn get_ref(&self) -> &S {
        &self.sink
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// 取回底层汇；段链中的内存随写端一起归还。
    pub fn into_inner(self) -> S {
        self.sink
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.completed {
            return Ok(());
        }
        Err(self
            .error
            .clone()
            .unwrap_or_else(|| PipeError::invalid_state("writer is completed")))
    }

    fn append_segment(&mut self, hint: usize) -> Result<()> {
        let size = self.options.minimum_segment_size().max(hint);
        let running_index = self.committed_len + self.pending_len as u64;
        match self.chain.back().map(Segment::is_empty) {
            // 已全部提交的空尾段没有保留价值，直接归还。
            Some(true) => {
                if let Some(spent) = self.chain.pop_back() {
                    self.segments.release(spent);
                }
            }
            Some(false) => {
                if let Some(tail) = self.chain.back_mut() {
                    tail.seal();
                }
            }
            None => {}
        }
        let segment = self.segments.rent(size, running_index)?;
        self.chain.push_back(segment);
        Ok(())
    }

    fn on_committed(&mut self) {
        let flushed = self.pending_len;
        let mut released = 0usize;
        let keep_from = self.chain.len().saturating_sub(1);
        for segment in self.chain.drain(..keep_from) {
            self.segments.release(segment);
            released += 1;
        }
        let tail_exhausted = self
            .chain
            .back()
            .is_some_and(|tail| tail.writable_bytes() == 0);
        if tail_exhausted {
            if let Some(tail) = self.chain.pop_back() {
                self.segments.release(tail);
                released += 1;
            }
            self.lease = None;
        } else if let Some(tail) = self.chain.back_mut() {
            let len = tail.len();
            tail.consume(len);
        }
        self.committed_len += flushed as u64;
        self.pending_len = 0;
        tracing::debug!(
            bytes = flushed,
            segments = released,
            committed = self.committed_len,
            "pipe writer committed"
        );
    }

    fn release_all(&mut self) -> usize {
        let count = self.chain.len();
        for segment in self.chain.drain(..) {
            self.segments.release(segment);
        }
        self.pending_len = 0;
        count
    }

    fn completed_result(&self) -> Result<FlushResult> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(FlushResult::completed()),
        }
    }
}

impl<S: ByteSink> StreamPipeWriter<S> {
    /// 把 `[commitHead@commitIndex, writeHead@end)` 按序写入底层汇并 `flush`。
    ///
    /// - 内部取消（`cancel_pending_flush`）或外部令牌任一触发都返回 `is_canceled() == true`，
    ///   待提交字节与段链保持不变；
    /// - 没有待提交字节时不触碰底层汇，但已武装的取消仍会被本次调用观察并报告；
    /// - 底层汇失败时返回 `PipeError::Stream`，本层不重试，状态同样保持不变。
    pub async fn commit(&mut self, cancellation: &Cancellation) -> Result<FlushResult> {
        self.coordinator.begin();
        if self.completed {
            return self.completed_result();
        }
        if self.coordinator.try_observe() || cancellation.is_cancelled() {
            tracing::debug!(pending = self.pending_len, "pipe flush canceled before start");
            return Ok(FlushResult::canceled());
        }
        if self.pending_len == 0 {
            return Ok(FlushResult::default());
        }

        let coordinator = Arc::clone(&self.coordinator);
        let outcome = run_cancellable(
            &coordinator,
            cancellation,
            write_chain(&mut self.sink, &self.chain),
        )
        .await;

        match outcome {
            Outcome::Completed(Ok(())) => {
                self.on_committed();
                Ok(FlushResult::default())
            }
            Outcome::Completed(Err(err)) => {
                tracing::debug!(
                    code = err.code(),
                    pending = self.pending_len,
                    "pipe flush failed"
                );
                Err(err)
            }
            Outcome::Canceled(source) => {
                tracing::debug!(
                    pending = self.pending_len,
                    ?source,
                    "pipe flush canceled"
                );
                Ok(FlushResult::canceled())
            }
        }
    }

    /// 以不会被外部取消的令牌执行 [`commit`](Self::commit)。
    pub async fn flush(&mut self) -> Result<FlushResult> {
        self.commit(&Cancellation::new()).await
    }

    /// 复制 `bytes` 进段链后立即提交。
    pub async fn write(
        &mut self,
        bytes: &[u8],
        cancellation: &Cancellation,
    ) -> Result<FlushResult> {
        self.write_buffered(bytes)?;
        self.commit(cancellation).await
    }
}

async fn write_chain<S: ByteSink>(sink: &mut S, chain: &VecDeque<Segment>) -> Result<()> {
    for segment in chain {
        let bytes = segment.bytes();
        if bytes.is_empty() {
            continue;
        }
        sink.write(bytes)
            .await
            .map_err(|err| PipeError::stream(StreamOp::Write, err))?;
    }
    sink.flush()
        .await
        .map_err(|err| PipeError::stream(StreamOp::Flush, err))
}

impl<S> fmt::Debug for StreamPipeWriter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPipeWriter")
            .field("segments", &self.chain.len())
            .field("pending_len", &self.pending_len)
            .field("committed_len", &self.committed_len)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;
    use futures::executor::block_on;
    use tracing_test::traced_test;

    fn writer_with(
        segment_size: usize,
    ) -> (StreamPipeWriter<MemoryStream>, MemoryStream, Arc<SlabBlockPool>) {
        let sink = MemoryStream::new();
        let pool = Arc::new(SlabBlockPool::new());
        let writer = StreamPipeWriter::with_options(
            sink.clone(),
            PipeOptions::default().with_minimum_segment_size(segment_size),
            pool.clone(),
        )
        .expect("配置合法");
        (writer, sink, pool)
    }

    #[test]
    fn repeated_buffer_request_is_idempotent() {
        let (mut writer, _, _) = writer_with(4096);
        let first = writer.get_write_buffer(0).expect("获取缓冲失败").len();
        let second = writer.get_write_buffer(0).expect("获取缓冲失败").len();
        assert_eq!(first, second);
        assert_eq!(writer.segment_count(), 1, "重复请求不应租借新段");

        let hinted = writer.get_write_buffer(100).expect("获取缓冲失败").len();
        assert_eq!(hinted, first, "尾段足以满足提示时继续使用尾段");
    }

    #[test]
    fn growth_preserves_unflushed_bytes() {
        let (mut writer, sink, _) = writer_with(64);
        writer.write_buffered(b"0123456789").expect("写入失败");

        let buffer = writer.get_write_buffer(1000).expect("扩容失败");
        assert!(buffer.len() >= 1000);
        buffer[..3].copy_from_slice(b"abc");
        writer.advance(3).expect("advance 失败");
        assert_eq!(writer.segment_count(), 2);
        assert_eq!(writer.pending_len(), 13);

        let result = block_on(writer.flush()).expect("提交失败");
        assert!(!result.is_canceled());
        assert_eq!(sink.contents(), b"0123456789abc");
    }

    #[test]
    fn partial_commit_does_not_resend_prefix() {
        let (mut writer, sink, _) = writer_with(4096);
        block_on(async {
            writer
                .write(b"abc", &Cancellation::new())
                .await
                .expect("首次写入失败");
            writer
                .write(b"def", &Cancellation::new())
                .await
                .expect("二次写入失败");
        });
        assert_eq!(sink.contents(), b"abcdef");
        assert_eq!(sink.write_count(), 2);
        assert_eq!(writer.segment_count(), 1, "尾段仍有空间，应保留复用");
        assert_eq!(writer.committed_len(), 6);
    }

    #[test]
    fn advance_checks_lease() {
        let (mut writer, _, _) = writer_with(4096);
        let err = writer.advance(1).expect_err("未取缓冲就 advance 必须失败");
        assert_eq!(err.code(), "spark.pipe.invalid_state");

        let len = writer.get_write_buffer(0).expect("获取缓冲失败").len();
        let err = writer.advance(len + 1).expect_err("越界 advance 必须失败");
        assert!(matches!(err, PipeError::OutOfRange { requested, available } if requested == len + 1 && available == len));

        writer.advance(len).expect("恰好用满应成功");
        assert_eq!(writer.pending_len(), len);
        let err = writer.advance(0).expect_err("区域用尽后租约失效");
        assert_eq!(err.code(), "spark.pipe.invalid_state");
    }

    #[test]
    fn repeated_advance_shares_one_buffer() {
        let (mut writer, sink, _) = writer_with(4096);
        let buffer = writer.get_write_buffer(0).expect("获取缓冲失败");
        let len = buffer.len();
        buffer[..6].copy_from_slice(b"abcdef");
        writer.advance(3).expect("首次 advance 失败");
        writer.advance(3).expect("同一区域的二次 advance 应成功");
        assert_eq!(writer.pending_len(), 6);

        let err = writer.advance(len).expect_err("累计超出区域必须失败");
        assert!(matches!(err, PipeError::OutOfRange { available, .. } if available == len - 6));

        block_on(writer.flush()).expect("提交失败");
        assert_eq!(sink.contents(), b"abcdef");
    }

    #[test]
    fn complete_returns_every_block() {
        let (mut writer, sink, pool) = writer_with(64);
        writer.write_buffered(&[7u8; 300]).expect("写入失败");
        assert!(pool.statistics().active_leases >= 5);

        writer.complete(None);
        assert_eq!(pool.statistics().active_leases, 0);
        let result = block_on(writer.flush()).expect("无错误终结时提交返回 completed");
        assert!(result.is_completed());
        assert!(sink.is_empty(), "终结后不得触碰底层汇");
        assert_eq!(sink.flush_count(), 0);
    }

    #[traced_test]
    #[test]
    fn commit_emits_structured_log() {
        let (mut writer, _, _) = writer_with(4096);
        block_on(writer.write(b"Hello World", &Cancellation::new())).expect("写入失败");
        assert!(logs_contain("pipe writer committed"));
        assert!(logs_contain("bytes=11"));
    }
}
