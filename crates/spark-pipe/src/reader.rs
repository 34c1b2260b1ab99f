use std::{
    collections::VecDeque,
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use spark_buffer::{BlockPool, SlabBlockPool};

use crate::{
    cancellation::{Cancellation, CancellationCoordinator, Canceller, Outcome, run_cancellable},
    error::{PipeError, Result, StreamOp},
    options::PipeOptions,
    segment::Segment,
    segment_pool::SegmentPool,
    sequence::{ReadSequence, SequencePosition},
    stream::ByteSource,
};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// 一次 `read`/`try_read` 的结果。
#[derive(Clone, Copy, Debug)]
pub struct ReadResult<'a> {
    buffer: ReadSequence<'a>,
    canceled: bool,
    completed: bool,
}

impl<'a> ReadResult<'a> {
    /// 从读头到填充点的全部已缓冲字节。
    pub fn buffer(&self) -> ReadSequence<'a> {
        self.buffer
    }

    /// 本次读取被取消；`buffer` 仍包含此前累积的数据。
    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// 读端已终结。
    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

/// `StreamPipeReader` 从底层字节源拉取数据到池化段链，并以“已消费 / 已检视”两条游标管理其生命周期。
///
/// # 设计背景（Why）
/// - 协议解析往往需要“先看一眼，不够再读”：`examined` 记录应用已经看过的位置，
///   只要还有未检视的数据，`read` 就直接返回而不发起 IO；
/// - `consumed` 之前的字节可以安全丢弃，完整落在其后的段立即归还分配器。
///
/// # 逻辑解析（How）
/// - 所有游标都是流内绝对偏移：`consumed <= examined <= filled`；链首段的
///   `running_index` 恒等于 `consumed`，尾段的逻辑终点恒等于 `filled`；
/// - 每次拉取写入尾段的剩余空间；尾段不存在、已封存或剩余空间低于
///   `minimum_read_size` 时租借新段；
/// - IO Future 与取消信号赛跑，取消时返回已累积的数据并标记 `is_canceled`。
///
/// # 契约说明（What）
/// - 单读者：同一实例最多一个 `read` 在进行中，由 `&mut self` 保证；
/// - 源返回 0 字节是合法的非终止结果，是否代表流结束由调用方依据源的语义判断；
/// - `complete` 立即归还全部段，不保留任何字节。
pub struct StreamPipeReader<S> {
    source: S,
    segments: SegmentPool,
    chain: VecDeque<Segment>,
    owner: u64,
    consumed: u64,
    examined: u64,
    filled: u64,
    coordinator: Arc<CancellationCoordinator>,
    options: PipeOptions,
    completed: bool,
    error: Option<PipeError>,
}

impl<S> StreamPipeReader<S> {
    /// 使用默认配置与独立的 [`SlabBlockPool`] 创建读端。
    pub fn new(source: S) -> Self {
        Self::build(source, PipeOptions::default(), Arc::new(SlabBlockPool::new()))
    }

    /// 使用自定义配置与共享分配器创建读端；配置非法时返回 `InvalidOptions`。
    pub fn with_options(
        source: S,
        options: PipeOptions,
        pool: Arc<dyn BlockPool>,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self::build(source, options, pool))
    }

    fn build(source: S, options: PipeOptions, pool: Arc<dyn BlockPool>) -> Self {
        Self {
            source,
            segments: SegmentPool::new(pool, options.descriptor_cache_limit()),
            chain: VecDeque::new(),
            owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
            consumed: 0,
            examined: 0,
            filled: 0,
            coordinator: Arc::new(CancellationCoordinator::default()),
            options,
            completed: false,
            error: None,
        }
    }

    /// 非阻塞读取：仅当存在未检视的已缓冲数据时返回结果，从不发起 IO。
    pub fn try_read(&self) -> Result<Option<ReadResult<'_>>> {
        if self.completed {
            return self.completed_result().map(Some);
        }
        if self.examined < self.filled {
            return Ok(Some(self.result(false)));
        }
        Ok(None)
    }

    /// 确认 `consumed` 之前的字节已处理完毕、`examined` 之前的字节已被检视。
    ///
    /// - `consumed` 早于当前读头、或不是本读端产生过的位置时返回 `InvalidState`；
    /// - `examined` 早于 `consumed` 时返回 `OutOfRange`；
    /// - 完整落在 `consumed` 之前的段立即归还分配器。
    pub fn advance_to(
        &mut self,
        consumed: SequencePosition,
        examined: SequencePosition,
    ) -> Result<()> {
        if self.completed {
            return self.completed_result().map(|_| ());
        }
        if consumed.owner() != self.owner || examined.owner() != self.owner {
            return Err(PipeError::invalid_state(
                "position belongs to another reader",
            ));
        }
        if consumed.offset() < self.consumed {
            return Err(PipeError::invalid_state(
                "consumed position precedes the current read head",
            ));
        }
        if consumed.offset() > self.filled || examined.offset() > self.filled {
            return Err(PipeError::invalid_state(
                "position was never returned by this reader",
            ));
        }
        if examined.offset() < consumed.offset() {
            return Err(PipeError::OutOfRange {
                requested: (consumed.offset() - self.consumed) as usize,
                available: (examined.offset() - self.consumed) as usize,
            });
        }

        let released = self.release_consumed(consumed.offset() - self.consumed);
        self.consumed = consumed.offset();
        self.examined = examined.offset();
        if released > 0 {
            tracing::trace!(
                segments = released,
                consumed = self.consumed,
                "pipe reader released segments"
            );
        }
        Ok(())
    }

    /// 等价于 `advance_to(position, position)`。
    pub fn advance(&mut self, position: SequencePosition) -> Result<()> {
        self.advance_to(position, position)
    }

    /// 请求取消下一次（或当前进行中的）`read`，立即返回且不获取任何锁。
    pub fn cancel_pending_read(&self) {
        tracing::debug!(buffered = self.buffered_len(), "pipe read cancellation requested");
        self.coordinator.request();
    }

    /// 可跨任务持有的取消句柄。
    pub fn read_canceller(&self) -> Canceller {
        Canceller::new(Arc::clone(&self.coordinator))
    }

    /// 终结读端并立即归还所有段。重复调用时以第一次为准。
    pub fn complete(&mut self, error: Option<PipeError>) {
        if self.completed {
            return;
        }
        self.completed = true;
        let discarded = self.buffered_len();
        let segments = self.chain.len();
        for segment in self.chain.drain(..) {
            self.segments.release(segment);
        }
        self.filled = self.consumed;
        self.examined = self.consumed;
        match &error {
            Some(err) => tracing::debug!(
                code = err.code(),
                discarded,
                segments,
                "pipe reader completed with error"
            ),
            None => tracing::debug!(discarded, segments, "pipe reader completed"),
        }
        self.error = error;
    }

    /// 读头之后已缓冲的字节数。
    pub fn buffered_len(&self) -> usize {
        (self.filled - self.consumed) as usize
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

    pub fn block_pool(&self) -> &Arc<dyn BlockPool> {
        self.segments.block_pool()
    }

    pub fn get_ref(&self) -> &S {
        &self.source
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// 取回底层源；已缓冲的字节随读端一起丢弃。
    pub fn into_inner(self) -> S {
        self.source
    }

    fn result(&self, canceled: bool) -> ReadResult<'_> {
        ReadResult {
            buffer: ReadSequence::new(&self.chain, self.owner, self.consumed, self.filled),
            canceled,
            completed: false,
        }
    }

    fn completed_result(&self) -> Result<ReadResult<'_>> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(ReadResult {
                buffer: ReadSequence::new(&self.chain, self.owner, self.consumed, self.consumed),
                canceled: false,
                completed: true,
            }),
        }
    }

    /// 丢弃链首 `count` 字节，返回归还的段数。
    fn release_consumed(&mut self, mut count: u64) -> usize {
        let min_read = self.options.minimum_read_size();
        let mut released = 0;
        loop {
            let only_tail = self.chain.len() == 1;
            let Some(front) = self.chain.front_mut() else {
                break;
            };
            let len = front.len() as u64;
            if count < len {
                front.consume(count as usize);
                break;
            }
            count -= len;
            // 唯一的尾段若仍能承接一次完整拉取，则保留复用。
            let reusable_tail = only_tail && front.writable_bytes() >= min_read;
            if reusable_tail {
                front.consume(len as usize);
                break;
            }
            if let Some(segment) = self.chain.pop_front() {
                self.segments.release(segment);
                released += 1;
            }
        }
        released
    }

    fn prepare_fill_tail(&mut self) -> Result<()> {
        let min_read = self.options.minimum_read_size();
        let needs_segment = self.chain.back().is_none_or(|tail| {
            let writable = tail.writable_bytes();
            writable == 0 || writable < min_read
        });
        if !needs_segment {
            return Ok(());
        }
        match self.chain.back().map(Segment::is_empty) {
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
        let segment = self
            .segments
            .rent(self.options.minimum_segment_size(), self.filled)?;
        self.chain.push_back(segment);
        Ok(())
    }
}

impl<S: ByteSource> StreamPipeReader<S> {
    /// 读取：存在未检视数据时直接返回；否则从源拉取一次并返回扩展后的区间。
    ///
    /// 内部取消或外部令牌任一触发时返回已累积的数据并标记 `is_canceled()`，
    /// 下一次 `read` 从未取消状态开始。
    pub async fn read(&mut self, cancellation: &Cancellation) -> Result<ReadResult<'_>> {
        self.coordinator.begin();
        if self.completed {
            return self.completed_result();
        }
        if self.examined < self.filled {
            return Ok(self.result(false));
        }
        if self.coordinator.try_observe() || cancellation.is_cancelled() {
            tracing::debug!(buffered = self.buffered_len(), "pipe read canceled before start");
            return Ok(self.result(true));
        }

        self.prepare_fill_tail()?;
        let coordinator = Arc::clone(&self.coordinator);
        let tail = self
            .chain
            .back_mut()
            .ok_or_else(|| PipeError::invalid_state("read chain is empty"))?;
        let writable = tail.writable_bytes();
        let outcome = run_cancellable(
            &coordinator,
            cancellation,
            self.source.read(tail.writable_mut()),
        )
        .await;

        match outcome {
            Outcome::Completed(Ok(count)) => {
                if count > writable {
                    return Err(PipeError::stream(
                        StreamOp::Read,
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("source reported {count} bytes for a {writable}-byte buffer"),
                        ),
                    ));
                }
                tail.append(count)?;
                self.filled += count as u64;
                tracing::trace!(bytes = count, filled = self.filled, "pipe reader filled");
                Ok(self.result(false))
            }
            Outcome::Completed(Err(err)) => {
                let err = PipeError::stream(StreamOp::Read, err);
                tracing::debug!(code = err.code(), "pipe read failed");
                Err(err)
            }
            Outcome::Canceled(source) => {
                tracing::debug!(buffered = self.buffered_len(), ?source, "pipe read canceled");
                Ok(self.result(true))
            }
        }
    }
}

impl<S> fmt::Debug for StreamPipeReader<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPipeReader")
            .field("segments", &self.chain.len())
            .field("consumed", &self.consumed)
            .field("examined", &self.examined)
            .field("filled", &self.filled)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;
    use futures::executor::block_on;

    fn reader_over(
        bytes: &[u8],
        segment_size: usize,
    ) -> (StreamPipeReader<MemoryStream>, Arc<SlabBlockPool>) {
        let pool = Arc::new(SlabBlockPool::new());
        let reader = StreamPipeReader::with_options(
            MemoryStream::from_bytes(bytes.to_vec()),
            PipeOptions::default().with_minimum_segment_size(segment_size),
            pool.clone(),
        )
        .expect("配置合法");
        (reader, pool)
    }

    #[test]
    fn unexamined_data_is_served_without_io() {
        let (mut reader, _) = reader_over(b"abcdef", 4096);
        block_on(async {
            let first = reader.read(&Cancellation::new()).await.expect("读取失败");
            assert_eq!(first.buffer().to_vec(), b"abcdef");
            let start = first.buffer().start();
            let middle = first.buffer().position_at(3).expect("位置合法");

            reader.advance_to(start, middle).expect("advance 失败");
            let again = reader.try_read().expect("不应出错").expect("仍有未检视数据");
            assert_eq!(again.buffer().len(), 6, "未消费的数据仍在序列中");
        });
        assert_eq!(reader.get_ref().unread_len(), 0);
    }

    #[test]
    fn try_read_without_data_returns_none() {
        let (reader, _) = reader_over(b"", 4096);
        assert!(reader.try_read().expect("不应出错").is_none());
    }

    #[test]
    fn partial_consume_keeps_tail_segment() {
        let (mut reader, pool) = reader_over(b"Hello World", 4096);
        block_on(async {
            let result = reader.read(&Cancellation::new()).await.expect("读取失败");
            let split = result.buffer().position_at(6).expect("位置合法");
            let end = result.buffer().end();
            reader.advance_to(split, end).expect("advance 失败");
        });
        assert_eq!(reader.buffered_len(), 5);
        assert_eq!(reader.segment_count(), 1);
        assert_eq!(pool.statistics().active_leases, 1);

        let rest = reader.try_read().expect("不应出错");
        assert!(rest.is_none(), "全部数据已检视，try_read 不应返回结果");
    }

    #[test]
    fn zero_byte_read_is_not_terminal() {
        let (mut reader, _) = reader_over(b"", 4096);
        let result = block_on(reader.read(&Cancellation::new())).expect("读取失败");
        assert!(result.buffer().is_empty());
        assert!(!result.is_completed());
        assert!(!result.is_canceled());
    }

    #[test]
    fn complete_releases_segments_and_sticks() {
        let (mut reader, pool) = reader_over(b"payload", 4096);
        block_on(reader.read(&Cancellation::new())).expect("读取失败");
        assert_eq!(pool.statistics().active_leases, 1);

        reader.complete(Some(PipeError::aborted("peer reset")));
        assert_eq!(pool.statistics().active_leases, 0);
        for _ in 0..2 {
            let err = block_on(reader.read(&Cancellation::new())).expect_err("终结错误必须粘滞");
            assert_eq!(err.code(), "spark.pipe.aborted");
        }
        assert!(reader.try_read().is_err());
    }
}
