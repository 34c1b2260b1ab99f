//! 管道测试与基准共用的替身实现。
//!
//! # 设计定位（Why）
//! - 取消、失败与分段增长等路径需要可控的底层流与分配器，散落在各测试文件里的
//!   临时实现容易在接口调整时漏改，这里统一维护。
//! - 模块对外公开，集成测试与基准通过 `spark_pipe::test_stubs::*` 引入。
//!
//! # 替身一览（What）
//! - [`HangingStream`]：所有读写永远挂起，只能通过取消解除；
//! - [`ScriptedReadStream`]：按脚本逐块产出数据，块大于目标缓冲时自动拆分，脚本耗尽后返回 0；
//! - [`FailingStream`]：每次调用都返回指定种类的 IO 错误；
//! - [`CountingPool`]：不复用内存、记录每次租借与归还的分配器，用于断言无泄漏。

use std::{
    collections::VecDeque,
    future::pending,
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::BytesMut;
use spark_buffer::{
    BlockPool, BlockRecycler, MIN_BLOCK_SIZE, PoolError, PoolStats, PooledBlock, ReclaimedBlock,
};
use spin::Mutex;

use crate::stream::{ByteSink, ByteSource};

/// 读、写、刷新都永远不会完成的流。
#[derive(Clone, Copy, Debug, Default)]
pub struct HangingStream;

#[async_trait]
impl ByteSource for HangingStream {
    async fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        pending().await
    }
}

#[async_trait]
impl ByteSink for HangingStream {
    async fn write(&mut self, _buf: &[u8]) -> io::Result<()> {
        pending().await
    }

    async fn flush(&mut self) -> io::Result<()> {
        pending().await
    }
}

/// 按脚本产出数据块的源。
#[derive(Clone, Debug, Default)]
pub struct ScriptedReadStream {
    script: VecDeque<Vec<u8>>,
    reads: usize,
}

impl ScriptedReadStream {
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        Self {
            script: chunks.into_iter().map(Into::into).collect(),
            reads: 0,
        }
    }

    /// 已发生的 `read` 调用次数。
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// 脚本中尚未产出的字节数。
    pub fn remaining(&self) -> usize {
        self.script.iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl ByteSource for ScriptedReadStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reads += 1;
        let Some(mut chunk) = self.script.pop_front() else {
            return Ok(0);
        };
        if chunk.len() > buf.len() {
            let rest = chunk.split_off(buf.len());
            self.script.push_front(rest);
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }
}

/// 每次调用都失败的流。
#[derive(Clone, Copy, Debug)]
pub struct FailingStream {
    kind: io::ErrorKind,
}

impl FailingStream {
    pub fn new(kind: io::ErrorKind) -> Self {
        Self { kind }
    }

    fn error(&self) -> io::Error {
        io::Error::new(self.kind, "scripted stream failure")
    }
}

#[async_trait]
impl ByteSource for FailingStream {
    async fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(self.error())
    }
}

#[async_trait]
impl ByteSink for FailingStream {
    async fn write(&mut self, _buf: &[u8]) -> io::Result<()> {
        Err(self.error())
    }

    async fn flush(&mut self) -> io::Result<()> {
        Err(self.error())
    }
}

/// 记录租借与归还次数的分配器。
///
/// 每次租借都分配新内存、从不复用，因此请求长度与归还次数都是确定的；
/// `requests()` 返回每次租借请求的最小长度，可用于断言分段策略。
#[derive(Clone, Debug)]
pub struct CountingPool {
    state: Arc<CountingState>,
}

#[derive(Debug)]
struct CountingState {
    max_block_size: usize,
    rented: AtomicUsize,
    returned: AtomicUsize,
    failed: AtomicUsize,
    requests: Mutex<Vec<usize>>,
}

impl Default for CountingPool {
    fn default() -> Self {
        Self::with_max_block_size(spark_buffer::DEFAULT_MAX_BLOCK_SIZE)
    }
}

impl CountingPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_block_size(max_block_size: usize) -> Self {
        Self {
            state: Arc::new(CountingState {
                max_block_size: max_block_size.max(MIN_BLOCK_SIZE),
                rented: AtomicUsize::new(0),
                returned: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn rented(&self) -> usize {
        self.state.rented.load(Ordering::Acquire)
    }

    pub fn returned(&self) -> usize {
        self.state.returned.load(Ordering::Acquire)
    }

    /// 尚未归还的块数。
    pub fn outstanding(&self) -> usize {
        self.rented().saturating_sub(self.returned())
    }

    pub fn requests(&self) -> Vec<usize> {
        self.state.requests.lock().clone()
    }
}

impl BlockRecycler for CountingState {
    fn reclaim(&self, _reclaimed: ReclaimedBlock) {
        self.returned.fetch_add(1, Ordering::AcqRel);
    }
}

impl BlockPool for CountingPool {
    fn rent(&self, min_size: usize) -> Result<PooledBlock, PoolError> {
        if min_size > self.state.max_block_size {
            self.state.failed.fetch_add(1, Ordering::AcqRel);
            return Err(PoolError::Oversized {
                requested: min_size,
                max: self.state.max_block_size,
            });
        }
        self.state.requests.lock().push(min_size);
        self.state.rented.fetch_add(1, Ordering::AcqRel);
        let buffer = BytesMut::zeroed(min_size.max(MIN_BLOCK_SIZE));
        let recycler: Arc<dyn BlockRecycler> = self.state.clone();
        Ok(PooledBlock::new(buffer, recycler))
    }

    fn max_block_size(&self) -> usize {
        self.state.max_block_size
    }

    fn statistics(&self) -> PoolStats {
        PoolStats {
            active_leases: self.outstanding(),
            total_rented: self.rented() as u64,
            total_returned: self.returned() as u64,
            failed_acquisitions: self.state.failed.load(Ordering::Acquire) as u64,
            ..PoolStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn scripted_stream_splits_large_chunks() {
        let mut stream = ScriptedReadStream::new([b"abcdef".to_vec(), b"g".to_vec()]);
        let mut buf = [0u8; 4];
        block_on(async {
            assert_eq!(stream.read(&mut buf).await.expect("读取失败"), 4);
            assert_eq!(&buf, b"abcd");
            assert_eq!(stream.read(&mut buf).await.expect("读取失败"), 2);
            assert_eq!(&buf[..2], b"ef");
            assert_eq!(stream.read(&mut buf).await.expect("读取失败"), 1);
            assert_eq!(stream.read(&mut buf).await.expect("读取失败"), 0);
        });
        assert_eq!(stream.reads(), 4);
        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    fn counting_pool_tracks_leases() {
        let pool = CountingPool::with_max_block_size(1024);
        let first = pool.rent(100).expect("租借失败");
        assert_eq!(first.len(), 100);
        assert!(pool.rent(2048).is_err());
        assert_eq!(pool.outstanding(), 1);
        drop(first);
        assert_eq!(pool.returned(), 1);
        assert_eq!(pool.requests(), vec![100]);
        assert_eq!(pool.statistics().failed_acquisitions, 1);
    }
}
