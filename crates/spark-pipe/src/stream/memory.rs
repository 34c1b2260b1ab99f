use std::{io, sync::Arc};

use async_trait::async_trait;
use spin::Mutex;

use super::{ByteSink, ByteSource};

/// 内存中的双工字节缓冲。
///
/// # 设计背景（Why）
/// - 管道的回环测试与基准需要一个“写入什么就能读回什么”的汇/源，同时允许测试在
///   管道持有流的期间检查其内容，因此句柄可克隆，所有克隆共享同一份缓冲。
///
/// # 契约说明（What）
/// - `write` 追加到缓冲尾部，`read` 从独立的读游标处取数据，读尽时返回 `0`；
/// - `contents()` 返回自创建以来写入（或预置）的全部字节，不受读游标影响；
/// - `write_count()`/`flush_count()` 记录调用次数，用于断言“未触碰底层流”。
#[derive(Clone, Debug, Default)]
pub struct MemoryStream {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<u8>,
    read_pos: usize,
    writes: usize,
    flushes: usize,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以预置内容创建，读端可直接读取这些字节。
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                data: bytes.into(),
                ..MemoryState::default()
            })),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 尚未被读取的字节数。
    pub fn unread_len(&self) -> usize {
        let state = self.inner.lock();
        state.data.len() - state.read_pos
    }

    pub fn write_count(&self) -> usize {
        self.inner.lock().writes
    }

    pub fn flush_count(&self) -> usize {
        self.inner.lock().flushes
    }
}

#[async_trait]
impl ByteSource for MemoryStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.inner.lock();
        let start = state.read_pos;
        let count = buf.len().min(state.data.len() - start);
        buf[..count].copy_from_slice(&state.data[start..start + count]);
        state.read_pos += count;
        Ok(count)
    }
}

#[async_trait]
impl ByteSink for MemoryStream {
    async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut state = self.inner.lock();
        state.data.extend_from_slice(buf);
        state.writes += 1;
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flushes += 1;
        Ok(())
    }
}
