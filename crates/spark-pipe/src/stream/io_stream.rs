use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ByteSink, ByteSource};

/// 把任意 Tokio `AsyncRead`/`AsyncWrite` 值（TCP 套接字、文件、`duplex` 管道）适配为
/// [`ByteSource`]/[`ByteSink`]。
///
/// # 契约说明（What）
/// - `read` 直接转发 `AsyncReadExt::read`；
/// - `write` 使用 `write_all`，被丢弃时已写出的前缀无法回滚，这与底层 Tokio 类型的语义一致；
/// - `flush` 转发 `AsyncWriteExt::flush`。
#[derive(Debug)]
pub struct IoStream<T> {
    inner: T,
}

impl<T> IoStream<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[async_trait]
impl<T> ByteSource for IoStream<T>
where
    T: AsyncRead + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }
}

#[async_trait]
impl<T> ByteSink for IoStream<T>
where
    T: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }
}
