//! 底层字节流的能力接口与具体适配器。
//!
//! # 设计背景（Why）
//! - 管道只依赖三个动作：`read(buf) -> n`、`write(buf)`、`flush()`；把它们拆成
//!   [`ByteSource`] 与 [`ByteSink`] 两个能力 trait，内存缓冲、套接字、文件与测试替身
//!   都以同样的方式接入。
//! - 取消以 Rust 的方式表达：管道让 IO Future 与取消信号赛跑，信号触发时直接丢弃该 Future。
//!   因此实现必须容忍在任意 `.await` 点被丢弃，其内部状态以各自文档为准。
//!
//! # 契约说明（What）
//! - `read` 返回本次写入 `buf` 的字节数，`0` 是合法结果，是否代表流结束由具体源决定；
//!   返回值不得超过 `buf.len()`；
//! - `write` 必须写完整个切片或返回错误；
//! - `flush` 在数据抵达下一层之前挂起。

use std::io;

use async_trait::async_trait;

mod memory;
#[cfg(feature = "runtime-tokio")]
mod io_stream;

pub use memory::MemoryStream;
#[cfg(feature = "runtime-tokio")]
pub use io_stream::IoStream;

/// 可被 [`StreamPipeReader`](crate::StreamPipeReader) 拉取的字节源。
#[async_trait]
pub trait ByteSource: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// 可被 [`StreamPipeWriter`](crate::StreamPipeWriter) 提交的字节汇。
#[async_trait]
pub trait ByteSink: Send {
    async fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    async fn flush(&mut self) -> io::Result<()>;
}

#[async_trait]
impl<T: ByteSource + ?Sized> ByteSource for Box<T> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf).await
    }
}

#[async_trait]
impl<T: ByteSink + ?Sized> ByteSink for Box<T> {
    async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        (**self).write(buf).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        (**self).flush().await
    }
}
