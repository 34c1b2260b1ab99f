#![doc = r#"
# spark-pipe

## 设计动机（Why）
- **定位**：把任意顺序字节流（支持 `read`/`write`/`flush` 的套接字、文件、内存缓冲）
  适配为分段、池化、可取消的双工管道：写端把应用写入累积进池化段，按需提交；
  读端把源数据拉进池化段，以“已消费 / 已检视”两条游标暴露逻辑字节序列。
- **边界**：本 crate 不解析字节内容、不做重试退避、也不在一条流上复用多个读写者。

## 核心契约（What）
- [`StreamPipeWriter`]：`get_write_buffer` / `advance` 无 IO；`commit` 按 `advance` 顺序写入底层汇并刷新，
  成功后归还已提交的段，取消或失败时待提交字节原样保留；
- [`StreamPipeReader`]：`read` 在存在未检视数据时不发起 IO；`advance_to` 归还完整落在
  已消费位置之前的段；
- 取消是结果值而不是错误：`cancel_pending_flush` / `cancel_pending_read` 无锁、立即返回，
  且每次武装只会让一次操作观察到取消；
- `complete(error)` 之后不再有 IO，附带的错误在之后每次调用中重复返回。

## 实现策略（How）
- 段链是单一所有者的有序链（`VecDeque<Segment>`），段在链之间只能移动；
- 内存块来自显式注入的 [`spark_buffer::BlockPool`]，默认使用 [`spark_buffer::SlabBlockPool`]；
- 进行中的 IO Future 与内部协调器、外部 [`Cancellation`] 令牌通过 `tokio::select!` 赛跑，
  任一信号触发即丢弃该 Future。

## 风险与考量（Trade-offs）
- 被取消的提交无法得知底层汇实际写出了多少字节，因此取消后整段待提交数据会在下一次提交中重发；
- 写端换用新尾段时旧尾段剩余空间被封存浪费，换取“段内只追加”的简单不变量。
"#]
#![deny(unsafe_code)]

mod cancellation;
mod error;
mod options;
mod reader;
mod segment;
mod segment_pool;
mod sequence;
pub mod stream;
/// 测试替身命名空间，供集成测试与基准复用。
pub mod test_stubs;
mod writer;

pub use cancellation::{Cancellation, CancellationPhase, Canceller};
pub use error::{PipeError, Result, StreamOp};
pub use options::{DEFAULT_DESCRIPTOR_CACHE_LIMIT, DEFAULT_MINIMUM_SEGMENT_SIZE, PipeOptions};
pub use reader::{ReadResult, StreamPipeReader};
pub use sequence::{ReadSequence, SequencePosition};
pub use stream::{ByteSink, ByteSource, MemoryStream};
#[cfg(feature = "runtime-tokio")]
pub use stream::IoStream;
pub use writer::{FlushResult, StreamPipeWriter};
