use std::{fmt, io, sync::Arc};

use spark_buffer::PoolError;
use thiserror::Error;

/// 底层流操作的种类，决定 [`PipeError::Stream`] 的稳定错误码。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOp {
    Read,
    Write,
    Flush,
}

impl StreamOp {
    /// 该操作失败时使用的错误码。
    pub fn code(self) -> &'static str {
        match self {
            StreamOp::Read => "spark.pipe.stream.read_failed",
            StreamOp::Write => "spark.pipe.stream.write_failed",
            StreamOp::Flush => "spark.pipe.stream.flush_failed",
        }
    }

    fn label(self) -> &'static str {
        match self {
            StreamOp::Read => "stream read",
            StreamOp::Write => "stream write",
            StreamOp::Flush => "stream flush",
        }
    }
}

impl fmt::Display for StreamOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// `PipeError` 是分段管道对外暴露的唯一错误类型。
///
/// # 设计背景（Why）
/// - 写端/读端在 `complete(error)` 后必须在每一次后续调用中重新抛出同一个错误，
///   因此错误需要 `Clone`；底层 `io::Error` 不可克隆，统一包进 `Arc` 共享。
/// - 取消不是错误：它以 `FlushResult::is_canceled` / `ReadResult::is_canceled` 的形式返回，
///   调用方据此重试而不是展开错误路径。
///
/// # 契约说明（What）
/// - `InvalidState` / `OutOfRange`：调用顺序或参数错误，属于调用方缺陷，永不重试；
/// - `Stream`：底层源/汇失败，原样透传，本层不做重试；
/// - `Pool`：分配器拒绝了租借请求；
/// - `Aborted`：调用方在没有更具体原因时附加给 `complete` 的终止错误；
/// - `InvalidOptions`：构造阶段的配置校验失败。
#[derive(Clone, Debug, Error)]
pub enum PipeError {
    #[error("invalid state: {reason}")]
    InvalidState { reason: &'static str },

    #[error("out of range: requested {requested} bytes but only {available} available")]
    OutOfRange { requested: usize, available: usize },

    #[error("{op} failed: {source}")]
    Stream {
        op: StreamOp,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("segment rent failed: {source}")]
    Pool {
        #[from]
        source: PoolError,
    },

    #[error("pipe aborted: {reason}")]
    Aborted { reason: String },

    #[error("invalid pipe options: {reason}")]
    InvalidOptions { reason: String },
}

impl PipeError {
    /// 构造底层流失败错误。
    pub fn stream(op: StreamOp, source: io::Error) -> Self {
        PipeError::Stream {
            op,
            source: Arc::new(source),
        }
    }

    /// 构造终止错误，供 `complete(Some(..))` 使用。
    pub fn aborted(reason: impl Into<String>) -> Self {
        PipeError::Aborted {
            reason: reason.into(),
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            PipeError::InvalidState { .. } => "spark.pipe.invalid_state",
            PipeError::OutOfRange { .. } => "spark.pipe.out_of_range",
            PipeError::Stream { op, .. } => op.code(),
            PipeError::Pool { .. } => "spark.pipe.pool_rent_failed",
            PipeError::Aborted { .. } => "spark.pipe.aborted",
            PipeError::InvalidOptions { .. } => "spark.pipe.invalid_options",
        }
    }

    /// 是否属于调用方违反调用约定导致的错误。
    pub fn is_caller_bug(&self) -> bool {
        matches!(
            self,
            PipeError::InvalidState { .. } | PipeError::OutOfRange { .. }
        )
    }

    /// 底层 IO 错误的种类（仅 `Stream` 变体有值）。
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            PipeError::Stream { source, .. } => Some(source.kind()),
            _ => None,
        }
    }

    pub(crate) fn invalid_state(reason: &'static str) -> Self {
        PipeError::InvalidState { reason }
    }
}

pub type Result<T, E = PipeError> = std::result::Result<T, E>;
