use thiserror::Error;

/// 内存块分配失败的原因。
///
/// # 契约说明（What）
/// - `Oversized`：请求的最小长度超过池允许的单块上限；调用方应先按
///   [`BlockPool::max_block_size`](crate::BlockPool::max_block_size) 截断请求。
/// - 池本身不设总量上限，因此不存在“等待归还”的错误分支。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// 请求长度超过单块上限。
    #[error("requested block of {requested} bytes exceeds the pool limit of {max} bytes")]
    Oversized { requested: usize, max: usize },
}

impl PoolError {
    /// 稳定错误码，供上层日志与告警聚合。
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::Oversized { .. } => "spark.buffer.oversized_request",
        }
    }
}
