//! `spark-buffer` 提供 `spark-pipe` 所依赖的内存块分配器。
//!
//! # 模块定位（Why）
//! - 管道的写端与读端都以“段（Segment）”为单位搬运字节，每个段背后都需要一块可复用的内存；
//!   若每次都向系统申请，吞吐与延迟都会随流量抖动。
//! - 将“租借 / 归还”抽象为 [`BlockPool`] 契约，使分配器成为显式注入的依赖，
//!   测试可以替换为带计数的实现，断言没有泄漏。
//!
//! # 设计概要（How）
//! - `pooled_block` 模块实现 [`PooledBlock`]：独占一块完全初始化的 `BytesMut`，
//!   在 `Drop` 阶段通过 [`BlockRecycler`] 把内存交还所属池，保证“恰好归还一次”。
//! - `pool` 模块实现 [`SlabBlockPool`]：以 `spin::Mutex<Vec<BytesMut>>` 为自由链表，
//!   原子计数维护 [`PoolStats`]，支持跨实例并发租借与归还。
//!
//! # 契约（What）
//! - `rent(min)` 返回的块长度满足 `min <= len <= max_block_size()`；
//! - 超过 `max_block_size()` 的请求返回 [`PoolError::Oversized`]，不会阻塞；
//! - 所有公开类型均满足 `Send + Sync + 'static`。

#![deny(unsafe_code)]

mod error;
mod pool;
mod pooled_block;

pub use error::PoolError;
pub use pool::{BlockPool, DEFAULT_MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, PoolStats, SlabBlockPool};
pub use pooled_block::{BlockRecycler, PooledBlock, ReclaimedBlock};
