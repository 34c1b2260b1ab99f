//! `io_stream_contract` 集成测试：通过 Tokio `duplex` 管道把写端与读端首尾相接。
//!
//! # 测试目标（Why）
//! - `IoStream` 是管道接入真实套接字与文件的唯一入口，必须保证字节顺序与背压下的取消行为。
//!
//! # 结构安排（How）
//! - 写端持有 `duplex` 的一端，读端持有另一端，在同一运行时的两个任务中并发推进；
//! - 小容量 `duplex` 会在写满后挂起写入，以此构造“提交进行中被取消”的真实场景。

use std::{sync::Arc, time::Duration};

use spark_buffer::{BlockPool, SlabBlockPool};
use spark_pipe::{Cancellation, IoStream, PipeOptions, StreamPipeReader, StreamPipeWriter};

const HELLO: &[u8] = b"Hello World";

/// 写端 1000 次写入后一次提交，读端按序收到全部字节。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplex_round_trip() {
    let (client, server) = tokio::io::duplex(1024);
    let pool = Arc::new(SlabBlockPool::new());
    let mut writer = StreamPipeWriter::with_options(
        IoStream::new(client),
        PipeOptions::default(),
        pool.clone(),
    )
    .expect("配置合法");
    let mut reader =
        StreamPipeReader::with_options(IoStream::new(server), PipeOptions::default(), pool.clone())
            .expect("配置合法");

    let expected = HELLO.repeat(1000);
    let producer = tokio::spawn(async move {
        for _ in 0..1000 {
            writer.write_buffered(HELLO).expect("写入失败");
        }
        writer.flush().await.expect("提交失败");
        writer.complete(None);
        // 释放写半部，读端随后读到 EOF。
        drop(writer.into_inner());
    });

    let mut received = Vec::new();
    loop {
        let result = reader.read(&Cancellation::new()).await.expect("读取失败");
        let buffer = result.buffer();
        if buffer.is_empty() {
            break;
        }
        received.extend(buffer.to_vec());
        let end = buffer.end();
        reader.advance(end).expect("advance 失败");
    }

    producer.await.expect("写端任务 panic");
    assert_eq!(received, expected);
    reader.complete(None);
    assert_eq!(pool.statistics().active_leases, 0);
}

/// 对端不读取时写入被背压挂起，取消句柄能够解除进行中的提交。
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backpressured_flush_is_cancellable() {
    let (client, _server) = tokio::io::duplex(16);
    let mut writer = StreamPipeWriter::new(IoStream::new(client));
    writer.write_buffered(&[0u8; 4096]).expect("写入失败");
    let canceller = writer.flush_canceller();

    let task = tokio::spawn(async move {
        let result = writer.flush().await;
        (writer, result)
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    canceller.cancel();

    let (writer, result) = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("取消必须解除被背压挂起的提交")
        .expect("任务 panic");
    assert!(result.expect("取消不是错误").is_canceled());
    assert_eq!(writer.pending_len(), 4096, "被取消的提交保留全部待提交字节");
}
