use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
};

use tokio::sync::Notify;

/// 调用方提供的外部取消令牌。
///
/// # 设计背景（Why）
/// - 每次 `commit`/`read` 都可以附带一个外部令牌；它与管道内部的取消协调器组合，
///   任一触发都会中止当前操作，但外部令牌不会跨调用持久化到管道内部。
///
/// # 逻辑解析（How）
/// - 原子位表达取消状态，`cancel` 首次成功时返回 `true`；
/// - 额外持有一个 [`Notify`]，使挂起中的 IO 可以被立即唤醒，而不是轮询原子位。
///
/// # 契约说明（What）
/// - `child` 派生共享同一状态的令牌；
/// - 取消不可撤销：需要“新的一轮”时，构造新的令牌即可。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<CancellationSignal>,
}

#[derive(Debug, Default)]
struct CancellationSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    /// 创建处于“未取消”状态的令牌。
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 标记取消并唤醒所有等待者；返回 `true` 表示本次调用首次触发取消。
    pub fn cancel(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// 派生共享同一原子位的子令牌。
    pub fn child(&self) -> Self {
        self.clone()
    }

    /// 等待令牌被取消。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // 先登记等待者再检查标志，避免错过 `cancel` 与检查之间的唤醒。
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// 取消协调器所处的阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancellationPhase {
    /// 没有待观察的取消请求。
    Idle,
    /// 已请求取消，等待下一次（或当前进行中的）操作观察。
    Armed,
    /// 某次操作已观察到取消；下一次操作开始前回到 `Idle`。
    Consumed,
}

const IDLE: u8 = 0;
const ARMED: u8 = 1;
const CONSUMED: u8 = 2;

/// 写端/读端各自持有的取消状态机：`Idle → Armed → Consumed → Idle`。
///
/// # 设计背景（Why）
/// - `cancel_pending_flush`/`cancel_pending_read` 必然与进行中的 `commit`/`read` 竞争；
///   若请求取消也需要获取进行中操作持有的锁，两者可能互相等待。
/// - 这里整个状态机只由一个 `AtomicU8` 与一个 [`Notify`] 组成，请求方永远不会阻塞，
///   进行中的操作也不在持锁状态下创建或拆除任何取消源。
///
/// # 逻辑解析（How）
/// - `request`：无条件置为 `Armed` 并唤醒等待者（`Idle/Armed/Consumed → Armed`）；
/// - `try_observe`：`Armed → Consumed` 的 CAS，成功者即本次被取消的操作，保证“边沿触发一次”；
/// - `begin`：每次操作开始时执行 `Consumed → Idle`，上一轮的观察结果在此清理，
///   而不是与取消信号并发地替换。
#[derive(Debug, Default)]
pub(crate) struct CancellationCoordinator {
    state: AtomicU8,
    notify: Notify,
}

impl CancellationCoordinator {
    pub(crate) fn request(&self) {
        self.state.store(ARMED, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn begin(&self) {
        let _ = self
            .state
            .compare_exchange(CONSUMED, IDLE, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn try_observe(&self) -> bool {
        self.state
            .compare_exchange(ARMED, CONSUMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 挂起直到观察到一次取消请求。
    pub(crate) async fn observed(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.try_observe() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn phase(&self) -> CancellationPhase {
        match self.state.load(Ordering::Acquire) {
            ARMED => CancellationPhase::Armed,
            CONSUMED => CancellationPhase::Consumed,
            _ => CancellationPhase::Idle,
        }
    }
}

/// 可跨任务/线程传递的取消句柄。
///
/// 写端的 `flush_canceller()` 与读端的 `read_canceller()` 返回该句柄；
/// 进行中的 `commit`/`read` 独占管道的可变借用，其它任务只能通过它发出取消请求。
#[derive(Clone, Debug)]
pub struct Canceller {
    coordinator: Arc<CancellationCoordinator>,
}

impl Canceller {
    pub(crate) fn new(coordinator: Arc<CancellationCoordinator>) -> Self {
        Self { coordinator }
    }

    /// 请求取消下一次（或当前进行中的）操作，立即返回。
    pub fn cancel(&self) {
        self.coordinator.request();
    }

    pub fn phase(&self) -> CancellationPhase {
        self.coordinator.phase()
    }
}

/// 被取消操作的触发来源。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CancelSource {
    Internal,
    External,
}

pub(crate) enum Outcome<T> {
    Completed(T),
    Canceled(CancelSource),
}

/// 让 IO Future 与内部协调器、外部令牌赛跑；任一取消信号触发时丢弃 IO Future。
pub(crate) async fn run_cancellable<F, T>(
    coordinator: &CancellationCoordinator,
    external: &Cancellation,
    future: F,
) -> Outcome<T>
where
    F: Future<Output = T>,
{
    if coordinator.try_observe() {
        return Outcome::Canceled(CancelSource::Internal);
    }
    if external.is_cancelled() {
        return Outcome::Canceled(CancelSource::External);
    }

    tokio::select! {
        biased;
        _ = coordinator.observed() => Outcome::Canceled(CancelSource::Internal),
        _ = external.cancelled() => Outcome::Canceled(CancelSource::External),
        value = future => Outcome::Completed(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::future::pending;

    #[test]
    fn armed_state_is_observed_exactly_once() {
        let coordinator = CancellationCoordinator::default();
        coordinator.request();
        coordinator.request();
        assert_eq!(coordinator.phase(), CancellationPhase::Armed);

        assert!(coordinator.try_observe());
        assert!(!coordinator.try_observe(), "重复请求只应取消一次");
        assert_eq!(coordinator.phase(), CancellationPhase::Consumed);

        coordinator.begin();
        assert_eq!(coordinator.phase(), CancellationPhase::Idle);
    }

    #[test]
    fn begin_keeps_fresh_requests_armed() {
        let coordinator = CancellationCoordinator::default();
        coordinator.request();
        coordinator.begin();
        assert_eq!(
            coordinator.phase(),
            CancellationPhase::Armed,
            "尚未被观察的请求不能在操作开始时被清除"
        );
    }

    #[test]
    fn external_token_cancels_pending_future() {
        let coordinator = CancellationCoordinator::default();
        let external = Cancellation::new();
        external.cancel();
        let outcome = block_on(run_cancellable(&coordinator, &external, pending::<()>()));
        assert!(matches!(outcome, Outcome::Canceled(CancelSource::External)));
        assert_eq!(coordinator.phase(), CancellationPhase::Idle);
    }

    #[test]
    fn completed_future_wins_without_signals() {
        let coordinator = CancellationCoordinator::default();
        let outcome = block_on(run_cancellable(
            &coordinator,
            &Cancellation::new(),
            async { 42 },
        ));
        assert!(matches!(outcome, Outcome::Completed(42)));
    }

    #[test]
    fn cancel_reports_first_trigger_only() {
        let token = Cancellation::new();
        let child = token.child();
        assert!(child.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
        block_on(token.cancelled());
    }
}
