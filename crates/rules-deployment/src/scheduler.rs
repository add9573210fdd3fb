//! 延迟重启调度
//!
//! - [`Scheduler`]：一次性延迟任务原语，返回取消令牌
//! - [`DelayQueueScheduler`]：全部部署共享的单个 tokio 延迟队列 worker
//! - `ManualScheduler`：手动推进时间的调度器，用于确定性测试（`test-utils` 特性）
//! - [`RestartScheduler`]：在调度原语之上实现防抖，每个部署最多一个待执行重启

use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

/// 延迟任务
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 取消令牌，克隆共享同一状态
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 一次性延迟调度原语
pub trait Scheduler: Send + Sync {
    fn schedule_once(&self, delay: Duration, task: Task) -> CancelToken;
}

// ============================================================================
// 延迟队列调度器
// ============================================================================

struct Pending {
    deadline: Instant,
    seq: u64,
    token: CancelToken,
    task: Task,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

enum Command {
    Schedule(Pending),
    Shutdown,
}

/// 共享延迟队列调度器
///
/// 单个后台 worker 维护按截止时间排序的最小堆，到期任务交给阻塞线程池执行
/// （任务会获取部署锁，不能阻塞异步 worker）。必须在 tokio 运行时内创建。
pub struct DelayQueueScheduler {
    tx: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_seq: AtomicU64,
}

impl DelayQueueScheduler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::run(rx));
        info!("延迟队列调度器已启动");

        Self {
            tx,
            worker: Mutex::new(Some(worker)),
            next_seq: AtomicU64::new(0),
        }
    }

    async fn run(mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut queue: BinaryHeap<Reverse<Pending>> = BinaryHeap::new();

        loop {
            let next = queue.peek().map(|Reverse(p)| p.deadline);

            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Schedule(pending)) => queue.push(Reverse(pending)),
                    Some(Command::Shutdown) | None => break,
                },
                _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                    let now = Instant::now();
                    while queue.peek().is_some_and(|Reverse(p)| p.deadline <= now) {
                        let Some(Reverse(due)) = queue.pop() else {
                            break;
                        };
                        if due.token.is_cancelled() {
                            debug!(seq = due.seq, "延迟任务已取消，跳过");
                            continue;
                        }
                        tokio::task::spawn_blocking(due.task);
                    }
                }
            }
        }

        info!(dropped = queue.len(), "延迟队列调度器已停止");
    }

    /// 停止 worker，尚未到期的任务被丢弃
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "延迟队列 worker 异常退出");
            }
        }
    }
}

impl Scheduler for DelayQueueScheduler {
    fn schedule_once(&self, delay: Duration, task: Task) -> CancelToken {
        let token = CancelToken::new();
        let pending = Pending {
            deadline: Instant::now() + delay,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            token: token.clone(),
            task,
        };

        if self.tx.send(Command::Schedule(pending)).is_err() {
            warn!("调度器已停止，延迟任务被丢弃");
            token.cancel();
        }

        token
    }
}

// ============================================================================
// 手动调度器
// ============================================================================

#[cfg(any(test, feature = "test-utils"))]
#[derive(Default)]
struct ManualState {
    now: Duration,
    next_seq: u64,
    pending: Vec<(Duration, u64, CancelToken, Task)>,
}

/// 手动推进时间的调度器
///
/// 任务只在 [`ManualScheduler::advance`] 中、在调用线程上执行。
/// 仅在测试或启用 `test-utils` 特性时编译。
#[cfg(any(test, feature = "test-utils"))]
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

#[cfg(any(test, feature = "test-utils"))]
impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 推进时间并按截止时间顺序执行所有到期任务
    ///
    /// 执行任务时不持有内部锁，任务可以再次调度。
    pub fn advance(&self, by: Duration) {
        let now = {
            let mut state = self.state.lock();
            state.now += by;
            state.now
        };

        loop {
            let due = {
                let mut state = self.state.lock();
                state.pending.sort_by_key(|(deadline, seq, _, _)| (*deadline, *seq));
                match state.pending.first() {
                    Some((deadline, _, _, _)) if *deadline <= now => Some(state.pending.remove(0)),
                    _ => None,
                }
            };

            let Some((_, _, token, task)) = due else {
                break;
            };
            if !token.is_cancelled() {
                task();
            }
        }
    }

    /// 未取消的待执行任务数
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|(_, _, token, _)| !token.is_cancelled())
            .count()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Scheduler for ManualScheduler {
    fn schedule_once(&self, delay: Duration, task: Task) -> CancelToken {
        let token = CancelToken::new();
        let mut state = self.state.lock();
        let deadline = state.now + delay;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push((deadline, seq, token.clone(), task));
        token
    }
}

// ============================================================================
// 防抖重启
// ============================================================================

/// 部署的待执行重启槽位
///
/// `epoch` 在每次调度时递增，到期回调凭它确认自己仍是最新的那次调度。
#[derive(Debug, Default)]
pub struct PendingRestart {
    token: Option<CancelToken>,
    epoch: u64,
}

impl PendingRestart {
    pub fn is_pending(&self) -> bool {
        self.token.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    /// 取消待执行的重启，返回是否确实取消了一个
    pub fn cancel(&mut self) -> bool {
        match self.token.take() {
            Some(token) => {
                let was_pending = !token.is_cancelled();
                token.cancel();
                was_pending
            }
            None => false,
        }
    }

    /// 到期回调确认并清空槽位，过期的回调返回 false
    pub fn claim(&mut self, epoch: u64) -> bool {
        if self.epoch == epoch && self.is_pending() {
            self.token = None;
            true
        } else {
            false
        }
    }
}

/// 防抖重启调度器
#[derive(Clone)]
pub struct RestartScheduler {
    scheduler: Arc<dyn Scheduler>,
    delay: Duration,
}

impl RestartScheduler {
    pub fn new(scheduler: Arc<dyn Scheduler>, delay: Duration) -> Self {
        Self { scheduler, delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// 取消槽位中已有的重启并重新调度，回调参数为本次调度的 epoch
    pub fn schedule_restart<F>(&self, slot: &mut PendingRestart, restart: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        slot.cancel();
        slot.epoch += 1;
        let epoch = slot.epoch;
        let token = self
            .scheduler
            .schedule_once(self.delay, Box::new(move || restart(epoch)));
        slot.token = Some(token);
    }
}
