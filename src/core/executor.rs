//! 传输调度器
//!
//! 两个有界工作池：传输池（`parallelism` 个并发）负责分块读写，
//! 计算池（`compute_threads` 个并发）负责校验和计算与收尾。
//! 工作内容都是阻塞闭包，通过 `spawn_blocking` 执行，并发由信号量限制。
//!
//! 工作线程只通过无界通道发送 [`ProgressEvent`]，状态的累加由编排方在
//! [`TransferCoordinator::drain_progress`] 中完成。

use crate::core::progress::{ProgressEvent, ProgressSink};
use crate::core::status::{OperationState, StatusRegistry};
use crate::error::TransferError;
use crate::remote::LockedSession;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

/// 任务结果，交给完成回调
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(TransferError),
    /// 任务在开始前被取消（调度器关闭或已中断）
    Cancelled,
}

const TASK_QUEUED: u8 = 0;
const TASK_RUNNING: u8 = 1;
const TASK_CANCELLED: u8 = 2;

/// 已提交任务的句柄
#[derive(Debug, Clone)]
pub struct TaskHandle {
    state: Arc<AtomicU8>,
}

impl TaskHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(TASK_QUEUED)),
        }
    }

    /// 取消尚未开始的任务，返回是否取消成功
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(TASK_QUEUED, TASK_CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn start(&self) -> bool {
        self.state
            .compare_exchange(TASK_QUEUED, TASK_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

struct WorkerPool {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl WorkerPool {
    fn new(name: &'static str, workers: usize) -> Self {
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            tracker: TaskTracker::new(),
        }
    }
}

struct Shared {
    session: LockedSession,
    runtime: Handle,
    /// 调度器自身的中断标志（关闭或析构时设置）
    interrupted: AtomicBool,
    /// 外部取消标志（引擎的 cancel）
    cancel: Arc<AtomicBool>,
    progress_tx: mpsc::UnboundedSender<ProgressEvent>,
    transfer: WorkerPool,
    compute: WorkerPool,
    /// 已提交但完成回调尚未结束的任务数
    outstanding: AtomicUsize,
}

/// 工作线程看到的调度器视图，可克隆
#[derive(Clone)]
pub struct WorkerContext {
    shared: Arc<Shared>,
}

impl WorkerContext {
    /// 每个热循环在处理每一块之前检查
    pub fn is_interrupted(&self) -> bool {
        self.shared.interrupted.load(Ordering::SeqCst) || self.shared.cancel.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> &LockedSession {
        &self.shared.session
    }

    /// 发送进度事件，从不阻塞
    pub fn post_progress(&self, path: &str, delta: Option<u64>) {
        let event = ProgressEvent {
            path: path.to_string(),
            delta,
        };
        // 接收端只在调度器析构后关闭，此时事件已无意义
        let _ = self.shared.progress_tx.send(event);
    }

    pub fn submit_transfer<T, W, C>(&self, work: W, on_complete: C) -> TaskHandle
    where
        T: Send + 'static,
        W: FnOnce(&WorkerContext) -> Result<T, TransferError> + Send + 'static,
        C: FnOnce(&WorkerContext, TaskOutcome<T>) + Send + 'static,
    {
        self.submit(PoolKind::Transfer, work, on_complete)
    }

    pub fn submit_compute<T, W, C>(&self, work: W, on_complete: C) -> TaskHandle
    where
        T: Send + 'static,
        W: FnOnce(&WorkerContext) -> Result<T, TransferError> + Send + 'static,
        C: FnOnce(&WorkerContext, TaskOutcome<T>) + Send + 'static,
    {
        self.submit(PoolKind::Compute, work, on_complete)
    }

    fn pool(&self, kind: PoolKind) -> &WorkerPool {
        match kind {
            PoolKind::Transfer => &self.shared.transfer,
            PoolKind::Compute => &self.shared.compute,
        }
    }

    fn submit<T, W, C>(&self, kind: PoolKind, work: W, on_complete: C) -> TaskHandle
    where
        T: Send + 'static,
        W: FnOnce(&WorkerContext) -> Result<T, TransferError> + Send + 'static,
        C: FnOnce(&WorkerContext, TaskOutcome<T>) + Send + 'static,
    {
        let handle = TaskHandle::new();
        let pool = self.pool(kind);
        let semaphore = pool.semaphore.clone();
        let pool_name = pool.name;
        let ctx = self.clone();
        let task = handle.clone();

        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);

        let fut = async move {
            // 池关闭后等待中的任务直接拿到错误
            let permit = semaphore.acquire_owned().await.ok();
            let run = permit.is_some() && !ctx.is_interrupted() && task.start();

            let worker = ctx.clone();
            let joined = tokio::task::spawn_blocking(move || {
                let outcome = if run {
                    let outcome = run_work(&worker, work);
                    drop(permit);
                    outcome
                } else {
                    task.cancel();
                    TaskOutcome::Cancelled
                };

                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| on_complete(&worker, outcome))) {
                    error!("[{}] 完成回调异常: {}", pool_name, panic_message(panic.as_ref()));
                }
            })
            .await;

            if let Err(e) = joined {
                error!("[{}] 工作线程异常退出: {}", pool_name, e);
            }
            ctx.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
        };

        pool.tracker.spawn_on(fut, &self.shared.runtime);
        handle
    }
}

#[derive(Debug, Clone, Copy)]
enum PoolKind {
    Transfer,
    Compute,
}

fn run_work<T, W>(ctx: &WorkerContext, work: W) -> TaskOutcome<T>
where
    W: FnOnce(&WorkerContext) -> Result<T, TransferError>,
{
    match catch_unwind(AssertUnwindSafe(|| work(ctx))) {
        Ok(Ok(value)) => TaskOutcome::Completed(value),
        Ok(Err(e)) => TaskOutcome::Failed(e),
        Err(panic) => TaskOutcome::Failed(TransferError::Worker(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// 一批传输共用的调度器
///
/// 由编排方独占；`close` 或析构后不再接受新工作。
pub struct TransferCoordinator {
    ctx: WorkerContext,
    progress_rx: mpsc::UnboundedReceiver<ProgressEvent>,
    closed: bool,
}

impl TransferCoordinator {
    /// 创建调度器，必须在 tokio 运行时内调用
    pub fn new(
        session: LockedSession,
        cancel: Arc<AtomicBool>,
        parallelism: usize,
        compute_threads: usize,
    ) -> Result<Self, TransferError> {
        let runtime = Handle::try_current()
            .map_err(|e| TransferError::Config(format!("no tokio runtime: {}", e)))?;
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        debug!(
            "创建传输调度器: 传输并发 {}, 计算并发 {}",
            parallelism, compute_threads
        );

        let shared = Shared {
            session,
            runtime,
            interrupted: AtomicBool::new(false),
            cancel,
            progress_tx,
            transfer: WorkerPool::new("transfer", parallelism),
            compute: WorkerPool::new("compute", compute_threads),
            outstanding: AtomicUsize::new(0),
        };

        Ok(Self {
            ctx: WorkerContext {
                shared: Arc::new(shared),
            },
            progress_rx,
            closed: false,
        })
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    pub fn session(&self) -> &LockedSession {
        self.ctx.session()
    }

    pub fn is_interrupted(&self) -> bool {
        self.ctx.is_interrupted()
    }

    pub fn submit_transfer<T, W, C>(&self, work: W, on_complete: C) -> TaskHandle
    where
        T: Send + 'static,
        W: FnOnce(&WorkerContext) -> Result<T, TransferError> + Send + 'static,
        C: FnOnce(&WorkerContext, TaskOutcome<T>) + Send + 'static,
    {
        self.ctx.submit_transfer(work, on_complete)
    }

    pub fn submit_compute<T, W, C>(&self, work: W, on_complete: C) -> TaskHandle
    where
        T: Send + 'static,
        W: FnOnce(&WorkerContext) -> Result<T, TransferError> + Send + 'static,
        C: FnOnce(&WorkerContext, TaskOutcome<T>) + Send + 'static,
    {
        self.ctx.submit_compute(work, on_complete)
    }

    pub fn post_progress(&self, path: &str, delta: Option<u64>) {
        self.ctx.post_progress(path, delta)
    }

    /// 未完成的任务数（含尚未执行完完成回调的任务）
    pub fn pending_tasks(&self) -> usize {
        self.ctx.shared.outstanding.load(Ordering::SeqCst)
    }

    /// 有限时间内等待两个池的任务结束，返回仍未完成的任务数
    pub async fn wait(&self, transfer_timeout: Duration, compute_timeout: Duration) -> usize {
        let shared = &self.ctx.shared;
        for (pool, limit) in [
            (&shared.transfer, transfer_timeout),
            (&shared.compute, compute_timeout),
        ] {
            pool.tracker.close();
            let _ = tokio::time::timeout(limit, pool.tracker.wait()).await;
            pool.tracker.reopen();
        }
        self.pending_tasks()
    }

    /// 取出所有已到达的进度事件并更新状态，返回本次累计的字节数
    ///
    /// 终止事件只把仍在进行中的状态标记为完成，已失败的状态保持不变。
    pub fn drain_progress(&mut self, registry: &dyn StatusRegistry) -> u64 {
        let mut drained = 0;
        while let Ok(event) = self.progress_rx.try_recv() {
            let Some(status) = registry.get(&event.path) else {
                debug!("忽略未登记路径的进度: {}", event.path);
                continue;
            };
            match event.delta {
                Some(delta) => {
                    status.add_progress(delta);
                    drained += delta;
                }
                None => {
                    if status.state() == OperationState::InProgress {
                        status.done();
                    }
                }
            }
        }
        drained
    }

    /// 等待所有任务结束，期间定期转发进度
    pub async fn wait_progress(
        &mut self,
        poll: Duration,
        registry: &dyn StatusRegistry,
        sink: &mut ProgressSink,
    ) {
        let half = poll / 2;
        loop {
            let remaining = self.wait(half, half).await;
            let drained = self.drain_progress(registry);
            sink.advance(drained).await;
            if remaining == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let drained = self.drain_progress(registry);
        sink.advance(drained).await;
    }

    fn interrupt(&self) {
        let shared = &self.ctx.shared;
        shared.transfer.semaphore.close();
        shared.interrupted.store(true, Ordering::SeqCst);
    }

    /// 关闭调度器：取消排队中的传输任务，设置中断标志，等待执行中的任务结束
    pub async fn close(mut self) {
        self.closed = true;
        self.interrupt();

        let shared = self.ctx.shared.clone();
        shared.transfer.tracker.close();
        shared.compute.tracker.close();
        shared.transfer.tracker.wait().await;
        shared.compute.tracker.wait().await;
        debug!("传输调度器已关闭");
    }
}

impl Drop for TransferCoordinator {
    fn drop(&mut self) {
        if !self.closed {
            self.interrupt();
        }
    }
}
