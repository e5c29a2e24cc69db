//! # 有界优先请求队列
//!
//! 唯一真正触发下游处理的组件：固定工作协程池从后端取条目执行流水线，
//! 拥有重试与超时语义。队列满时显式拒绝准入，清扫任务兜底清理过期条目。

use super::strategies::{QueueBackend, create_backend};
use super::types::{QueueStatus, QueueStrategy, QueuedRequest};
use super::worker::RequestPipeline;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::types::{GatewayRequest, GatewayResponse, RequestPriority};
use crate::{ldebug, linfo, lwarn};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// 工作协程空转时的兜底唤醒间隔
const IDLE_POLL: Duration = Duration::from_millis(100);
/// 重试退避上限
const RETRY_BACKOFF_CAP_SECS: u64 = 30;

/// 队列运行参数
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// 调度策略
    pub strategy: QueueStrategy,
    /// 工作协程数
    pub worker_count: usize,
    /// 最大排队条目数
    pub max_queue_size: usize,
    /// 过期清扫周期
    pub sweep_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            strategy: QueueStrategy::default(),
            worker_count: 4,
            max_queue_size: 10_000,
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl From<&GatewayConfig> for QueueOptions {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            strategy: config.queue_strategy,
            worker_count: config.worker_count,
            max_queue_size: config.max_queue_size,
            sweep_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    retries: AtomicU64,
    rejected: AtomicU64,
}

/// 请求队列
pub struct RequestQueue {
    options: QueueOptions,
    backend: Mutex<Box<dyn QueueBackend>>,
    pipeline: Arc<RequestPipeline>,
    notify: Notify,
    semaphore: Arc<Semaphore>,
    running: AtomicBool,
    in_flight: AtomicUsize,
    counters: QueueCounters,
    seq: AtomicU64,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    /// 自引用，供后台任务与重试再入队持有强引用
    me: Weak<RequestQueue>,
}

impl RequestQueue {
    /// 创建请求队列
    #[must_use]
    pub fn new(options: QueueOptions, pipeline: Arc<RequestPipeline>) -> Arc<Self> {
        let backend = create_backend(options.strategy);
        let semaphore = Arc::new(Semaphore::new(options.worker_count.max(1)));
        Arc::new_cyclic(|me| Self {
            options,
            backend: Mutex::new(backend),
            pipeline,
            notify: Notify::new(),
            semaphore,
            running: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            counters: QueueCounters::default(),
            seq: AtomicU64::new(0),
            handles: tokio::sync::Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }

    /// 启动工作协程池与清扫任务（幂等）
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(queue) = self.me.upgrade() else {
            return;
        };

        let mut handles = self.handles.lock().await;
        for worker_id in 0..self.options.worker_count {
            handles.push(tokio::spawn(worker_loop(queue.clone(), worker_id)));
        }
        handles.push(tokio::spawn(sweeper_loop(queue)));

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Queue,
            "queue_started",
            "Request queue started",
            strategy = self.options.strategy.as_str(),
            worker_count = self.options.worker_count,
            max_queue_size = self.options.max_queue_size
        );
    }

    /// 停止队列（幂等）；停止后可再次 `start`
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }

        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::Queue,
            "queue_stopped",
            "Request queue stopped"
        );
    }

    /// 入队（不等待结果）
    pub fn enqueue(
        &self,
        request: GatewayRequest,
        priority: RequestPriority,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<String> {
        self.enqueue_inner(request, priority, timeout, max_retries)
            .map(|(id, _rx)| id)
    }

    /// 入队并阻塞等待结果
    ///
    /// 超时以独立的 `QueueTimeout` 错误返回；队列随后自行完成或放弃在途尝试。
    pub async fn enqueue_and_wait(
        &self,
        request: GatewayRequest,
        priority: RequestPriority,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<GatewayResponse> {
        let (id, rx) = self.enqueue_inner(request, priority, timeout, max_retries)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(GatewayError::queue_cancelled(format!(
                "request {id} was dropped before completion"
            ))),
            Err(_) => Err(GatewayError::queue_timeout(format!(
                "request {id} timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// 取消仍在排队的条目
    ///
    /// 已被工作协程取走的条目无法取消，只能等它跑完。
    pub fn cancel(&self, id: &str) -> bool {
        let item = {
            let mut backend = self.backend.lock().expect("queue backend poisoned");
            backend.remove(id)
        };

        match item {
            Some(mut item) => {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                let error = GatewayError::queue_cancelled("cancelled by caller");
                let response = GatewayResponse::from_error(item.request.provider.clone(), &error)
                    .with_retry_count(item.retry_count);
                item.resolve(response);
                true
            }
            None => false,
        }
    }

    /// 清空队列，所有排队条目按取消回执
    pub fn clear(&self) -> usize {
        let items = {
            let mut backend = self.backend.lock().expect("queue backend poisoned");
            backend.drain_all()
        };

        let cleared = items.len();
        for mut item in items {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            let error = GatewayError::queue_cancelled("queue flushed by admin command");
            let response = GatewayResponse::from_error(item.request.provider.clone(), &error)
                .with_retry_count(item.retry_count);
            item.resolve(response);
        }

        if cleared > 0 {
            lwarn!(
                "system",
                LogStage::Admin,
                LogComponent::Queue,
                "queue_cleared",
                "Request queue flushed",
                cleared = cleared
            );
        }
        cleared
    }

    /// 状态快照
    pub fn status(&self) -> QueueStatus {
        let pending = self.backend.lock().expect("queue backend poisoned").len();
        QueueStatus {
            running: self.running.load(Ordering::SeqCst),
            strategy: self.options.strategy.as_str(),
            pending,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            total_enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            total_completed: self.counters.completed.load(Ordering::Relaxed),
            total_failed: self.counters.failed.load(Ordering::Relaxed),
            total_timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            total_cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            total_retries: self.counters.retries.load(Ordering::Relaxed),
            total_rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// 当前待处理条目数
    pub fn pending(&self) -> usize {
        self.backend.lock().expect("queue backend poisoned").len()
    }

    fn enqueue_inner(
        &self,
        mut request: GatewayRequest,
        priority: RequestPriority,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<(String, oneshot::Receiver<GatewayResponse>)> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(GatewayError::internal("request queue is not running"));
        }

        request.priority = priority;
        request.timeout = timeout;

        let (tx, rx) = oneshot::channel();
        let id = request.request_id.clone();
        let item = QueuedRequest {
            id: id.clone(),
            request,
            priority,
            submitted_at: Instant::now(),
            timeout,
            retry_count: 0,
            max_retries,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            result_tx: Some(tx),
        };

        // 容量检查与入队在同一把锁内，杜绝并发准入超额
        {
            let mut backend = self.backend.lock().expect("queue backend poisoned");
            if backend.len() >= self.options.max_queue_size {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(GatewayError::queue_full(format!(
                    "queue at capacity ({} items)",
                    self.options.max_queue_size
                )));
            }
            backend.push(item);
        }
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();

        ldebug!(
            &id,
            LogStage::Admission,
            LogComponent::Queue,
            "enqueued",
            "Request admitted to queue",
            priority = priority.as_str(),
            timeout_ms = timeout.as_millis() as u64,
            max_retries = max_retries
        );

        Ok((id, rx))
    }

    fn resolve_timed_out(&self, mut item: QueuedRequest) {
        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
        let error = GatewayError::queue_timeout(format!(
            "request {} expired after {}ms in queue",
            item.id,
            item.timeout.as_millis()
        ));
        let response = GatewayResponse::from_error(item.request.provider.clone(), &error)
            .with_retry_count(item.retry_count);
        item.resolve(response);
    }

    async fn process_item(&self, mut item: QueuedRequest) {
        let result = self.pipeline.execute(&mut item.request).await;

        match result {
            Ok(response) => {
                if response.success {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                }
                let retry_count = item.retry_count;
                item.resolve(response.with_retry_count(retry_count));
            }
            Err(err) if err.is_retryable() && item.retry_count < item.max_retries => {
                let Some(queue) = self.me.upgrade() else {
                    let error = GatewayError::queue_cancelled("queue dropped during processing");
                    let response =
                        GatewayResponse::from_error(item.request.provider.clone(), &error)
                            .with_retry_count(item.retry_count);
                    item.resolve(response);
                    return;
                };

                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                let backoff =
                    Duration::from_secs(2u64.pow(item.retry_count.min(16)).min(RETRY_BACKOFF_CAP_SECS));
                item.retry_count += 1;

                ldebug!(
                    &item.id,
                    LogStage::ResponseFailure,
                    LogComponent::Queue,
                    "retry_scheduled",
                    "Retryable failure, re-enqueueing after backoff",
                    attempt = item.retry_count,
                    max_retries = item.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err
                );

                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let mut item = item;
                    if queue.running.load(Ordering::SeqCst) {
                        // 重试按新准入处理：重置提交时钟、重新排队
                        item.submitted_at = Instant::now();
                        item.seq = queue.seq.fetch_add(1, Ordering::SeqCst);
                        let mut backend = queue.backend.lock().expect("queue backend poisoned");
                        backend.push(item);
                        drop(backend);
                        queue.notify.notify_one();
                    } else {
                        let error =
                            GatewayError::queue_cancelled("queue stopped during retry backoff");
                        let response =
                            GatewayResponse::from_error(item.request.provider.clone(), &error)
                                .with_retry_count(item.retry_count);
                        item.resolve(response);
                    }
                });
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                ldebug!(
                    &item.id,
                    LogStage::ResponseFailure,
                    LogComponent::Queue,
                    "terminal_failure",
                    "Request resolved as terminal failure",
                    retry_count = item.retry_count,
                    error = %err
                );
                let response = GatewayResponse::from_error(item.request.provider.clone(), &err)
                    .with_retry_count(item.retry_count);
                item.resolve(response);
            }
        }
    }
}

async fn worker_loop(queue: Arc<RequestQueue>, worker_id: usize) {
    ldebug!(
        "system",
        LogStage::Startup,
        LogComponent::Worker,
        "worker_started",
        "Queue worker started",
        worker_id = worker_id
    );

    while queue.running.load(Ordering::SeqCst) {
        let item = {
            let mut backend = queue.backend.lock().expect("queue backend poisoned");
            backend.pop()
        };

        match item {
            Some(item) => {
                if item.is_expired(Instant::now()) {
                    queue.resolve_timed_out(item);
                    continue;
                }

                let Ok(_permit) = queue.semaphore.acquire().await else {
                    break;
                };
                queue.in_flight.fetch_add(1, Ordering::SeqCst);
                queue.process_item(item).await;
                queue.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                tokio::select! {
                    () = queue.notify.notified() => {}
                    () = tokio::time::sleep(IDLE_POLL) => {}
                }
            }
        }
    }
}

async fn sweeper_loop(queue: Arc<RequestQueue>) {
    let mut tick = tokio::time::interval(queue.options.sweep_interval);
    tick.tick().await;

    loop {
        tick.tick().await;

        let expired = {
            let mut backend = queue.backend.lock().expect("queue backend poisoned");
            backend.take_expired(Instant::now())
        };

        if !expired.is_empty() {
            ldebug!(
                "system",
                LogStage::BackgroundTask,
                LogComponent::Queue,
                "sweep_expired",
                "Sweeper resolved expired queue entries",
                expired = expired.len()
            );
        }
        for item in expired {
            queue.resolve_timed_out(item);
        }
    }
}
