//! # 请求队列类型定义

use crate::types::{GatewayRequest, GatewayResponse, RequestPriority};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// 队列调度策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    /// 优先级堆：高优先级先出，同级按提交顺序（默认）
    #[default]
    Priority,
    /// 纯先进先出
    Fifo,
    /// 按提供商分队列轮流出队
    ProviderRoundRobin,
}

impl QueueStrategy {
    /// 策略标签
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::Fifo => "fifo",
            Self::ProviderRoundRobin => "provider_round_robin",
        }
    }
}

/// 队列中的请求条目
///
/// 入队时创建，由持有它的工作协程在重试时修改，完成或取消时销毁。
/// 出队即从队列移除，同一条目同一时刻只被一个工作协程处理。
#[derive(Debug)]
pub struct QueuedRequest {
    /// 条目ID（与请求ID一致）
    pub id: String,
    /// 包裹的网关请求
    pub request: GatewayRequest,
    /// 优先级
    pub priority: RequestPriority,
    /// 提交时间；重试重新入队时重置
    pub submitted_at: Instant,
    /// 条目超时
    pub timeout: Duration,
    /// 已重试次数
    pub retry_count: u32,
    /// 最大重试次数
    pub max_retries: u32,
    /// 单调序号，同优先级按提交顺序决胜
    pub seq: u64,
    /// 结果回执；resolve 后为空
    pub result_tx: Option<oneshot::Sender<GatewayResponse>>,
}

impl QueuedRequest {
    /// 条目是否已超时
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.submitted_at) > self.timeout
    }

    /// 向等待的调用方回执结果
    ///
    /// 调用方可能已超时离开，发送失败直接忽略。
    pub fn resolve(&mut self, response: GatewayResponse) {
        if let Some(tx) = self.result_tx.take() {
            let _ = tx.send(response);
        }
    }
}

/// 队列状态快照
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// 是否运行中
    pub running: bool,
    /// 使用的调度策略
    pub strategy: &'static str,
    /// 待处理条目数
    pub pending: usize,
    /// 在途处理中的条目数
    pub in_flight: usize,
    /// 累计入队
    pub total_enqueued: u64,
    /// 累计成功完成
    pub total_completed: u64,
    /// 累计终态失败
    pub total_failed: u64,
    /// 累计超时
    pub total_timed_out: u64,
    /// 累计取消
    pub total_cancelled: u64,
    /// 累计重试次数
    pub total_retries: u64,
    /// 累计因队列满被拒绝
    pub total_rejected: u64,
}
