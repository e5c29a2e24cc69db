//! # 监控与告警类型定义

use crate::types::ProviderId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// 延迟样本保留上限
pub const LATENCY_SAMPLE_CAP: usize = 500;
/// 错误时间戳保留窗口（秒）
pub const ERROR_WINDOW_SECS: i64 = 60 * 60;

/// 告警严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// 需要关注
    Warning,
    /// 需要立即处理
    Critical,
}

/// 一条告警
///
/// 以规则键标识：同一条件再次触发时原地更新而非重复。
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// 规则键
    pub key: String,
    /// 严重级别
    pub severity: AlertSeverity,
    /// 告警内容
    pub message: String,
    /// 首次触发时间
    pub raised_at: DateTime<Utc>,
    /// 最近一次更新时间
    pub last_updated_at: DateTime<Utc>,
    /// 解除时间（进入历史后填写）
    pub resolved_at: Option<DateTime<Utc>>,
}

/// 结构化日志条目（环形缓冲区成员）
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// 记录时间
    pub timestamp: DateTime<Utc>,
    /// 级别
    pub level: String,
    /// 相关提供商
    pub provider: Option<ProviderId>,
    /// 原始消息
    pub message: String,
}

/// 每提供商时间序列
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderSeries {
    /// 请求总量
    pub request_count: u64,
    /// 错误总量
    pub error_count: u64,
    /// 累计处理耗时（毫秒）
    pub total_duration_ms: u64,
    /// 状态码分布
    pub status_codes: HashMap<u16, u64>,
    /// 近期延迟样本（毫秒）
    #[serde(skip)]
    pub latency_samples: VecDeque<u64>,
    /// 近一小时错误时间戳
    #[serde(skip)]
    pub error_timestamps: VecDeque<DateTime<Utc>>,
}

impl ProviderSeries {
    /// 平均延迟（近期样本）
    #[must_use]
    pub fn avg_latency_ms(&self) -> f64 {
        if self.latency_samples.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.latency_samples.iter().sum::<u64>() as f64 / self.latency_samples.len() as f64
        }
    }

    /// 近一小时错误数
    #[must_use]
    pub fn errors_last_hour(&self, now: DateTime<Utc>) -> u64 {
        self.error_timestamps
            .iter()
            .filter(|at| (now - **at).num_seconds() <= ERROR_WINDOW_SECS)
            .count() as u64
    }

    /// 记录一次延迟样本
    pub fn push_latency(&mut self, latency_ms: u64) {
        self.latency_samples.push_back(latency_ms);
        while self.latency_samples.len() > LATENCY_SAMPLE_CAP {
            self.latency_samples.pop_front();
        }
    }

    /// 记录一次错误时间戳并裁剪窗口
    pub fn push_error(&mut self, now: DateTime<Utc>) {
        self.error_timestamps.push_back(now);
        while let Some(front) = self.error_timestamps.front() {
            if (now - *front).num_seconds() > ERROR_WINDOW_SECS {
                self.error_timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}
