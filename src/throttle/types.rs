//! # 节流类型定义

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 每提供商节流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// 持续速率上限（请求/秒），自适应模式下也是恢复上限
    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: f64,
    /// 突发窗口内允许的最大请求数
    #[serde(default = "default_max_burst_size")]
    pub max_burst_size: u32,
    /// 突发滚动窗口（秒）
    #[serde(default = "default_burst_window_seconds")]
    pub burst_window_seconds: u64,
    /// 最小请求间隔（毫秒）
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
    /// 本地熔断退避倍率
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// 是否启用自适应速率
    #[serde(default = "default_adaptive_enabled")]
    pub adaptive_enabled: bool,
    /// 本地熔断的连续失败阈值
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: default_max_requests_per_second(),
            max_burst_size: default_max_burst_size(),
            burst_window_seconds: default_burst_window_seconds(),
            min_request_interval_ms: default_min_request_interval_ms(),
            backoff_factor: default_backoff_factor(),
            adaptive_enabled: default_adaptive_enabled(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
        }
    }
}

const fn default_max_requests_per_second() -> f64 {
    10.0
}

const fn default_max_burst_size() -> u32 {
    20
}

const fn default_burst_window_seconds() -> u64 {
    60
}

const fn default_min_request_interval_ms() -> u64 {
    50
}

const fn default_backoff_factor() -> f64 {
    2.0
}

const fn default_adaptive_enabled() -> bool {
    true
}

const fn default_circuit_breaker_threshold() -> u32 {
    5
}

/// 节流判定原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    /// 可立即放行
    Proceed,
    /// 未满足最小请求间隔
    MinInterval,
    /// 超过持续速率
    SustainedRate,
    /// 突发额度耗尽
    BurstExhausted,
    /// 本地熔断退避
    CircuitBackoff,
}

impl ThrottleReason {
    /// 原因标签
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Proceed => "proceed",
            Self::MinInterval => "min_interval",
            Self::SustainedRate => "sustained_rate",
            Self::BurstExhausted => "burst_exhausted",
            Self::CircuitBackoff => "circuit_backoff",
        }
    }
}

/// 节流判定结果
#[derive(Debug, Clone, Copy)]
pub struct ThrottleDecision {
    /// 是否需要等待
    pub throttled: bool,
    /// 建议等待时长
    pub delay: Duration,
    /// 判定原因
    pub reason: ThrottleReason,
}

impl ThrottleDecision {
    /// 放行判定
    #[must_use]
    pub const fn proceed() -> Self {
        Self {
            throttled: false,
            delay: Duration::ZERO,
            reason: ThrottleReason::Proceed,
        }
    }

    /// 等待判定
    #[must_use]
    pub const fn wait(delay: Duration, reason: ThrottleReason) -> Self {
        Self {
            throttled: true,
            delay,
            reason,
        }
    }
}

/// 每提供商节流指标
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ThrottleMetrics {
    /// 判定总次数
    pub total_checks: u64,
    /// 判定为节流的次数
    pub throttled_count: u64,
    /// 累计建议等待（毫秒）
    pub total_delay_ms: u64,
    /// 突发额度耗尽次数
    pub burst_rejections: u64,
    /// 本地熔断触发次数
    pub circuit_trips: u64,
    /// 自适应速率调整次数
    pub adaptive_adjustments: u64,
    /// 等待超过上限被拒绝的次数
    pub refused_waits: u64,
}

impl ThrottleMetrics {
    /// 平均建议等待（毫秒）
    #[must_use]
    pub fn avg_delay_ms(&self) -> f64 {
        if self.throttled_count == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                self.total_delay_ms as f64 / self.throttled_count as f64
            }
        }
    }
}
