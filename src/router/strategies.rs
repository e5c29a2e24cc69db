//! # 端点选择策略实现
//!
//! 封闭策略集合，配置时选定一次，请求路径上只做多态调用。

use super::types::{Endpoint, EndpointHealth};
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 端点选择策略枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// 纯轮询
    RoundRobin,
    /// 按成功率与响应时间加权（默认）
    #[default]
    WeightedRoundRobin,
    /// 在途请求最少优先
    LeastConnections,
    /// 最低时延优先
    FastestResponse,
    /// 随机
    Random,
}

impl RoutingStrategy {
    /// 策略标签
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::LeastConnections => "least_connections",
            Self::FastestResponse => "fastest_response",
            Self::Random => "random",
        }
    }
}

impl std::str::FromStr for RoutingStrategy {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round_robin" | "roundrobin" | "rr" => Ok(Self::RoundRobin),
            "weighted_round_robin" | "weighted" | "wrr" => Ok(Self::WeightedRoundRobin),
            "least_connections" | "least_conn" | "lc" => Ok(Self::LeastConnections),
            "fastest_response" | "fastest" | "fr" => Ok(Self::FastestResponse),
            "random" | "rand" => Ok(Self::Random),
            _ => Err(()),
        }
    }
}

/// 选择时的端点快照
#[derive(Debug, Clone)]
pub struct EndpointSnapshot {
    /// 端点
    pub endpoint: Endpoint,
    /// 当前健康状态
    pub health: EndpointHealth,
    /// 在途请求数
    pub in_flight: usize,
}

/// 选择结果
#[derive(Debug, Clone)]
pub struct SelectionResult {
    /// 选中快照数组中的索引
    pub index: usize,
    /// 选择原因
    pub reason: String,
    /// 使用的策略
    pub strategy: RoutingStrategy,
}

/// 端点选择器特质
pub trait EndpointSelector: Send + Sync {
    /// 从健康候选中选择一个端点
    fn select(&self, candidates: &[EndpointSnapshot]) -> Result<SelectionResult>;

    /// 选择器名称
    fn name(&self) -> &'static str;

    /// 重置内部状态
    fn reset(&self);
}

fn ensure_candidates(candidates: &[EndpointSnapshot]) -> Result<()> {
    if candidates.is_empty() {
        return Err(GatewayError::upstream_not_available(
            "No healthy endpoints available for selection",
        ));
    }
    Ok(())
}

/// 轮询选择器
pub struct RoundRobinSelector {
    counter: AtomicUsize,
}

impl RoundRobinSelector {
    /// 创建轮询选择器
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointSelector for RoundRobinSelector {
    fn select(&self, candidates: &[EndpointSnapshot]) -> Result<SelectionResult> {
        ensure_candidates(candidates)?;
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        let index = counter % candidates.len();
        Ok(SelectionResult {
            index,
            reason: format!("round robin: counter={counter}, candidates={}", candidates.len()),
            strategy: RoutingStrategy::RoundRobin,
        })
    }

    fn name(&self) -> &'static str {
        "RoundRobinSelector"
    }

    fn reset(&self) {
        self.counter.store(0, Ordering::SeqCst);
    }
}

/// 加权选择器
///
/// 权重 ∝ 成功率 × 1/响应时间 × 配置权重，按权重比例随机选取。
pub struct WeightedSelector;

impl WeightedSelector {
    /// 创建加权选择器
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn effective_weight(snapshot: &EndpointSnapshot) -> f64 {
        let latency = snapshot.health.avg_latency_ms.max(1.0);
        let success_rate = snapshot.health.success_rate().max(0.01);
        success_rate * (1000.0 / latency) * f64::from(snapshot.endpoint.weight)
    }
}

impl EndpointSelector for WeightedSelector {
    fn select(&self, candidates: &[EndpointSnapshot]) -> Result<SelectionResult> {
        ensure_candidates(candidates)?;

        let weights: Vec<f64> = candidates.iter().map(Self::effective_weight).collect();
        let total: f64 = weights.iter().sum();

        let index = if total <= 0.0 {
            0
        } else {
            let mut roll = fastrand::f64() * total;
            let mut chosen = candidates.len() - 1;
            for (i, weight) in weights.iter().enumerate() {
                if roll < *weight {
                    chosen = i;
                    break;
                }
                roll -= weight;
            }
            chosen
        };

        Ok(SelectionResult {
            index,
            reason: format!(
                "weighted: effective_weight={:.2}, total_weight={total:.2}",
                weights[index]
            ),
            strategy: RoutingStrategy::WeightedRoundRobin,
        })
    }

    fn name(&self) -> &'static str {
        "WeightedSelector"
    }

    fn reset(&self) {}
}

/// 在途最少选择器
pub struct LeastConnectionsSelector;

impl LeastConnectionsSelector {
    /// 创建在途最少选择器
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl EndpointSelector for LeastConnectionsSelector {
    fn select(&self, candidates: &[EndpointSnapshot]) -> Result<SelectionResult> {
        ensure_candidates(candidates)?;
        let index = candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.in_flight)
            .map(|(i, _)| i)
            .unwrap_or(0);
        Ok(SelectionResult {
            index,
            reason: format!("least connections: in_flight={}", candidates[index].in_flight),
            strategy: RoutingStrategy::LeastConnections,
        })
    }

    fn name(&self) -> &'static str {
        "LeastConnectionsSelector"
    }

    fn reset(&self) {}
}

/// 最低时延选择器
///
/// 未测得时延的端点视为 0，首轮即获得流量并建立测量。
pub struct FastestResponseSelector;

impl FastestResponseSelector {
    /// 创建最低时延选择器
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl EndpointSelector for FastestResponseSelector {
    fn select(&self, candidates: &[EndpointSnapshot]) -> Result<SelectionResult> {
        ensure_candidates(candidates)?;
        let index = candidates
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.health
                    .avg_latency_ms
                    .partial_cmp(&b.health.avg_latency_ms)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .unwrap_or(0);
        Ok(SelectionResult {
            index,
            reason: format!(
                "fastest response: avg_latency_ms={:.1}",
                candidates[index].health.avg_latency_ms
            ),
            strategy: RoutingStrategy::FastestResponse,
        })
    }

    fn name(&self) -> &'static str {
        "FastestResponseSelector"
    }

    fn reset(&self) {}
}

/// 随机选择器
pub struct RandomSelector;

impl RandomSelector {
    /// 创建随机选择器
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl EndpointSelector for RandomSelector {
    fn select(&self, candidates: &[EndpointSnapshot]) -> Result<SelectionResult> {
        ensure_candidates(candidates)?;
        let index = fastrand::usize(..candidates.len());
        Ok(SelectionResult {
            index,
            reason: "random".to_string(),
            strategy: RoutingStrategy::Random,
        })
    }

    fn name(&self) -> &'static str {
        "RandomSelector"
    }

    fn reset(&self) {}
}

/// 创建端点选择器
#[must_use]
pub fn create_selector(strategy: RoutingStrategy) -> Arc<dyn EndpointSelector> {
    match strategy {
        RoutingStrategy::RoundRobin => Arc::new(RoundRobinSelector::new()),
        RoutingStrategy::WeightedRoundRobin => Arc::new(WeightedSelector::new()),
        RoutingStrategy::LeastConnections => Arc::new(LeastConnectionsSelector::new()),
        RoutingStrategy::FastestResponse => Arc::new(FastestResponseSelector::new()),
        RoutingStrategy::Random => Arc::new(RandomSelector::new()),
    }
}
