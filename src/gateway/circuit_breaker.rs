//! # 熔断器协作方
//!
//! 每提供商一个熔断器：短路已知持续失败的提供商，独立于节流。
//! 跳闸逻辑在此协作层，核心流水线只消费其状态并可通过管理命令强制开合。

use crate::config::CircuitBreakerConfig;
use crate::logging::{LogComponent, LogStage};
use crate::types::ProviderId;
use crate::{linfo, lwarn};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// 正常放行
    Closed,
    /// 已打开，快速失败
    Open,
    /// 恢复试探
    HalfOpen,
}

impl CircuitState {
    /// 状态标签
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    /// 管理命令强制打开后不自动恢复，直到显式关闭
    forced_open: bool,
    config: CircuitBreakerConfig,
}

impl BreakerState {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            forced_open: false,
            config,
        }
    }
}

/// 熔断器状态摘要
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSummary {
    /// 当前状态
    pub state: CircuitState,
    /// 失败计数
    pub failure_count: u32,
    /// 是否被管理命令强制打开
    pub forced_open: bool,
}

/// 每提供商熔断器注册表
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: DashMap<ProviderId, BreakerState>,
}

impl CircuitBreakerRegistry {
    /// 创建注册表
    #[must_use]
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: DashMap::new(),
        }
    }

    /// 以指定配置注册提供商
    pub fn register(&self, provider: ProviderId, config: CircuitBreakerConfig) {
        self.breakers.insert(provider, BreakerState::new(config));
    }

    /// 请求是否允许通过
    pub fn can_execute(&self, provider: &ProviderId) -> bool {
        let mut entry = self
            .breakers
            .entry(provider.clone())
            .or_insert_with(|| BreakerState::new(self.default_config.clone()));

        if entry.forced_open {
            return false;
        }

        if entry.state == CircuitState::Open {
            let recovery = Duration::from_secs(entry.config.recovery_timeout_secs);
            if entry
                .last_failure_at
                .is_some_and(|at| at.elapsed() >= recovery)
            {
                entry.state = CircuitState::HalfOpen;
            }
        }

        !matches!(entry.state, CircuitState::Open)
    }

    /// 记录一次成功
    pub fn record_success(&self, provider: &ProviderId) {
        if let Some(mut entry) = self.breakers.get_mut(provider) {
            if entry.forced_open {
                return;
            }
            entry.failure_count = 0;
            entry.state = CircuitState::Closed;
        }
    }

    /// 记录一次失败
    pub fn record_failure(&self, provider: &ProviderId) {
        let mut entry = self
            .breakers
            .entry(provider.clone())
            .or_insert_with(|| BreakerState::new(self.default_config.clone()));

        entry.failure_count += 1;
        entry.last_failure_at = Some(Instant::now());

        if entry.failure_count >= entry.config.failure_threshold
            && entry.state != CircuitState::Open
        {
            entry.state = CircuitState::Open;
            lwarn!(
                "system",
                LogStage::ResponseFailure,
                LogComponent::CircuitBreaker,
                "circuit_opened",
                "Circuit breaker opened after repeated failures",
                provider = %provider,
                failure_count = entry.failure_count
            );
        }
    }

    /// 管理命令：强制打开
    pub fn force_open(&self, provider: &ProviderId, reason: &str) {
        let mut entry = self
            .breakers
            .entry(provider.clone())
            .or_insert_with(|| BreakerState::new(self.default_config.clone()));
        entry.state = CircuitState::Open;
        entry.forced_open = true;
        entry.last_failure_at = Some(Instant::now());

        linfo!(
            "system",
            LogStage::Admin,
            LogComponent::CircuitBreaker,
            "circuit_forced_open",
            "Circuit breaker forced open",
            provider = %provider,
            reason = reason
        );
    }

    /// 管理命令：强制关闭
    pub fn force_closed(&self, provider: &ProviderId, reason: &str) {
        let mut entry = self
            .breakers
            .entry(provider.clone())
            .or_insert_with(|| BreakerState::new(self.default_config.clone()));
        entry.state = CircuitState::Closed;
        entry.forced_open = false;
        entry.failure_count = 0;
        entry.last_failure_at = None;

        linfo!(
            "system",
            LogStage::Admin,
            LogComponent::CircuitBreaker,
            "circuit_forced_closed",
            "Circuit breaker forced closed",
            provider = %provider,
            reason = reason
        );
    }

    /// 提供商当前状态
    pub fn state(&self, provider: &ProviderId) -> CircuitState {
        self.breakers
            .get(provider)
            .map_or(CircuitState::Closed, |entry| entry.state)
    }

    /// 是否有任何熔断器处于打开状态
    pub fn any_open(&self) -> bool {
        self.breakers
            .iter()
            .any(|entry| entry.state == CircuitState::Open)
    }

    /// 全量状态摘要
    pub fn summary(&self) -> HashMap<ProviderId, BreakerSummary> {
        self.breakers
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    BreakerSummary {
                        state: entry.state,
                        failure_count: entry.failure_count,
                        forced_open: entry.forced_open,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(threshold: u32, recovery_secs: u64) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout_secs: recovery_secs,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_half_opens_after_recovery() {
        let registry = registry(3, 60);
        let provider = ProviderId::new("powerschool");

        assert!(registry.can_execute(&provider));
        registry.record_failure(&provider);
        registry.record_failure(&provider);
        assert!(registry.can_execute(&provider));

        registry.record_failure(&provider);
        assert_eq!(registry.state(&provider), CircuitState::Open);
        assert!(!registry.can_execute(&provider));
        assert!(registry.any_open());

        // 恢复窗口过后进入半开，放行试探请求
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(registry.can_execute(&provider));
        assert_eq!(registry.state(&provider), CircuitState::HalfOpen);

        registry.record_success(&provider);
        assert_eq!(registry.state(&provider), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_open_does_not_auto_recover() {
        let registry = registry(3, 1);
        let provider = ProviderId::new("skyward");

        registry.force_open(&provider, "maintenance window");
        assert!(!registry.can_execute(&provider));

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(!registry.can_execute(&provider));

        // 成功也不能解除强制打开
        registry.record_success(&provider);
        assert!(!registry.can_execute(&provider));

        registry.force_closed(&provider, "maintenance done");
        assert!(registry.can_execute(&provider));
        assert_eq!(registry.state(&provider), CircuitState::Closed);
    }
}
