//! # 限流中间件协作方
//!
//! 与节流器并行的第二道独立限流层（固定分钟窗口）。拒绝时返回
//! retry-after 提示，流水线按"稍后重试"处理，与节流结果同等对待。
//! 两层有意解耦，不合并（合并会悄悄改变调用方依赖的可观测行为）。

use crate::logging::{LogComponent, LogStage};
use crate::types::ProviderId;
use crate::ldebug;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// 固定窗口长度
const WINDOW: Duration = Duration::from_secs(60);

/// 限流判定结果
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    /// 是否放行
    pub allowed: bool,
    /// 拒绝时的重试提示
    pub retry_after: Duration,
    /// 当前窗口剩余额度
    pub remaining: u32,
}

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    count: u32,
    rejections: u64,
}

/// 每提供商固定窗口限流器
pub struct RateLimitMiddleware {
    default_limit_per_minute: u32,
    limits: DashMap<ProviderId, u32>,
    windows: DashMap<ProviderId, WindowState>,
}

impl RateLimitMiddleware {
    /// 创建限流中间件
    #[must_use]
    pub fn new(default_limit_per_minute: u32) -> Self {
        Self {
            default_limit_per_minute,
            limits: DashMap::new(),
            windows: DashMap::new(),
        }
    }

    /// 设置提供商限额
    pub fn set_limit(&self, provider: ProviderId, limit_per_minute: u32) {
        self.limits.insert(provider, limit_per_minute);
    }

    /// 判定一次请求
    pub fn check(&self, provider: &ProviderId, request_id: &str) -> RateLimitDecision {
        let limit = self
            .limits
            .get(provider)
            .map_or(self.default_limit_per_minute, |l| *l);
        let now = Instant::now();

        let mut window = self.windows.entry(provider.clone()).or_insert_with(|| {
            WindowState {
                window_start: now,
                count: 0,
                rejections: 0,
            }
        });

        if now.saturating_duration_since(window.window_start) >= WINDOW {
            window.window_start = now;
            window.count = 0;
        }

        if window.count < limit {
            window.count += 1;
            return RateLimitDecision {
                allowed: true,
                retry_after: Duration::ZERO,
                remaining: limit - window.count,
            };
        }

        window.rejections += 1;
        let retry_after = WINDOW.saturating_sub(now.saturating_duration_since(window.window_start));
        ldebug!(
            request_id,
            LogStage::Throttle,
            LogComponent::RateLimiter,
            "rate_limited",
            "Request rejected by rate limit middleware",
            provider = %provider,
            limit_per_minute = limit,
            retry_after_ms = retry_after.as_millis() as u64
        );

        RateLimitDecision {
            allowed: false,
            retry_after,
            remaining: 0,
        }
    }

    /// 提供商在当前统计中被拒绝的次数
    pub fn rejection_count(&self, provider: &ProviderId) -> u64 {
        self.windows.get(provider).map_or(0, |w| w.rejections)
    }

    /// 清零统计
    pub fn reset_metrics(&self) {
        for mut window in self.windows.iter_mut() {
            window.rejections = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_allows_until_limit_then_rejects_with_retry_after() {
        let limiter = RateLimitMiddleware::new(3);
        let provider = ProviderId::new("powerschool");

        for i in 0..3 {
            let decision = limiter.check(&provider, &format!("r{i}"));
            assert!(decision.allowed);
        }

        let rejected = limiter.check(&provider, "r4");
        assert!(!rejected.allowed);
        assert!(rejected.retry_after > Duration::ZERO);
        assert_eq!(limiter.rejection_count(&provider), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset_restores_quota() {
        let limiter = RateLimitMiddleware::new(1);
        let provider = ProviderId::new("skyward");

        assert!(limiter.check(&provider, "r1").allowed);
        assert!(!limiter.check(&provider, "r2").allowed);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check(&provider, "r3").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_provider_limits_are_independent() {
        let limiter = RateLimitMiddleware::new(1);
        limiter.set_limit(ProviderId::new("big"), 100);

        assert!(limiter.check(&ProviderId::new("small"), "r1").allowed);
        assert!(!limiter.check(&ProviderId::new("small"), "r2").allowed);

        for i in 0..50 {
            assert!(limiter.check(&ProviderId::new("big"), &format!("b{i}")).allowed);
        }
    }
}
