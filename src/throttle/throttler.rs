//! # 每提供商自适应节流器
//!
//! 判定顺序：本地熔断退避 → 最小请求间隔 → 持续速率 → 突发额度。
//! 自适应控制器按滚动错误率调整持续速率，至多每 30 秒重估一次。

use super::types::{ThrottleConfig, ThrottleDecision, ThrottleMetrics, ThrottleReason};
use crate::logging::{LogComponent, LogStage};
use crate::types::ProviderId;
use crate::{ldebug, linfo, lwarn};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// 等待上限，超出则拒绝而非继续等待
const MAX_WAIT: Duration = Duration::from_secs(60);
/// 自适应控制器重估的最短间隔
const ADJUSTMENT_INTERVAL: Duration = Duration::from_secs(30);
/// 错误率滚动窗口
const RESPONSE_WINDOW: Duration = Duration::from_secs(120);
/// 低于该样本数不做自适应调整
const MIN_ADAPTIVE_SAMPLES: usize = 5;
/// 自适应速率下限（请求/秒）
const RATE_FLOOR: f64 = 0.1;
/// 错误率超过该值时降速
const ERROR_RATE_HIGH: f64 = 0.10;
/// 错误率低于该值时提速
const ERROR_RATE_LOW: f64 = 0.05;
/// 本地熔断退避上限
const BACKOFF_CAP: Duration = Duration::from_secs(60);

struct ThrottleState {
    last_admitted_at: Option<Instant>,
    admissions: VecDeque<Instant>,
    responses: VecDeque<(Instant, bool)>,
    current_rate: f64,
    consecutive_failures: u32,
    last_adjustment_at: Instant,
    metrics: ThrottleMetrics,
}

/// 每提供商节流器
pub struct Throttler {
    provider: ProviderId,
    config: ThrottleConfig,
    state: Mutex<ThrottleState>,
}

impl Throttler {
    /// 创建节流器
    #[must_use]
    pub fn new(provider: ProviderId, config: ThrottleConfig) -> Self {
        let current_rate = config.max_requests_per_second;
        Self {
            provider,
            config,
            state: Mutex::new(ThrottleState {
                last_admitted_at: None,
                admissions: VecDeque::new(),
                responses: VecDeque::new(),
                current_rate,
                consecutive_failures: 0,
                last_adjustment_at: Instant::now(),
                metrics: ThrottleMetrics::default(),
            }),
        }
    }

    /// 判定请求现在是否需要等待（只读，不占用额度）
    pub fn should_throttle(&self, request_id: &str) -> ThrottleDecision {
        let mut state = self.state.lock().expect("throttle state poisoned");
        let decision = Self::evaluate(&self.config, &mut state, Instant::now());

        state.metrics.total_checks += 1;
        if decision.throttled {
            state.metrics.throttled_count += 1;
            state.metrics.total_delay_ms += decision.delay.as_millis() as u64;
            if decision.reason == ThrottleReason::BurstExhausted {
                state.metrics.burst_rejections += 1;
            }
            ldebug!(
                request_id,
                LogStage::Throttle,
                LogComponent::Throttler,
                "throttle_decision",
                "Request must wait before dispatch",
                provider = %self.provider,
                reason = decision.reason.as_str(),
                delay_ms = decision.delay.as_millis() as u64
            );
        }
        decision
    }

    /// 等待到可放行为止
    ///
    /// 成功放行返回 `true` 并占用额度；累计等待将超过 60 秒时拒绝并返回
    /// `false`，由调用方按"稍后重试"处理。
    pub async fn wait_if_throttled(&self, request_id: &str) -> bool {
        let mut waited = Duration::ZERO;

        loop {
            let delay = {
                let mut state = self.state.lock().expect("throttle state poisoned");
                let now = Instant::now();
                let decision = Self::evaluate(&self.config, &mut state, now);
                state.metrics.total_checks += 1;

                if decision.throttled {
                    state.metrics.throttled_count += 1;
                    state.metrics.total_delay_ms += decision.delay.as_millis() as u64;
                    if decision.reason == ThrottleReason::BurstExhausted {
                        state.metrics.burst_rejections += 1;
                    }
                } else {
                    // 放行即占用额度，与判定在同一把锁内完成
                    state.last_admitted_at = Some(now);
                    state.admissions.push_back(now);
                    return true;
                }

                if waited + decision.delay > MAX_WAIT {
                    state.metrics.refused_waits += 1;
                    lwarn!(
                        request_id,
                        LogStage::Throttle,
                        LogComponent::Throttler,
                        "wait_refused",
                        "Throttle wait would exceed cap, refusing",
                        provider = %self.provider,
                        reason = decision.reason.as_str(),
                        delay_ms = decision.delay.as_millis() as u64,
                        waited_ms = waited.as_millis() as u64
                    );
                    return false;
                }

                decision.delay
            };

            tokio::time::sleep(delay).await;
            waited += delay;
        }
    }

    /// 回灌响应结果，驱动自适应控制与本地熔断
    pub fn record_response(&self, request_id: &str, success: bool, latency: Duration) {
        let mut state = self.state.lock().expect("throttle state poisoned");
        let now = Instant::now();

        state.responses.push_back((now, success));
        Self::prune_responses(&mut state.responses, now);

        if success {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
            if state.consecutive_failures == self.config.circuit_breaker_threshold {
                state.metrics.circuit_trips += 1;
                lwarn!(
                    request_id,
                    LogStage::Throttle,
                    LogComponent::Throttler,
                    "local_circuit_tripped",
                    "Consecutive failures reached threshold, backoff engaged",
                    provider = %self.provider,
                    consecutive_failures = state.consecutive_failures,
                    latency_ms = latency.as_millis() as u64
                );
            }
        }
    }

    /// 当前生效的持续速率（请求/秒）
    pub fn current_rate(&self) -> f64 {
        self.state.lock().expect("throttle state poisoned").current_rate
    }

    /// 指标快照
    pub fn metrics(&self) -> ThrottleMetrics {
        self.state.lock().expect("throttle state poisoned").metrics
    }

    /// 清零指标
    pub fn reset_metrics(&self) {
        self.state.lock().expect("throttle state poisoned").metrics = ThrottleMetrics::default();
    }

    fn evaluate(
        config: &ThrottleConfig,
        state: &mut ThrottleState,
        now: Instant,
    ) -> ThrottleDecision {
        Self::maybe_adjust_rate(config, state, now);

        // 本地熔断退避优先于一切其它判定
        if state.consecutive_failures >= config.circuit_breaker_threshold {
            let exceeded = state.consecutive_failures - config.circuit_breaker_threshold;
            let backoff_secs = config.backoff_factor.powi(exceeded.min(16) as i32 + 1);
            let backoff = Duration::from_secs_f64(backoff_secs).min(BACKOFF_CAP);
            let since_last = state
                .last_admitted_at
                .map_or(backoff, |at| now.saturating_duration_since(at));
            if since_last < backoff {
                return ThrottleDecision::wait(backoff - since_last, ThrottleReason::CircuitBackoff);
            }
        }

        // 最小请求间隔
        if let Some(last) = state.last_admitted_at {
            let min_interval = Duration::from_millis(config.min_request_interval_ms);
            let elapsed = now.saturating_duration_since(last);
            if elapsed < min_interval {
                return ThrottleDecision::wait(min_interval - elapsed, ThrottleReason::MinInterval);
            }

            // 持续速率
            if state.current_rate > 0.0 {
                let rate_interval = Duration::from_secs_f64(1.0 / state.current_rate);
                if elapsed < rate_interval {
                    return ThrottleDecision::wait(
                        rate_interval - elapsed,
                        ThrottleReason::SustainedRate,
                    );
                }
            }
        }

        // 突发额度：滚动窗口内的令牌桶。窗口边界按 >= 剔除，
        // 保证随后计算出的等待时长严格为正。
        let window = Duration::from_secs(config.burst_window_seconds);
        while let Some(front) = state.admissions.front() {
            if now.saturating_duration_since(*front) >= window {
                state.admissions.pop_front();
            } else {
                break;
            }
        }
        if state.admissions.len() >= config.max_burst_size as usize {
            let oldest = *state.admissions.front().expect("non-empty admissions");
            let until_reset = window.saturating_sub(now.saturating_duration_since(oldest));
            return ThrottleDecision::wait(until_reset, ThrottleReason::BurstExhausted);
        }

        ThrottleDecision::proceed()
    }

    /// 按滚动错误率重估持续速率，至多每 30 秒一次
    fn maybe_adjust_rate(config: &ThrottleConfig, state: &mut ThrottleState, now: Instant) {
        if !config.adaptive_enabled {
            return;
        }
        if now.saturating_duration_since(state.last_adjustment_at) < ADJUSTMENT_INTERVAL {
            return;
        }
        state.last_adjustment_at = now;

        Self::prune_responses(&mut state.responses, now);
        let total = state.responses.len();
        if total < MIN_ADAPTIVE_SAMPLES {
            return;
        }

        let failures = state.responses.iter().filter(|(_, ok)| !ok).count();
        #[allow(clippy::cast_precision_loss)]
        let error_rate = failures as f64 / total as f64;

        let previous = state.current_rate;
        if error_rate > ERROR_RATE_HIGH {
            state.current_rate = (state.current_rate / 2.0).max(RATE_FLOOR);
        } else if error_rate < ERROR_RATE_LOW {
            state.current_rate = (state.current_rate * 1.1).min(config.max_requests_per_second);
        }

        if (state.current_rate - previous).abs() > f64::EPSILON {
            state.metrics.adaptive_adjustments += 1;
            linfo!(
                "system",
                LogStage::Throttle,
                LogComponent::Throttler,
                "adaptive_rate_adjusted",
                "Sustained rate adjusted from observed error rate",
                error_rate = error_rate,
                previous_rate = previous,
                current_rate = state.current_rate
            );
        }
    }

    fn prune_responses(responses: &mut VecDeque<(Instant, bool)>, now: Instant) {
        while let Some((at, _)) = responses.front() {
            if now.saturating_duration_since(*at) > RESPONSE_WINDOW {
                responses.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttler(config: ThrottleConfig) -> Throttler {
        Throttler::new(ProviderId::new("powerschool"), config)
    }

    fn fixed_rate_config(rate: f64) -> ThrottleConfig {
        ThrottleConfig {
            max_requests_per_second: rate,
            max_burst_size: 100,
            burst_window_seconds: 60,
            min_request_interval_ms: 0,
            adaptive_enabled: false,
            ..ThrottleConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_excess_requests_are_throttled_with_positive_delay() {
        let throttler = throttler(fixed_rate_config(2.0));

        assert!(throttler.wait_if_throttled("r1").await);
        let decision = throttler.should_throttle("r2");
        assert!(decision.throttled);
        assert!(decision.delay > Duration::ZERO);
        assert_eq!(decision.reason, ThrottleReason::SustainedRate);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_spaces_admissions_by_rate() {
        let throttler = std::sync::Arc::new(throttler(fixed_rate_config(1.0)));

        let start = Instant::now();
        let mut handles = Vec::new();
        for i in 0..5 {
            let throttler = throttler.clone();
            handles.push(tokio::spawn(async move {
                let admitted = throttler.wait_if_throttled(&format!("r{i}")).await;
                (admitted, start.elapsed())
            }));
        }

        let mut elapsed: Vec<Duration> = Vec::new();
        for handle in handles {
            let (admitted, at) = handle.await.unwrap();
            assert!(admitted);
            elapsed.push(at);
        }
        elapsed.sort();

        // 1 req/s 下相邻放行至少间隔约 1 秒
        for pair in elapsed.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(950));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_gate_forces_wait_until_window_resets() {
        let config = ThrottleConfig {
            max_requests_per_second: 1000.0,
            max_burst_size: 3,
            burst_window_seconds: 10,
            min_request_interval_ms: 0,
            adaptive_enabled: false,
            ..ThrottleConfig::default()
        };
        let throttler = throttler(config);

        for i in 0..3 {
            assert!(throttler.wait_if_throttled(&format!("r{i}")).await);
        }
        let decision = throttler.should_throttle("r4");
        assert!(decision.throttled);
        assert_eq!(decision.reason, ThrottleReason::BurstExhausted);

        // 窗口滚动后恢复
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!throttler.should_throttle("r5").throttled);
        assert!(throttler.metrics().burst_rejections >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_rate_halves_on_errors_and_recovers_bounded() {
        let config = ThrottleConfig {
            max_requests_per_second: 8.0,
            adaptive_enabled: true,
            ..ThrottleConfig::default()
        };
        let throttler = throttler(config);

        for i in 0..10 {
            throttler.record_response(&format!("r{i}"), false, Duration::from_millis(100));
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        let _ = throttler.should_throttle("check");
        assert!((throttler.current_rate() - 4.0).abs() < f64::EPSILON);

        // 连续成功逐步恢复，但不超过配置上限
        for round in 0..40 {
            for i in 0..10 {
                throttler.record_response(&format!("ok{round}-{i}"), true, Duration::from_millis(50));
            }
            tokio::time::advance(Duration::from_secs(31)).await;
            let _ = throttler.should_throttle("check");
        }
        assert!(throttler.current_rate() <= 8.0);
        assert!(throttler.current_rate() > 4.0);
        assert!(throttler.metrics().adaptive_adjustments >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_rate_floor() {
        let config = ThrottleConfig {
            max_requests_per_second: 1.0,
            adaptive_enabled: true,
            ..ThrottleConfig::default()
        };
        let throttler = throttler(config);

        for round in 0..10 {
            for i in 0..10 {
                throttler.record_response(&format!("f{round}-{i}"), false, Duration::from_millis(100));
            }
            tokio::time::advance(Duration::from_secs(31)).await;
            let _ = throttler.should_throttle("check");
        }
        assert!(throttler.current_rate() >= 0.1 - f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_engage_backoff_until_success() {
        let config = ThrottleConfig {
            max_requests_per_second: 1000.0,
            min_request_interval_ms: 0,
            adaptive_enabled: false,
            circuit_breaker_threshold: 3,
            backoff_factor: 2.0,
            ..ThrottleConfig::default()
        };
        let throttler = throttler(config);

        assert!(throttler.wait_if_throttled("seed").await);
        for i in 0..3 {
            throttler.record_response(&format!("f{i}"), false, Duration::from_millis(100));
        }

        let decision = throttler.should_throttle("blocked");
        assert!(decision.throttled);
        assert_eq!(decision.reason, ThrottleReason::CircuitBackoff);
        assert_eq!(throttler.metrics().circuit_trips, 1);

        // 一次成功清零计数并解除退避
        throttler.record_response("ok", true, Duration::from_millis(50));
        tokio::time::advance(Duration::from_millis(1)).await;
        let decision = throttler.should_throttle("after_success");
        assert_ne!(decision.reason, ThrottleReason::CircuitBackoff);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_refused_when_delay_exceeds_cap() {
        let config = ThrottleConfig {
            max_requests_per_second: 1000.0,
            min_request_interval_ms: 120_000,
            adaptive_enabled: false,
            ..ThrottleConfig::default()
        };
        let throttler = throttler(config);

        assert!(throttler.wait_if_throttled("first").await);
        // 第二个请求需要等 120 秒，超过 60 秒上限
        assert!(!throttler.wait_if_throttled("second").await);
        assert_eq!(throttler.metrics().refused_waits, 1);
    }
}
