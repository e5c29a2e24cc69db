//! # 路由类型定义

use crate::config::EndpointConfig;
use crate::types::ProviderId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 连续失败多少次后判定端点不健康
pub const UNHEALTHY_AFTER_CONSECUTIVE_FAILURES: u32 = 3;

/// 一个可路由的上游端点
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// 端点标识
    pub id: String,
    /// 所属提供商
    pub provider: ProviderId,
    /// 基地址
    pub base_url: String,
    /// 加权轮询权重
    pub weight: u32,
    /// 健康探测路径
    pub health_path: String,
    /// 单次传输超时
    pub timeout: Duration,
}

impl Endpoint {
    /// 由配置构造端点
    #[must_use]
    pub fn from_config(provider: ProviderId, config: &EndpointConfig) -> Self {
        Self {
            id: config.id.clone(),
            provider,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            weight: config.weight.max(1),
            health_path: config.health_path.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// 拼接请求完整地址
    #[must_use]
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// 健康探测完整地址
    #[must_use]
    pub fn probe_url(&self) -> String {
        self.url_for(&self.health_path)
    }
}

/// 端点健康状态
///
/// 由真实流量与周期探测共同更新：连续 3 次失败判为不健康，
/// 任意一次成功立即恢复。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointHealth {
    /// 成功计数
    pub success_count: u64,
    /// 失败计数
    pub error_count: u64,
    /// 最近一次测得延迟（毫秒）
    pub last_latency_ms: Option<u64>,
    /// 指数加权平均延迟（毫秒）
    pub avg_latency_ms: f64,
    /// 连续失败次数
    pub consecutive_failures: u32,
    /// 是否健康
    pub is_healthy: bool,
    /// 最近检查时间
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self {
            success_count: 0,
            error_count: 0,
            last_latency_ms: None,
            avg_latency_ms: 0.0,
            consecutive_failures: 0,
            is_healthy: true,
            last_checked_at: None,
        }
    }
}

impl EndpointHealth {
    /// 记录一次成功
    pub fn record_success(&mut self, latency: Duration) {
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.is_healthy = true;
        self.update_latency(latency);
        self.last_checked_at = Some(Utc::now());
    }

    /// 记录一次失败
    pub fn record_failure(&mut self) {
        self.error_count += 1;
        self.consecutive_failures += 1;
        if self.consecutive_failures >= UNHEALTHY_AFTER_CONSECUTIVE_FAILURES {
            self.is_healthy = false;
        }
        self.last_checked_at = Some(Utc::now());
    }

    /// 成功率
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            1.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                self.success_count as f64 / total as f64
            }
        }
    }

    fn update_latency(&mut self, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        self.last_latency_ms = Some(latency_ms);
        // 指数加权移动平均
        #[allow(clippy::cast_precision_loss)]
        let sample = latency_ms as f64;
        if self.avg_latency_ms == 0.0 {
            self.avg_latency_ms = sample;
        } else {
            self.avg_latency_ms = self.avg_latency_ms * 0.9 + sample * 0.1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unhealthy_after_three_consecutive_failures() {
        let mut health = EndpointHealth::default();
        assert!(health.is_healthy);

        health.record_failure();
        health.record_failure();
        assert!(health.is_healthy);

        health.record_failure();
        assert!(!health.is_healthy);

        // 任意一次成功立即恢复
        health.record_success(Duration::from_millis(80));
        assert!(health.is_healthy);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn test_success_rate() {
        let mut health = EndpointHealth::default();
        assert!((health.success_rate() - 1.0).abs() < f64::EPSILON);

        health.record_success(Duration::from_millis(10));
        health.record_success(Duration::from_millis(10));
        health.record_failure();
        assert!((health.success_rate() - 2.0 / 3.0).abs() < 0.001);
    }

    #[test]
    fn test_latency_moving_average() {
        let mut health = EndpointHealth::default();
        health.record_success(Duration::from_millis(100));
        assert!((health.avg_latency_ms - 100.0).abs() < f64::EPSILON);

        health.record_success(Duration::from_millis(200));
        assert!(health.avg_latency_ms > 100.0);
        assert!(health.avg_latency_ms < 200.0);
    }

    #[test]
    fn test_endpoint_url_join() {
        let endpoint = Endpoint {
            id: "ps-east".to_string(),
            provider: "powerschool".into(),
            base_url: "https://east.example.com".to_string(),
            weight: 1,
            health_path: "/health".to_string(),
            timeout: Duration::from_secs(30),
        };

        assert_eq!(
            endpoint.url_for("/attendance/daily"),
            "https://east.example.com/attendance/daily"
        );
        assert_eq!(endpoint.probe_url(), "https://east.example.com/health");
    }
}
