//! # 监控与告警服务
//!
//! 收集其它组件产生的指标与日志并在其上运行告警规则；只观察请求流，
//! 不影响它。告警按规则键去重：首次触发创建，条件消失自动解除。

use super::types::{Alert, AlertSeverity, LogEntry, ProviderSeries};
use crate::config::MonitorConfig;
use crate::gateway::CircuitBreakerRegistry;
use crate::logging::{LogComponent, LogStage};
use crate::queue::RequestQueue;
use crate::throttle::ThrottleManager;
use crate::types::{GatewayResponse, HttpMethod, ProviderId};
use crate::{linfo, lwarn};
use chrono::Utc;
use regex::Regex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

/// 错误模式归并的样式上限
const PATTERN_CAP: usize = 200;
/// 告警历史保留条数
const ALERT_HISTORY_CAP: usize = 100;
/// 节流比例规则生效所需的最少判定数
const MIN_THROTTLE_SAMPLES: u64 = 20;

/// 监控与告警服务
pub struct GatewayMonitor {
    config: MonitorConfig,
    series: RwLock<HashMap<ProviderId, ProviderSeries>>,
    logs: Mutex<VecDeque<LogEntry>>,
    patterns: Mutex<HashMap<String, u64>>,
    alerts: RwLock<HashMap<String, Alert>>,
    alert_history: Mutex<VecDeque<Alert>>,
    id_pattern: Regex,
    number_pattern: Regex,
    task_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl GatewayMonitor {
    /// 创建监控服务
    #[must_use]
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            series: RwLock::new(HashMap::new()),
            logs: Mutex::new(VecDeque::new()),
            patterns: Mutex::new(HashMap::new()),
            alerts: RwLock::new(HashMap::new()),
            alert_history: Mutex::new(VecDeque::new()),
            // 长十六进制串（含UUID段）先归一，再归一余下数字
            id_pattern: Regex::new(r"[0-9a-fA-F-]{8,}").expect("valid id pattern"),
            number_pattern: Regex::new(r"\d+").expect("valid number pattern"),
            task_handle: tokio::sync::Mutex::new(None),
        }
    }

    /// 记录一次请求结果
    pub fn record_request(
        &self,
        provider: &ProviderId,
        method: HttpMethod,
        path: &str,
        response: &GatewayResponse,
        processing_time: Duration,
    ) {
        let now = Utc::now();
        {
            let mut series = self.series.write().expect("series lock poisoned");
            let entry = series.entry(provider.clone()).or_default();
            entry.request_count += 1;
            entry.total_duration_ms += processing_time.as_millis() as u64;
            *entry.status_codes.entry(response.status).or_insert(0) += 1;
            entry.push_latency(processing_time.as_millis() as u64);
            if !response.success {
                entry.error_count += 1;
                entry.push_error(now);
            }
        }

        if !response.success {
            let message = response
                .error
                .clone()
                .unwrap_or_else(|| format!("{} {} -> {}", method, path, response.status));
            self.push_log("error", Some(provider.clone()), message);
        }
    }

    /// 记录一次组件错误
    pub fn record_error(&self, provider: &ProviderId, operation: &str, error: &str) {
        let now = Utc::now();
        {
            let mut series = self.series.write().expect("series lock poisoned");
            let entry = series.entry(provider.clone()).or_default();
            entry.error_count += 1;
            entry.push_error(now);
        }
        self.push_log(
            "error",
            Some(provider.clone()),
            format!("{operation}: {error}"),
        );
    }

    /// 仪表盘数据
    pub fn get_dashboard_data(&self) -> serde_json::Value {
        let series = self.series.read().expect("series lock poisoned");
        let providers: HashMap<String, serde_json::Value> = series
            .iter()
            .map(|(provider, s)| {
                (
                    provider.as_str().to_string(),
                    json!({
                        "request_count": s.request_count,
                        "error_count": s.error_count,
                        "avg_latency_ms": s.avg_latency_ms(),
                        "status_codes": s.status_codes,
                        "errors_last_hour": s.errors_last_hour(Utc::now()),
                    }),
                )
            })
            .collect();

        let alerts = self.alerts.read().expect("alerts lock poisoned");
        let patterns = self.patterns.lock().expect("patterns lock poisoned");
        let mut top_patterns: Vec<(&String, &u64)> = patterns.iter().collect();
        top_patterns.sort_by(|a, b| b.1.cmp(a.1));
        let top_patterns: Vec<serde_json::Value> = top_patterns
            .into_iter()
            .take(10)
            .map(|(pattern, count)| json!({"pattern": pattern, "count": count}))
            .collect();

        json!({
            "providers": providers,
            "active_alerts": alerts.values().collect::<Vec<_>>(),
            "recurring_errors": top_patterns,
            "buffered_logs": self.logs.lock().expect("logs lock poisoned").len(),
        })
    }

    /// 当前活跃告警
    pub fn active_alerts(&self) -> Vec<Alert> {
        let alerts = self.alerts.read().expect("alerts lock poisoned");
        alerts.values().cloned().collect()
    }

    /// 启动告警规则评估循环
    pub async fn start(
        self: Arc<Self>,
        queue: Arc<RequestQueue>,
        breakers: Arc<CircuitBreakerRegistry>,
        throttles: Arc<ThrottleManager>,
    ) {
        let mut guard = self.task_handle.lock().await;
        if guard.is_some() {
            return;
        }

        let monitor = Arc::clone(&self);
        let interval = Duration::from_secs(self.config.evaluation_interval_secs);
        *guard = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                monitor.evaluate_rules(&queue, &breakers, &throttles);
            }
        }));

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Monitor,
            "monitor_started",
            "Alert evaluation loop started",
            interval_secs = self.config.evaluation_interval_secs
        );
    }

    /// 停止告警循环
    pub async fn stop(&self) {
        let handle = {
            let mut guard = self.task_handle.lock().await;
            guard.take()
        };
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::Monitor,
            "monitor_stopped",
            "Alert evaluation loop stopped"
        );
    }

    /// 对当前指标快照评估固定规则集
    pub fn evaluate_rules(
        &self,
        queue: &RequestQueue,
        breakers: &CircuitBreakerRegistry,
        throttles: &ThrottleManager,
    ) {
        let now = Utc::now();
        let mut firing: HashMap<String, (AlertSeverity, String)> = HashMap::new();

        {
            let series = self.series.read().expect("series lock poisoned");
            for (provider, s) in series.iter() {
                let errors = s.errors_last_hour(now);
                if errors > self.config.error_rate_per_hour {
                    firing.insert(
                        format!("high_error_rate:{provider}"),
                        (
                            AlertSeverity::Critical,
                            format!("provider {provider}: {errors} errors in the last hour"),
                        ),
                    );
                }

                let avg_latency = s.avg_latency_ms();
                #[allow(clippy::cast_precision_loss)]
                if s.request_count > 0 && avg_latency > self.config.avg_latency_ms as f64 {
                    firing.insert(
                        format!("high_latency:{provider}"),
                        (
                            AlertSeverity::Warning,
                            format!("provider {provider}: average latency {avg_latency:.0}ms"),
                        ),
                    );
                }
            }
        }

        if breakers.any_open() {
            firing.insert(
                "circuit_breaker_open".to_string(),
                (
                    AlertSeverity::Critical,
                    "at least one provider circuit breaker is open".to_string(),
                ),
            );
        }

        let queue_status = queue.status();
        if queue_status.pending > self.config.queue_backlog_threshold {
            firing.insert(
                "queue_backlog".to_string(),
                (
                    AlertSeverity::Warning,
                    format!("request queue backlog at {} items", queue_status.pending),
                ),
            );
        }

        for (provider, metrics) in throttles.metrics_snapshot() {
            if metrics.total_checks >= MIN_THROTTLE_SAMPLES {
                #[allow(clippy::cast_precision_loss)]
                let share =
                    metrics.throttled_count as f64 / metrics.total_checks as f64 * 100.0;
                if share > self.config.throttle_share_percent {
                    firing.insert(
                        format!("high_throttle_rate:{provider}"),
                        (
                            AlertSeverity::Warning,
                            format!("provider {provider}: {share:.0}% of requests throttled"),
                        ),
                    );
                }
            }
        }

        self.apply_firing(firing);
    }

    fn apply_firing(&self, firing: HashMap<String, (AlertSeverity, String)>) {
        let now = Utc::now();
        let mut alerts = self.alerts.write().expect("alerts lock poisoned");

        for (key, (severity, message)) in &firing {
            match alerts.get_mut(key) {
                Some(existing) => {
                    existing.message.clone_from(message);
                    existing.last_updated_at = now;
                }
                None => {
                    lwarn!(
                        "system",
                        LogStage::Monitoring,
                        LogComponent::Monitor,
                        "alert_raised",
                        "Alert raised",
                        key = %key,
                        alert_message = %message
                    );
                    alerts.insert(
                        key.clone(),
                        Alert {
                            key: key.clone(),
                            severity: *severity,
                            message: message.clone(),
                            raised_at: now,
                            last_updated_at: now,
                            resolved_at: None,
                        },
                    );
                }
            }
        }

        let resolved: Vec<String> = alerts
            .keys()
            .filter(|key| !firing.contains_key(*key))
            .cloned()
            .collect();
        for key in resolved {
            if let Some(mut alert) = alerts.remove(&key) {
                alert.resolved_at = Some(now);
                linfo!(
                    "system",
                    LogStage::Monitoring,
                    LogComponent::Monitor,
                    "alert_resolved",
                    "Alert auto-resolved",
                    key = %key
                );
                let mut history = self.alert_history.lock().expect("history lock poisoned");
                history.push_back(alert);
                while history.len() > ALERT_HISTORY_CAP {
                    history.pop_front();
                }
            }
        }
    }

    fn push_log(&self, level: &str, provider: Option<ProviderId>, message: String) {
        let normalized = self.normalize_pattern(&message);
        {
            let mut patterns = self.patterns.lock().expect("patterns lock poisoned");
            if patterns.len() < PATTERN_CAP || patterns.contains_key(&normalized) {
                *patterns.entry(normalized).or_insert(0) += 1;
            }
        }

        let mut logs = self.logs.lock().expect("logs lock poisoned");
        logs.push_back(LogEntry {
            timestamp: Utc::now(),
            level: level.to_string(),
            provider,
            message,
        });
        while logs.len() > self.config.log_buffer_size {
            logs.pop_front();
        }
    }

    /// 数字与十六进制ID归一化，使重复错误聚为同一样式
    fn normalize_pattern(&self, message: &str) -> String {
        let step = self.id_pattern.replace_all(message, "<id>");
        self.number_pattern.replace_all(&step, "<n>").into_owned()
    }
}
