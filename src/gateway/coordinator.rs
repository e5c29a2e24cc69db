//! # 网关协调器
//!
//! 顶层门面：按依赖顺序启停各组件，提供 `process_request` 唯一入口，
//! 聚合跨组件指标并响应管理命令。状态机
//! STARTING → HEALTHY ⇄ DEGRADED → SHUTDOWN；只有 SHUTDOWN 拒绝新请求。

use super::circuit_breaker::CircuitBreakerRegistry;
use super::rate_limit::RateLimitMiddleware;
use super::transport::{HttpTransport, SisTransport};
use crate::config::{AppConfig, CredentialCrypto, MASTER_KEY_ENV};
use crate::credentials::{ApiKeyManager, CredentialStore, KeyLifecycleTask};
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::monitor::GatewayMonitor;
use crate::queue::{QueueOptions, RequestPipeline, RequestQueue};
use crate::router::{HealthProbeTask, SisRouter};
use crate::throttle::ThrottleManager;
use crate::types::{
    GatewayRequest, GatewayResponse, HttpMethod, ProviderId, RequestPriority,
};
use crate::{linfo, lwarn};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// 状态监测循环周期
const STATE_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// 协调器状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayState {
    /// 启动中
    Starting,
    /// 正常
    Healthy,
    /// 降级（熔断打开或队列积压）
    Degraded,
    /// 已关闭；需要重新 `start()` 才能恢复
    Shutdown,
}

impl GatewayState {
    /// 状态标签
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Default)]
struct AggregateMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    degraded_requests: AtomicU64,
    total_duration_ms: AtomicU64,
    per_provider: DashMap<ProviderId, u64>,
}

impl AggregateMetrics {
    fn record(&self, provider: &ProviderId, response: &GatewayResponse, degraded: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if response.success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        if degraded {
            self.degraded_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_ms
            .fetch_add(response.duration.as_millis() as u64, Ordering::Relaxed);
        *self.per_provider.entry(provider.clone()).or_insert(0) += 1;
    }

    fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.successful_requests.store(0, Ordering::Relaxed);
        self.failed_requests.store(0, Ordering::Relaxed);
        self.degraded_requests.store(0, Ordering::Relaxed);
        self.total_duration_ms.store(0, Ordering::Relaxed);
        self.per_provider.clear();
    }

    fn snapshot(&self) -> serde_json::Value {
        let total = self.total_requests.load(Ordering::Relaxed);
        let duration = self.total_duration_ms.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let avg_duration_ms = if total == 0 {
            0.0
        } else {
            duration as f64 / total as f64
        };
        let per_provider: HashMap<String, u64> = self
            .per_provider
            .iter()
            .map(|entry| (entry.key().as_str().to_string(), *entry.value()))
            .collect();

        json!({
            "total_requests": total,
            "successful_requests": self.successful_requests.load(Ordering::Relaxed),
            "failed_requests": self.failed_requests.load(Ordering::Relaxed),
            "degraded_requests": self.degraded_requests.load(Ordering::Relaxed),
            "avg_duration_ms": avg_duration_ms,
            "per_provider": per_provider,
        })
    }
}

/// 网关协调器
pub struct GatewayCoordinator {
    config: AppConfig,
    credentials: Arc<ApiKeyManager>,
    lifecycle_task: KeyLifecycleTask,
    throttles: Arc<ThrottleManager>,
    router: Arc<SisRouter>,
    probe_task: Option<HealthProbeTask>,
    queue: Arc<RequestQueue>,
    breakers: Arc<CircuitBreakerRegistry>,
    rate_limiter: Arc<RateLimitMiddleware>,
    monitor: Arc<GatewayMonitor>,
    state: RwLock<GatewayState>,
    state_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    metrics: AggregateMetrics,
    started_at: RwLock<Option<DateTime<Utc>>>,
    /// 自引用，供状态监测循环持有强引用
    me: std::sync::Weak<GatewayCoordinator>,
}

impl GatewayCoordinator {
    /// 以默认 HTTP 传输创建协调器
    pub fn new(config: AppConfig) -> Result<Arc<Self>> {
        let transport = Arc::new(HttpTransport::new()?);
        Ok(Self::with_transport(config, transport))
    }

    /// 以指定传输协作方创建协调器（测试注入替身）
    #[must_use]
    pub fn with_transport(config: AppConfig, transport: Arc<dyn SisTransport>) -> Arc<Self> {
        let crypto = CredentialCrypto::from_env().unwrap_or_else(|_| {
            lwarn!(
                "system",
                LogStage::Startup,
                LogComponent::Coordinator,
                "ephemeral_master_key",
                "Master key env var missing, using ephemeral key; persisted credentials will not survive restarts",
                env_var = MASTER_KEY_ENV
            );
            let key = CredentialCrypto::generate_key();
            CredentialCrypto::from_password(&key)
        });

        let store = CredentialStore::new(config.credentials.clone(), crypto);
        let credentials = Arc::new(ApiKeyManager::new(store));
        let lifecycle_task = KeyLifecycleTask::new(credentials.clone());

        let throttles = Arc::new(ThrottleManager::new(crate::throttle::ThrottleConfig::default()));
        let router = Arc::new(SisRouter::new(transport));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            crate::config::CircuitBreakerConfig::default(),
        ));
        let rate_limiter = Arc::new(RateLimitMiddleware::new(600));

        for provider in &config.providers {
            throttles.register(provider.id.clone(), provider.throttle.clone());
            breakers.register(provider.id.clone(), provider.circuit_breaker.clone());
            rate_limiter.set_limit(provider.id.clone(), provider.rate_limit_per_minute);
            router.apply_provider_config(provider);
        }

        let pipeline = Arc::new(RequestPipeline::new(
            throttles.clone(),
            credentials.clone(),
            router.clone(),
            breakers.clone(),
            rate_limiter.clone(),
        ));
        let queue = RequestQueue::new(QueueOptions::from(&config.gateway), pipeline);
        let monitor = Arc::new(GatewayMonitor::new(config.monitor.clone()));

        let probe_task = if config.gateway.health_probe_enabled {
            HealthProbeTask::new(
                router.clone(),
                Duration::from_secs(config.gateway.health_probe_interval_secs),
            )
            .ok()
        } else {
            None
        };

        Arc::new_cyclic(|me| Self {
            config,
            credentials,
            lifecycle_task,
            throttles,
            router,
            probe_task,
            queue,
            breakers,
            rate_limiter,
            monitor,
            state: RwLock::new(GatewayState::Shutdown),
            state_task: tokio::sync::Mutex::new(None),
            metrics: AggregateMetrics::default(),
            started_at: RwLock::new(None),
            me: me.clone(),
        })
    }

    /// 按依赖顺序启动所有组件（幂等）
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().expect("state lock poisoned");
            if matches!(*state, GatewayState::Healthy | GatewayState::Degraded) {
                return Ok(());
            }
            *state = GatewayState::Starting;
        }

        // 依赖顺序：凭据 → 节流（无启动动作）→ 路由探测 → 队列 → 监控
        self.credentials.load().await?;
        self.lifecycle_task.start().await;
        if let Some(probe) = &self.probe_task {
            probe.start().await;
        }
        self.queue.start().await;
        self.monitor
            .clone()
            .start(self.queue.clone(), self.breakers.clone(), self.throttles.clone())
            .await;
        self.spawn_state_monitor().await;

        *self.state.write().expect("state lock poisoned") = GatewayState::Healthy;
        *self.started_at.write().expect("started_at lock poisoned") = Some(Utc::now());

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Coordinator,
            "gateway_started",
            "Gateway coordinator started",
            providers = self.config.providers.len(),
            workers = self.config.gateway.worker_count
        );
        Ok(())
    }

    /// 逆序停止所有组件（幂等）
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().expect("state lock poisoned");
            if *state == GatewayState::Shutdown {
                return;
            }
            *state = GatewayState::Shutdown;
        }

        if let Some(handle) = self.state_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.monitor.stop().await;
        self.queue.stop().await;
        if let Some(probe) = &self.probe_task {
            probe.stop().await;
        }
        self.lifecycle_task.stop().await;

        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::Coordinator,
            "gateway_stopped",
            "Gateway coordinator stopped"
        );
    }

    /// 唯一对外入口：构建请求、入队等待、聚合指标
    ///
    /// 网关边界上永远返回响应：任何失败都以 `success=false` 的响应表达。
    #[allow(clippy::too_many_arguments)]
    pub async fn process_request(
        &self,
        provider: ProviderId,
        method: HttpMethod,
        path: &str,
        params: Vec<(String, String)>,
        headers: HashMap<String, String>,
        body: Option<serde_json::Value>,
        priority: RequestPriority,
        timeout: Option<Duration>,
    ) -> GatewayResponse {
        let state = self.state();
        if state == GatewayState::Shutdown {
            return GatewayResponse::failure(provider, 503, "gateway is shut down");
        }

        let timeout = timeout
            .unwrap_or_else(|| Duration::from_secs(self.config.gateway.default_timeout_secs));
        let mut request = GatewayRequest::new(provider.clone(), method, path)
            .with_priority(priority)
            .with_timeout(timeout);
        request.query = params;
        request.headers = headers;
        request.body = body;

        let started = Instant::now();
        let result = self
            .queue
            .enqueue_and_wait(
                request,
                priority,
                timeout,
                self.config.gateway.default_max_retries,
            )
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => GatewayResponse::from_error(provider.clone(), &err),
        };

        let degraded = state == GatewayState::Degraded;
        self.metrics.record(&provider, &response, degraded);
        self.monitor
            .record_request(&provider, method, path, &response, started.elapsed());

        response
    }

    /// 当前状态
    pub fn state(&self) -> GatewayState {
        *self.state.read().expect("state lock poisoned")
    }

    /// 简要健康状态
    pub fn get_health_status(&self) -> serde_json::Value {
        let uptime_secs = self
            .started_at
            .read()
            .expect("started_at lock poisoned")
            .map_or(0, |at| (Utc::now() - at).num_seconds().max(0));

        json!({
            "state": self.state().as_str(),
            "uptime_secs": uptime_secs,
            "queue_pending": self.queue.pending(),
            "any_circuit_open": self.breakers.any_open(),
        })
    }

    /// 详细状态：各组件快照的聚合
    pub async fn get_detailed_status(&self) -> serde_json::Value {
        let key_health = self.credentials.check_key_health().await;
        json!({
            "state": self.state().as_str(),
            "metrics": self.metrics.snapshot(),
            "queue": self.queue.status(),
            "endpoints": self.router.health_summary(),
            "circuit_breakers": self.breakers.summary(),
            "throttles": self.throttles.metrics_snapshot()
                .into_iter()
                .map(|(provider, m)| (provider.as_str().to_string(), m))
                .collect::<HashMap<_, _>>(),
            "credentials": key_health,
            "active_alerts": self.monitor.active_alerts(),
        })
    }

    /// 管理命令入口；永远返回负载，不向调用方抛错
    pub async fn admin_command(&self, name: &str, args: &serde_json::Value) -> serde_json::Value {
        linfo!(
            "system",
            LogStage::Admin,
            LogComponent::Coordinator,
            "admin_command",
            "Admin command received",
            command = name
        );

        match name {
            "health_check" => self.get_health_status(),
            "detailed_status" => self.get_detailed_status().await,
            "reset_metrics" => {
                self.metrics.reset();
                self.throttles.reset_metrics();
                self.rate_limiter.reset_metrics();
                json!({"status": "ok"})
            }
            "force_circuit_breaker_open" => match args.get("provider").and_then(|v| v.as_str()) {
                Some(provider) => {
                    let reason = args
                        .get("reason")
                        .and_then(|v| v.as_str())
                        .unwrap_or("admin command");
                    self.breakers.force_open(&ProviderId::new(provider), reason);
                    json!({"status": "ok", "provider": provider, "state": "open"})
                }
                None => json!({"status": "error", "error": "missing 'provider' argument"}),
            },
            "force_circuit_breaker_closed" => match args.get("provider").and_then(|v| v.as_str()) {
                Some(provider) => {
                    let reason = args
                        .get("reason")
                        .and_then(|v| v.as_str())
                        .unwrap_or("admin command");
                    self.breakers
                        .force_closed(&ProviderId::new(provider), reason);
                    json!({"status": "ok", "provider": provider, "state": "closed"})
                }
                None => json!({"status": "error", "error": "missing 'provider' argument"}),
            },
            "clear_request_queue" => {
                let cleared = self.queue.clear();
                json!({"status": "ok", "cleared": cleared})
            }
            "recent_audit" => {
                let limit = args.get("limit").and_then(serde_json::Value::as_u64).unwrap_or(20);
                let records = self.credentials.recent_audit(limit as usize).await;
                json!({"status": "ok", "records": records})
            }
            _ => json!({"status": "error", "error": format!("unknown admin command: {name}")}),
        }
    }

    /// 凭据管理器句柄（管理面使用）
    #[must_use]
    pub fn credentials(&self) -> &Arc<ApiKeyManager> {
        &self.credentials
    }

    /// 路由器句柄
    #[must_use]
    pub fn router(&self) -> &Arc<SisRouter> {
        &self.router
    }

    /// 熔断器注册表句柄
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// 根据熔断与队列积压评估一次状态迁移
    pub fn evaluate_state(&self) {
        let mut state = self.state.write().expect("state lock poisoned");
        let current = *state;
        if !matches!(current, GatewayState::Healthy | GatewayState::Degraded) {
            return;
        }

        let backlog = self.queue.pending() > self.config.gateway.queue_backlog_threshold;
        let circuit_open = self.breakers.any_open();
        let next = if backlog || circuit_open {
            GatewayState::Degraded
        } else {
            GatewayState::Healthy
        };

        if next != current {
            *state = next;
            lwarn!(
                "system",
                LogStage::Monitoring,
                LogComponent::Coordinator,
                "state_transition",
                "Gateway state changed",
                from = current.as_str(),
                to = next.as_str(),
                queue_backlog = backlog,
                circuit_open = circuit_open
            );
        }
    }

    async fn spawn_state_monitor(&self) {
        let mut guard = self.state_task.lock().await;
        if guard.is_some() {
            return;
        }
        let Some(coordinator) = self.me.upgrade() else {
            return;
        };
        *guard = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(STATE_MONITOR_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                coordinator.evaluate_state();
            }
        }));
    }
}
