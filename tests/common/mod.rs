//! 集成测试共用构件：脚本化传输替身与配置/流水线装配

// 各集成测试二进制各自编译本模块，用到的构件不尽相同
#![allow(dead_code)]

use async_trait::async_trait;
use sis_gateway::config::{
    AppConfig, CircuitBreakerConfig, CredentialFilesConfig, EndpointConfig, ProviderConfig,
};
use sis_gateway::credentials::{ApiKeyManager, CredentialStore};
use sis_gateway::error::{GatewayError, Result};
use sis_gateway::gateway::{CircuitBreakerRegistry, RateLimitMiddleware, SisTransport};
use sis_gateway::queue::{QueueOptions, RequestPipeline, RequestQueue};
use sis_gateway::router::{Endpoint, RoutingStrategy, SisRouter};
use sis_gateway::throttle::{ThrottleConfig, ThrottleManager};
use sis_gateway::types::{GatewayRequest, GatewayResponse};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

/// 按脚本应答并记录派发时间的传输替身
pub struct ScriptedTransport {
    fail_times: AtomicU64,
    dispatched: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedTransport {
    pub fn ok() -> Arc<Self> {
        Self::failing(0)
    }

    pub fn failing(times: u64) -> Arc<Self> {
        Arc::new(Self {
            fail_times: AtomicU64::new(times),
            dispatched: Mutex::new(Vec::new()),
        })
    }

    pub fn dispatch_log(&self) -> Vec<(String, Instant)> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl SisTransport for ScriptedTransport {
    async fn send(
        &self,
        request: &GatewayRequest,
        _endpoint: &Endpoint,
    ) -> Result<GatewayResponse> {
        self.dispatched
            .lock()
            .unwrap()
            .push((request.request_id.clone(), Instant::now()));

        if self.fail_times.load(Ordering::SeqCst) > 0 {
            self.fail_times.fetch_sub(1, Ordering::SeqCst);
            return Err(GatewayError::network("scripted connection reset"));
        }

        Ok(GatewayResponse::success(
            request.provider.clone(),
            200,
            Some(serde_json::json!({"ok": true})),
            HashMap::new(),
            Duration::from_millis(8),
        ))
    }
}

/// 不限速的节流配置
pub fn open_throttle() -> ThrottleConfig {
    ThrottleConfig {
        max_requests_per_second: 1_000_000.0,
        max_burst_size: 1_000_000,
        min_request_interval_ms: 0,
        adaptive_enabled: false,
        ..ThrottleConfig::default()
    }
}

/// 临时目录下的凭据文件配置
pub fn credential_files(dir: &TempDir) -> CredentialFilesConfig {
    CredentialFilesConfig {
        key_store_path: dir.path().join("keys.json"),
        rotation_config_path: dir.path().join("rotation.toml"),
        audit_log_path: dir.path().join("audit.json"),
        audit_max_entries: 100,
    }
}

/// 装配一套完整的队列 + 流水线（含一个已配置端点的提供商）
pub struct QueueHarness {
    pub queue: Arc<RequestQueue>,
    pub credentials: Arc<ApiKeyManager>,
    pub router: Arc<SisRouter>,
    pub transport: Arc<ScriptedTransport>,
    _dir: TempDir,
}

pub async fn queue_harness(
    transport: Arc<ScriptedTransport>,
    throttle: ThrottleConfig,
    options: QueueOptions,
    providers_with_endpoints: &[&str],
) -> QueueHarness {
    let dir = TempDir::new().unwrap();
    let credentials = Arc::new(ApiKeyManager::new(CredentialStore::new(
        credential_files(&dir),
        sis_gateway::config::CredentialCrypto::new(&[11u8; 32]),
    )));

    let router = Arc::new(SisRouter::new(transport.clone()));
    for provider in providers_with_endpoints {
        router.add_endpoint(Endpoint {
            id: format!("{provider}-1"),
            provider: (*provider).into(),
            base_url: format!("https://{provider}.example.com"),
            weight: 1,
            health_path: "/health".to_string(),
            timeout: Duration::from_secs(5),
        });
    }

    let pipeline = Arc::new(RequestPipeline::new(
        Arc::new(ThrottleManager::new(throttle)),
        credentials.clone(),
        router.clone(),
        Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1_000,
            recovery_timeout_secs: 60,
        })),
        Arc::new(RateLimitMiddleware::new(1_000_000)),
    ));

    let queue = RequestQueue::new(options, pipeline);
    queue.start().await;

    QueueHarness {
        queue,
        credentials,
        router,
        transport,
        _dir: dir,
    }
}

/// 单提供商、关闭健康探测的协调器配置
pub fn coordinator_config(provider: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.gateway.health_probe_enabled = false;
    config.providers.push(ProviderConfig {
        id: provider.into(),
        endpoints: vec![EndpointConfig {
            id: format!("{provider}-1"),
            base_url: format!("https://{provider}.example.com"),
            weight: 1,
            health_path: "/health".to_string(),
            timeout_ms: 5_000,
        }],
        routing_strategy: RoutingStrategy::RoundRobin,
        throttle: open_throttle(),
        rate_limit_per_minute: 1_000_000,
        circuit_breaker: CircuitBreakerConfig::default(),
        route_rules: Vec::new(),
    });
    config
}
