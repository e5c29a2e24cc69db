//! # 请求处理流水线
//!
//! 工作协程对每个出队条目执行：节流等待 → 限流中间件 → 密钥注入 →
//! 熔断门 → 路由转发，并把结果回灌节流器与熔断器。

use crate::credentials::ApiKeyManager;
use crate::error::{GatewayError, Result};
use crate::gateway::{CircuitBreakerRegistry, RateLimitMiddleware};
use crate::logging::{LogComponent, LogStage};
use crate::router::SisRouter;
use crate::throttle::ThrottleManager;
use crate::types::{GatewayRequest, GatewayResponse};
use crate::{ldebug, lwarn};
use std::sync::Arc;
use std::time::Duration;

/// 节流等待被拒绝时对外报告的重试提示
const THROTTLE_REFUSED_RETRY_MS: u64 = 60_000;

/// 请求处理流水线
pub struct RequestPipeline {
    throttles: Arc<ThrottleManager>,
    credentials: Arc<ApiKeyManager>,
    router: Arc<SisRouter>,
    breakers: Arc<CircuitBreakerRegistry>,
    rate_limiter: Arc<RateLimitMiddleware>,
}

impl RequestPipeline {
    /// 组装流水线
    #[must_use]
    pub fn new(
        throttles: Arc<ThrottleManager>,
        credentials: Arc<ApiKeyManager>,
        router: Arc<SisRouter>,
        breakers: Arc<CircuitBreakerRegistry>,
        rate_limiter: Arc<RateLimitMiddleware>,
    ) -> Self {
        Self {
            throttles,
            credentials,
            router,
            breakers,
            rate_limiter,
        }
    }

    /// 执行一次完整的下游处理
    pub async fn execute(&self, request: &mut GatewayRequest) -> Result<GatewayResponse> {
        let throttler = self.throttles.get(&request.provider);

        // 1. 节流等待；等待超上限按"稍后重试"上抛
        if !throttler.wait_if_throttled(&request.request_id).await {
            return Err(GatewayError::throttled(
                format!("throttle wait cap exceeded for provider {}", request.provider),
                THROTTLE_REFUSED_RETRY_MS,
            ));
        }

        // 2. 独立的限流中间件（与节流器并行的第二道限流层）
        let decision = self.rate_limiter.check(&request.provider, &request.request_id);
        if !decision.allowed {
            return Err(GatewayError::rate_limited(
                format!("rate limit window exhausted for provider {}", request.provider),
                decision.retry_after.as_millis() as u64,
            ));
        }

        // 3. 密钥注入；无活跃密钥时记警告并继续，由上游拒绝
        match self.credentials.get_active_key(&request.provider).await {
            Some(key) => {
                request.insert_header("Authorization", format!("Bearer {}", key.value));
                ldebug!(
                    &request.request_id,
                    LogStage::Credentials,
                    LogComponent::Worker,
                    "credential_injected",
                    "Active key injected into request headers",
                    provider = %request.provider,
                    key_id = %key.id
                );
            }
            None => {
                lwarn!(
                    &request.request_id,
                    LogStage::Credentials,
                    LogComponent::Worker,
                    "no_active_key",
                    "No active key for provider, proceeding without credentials",
                    provider = %request.provider
                );
            }
        }

        // 4. 熔断门：已知持续失败的提供商直接短路
        if !self.breakers.can_execute(&request.provider) {
            return Err(GatewayError::circuit_open(format!(
                "circuit breaker open for provider {}",
                request.provider
            )));
        }

        // 5. 路由转发
        let result = self.router.route_request(request).await;

        // 6. 结果回灌：4xx 表示提供商本身可用，不计入故障
        match &result {
            Ok(response) => {
                let upstream_healthy = response.status < 500;
                throttler.record_response(
                    &request.request_id,
                    upstream_healthy,
                    response.duration,
                );
                if upstream_healthy {
                    self.breakers.record_success(&request.provider);
                } else {
                    self.breakers.record_failure(&request.provider);
                }
            }
            Err(err) => {
                throttler.record_response(&request.request_id, false, Duration::ZERO);
                // 无端点可用的快速失败不是提供商故障信号
                if !matches!(
                    err,
                    GatewayError::UpstreamNotFound { .. } | GatewayError::UpstreamNotAvailable { .. }
                ) {
                    self.breakers.record_failure(&request.provider);
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, CredentialCrypto, CredentialFilesConfig};
    use crate::credentials::{ApiKeyKind, CredentialStore};
    use crate::gateway::SisTransport;
    use crate::router::Endpoint;
    use crate::throttle::ThrottleConfig;
    use crate::types::HttpMethod;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct CapturingTransport {
        seen_auth: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl SisTransport for CapturingTransport {
        async fn send(
            &self,
            request: &GatewayRequest,
            _endpoint: &Endpoint,
        ) -> Result<GatewayResponse> {
            self.seen_auth
                .lock()
                .unwrap()
                .push(request.headers.get("Authorization").cloned());
            Ok(GatewayResponse::success(
                request.provider.clone(),
                200,
                None,
                HashMap::new(),
                Duration::from_millis(10),
            ))
        }
    }

    fn pipeline_with(
        dir: &TempDir,
        transport: Arc<dyn SisTransport>,
    ) -> (RequestPipeline, Arc<SisRouter>, Arc<ApiKeyManager>) {
        let files = CredentialFilesConfig {
            key_store_path: dir.path().join("keys.json"),
            rotation_config_path: dir.path().join("rotation.toml"),
            audit_log_path: dir.path().join("audit.json"),
            audit_max_entries: 50,
        };
        let credentials = Arc::new(ApiKeyManager::new(CredentialStore::new(
            files,
            CredentialCrypto::new(&[9u8; 32]),
        )));
        let router = Arc::new(SisRouter::new(transport));
        let pipeline = RequestPipeline::new(
            Arc::new(ThrottleManager::new(ThrottleConfig {
                min_request_interval_ms: 0,
                max_requests_per_second: 10_000.0,
                adaptive_enabled: false,
                ..ThrottleConfig::default()
            })),
            credentials.clone(),
            router.clone(),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            Arc::new(RateLimitMiddleware::new(10_000)),
        );
        (pipeline, router, credentials)
    }

    fn endpoint(provider: &str, id: &str) -> Endpoint {
        Endpoint {
            id: id.to_string(),
            provider: provider.into(),
            base_url: format!("https://{id}.example.com"),
            weight: 1,
            health_path: "/health".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_pipeline_injects_active_key() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(CapturingTransport {
            seen_auth: Mutex::new(Vec::new()),
        });
        let (pipeline, router, credentials) = pipeline_with(&dir, transport.clone());
        router.add_endpoint(endpoint("powerschool", "ps-1"));
        credentials
            .create_key("powerschool".into(), "sk-live", ApiKeyKind::Primary, None)
            .await
            .unwrap();

        let mut request = GatewayRequest::new("powerschool".into(), HttpMethod::Get, "/students");
        let response = pipeline.execute(&mut request).await.unwrap();
        assert!(response.success);

        let seen = transport.seen_auth.lock().unwrap();
        assert_eq!(seen[0].as_deref(), Some("Bearer sk-live"));
    }

    #[tokio::test]
    async fn test_pipeline_proceeds_without_key_and_warns() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(CapturingTransport {
            seen_auth: Mutex::new(Vec::new()),
        });
        let (pipeline, router, _) = pipeline_with(&dir, transport.clone());
        router.add_endpoint(endpoint("skyward", "sw-1"));

        let mut request = GatewayRequest::new("skyward".into(), HttpMethod::Get, "/students");
        let response = pipeline.execute(&mut request).await.unwrap();
        assert!(response.success);

        let seen = transport.seen_auth.lock().unwrap();
        assert_eq!(seen[0], None);
    }

    #[tokio::test]
    async fn test_pipeline_short_circuits_on_open_breaker() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(CapturingTransport {
            seen_auth: Mutex::new(Vec::new()),
        });
        let (pipeline, router, _) = pipeline_with(&dir, transport.clone());
        router.add_endpoint(endpoint("aeries", "ae-1"));
        pipeline.breakers.force_open(&"aeries".into(), "test");

        let mut request = GatewayRequest::new("aeries".into(), HttpMethod::Get, "/students");
        let err = pipeline.execute(&mut request).await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));
        assert!(transport.seen_auth.lock().unwrap().is_empty());
    }
}
