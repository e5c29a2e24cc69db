//! # 请求路由器
//!
//! 为提供商选择健康端点，委托传输协作方执行调用，并按结果更新端点健康。
//! 无健康端点时快速失败，绝不发起传输调用。

use super::rules::{RouteRule, RouteTable};
use super::strategies::{EndpointSelector, EndpointSnapshot, create_selector};
use super::types::{Endpoint, EndpointHealth};
use crate::config::ProviderConfig;
use crate::error::{GatewayError, Result};
use crate::gateway::SisTransport;
use crate::logging::{LogComponent, LogStage};
use crate::types::{GatewayRequest, GatewayResponse, ProviderId};
use crate::{ldebug, lwarn};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// 端点状态视图（用于状态汇总）
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    /// 端点标识
    pub id: String,
    /// 健康状态
    pub health: EndpointHealth,
    /// 在途请求数
    pub in_flight: usize,
}

/// 请求路由器
pub struct SisRouter {
    transport: Arc<dyn SisTransport>,
    endpoints: RwLock<HashMap<ProviderId, Vec<Endpoint>>>,
    health: RwLock<HashMap<String, EndpointHealth>>,
    selectors: RwLock<HashMap<ProviderId, Arc<dyn EndpointSelector>>>,
    in_flight: DashMap<String, Arc<AtomicUsize>>,
    route_table: RwLock<RouteTable>,
}

impl SisRouter {
    /// 创建路由器
    #[must_use]
    pub fn new(transport: Arc<dyn SisTransport>) -> Self {
        Self {
            transport,
            endpoints: RwLock::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            selectors: RwLock::new(HashMap::new()),
            in_flight: DashMap::new(),
            route_table: RwLock::new(RouteTable::new()),
        }
    }

    /// 应用提供商配置：端点、选择策略与路径规则
    pub fn apply_provider_config(&self, config: &ProviderConfig) {
        for endpoint_config in &config.endpoints {
            self.add_endpoint(Endpoint::from_config(config.id.clone(), endpoint_config));
        }

        {
            let mut selectors = self.selectors.write().expect("selectors lock poisoned");
            selectors.insert(config.id.clone(), create_selector(config.routing_strategy));
        }

        {
            let mut table = self.route_table.write().expect("route table lock poisoned");
            for rule in &config.route_rules {
                table.add(RouteRule::new(
                    rule.pattern.clone(),
                    config.id.clone(),
                    rule.priority,
                ));
            }
        }
    }

    /// 添加端点
    pub fn add_endpoint(&self, endpoint: Endpoint) {
        {
            let mut health = self.health.write().expect("health lock poisoned");
            health
                .entry(endpoint.id.clone())
                .or_insert_with(EndpointHealth::default);
        }
        self.in_flight
            .entry(endpoint.id.clone())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)));

        let mut endpoints = self.endpoints.write().expect("endpoints lock poisoned");
        endpoints
            .entry(endpoint.provider.clone())
            .or_default()
            .push(endpoint);
    }

    /// 由路径规则解析提供商
    #[must_use]
    pub fn resolve_provider(&self, path: &str) -> Option<ProviderId> {
        let table = self.route_table.read().expect("route table lock poisoned");
        table.resolve(path).cloned()
    }

    /// 路由并执行请求
    ///
    /// 选中端点后委托传输协作方；结果回灌端点健康记录。
    pub async fn route_request(&self, request: &GatewayRequest) -> Result<GatewayResponse> {
        let candidates = self.healthy_snapshots(&request.provider)?;

        let selector = {
            let selectors = self.selectors.read().expect("selectors lock poisoned");
            selectors.get(&request.provider).cloned()
        }
        .unwrap_or_else(|| create_selector(super::strategies::RoutingStrategy::default()));

        let selection = selector.select(&candidates)?;
        let endpoint = candidates[selection.index].endpoint.clone();

        ldebug!(
            &request.request_id,
            LogStage::Routing,
            LogComponent::Router,
            "endpoint_selected",
            "Endpoint selected for request",
            provider = %request.provider,
            endpoint_id = %endpoint.id,
            strategy = selection.strategy.as_str(),
            reason = %selection.reason
        );

        let counter = self
            .in_flight
            .entry(endpoint.id.clone())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::SeqCst);

        let outcome = tokio::time::timeout(
            endpoint.timeout,
            self.transport.send(request, &endpoint),
        )
        .await;

        counter.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(Ok(response)) => {
                // 4xx 说明端点本身可达，只有传输失败与 5xx 计入端点故障
                if response.status < 500 {
                    self.record_endpoint_success(&endpoint.id, response.duration);
                } else {
                    self.record_endpoint_failure(&endpoint.id);
                }
                Ok(response)
            }
            Ok(Err(err)) => {
                self.record_endpoint_failure(&endpoint.id);
                Err(err)
            }
            Err(_) => {
                self.record_endpoint_failure(&endpoint.id);
                Err(GatewayError::connection_timeout(
                    format!("endpoint {} timed out", endpoint.id),
                    endpoint.timeout.as_secs(),
                ))
            }
        }
    }

    /// 所有已配置端点（健康探测目标）
    #[must_use]
    pub fn probe_targets(&self) -> Vec<Endpoint> {
        let endpoints = self.endpoints.read().expect("endpoints lock poisoned");
        endpoints.values().flatten().cloned().collect()
    }

    /// 回写一次探测结果
    pub fn apply_probe_result(&self, endpoint_id: &str, success: bool, latency: Duration) {
        if success {
            self.record_endpoint_success(endpoint_id, latency);
        } else {
            self.record_endpoint_failure(endpoint_id);
        }
    }

    /// 管理操作：强制设定端点健康状态
    pub fn set_endpoint_health(&self, endpoint_id: &str, is_healthy: bool) {
        let mut health = self.health.write().expect("health lock poisoned");
        if let Some(entry) = health.get_mut(endpoint_id) {
            entry.is_healthy = is_healthy;
            if is_healthy {
                entry.consecutive_failures = 0;
            }
        }
    }

    /// 每提供商端点状态汇总
    #[must_use]
    pub fn health_summary(&self) -> HashMap<ProviderId, Vec<EndpointStatus>> {
        let endpoints = self.endpoints.read().expect("endpoints lock poisoned");
        let health = self.health.read().expect("health lock poisoned");

        let mut summary = HashMap::new();
        for (provider, provider_endpoints) in endpoints.iter() {
            let statuses = provider_endpoints
                .iter()
                .map(|endpoint| EndpointStatus {
                    id: endpoint.id.clone(),
                    health: health.get(&endpoint.id).cloned().unwrap_or_default(),
                    in_flight: self
                        .in_flight
                        .get(&endpoint.id)
                        .map_or(0, |c| c.load(Ordering::SeqCst)),
                })
                .collect();
            summary.insert(provider.clone(), statuses);
        }
        summary
    }

    /// 提供商的健康端点数
    #[must_use]
    pub fn healthy_endpoint_count(&self, provider: &ProviderId) -> usize {
        self.healthy_snapshots(provider).map_or(0, |s| s.len())
    }

    /// 重置所有选择器状态
    pub fn reset_selectors(&self) {
        let selectors = self.selectors.read().expect("selectors lock poisoned");
        for selector in selectors.values() {
            selector.reset();
        }
    }

    fn healthy_snapshots(&self, provider: &ProviderId) -> Result<Vec<EndpointSnapshot>> {
        let endpoints = {
            let endpoints = self.endpoints.read().expect("endpoints lock poisoned");
            endpoints.get(provider).cloned().unwrap_or_default()
        };

        if endpoints.is_empty() {
            return Err(GatewayError::upstream_not_found(format!(
                "no endpoints configured for provider {provider}"
            )));
        }

        let health = self.health.read().expect("health lock poisoned");
        let snapshots: Vec<EndpointSnapshot> = endpoints
            .into_iter()
            .filter_map(|endpoint| {
                let endpoint_health = health.get(&endpoint.id).cloned().unwrap_or_default();
                if !endpoint_health.is_healthy {
                    return None;
                }
                let in_flight = self
                    .in_flight
                    .get(&endpoint.id)
                    .map_or(0, |c| c.load(Ordering::SeqCst));
                Some(EndpointSnapshot {
                    endpoint,
                    health: endpoint_health,
                    in_flight,
                })
            })
            .collect();

        if snapshots.is_empty() {
            lwarn!(
                "system",
                LogStage::Routing,
                LogComponent::Router,
                "no_healthy_endpoints",
                "All endpoints unhealthy, failing fast without transport call",
                provider = %provider
            );
            return Err(GatewayError::upstream_not_available(format!(
                "no healthy endpoints for provider {provider}"
            )));
        }

        Ok(snapshots)
    }

    fn record_endpoint_success(&self, endpoint_id: &str, latency: Duration) {
        let mut health = self.health.write().expect("health lock poisoned");
        health
            .entry(endpoint_id.to_string())
            .or_default()
            .record_success(latency);
    }

    fn record_endpoint_failure(&self, endpoint_id: &str) {
        let mut health = self.health.write().expect("health lock poisoned");
        let entry = health.entry(endpoint_id.to_string()).or_default();
        let was_healthy = entry.is_healthy;
        entry.record_failure();
        if was_healthy && !entry.is_healthy {
            lwarn!(
                "system",
                LogStage::HealthCheck,
                LogComponent::Router,
                "endpoint_unhealthy",
                "Endpoint marked unhealthy after consecutive failures",
                endpoint_id = endpoint_id,
                consecutive_failures = entry.consecutive_failures
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HttpMethod;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// 记录调用并按脚本应答的传输替身
    struct ScriptedTransport {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl ScriptedTransport {
        fn new(fail: bool) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SisTransport for ScriptedTransport {
        async fn send(
            &self,
            request: &GatewayRequest,
            endpoint: &Endpoint,
        ) -> Result<GatewayResponse> {
            self.calls.lock().unwrap().push(endpoint.id.clone());
            if self.fail {
                return Err(GatewayError::network("connection reset"));
            }
            Ok(GatewayResponse::success(
                request.provider.clone(),
                200,
                None,
                HashMap::new(),
                Duration::from_millis(25),
            ))
        }
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

    fn request(provider: &str) -> GatewayRequest {
        GatewayRequest::new(provider.into(), HttpMethod::Get, "/attendance/daily")
    }

    #[tokio::test]
    async fn test_route_success_updates_health() {
        let transport = Arc::new(ScriptedTransport::new(false));
        let router = SisRouter::new(transport.clone());
        router.add_endpoint(endpoint("powerschool", "ps-1"));

        let response = router.route_request(&request("powerschool")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(transport.call_count(), 1);

        let summary = router.health_summary();
        let statuses = &summary[&ProviderId::new("powerschool")];
        assert_eq!(statuses[0].health.success_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_provider_fails_without_transport() {
        let transport = Arc::new(ScriptedTransport::new(false));
        let router = SisRouter::new(transport.clone());

        let err = router.route_request(&request("nobody")).await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamNotFound { .. }));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_all_unhealthy_fails_fast_without_transport() {
        let transport = Arc::new(ScriptedTransport::new(false));
        let router = SisRouter::new(transport.clone());
        router.add_endpoint(endpoint("powerschool", "ps-1"));
        router.set_endpoint_health("ps-1", false);

        let err = router.route_request(&request("powerschool")).await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamNotAvailable { .. }));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_failures_mark_endpoint_unhealthy() {
        let transport = Arc::new(ScriptedTransport::new(true));
        let router = SisRouter::new(transport.clone());
        router.add_endpoint(endpoint("powerschool", "ps-1"));

        for _ in 0..3 {
            let _ = router.route_request(&request("powerschool")).await;
        }

        // 三连败后端点不健康，后续请求快速失败
        assert_eq!(router.healthy_endpoint_count(&"powerschool".into()), 0);
        let err = router.route_request(&request("powerschool")).await.unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamNotAvailable { .. }));
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_probe_result_restores_health() {
        let transport = Arc::new(ScriptedTransport::new(true));
        let router = SisRouter::new(transport);
        router.add_endpoint(endpoint("skyward", "sw-1"));

        for _ in 0..3 {
            router.apply_probe_result("sw-1", false, Duration::ZERO);
        }
        assert_eq!(router.healthy_endpoint_count(&"skyward".into()), 0);

        router.apply_probe_result("sw-1", true, Duration::from_millis(30));
        assert_eq!(router.healthy_endpoint_count(&"skyward".into()), 1);
    }
}
