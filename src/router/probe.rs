//! # 端点健康探测任务
//!
//! 独立于真实流量，每 30 秒对所有端点做一次轻量连通性检查。
//! 单个端点探测失败只影响该端点的健康记录，循环继续。

use super::router::SisRouter;
use crate::logging::{LogComponent, LogStage};
use crate::router::Endpoint;
use crate::{ldebug, linfo};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// 单次探测超时
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// 健康探测任务
#[derive(Clone)]
pub struct HealthProbeTask {
    router: Arc<SisRouter>,
    client: reqwest::Client,
    interval: Duration,
    task_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl HealthProbeTask {
    /// 创建探测任务
    pub fn new(router: Arc<SisRouter>, interval: Duration) -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .connect_timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| {
                crate::error::GatewayError::internal_with_source("Failed to create probe client", e)
            })?;
        Ok(Self {
            router,
            client,
            interval,
            task_handle: Arc::new(RwLock::new(None)),
        })
    }

    /// 启动探测循环
    pub async fn start(&self) {
        let mut guard = self.task_handle.write().await;
        if guard.is_some() {
            return;
        }

        let router = self.router.clone();
        let client = self.client.clone();
        let interval = self.interval;
        *guard = Some(tokio::spawn(run(router, client, interval)));

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::HealthProbe,
            "probe_task_started",
            "Endpoint health probe task started",
            interval_secs = interval.as_secs()
        );
    }

    /// 停止探测循环
    pub async fn stop(&self) {
        let handle = {
            let mut guard = self.task_handle.write().await;
            guard.take()
        };

        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::HealthProbe,
            "probe_task_stopped",
            "Endpoint health probe task stopped"
        );
    }
}

async fn run(router: Arc<SisRouter>, client: reqwest::Client, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    tick.tick().await;

    loop {
        tick.tick().await;

        let targets = router.probe_targets();
        let probes = targets.iter().map(|endpoint| {
            let client = client.clone();
            async move {
                let outcome = probe_endpoint(&client, endpoint).await;
                (endpoint.id.clone(), outcome)
            }
        });

        for (endpoint_id, outcome) in futures::future::join_all(probes).await {
            match outcome {
                Ok(latency) => {
                    router.apply_probe_result(&endpoint_id, true, latency);
                }
                Err(reason) => {
                    ldebug!(
                        "system",
                        LogStage::HealthCheck,
                        LogComponent::HealthProbe,
                        "probe_failed",
                        "Endpoint probe failed",
                        endpoint_id = %endpoint_id,
                        reason = %reason
                    );
                    router.apply_probe_result(&endpoint_id, false, Duration::ZERO);
                }
            }
        }
    }
}

/// 单端点连通性检查：收到任何非 5xx 响应即视为可达
async fn probe_endpoint(
    client: &reqwest::Client,
    endpoint: &Endpoint,
) -> std::result::Result<Duration, String> {
    let started = Instant::now();
    match client.get(endpoint.probe_url()).send().await {
        Ok(response) if response.status().as_u16() < 500 => Ok(started.elapsed()),
        Ok(response) => Err(format!("status {}", response.status().as_u16())),
        Err(err) => Err(err.to_string()),
    }
}
