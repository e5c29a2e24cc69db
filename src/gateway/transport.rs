//! # 传输协作方
//!
//! 执行对已解析端点的物理调用。网关核心不解析提供商负载语义，
//! 除密钥注入外对请求体/头保持透明。

use crate::error::{GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::router::Endpoint;
use crate::types::{GatewayRequest, GatewayResponse, HttpMethod};
use crate::{ldebug, lwarn};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// 传输服务特质
///
/// 消费 `GatewayRequest` 与已选定端点，同步返回 `GatewayResponse`。
#[async_trait]
pub trait SisTransport: Send + Sync {
    /// 执行对端点的一次调用
    async fn send(&self, request: &GatewayRequest, endpoint: &Endpoint) -> Result<GatewayResponse>;
}

/// 基于 reqwest 的默认传输实现
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// 创建传输实现
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::internal_with_source("Failed to create HTTP client", e))?;
        Ok(Self { client })
    }

    fn method_for(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[async_trait]
impl SisTransport for HttpTransport {
    async fn send(&self, request: &GatewayRequest, endpoint: &Endpoint) -> Result<GatewayResponse> {
        let url = endpoint.url_for(&request.path);
        let started = Instant::now();

        let mut builder = self
            .client
            .request(Self::method_for(request.method), &url)
            .timeout(endpoint.timeout)
            .query(&request.query);

        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        ldebug!(
            &request.request_id,
            LogStage::Routing,
            LogComponent::Transport,
            "dispatching",
            "Dispatching request to endpoint",
            endpoint_id = %endpoint.id,
            method = request.method.as_str(),
            url = %url
        );

        let response = builder.send().await?;
        let duration = started.elapsed();
        let status = response.status().as_u16();

        let mut headers = HashMap::new();
        for (key, value) in response.headers() {
            if let Ok(value_str) = value.to_str() {
                headers.insert(key.to_string(), value_str.to_string());
            }
        }

        let body = match response.json::<serde_json::Value>().await {
            Ok(value) => Some(value),
            Err(err) => {
                // 响应体不是 JSON 时按不透明内容处理，不视为失败
                lwarn!(
                    &request.request_id,
                    LogStage::Routing,
                    LogComponent::Transport,
                    "body_not_json",
                    "Response body is not JSON, dropping body",
                    endpoint_id = %endpoint.id,
                    error = %err
                );
                None
            }
        };

        Ok(GatewayResponse::success(
            request.provider.clone(),
            status,
            body,
            headers,
            duration,
        ))
    }
}
