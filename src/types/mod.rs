//! # 核心数据类型定义
//!
//! 网关请求/响应模型、提供商标识与请求优先级。

use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// 上游 SIS 提供商标识
///
/// 作为队列、节流器、端点与密钥的分区键。提供商由配置定义，
/// 因此用字符串新类型而非封闭枚举表示。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    /// 创建提供商标识
    pub fn new<T: Into<String>>(id: T) -> Self {
        Self(id.into())
    }

    /// 标识字符串
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// HTTP 请求方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// 方法名
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 请求优先级
///
/// 高优先级先于更早提交的低优先级条目出队；同级按提交顺序。
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RequestPriority {
    /// 批量/后台请求
    Low,
    /// 常规请求
    #[default]
    Normal,
    /// 交互请求
    High,
    /// 故障恢复、合规截止等紧急请求
    Urgent,
}

impl RequestPriority {
    /// 优先级标签
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

/// 出站网关请求
///
/// 入队前归调用方所有；入队后所有权转移给请求队列直至处理结束。
/// 头部可变：活跃密钥在流水线中注入。
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    /// 目标提供商
    pub provider: ProviderId,
    /// HTTP 方法
    pub method: HttpMethod,
    /// 请求路径（相对端点基地址）
    pub path: String,
    /// 查询参数
    pub query: Vec<(String, String)>,
    /// 请求头（密钥注入点）
    pub headers: HashMap<String, String>,
    /// 请求体，网关不解析其语义
    pub body: Option<serde_json::Value>,
    /// 端到端超时
    pub timeout: Duration,
    /// 调用方指定的优先级
    pub priority: RequestPriority,
    /// 生成的请求ID
    pub request_id: String,
    /// 附加元数据
    pub metadata: HashMap<String, serde_json::Value>,
}

impl GatewayRequest {
    /// 默认端到端超时
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// 创建新的网关请求
    pub fn new<P: Into<String>>(provider: ProviderId, method: HttpMethod, path: P) -> Self {
        Self {
            provider,
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HashMap::new(),
            body: None,
            timeout: Self::DEFAULT_TIMEOUT,
            priority: RequestPriority::default(),
            request_id: uuid::Uuid::new_v4().to_string(),
            metadata: HashMap::new(),
        }
    }

    /// 设置优先级
    #[must_use]
    pub const fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    /// 设置超时
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 设置请求体
    #[must_use]
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// 写入请求头（覆盖同名头）
    pub fn insert_header<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.headers.insert(key.into(), value.into());
    }
}

/// 出站网关响应
///
/// 由传输协作方产生后不可变；除队列层包装外原样返回调用方。
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// HTTP 状态码
    pub status: u16,
    /// 响应体
    pub body: Option<serde_json::Value>,
    /// 响应头
    pub headers: HashMap<String, String>,
    /// 实际耗时
    pub duration: Duration,
    /// 来源提供商
    pub provider: ProviderId,
    /// 是否成功
    pub success: bool,
    /// 错误描述
    pub error: Option<String>,
    /// 已执行的重试次数
    pub retry_count: u32,
    /// 是否由熔断器短路
    pub circuit_breaker_tripped: bool,
}

impl GatewayResponse {
    /// 构造成功响应
    #[must_use]
    pub fn success(
        provider: ProviderId,
        status: u16,
        body: Option<serde_json::Value>,
        headers: HashMap<String, String>,
        duration: Duration,
    ) -> Self {
        Self {
            status,
            body,
            headers,
            duration,
            provider,
            success: (200..400).contains(&status),
            error: None,
            retry_count: 0,
            circuit_breaker_tripped: false,
        }
    }

    /// 构造失败响应
    pub fn failure<T: Into<String>>(provider: ProviderId, status: u16, error: T) -> Self {
        Self {
            status,
            body: None,
            headers: HashMap::new(),
            duration: Duration::ZERO,
            provider,
            success: false,
            error: Some(error.into()),
            retry_count: 0,
            circuit_breaker_tripped: false,
        }
    }

    /// 由错误构造失败响应
    ///
    /// 网关边界上任何失败都以响应形式返回，调用方不会收到未处理错误。
    #[must_use]
    pub fn from_error(provider: ProviderId, error: &GatewayError) -> Self {
        let (status, code) = error.to_response_parts();
        let tripped = matches!(error, GatewayError::CircuitOpen { .. });
        let mut response = Self::failure(provider, status, format!("{code}: {error}"));
        response.circuit_breaker_tripped = tripped;
        response
    }

    /// 记录重试次数
    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}
