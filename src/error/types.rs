//! # 错误类型定义

use thiserror::Error;

/// 应用主要错误类型
#[derive(Debug, Error)]
pub enum GatewayError {
    /// 配置相关错误
    #[error("配置错误: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// IO相关错误
    #[error("IO错误: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// 序列化/反序列化错误
    #[error("序列化错误: {message}")]
    Serialization {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    /// 密钥存储加解密错误
    #[error("加密错误: {message}")]
    Crypto {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 凭据管理错误
    #[error("凭据错误: {message}")]
    Credential {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 凭据未找到
    #[error("凭据未找到: {key_id}")]
    CredentialNotFound { key_id: String },

    /// 节流判定（可稍后重试）
    #[error("请求被节流: {message}")]
    Throttled {
        message: String,
        retry_after_ms: u64,
    },

    /// 限流中间件拒绝（可稍后重试）
    #[error("请求被限流: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: u64,
    },

    /// 队列已满，拒绝准入
    #[error("队列已满: {message}")]
    QueueFull { message: String },

    /// 队列等待超时
    #[error("队列等待超时: {message}")]
    QueueTimeout { message: String },

    /// 请求已被取消
    #[error("请求已取消: {message}")]
    QueueCancelled { message: String },

    /// 提供商未配置
    #[error("提供商未找到: {message}")]
    UpstreamNotFound {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 提供商无健康端点
    #[error("提供商不可用: {message}")]
    UpstreamNotAvailable {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 熔断器处于打开状态
    #[error("熔断器已打开: {message}")]
    CircuitOpen { message: String },

    /// 网络通信错误
    #[error("网络错误: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 连接超时错误
    #[error("连接超时: {message}")]
    ConnectionTimeout {
        message: String,
        timeout_seconds: u64,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 健康检查错误
    #[error("健康检查错误: {message}")]
    HealthCheck {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 系统内部错误
    #[error("内部错误: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 带上下文包装的错误
    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<GatewayError>,
    },
}

impl GatewayError {
    /// 将错误转换为HTTP状态码和错误代码
    #[must_use]
    pub fn to_response_parts(&self) -> (u16, &'static str) {
        match self {
            Self::Config { .. } => (400, "CONFIG_ERROR"),
            Self::Io { .. } => (500, "IO_ERROR"),
            Self::Serialization { .. } => (400, "SERIALIZATION_ERROR"),
            Self::Crypto { .. } => (500, "CRYPTO_ERROR"),
            Self::Credential { .. } => (500, "CREDENTIAL_ERROR"),
            Self::CredentialNotFound { .. } => (404, "CREDENTIAL_NOT_FOUND"),
            Self::Throttled { .. } => (429, "THROTTLED"),
            Self::RateLimited { .. } => (429, "RATE_LIMITED"),
            Self::QueueFull { .. } => (503, "QUEUE_FULL"),
            Self::QueueTimeout { .. } => (504, "QUEUE_TIMEOUT"),
            Self::QueueCancelled { .. } => (499, "REQUEST_CANCELLED"),
            Self::UpstreamNotFound { .. } => (404, "UPSTREAM_NOT_FOUND"),
            Self::UpstreamNotAvailable { .. } => (503, "UPSTREAM_NOT_AVAILABLE"),
            Self::CircuitOpen { .. } => (503, "CIRCUIT_OPEN"),
            Self::Network { .. } => (502, "NETWORK_ERROR"),
            Self::ConnectionTimeout { .. } => (504, "CONNECTION_TIMEOUT"),
            Self::HealthCheck { .. } => (500, "HEALTH_CHECK_ERROR"),
            Self::Internal { .. } => (500, "INTERNAL_ERROR"),
            Self::Context { source, .. } => source.to_response_parts(),
        }
    }

    /// 判断失败是否值得重新入队重试
    ///
    /// 准入类错误与"快速失败"类错误（未知提供商、无健康端点、熔断打开）
    /// 不重试；传输层与节流类错误重试。
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::ConnectionTimeout { .. }
            | Self::Throttled { .. }
            | Self::RateLimited { .. } => true,
            Self::Context { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// 创建配置错误
    pub fn config<T: Into<String>>(message: T) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的配置错误
    pub fn config_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建加密错误
    pub fn crypto<T: Into<String>>(message: T) -> Self {
        Self::Crypto {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的加密错误
    pub fn crypto_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Crypto {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建凭据错误
    pub fn credential<T: Into<String>>(message: T) -> Self {
        Self::Credential {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的凭据错误
    pub fn credential_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Credential {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建节流结果
    pub fn throttled<T: Into<String>>(message: T, retry_after_ms: u64) -> Self {
        Self::Throttled {
            message: message.into(),
            retry_after_ms,
        }
    }

    /// 创建限流结果
    pub fn rate_limited<T: Into<String>>(message: T, retry_after_ms: u64) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after_ms,
        }
    }

    /// 创建队列已满错误
    pub fn queue_full<T: Into<String>>(message: T) -> Self {
        Self::QueueFull {
            message: message.into(),
        }
    }

    /// 创建队列超时错误
    pub fn queue_timeout<T: Into<String>>(message: T) -> Self {
        Self::QueueTimeout {
            message: message.into(),
        }
    }

    /// 创建取消错误
    pub fn queue_cancelled<T: Into<String>>(message: T) -> Self {
        Self::QueueCancelled {
            message: message.into(),
        }
    }

    /// 创建提供商未找到错误
    pub fn upstream_not_found<T: Into<String>>(message: T) -> Self {
        Self::UpstreamNotFound {
            message: message.into(),
            source: None,
        }
    }

    /// 创建提供商不可用错误
    pub fn upstream_not_available<T: Into<String>>(message: T) -> Self {
        Self::UpstreamNotAvailable {
            message: message.into(),
            source: None,
        }
    }

    /// 创建熔断打开错误
    pub fn circuit_open<T: Into<String>>(message: T) -> Self {
        Self::CircuitOpen {
            message: message.into(),
        }
    }

    /// 创建网络错误
    pub fn network<T: Into<String>>(message: T) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的网络错误
    pub fn network_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建连接超时错误
    pub fn connection_timeout<T: Into<String>>(message: T, timeout_seconds: u64) -> Self {
        Self::ConnectionTimeout {
            message: message.into(),
            timeout_seconds,
            source: None,
        }
    }

    /// 创建健康检查错误
    pub fn health_check<T: Into<String>>(message: T) -> Self {
        Self::HealthCheck {
            message: message.into(),
            source: None,
        }
    }

    /// 创建内部错误
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的内部错误
    pub fn internal_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
            source: err.into(),
        }
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
            source: err.into(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::ConnectionTimeout {
                message: err.to_string(),
                timeout_seconds: 0,
                source: Some(err.into()),
            }
        } else {
            Self::Network {
                message: err.to_string(),
                source: Some(err.into()),
            }
        }
    }
}
