//! # 配置管理模块
//!
//! 处理应用配置加载、验证和凭据加密。

mod app_config;
mod crypto;

pub use app_config::{
    AppConfig, CircuitBreakerConfig, CredentialFilesConfig, EndpointConfig, GatewayConfig,
    MonitorConfig, ProviderConfig, RouteRuleConfig,
};
pub use crypto::{CredentialCrypto, EncryptedValue, MASTER_KEY_ENV};

use std::env;
use std::path::Path;

/// 加载配置文件
pub fn load_config() -> crate::error::Result<AppConfig> {
    let env = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
    let config_file = format!("config/gateway.{env}.toml");
    load_config_from(Path::new(&config_file))
}

/// 从指定路径加载配置
pub fn load_config_from(path: &Path) -> crate::error::Result<AppConfig> {
    if !path.exists() {
        return Err(crate::error::GatewayError::config(format!(
            "配置文件不存在: {}",
            path.display()
        )));
    }

    let config_content = std::fs::read_to_string(path).map_err(|e| {
        crate::error::GatewayError::config_with_source(
            format!("读取配置文件失败: {}", path.display()),
            e,
        )
    })?;

    let config: AppConfig = toml::from_str(&config_content)?;

    validate_config(&config)?;

    Ok(config)
}

/// 验证配置有效性
pub fn validate_config(config: &AppConfig) -> crate::error::Result<()> {
    crate::ensure_config!(config.gateway.worker_count > 0, "工作协程数必须大于0");
    crate::ensure_config!(config.gateway.max_queue_size > 0, "队列容量必须大于0");

    let mut seen = std::collections::HashSet::new();
    for provider in &config.providers {
        crate::ensure_config!(
            seen.insert(provider.id.clone()),
            "提供商配置重复: {}",
            provider.id
        );
        crate::ensure_config!(
            provider.throttle.max_requests_per_second > 0.0,
            "提供商 {} 的持续速率必须大于0",
            provider.id
        );
        crate::ensure_config!(
            provider.throttle.max_burst_size > 0,
            "提供商 {} 的突发额度必须大于0",
            provider.id
        );

        for endpoint in &provider.endpoints {
            url::Url::parse(&endpoint.base_url).map_err(|e| {
                crate::error::GatewayError::config_with_source(
                    format!(
                        "提供商 {} 端点 {} 的基地址无效: {}",
                        provider.id, endpoint.id, endpoint.base_url
                    ),
                    e,
                )
            })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProviderId;

    fn provider(id: &str) -> ProviderConfig {
        ProviderConfig {
            id: ProviderId::new(id),
            endpoints: vec![EndpointConfig {
                id: format!("{id}-1"),
                base_url: format!("https://{id}.example.com"),
                weight: 1,
                health_path: "/health".to_string(),
                timeout_ms: 30_000,
            }],
            routing_strategy: crate::router::RoutingStrategy::default(),
            throttle: crate::throttle::ThrottleConfig::default(),
            rate_limit_per_minute: 600,
            circuit_breaker: CircuitBreakerConfig::default(),
            route_rules: Vec::new(),
        }
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let mut config = AppConfig::default();
        config.providers.push(provider("powerschool"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_providers() {
        let mut config = AppConfig::default();
        config.providers.push(provider("powerschool"));
        config.providers.push(provider("powerschool"));
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_endpoint_url() {
        let mut config = AppConfig::default();
        let mut bad = provider("skyward");
        bad.endpoints[0].base_url = "not a url".to_string();
        config.providers.push(bad);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config_from(std::path::Path::new("/nonexistent/gateway.toml"));
        assert!(result.is_err());
    }
}
