//! # 应用配置结构定义

use crate::queue::QueueStrategy;
use crate::router::RoutingStrategy;
use crate::throttle::ThrottleConfig;
use crate::types::ProviderId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 应用主配置结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 网关与队列配置
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// 凭据持久化配置
    #[serde(default)]
    pub credentials: CredentialFilesConfig,
    /// 监控与告警配置
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// 提供商配置
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// 网关与请求队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// 队列工作协程数
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// 队列最大容量，超出后拒绝准入
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// 队列调度策略
    #[serde(default)]
    pub queue_strategy: QueueStrategy,
    /// 默认端到端超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// 默认最大重试次数
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// 队列积压降级阈值
    #[serde(default = "default_backlog_threshold")]
    pub queue_backlog_threshold: usize,
    /// 是否启动端点健康探测任务
    #[serde(default = "default_health_probe_enabled")]
    pub health_probe_enabled: bool,
    /// 端点健康探测周期（秒）
    #[serde(default = "default_health_probe_interval_secs")]
    pub health_probe_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_queue_size: default_max_queue_size(),
            queue_strategy: QueueStrategy::default(),
            default_timeout_secs: default_timeout_secs(),
            default_max_retries: default_max_retries(),
            queue_backlog_threshold: default_backlog_threshold(),
            health_probe_enabled: default_health_probe_enabled(),
            health_probe_interval_secs: default_health_probe_interval_secs(),
        }
    }
}

const fn default_health_probe_enabled() -> bool {
    true
}

const fn default_health_probe_interval_secs() -> u64 {
    30
}

fn default_worker_count() -> usize {
    num_cpus::get().clamp(2, 16)
}

const fn default_max_queue_size() -> usize {
    10_000
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_backlog_threshold() -> usize {
    1_000
}

/// 凭据持久化文件配置
///
/// 三个工件相互独立：任一文件损坏或缺失不影响其余文件加载。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialFilesConfig {
    /// 加密密钥存储路径
    #[serde(default = "default_key_store_path")]
    pub key_store_path: PathBuf,
    /// 轮换策略配置路径
    #[serde(default = "default_rotation_config_path")]
    pub rotation_config_path: PathBuf,
    /// 审计日志路径
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: PathBuf,
    /// 审计日志保留条目数
    #[serde(default = "default_audit_max_entries")]
    pub audit_max_entries: usize,
}

impl Default for CredentialFilesConfig {
    fn default() -> Self {
        Self {
            key_store_path: default_key_store_path(),
            rotation_config_path: default_rotation_config_path(),
            audit_log_path: default_audit_log_path(),
            audit_max_entries: default_audit_max_entries(),
        }
    }
}

fn default_key_store_path() -> PathBuf {
    PathBuf::from("data/credentials/keys.json")
}

fn default_rotation_config_path() -> PathBuf {
    PathBuf::from("data/credentials/rotation.toml")
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("data/credentials/audit.json")
}

const fn default_audit_max_entries() -> usize {
    500
}

/// 监控与告警阈值配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// 告警规则评估间隔（秒）
    #[serde(default = "default_evaluation_interval_secs")]
    pub evaluation_interval_secs: u64,
    /// 每小时错误数告警阈值
    #[serde(default = "default_error_rate_per_hour")]
    pub error_rate_per_hour: u64,
    /// 平均延迟告警阈值（毫秒）
    #[serde(default = "default_avg_latency_ms")]
    pub avg_latency_ms: u64,
    /// 队列积压告警阈值
    #[serde(default = "default_backlog_threshold")]
    pub queue_backlog_threshold: usize,
    /// 节流比例告警阈值（百分比）
    #[serde(default = "default_throttle_share_percent")]
    pub throttle_share_percent: f64,
    /// 结构化日志环形缓冲区容量
    #[serde(default = "default_log_buffer_size")]
    pub log_buffer_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: default_evaluation_interval_secs(),
            error_rate_per_hour: default_error_rate_per_hour(),
            avg_latency_ms: default_avg_latency_ms(),
            queue_backlog_threshold: default_backlog_threshold(),
            throttle_share_percent: default_throttle_share_percent(),
            log_buffer_size: default_log_buffer_size(),
        }
    }
}

const fn default_evaluation_interval_secs() -> u64 {
    30
}

const fn default_error_rate_per_hour() -> u64 {
    50
}

const fn default_avg_latency_ms() -> u64 {
    5_000
}

const fn default_throttle_share_percent() -> f64 {
    20.0
}

const fn default_log_buffer_size() -> usize {
    1_000
}

/// 单个 SIS 提供商配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// 提供商标识
    pub id: ProviderId,
    /// 上游端点列表
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    /// 端点选择策略
    #[serde(default)]
    pub routing_strategy: RoutingStrategy,
    /// 节流配置
    #[serde(default)]
    pub throttle: ThrottleConfig,
    /// 限流中间件每分钟请求上限
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    /// 熔断器配置
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// 路径路由规则
    #[serde(default)]
    pub route_rules: Vec<RouteRuleConfig>,
}

const fn default_rate_limit_per_minute() -> u32 {
    600
}

/// 上游端点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// 端点标识
    pub id: String,
    /// 基地址
    pub base_url: String,
    /// 权重（加权轮询使用）
    #[serde(default = "default_endpoint_weight")]
    pub weight: u32,
    /// 健康探测路径
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// 单次传输超时（毫秒）
    #[serde(default = "default_endpoint_timeout_ms")]
    pub timeout_ms: u64,
}

const fn default_endpoint_weight() -> u32 {
    1
}

fn default_health_path() -> String {
    "/health".to_string()
}

const fn default_endpoint_timeout_ms() -> u64 {
    30_000
}

/// 熔断器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// 连续失败阈值
    #[serde(default = "default_breaker_failure_threshold")]
    pub failure_threshold: u32,
    /// 恢复探测等待（秒）
    #[serde(default = "default_breaker_recovery_secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_failure_threshold(),
            recovery_timeout_secs: default_breaker_recovery_secs(),
        }
    }
}

const fn default_breaker_failure_threshold() -> u32 {
    5
}

const fn default_breaker_recovery_secs() -> u64 {
    60
}

/// 路径路由规则
///
/// `prefix/*` 通配语义；数值越大优先级越高，同优先级时前缀更长者胜出。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRuleConfig {
    /// 路径模式
    pub pattern: String,
    /// 规则优先级
    #[serde(default)]
    pub priority: i32,
}
