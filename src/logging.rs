//! # 日志配置模块
//!
//! 提供统一的结构化日志宏与日志系统初始化。所有组件通过
//! `linfo!`/`ldebug!`/`lwarn!`/`lerror!` 输出带请求ID、阶段与组件标签的日志。

use std::env;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 请求处理阶段标签
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStage {
    /// 服务启动
    Startup,
    /// 服务关闭
    Shutdown,
    /// 后台任务
    BackgroundTask,
    /// 队列准入
    Admission,
    /// 节流判定
    Throttle,
    /// 密钥注入与轮换
    Credentials,
    /// 端点选择与转发
    Routing,
    /// 健康检查
    HealthCheck,
    /// 响应失败处理
    ResponseFailure,
    /// 指标与告警
    Monitoring,
    /// 管理命令
    Admin,
}

impl LogStage {
    /// 阶段的日志标签
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::BackgroundTask => "background_task",
            Self::Admission => "admission",
            Self::Throttle => "throttle",
            Self::Credentials => "credentials",
            Self::Routing => "routing",
            Self::HealthCheck => "health_check",
            Self::ResponseFailure => "response_failure",
            Self::Monitoring => "monitoring",
            Self::Admin => "admin",
        }
    }
}

/// 产生日志的组件标签
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogComponent {
    /// 主程序
    Main,
    /// 网关协调器
    Coordinator,
    /// 请求队列
    Queue,
    /// 队列工作协程
    Worker,
    /// 节流器
    Throttler,
    /// 路由器
    Router,
    /// 端点健康探测
    HealthProbe,
    /// 密钥管理
    Credentials,
    /// 审计日志
    Audit,
    /// 监控与告警
    Monitor,
    /// 传输层
    Transport,
    /// 熔断器
    CircuitBreaker,
    /// 限流中间件
    RateLimiter,
    /// 配置
    Config,
}

impl LogComponent {
    /// 组件的日志标签
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Coordinator => "coordinator",
            Self::Queue => "queue",
            Self::Worker => "worker",
            Self::Throttler => "throttler",
            Self::Router => "router",
            Self::HealthProbe => "health_probe",
            Self::Credentials => "credentials",
            Self::Audit => "audit",
            Self::Monitor => "monitor",
            Self::Transport => "transport",
            Self::CircuitBreaker => "circuit_breaker",
            Self::RateLimiter => "rate_limiter",
            Self::Config => "config",
        }
    }
}

/// info 级结构化日志
#[macro_export]
macro_rules! linfo {
    ($request_id:expr, $stage:expr, $component:expr, $event:expr, $message:expr $(,)?) => {
        tracing::info!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            component = $component.as_str(),
            event = $event,
            "{}",
            $message
        )
    };
    ($request_id:expr, $stage:expr, $component:expr, $event:expr, $message:expr, $($fields:tt)+) => {
        tracing::info!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            component = $component.as_str(),
            event = $event,
            $($fields)+,
            "{}",
            $message
        )
    };
}

/// debug 级结构化日志
#[macro_export]
macro_rules! ldebug {
    ($request_id:expr, $stage:expr, $component:expr, $event:expr, $message:expr $(,)?) => {
        tracing::debug!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            component = $component.as_str(),
            event = $event,
            "{}",
            $message
        )
    };
    ($request_id:expr, $stage:expr, $component:expr, $event:expr, $message:expr, $($fields:tt)+) => {
        tracing::debug!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            component = $component.as_str(),
            event = $event,
            $($fields)+,
            "{}",
            $message
        )
    };
}

/// warn 级结构化日志
#[macro_export]
macro_rules! lwarn {
    ($request_id:expr, $stage:expr, $component:expr, $event:expr, $message:expr $(,)?) => {
        tracing::warn!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            component = $component.as_str(),
            event = $event,
            "{}",
            $message
        )
    };
    ($request_id:expr, $stage:expr, $component:expr, $event:expr, $message:expr, $($fields:tt)+) => {
        tracing::warn!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            component = $component.as_str(),
            event = $event,
            $($fields)+,
            "{}",
            $message
        )
    };
}

/// error 级结构化日志
#[macro_export]
macro_rules! lerror {
    ($request_id:expr, $stage:expr, $component:expr, $event:expr, $message:expr $(,)?) => {
        tracing::error!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            component = $component.as_str(),
            event = $event,
            "{}",
            $message
        )
    };
    ($request_id:expr, $stage:expr, $component:expr, $event:expr, $message:expr, $($fields:tt)+) => {
        tracing::error!(
            request_id = %$request_id,
            stage = $stage.as_str(),
            component = $component.as_str(),
            event = $event,
            $($fields)+,
            "{}",
            $message
        )
    };
}

/// 初始化日志系统
///
/// 默认过滤级别可被 `RUST_LOG` 覆盖。
pub fn init_logging(log_level: Option<&String>) {
    let level = log_level.map_or("info", std::string::String::as_str);

    let default_filter = format!("{level},sis_gateway=debug,reqwest=warn,hyper=warn");
    let log_filter = env::var("RUST_LOG").unwrap_or(default_filter);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into()))
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}
