//! # 监控模块
//!
//! 指标时间序列、日志环形缓冲与告警规则引擎。

mod service;
mod types;

pub use service::GatewayMonitor;
pub use types::{Alert, AlertSeverity, LogEntry, ProviderSeries};
