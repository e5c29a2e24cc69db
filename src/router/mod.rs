//! # 路由模块
//!
//! 端点选择策略、路径规则、健康探测与请求转发。

mod probe;
mod router;
mod rules;
mod strategies;
mod types;

pub use probe::HealthProbeTask;
pub use router::{EndpointStatus, SisRouter};
pub use rules::{RouteRule, RouteTable};
pub use strategies::{
    EndpointSelector, EndpointSnapshot, RoutingStrategy, SelectionResult, create_selector,
};
pub use types::{Endpoint, EndpointHealth, UNHEALTHY_AFTER_CONSECUTIVE_FAILURES};
