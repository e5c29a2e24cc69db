//! # 网关门面模块
//!
//! 协调器与外部协作方接缝：传输、熔断器、限流中间件。

mod circuit_breaker;
mod coordinator;
mod rate_limit;
mod transport;

pub use circuit_breaker::{BreakerSummary, CircuitBreakerRegistry, CircuitState};
pub use coordinator::{GatewayCoordinator, GatewayState};
pub use rate_limit::{RateLimitDecision, RateLimitMiddleware};
pub use transport::{HttpTransport, SisTransport};
