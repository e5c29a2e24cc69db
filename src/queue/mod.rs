//! # 请求队列模块
//!
//! 有界优先准入、工作协程池、重试与超时语义。

mod queue;
mod strategies;
mod types;
mod worker;

pub use queue::{QueueOptions, RequestQueue};
pub use strategies::{QueueBackend, create_backend};
pub use types::{QueueStatus, QueueStrategy, QueuedRequest};
pub use worker::RequestPipeline;
