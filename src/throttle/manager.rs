//! # 节流管理器
//!
//! 按提供商持有节流器实例；与路由解耦，仅回答"现在能否发出请求"。

use super::throttler::Throttler;
use super::types::{ThrottleConfig, ThrottleMetrics};
use crate::types::ProviderId;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// 节流管理器
pub struct ThrottleManager {
    default_config: ThrottleConfig,
    throttlers: DashMap<ProviderId, Arc<Throttler>>,
}

impl ThrottleManager {
    /// 创建节流管理器
    #[must_use]
    pub fn new(default_config: ThrottleConfig) -> Self {
        Self {
            default_config,
            throttlers: DashMap::new(),
        }
    }

    /// 以指定配置注册提供商节流器
    pub fn register(&self, provider: ProviderId, config: ThrottleConfig) {
        self.throttlers
            .insert(provider.clone(), Arc::new(Throttler::new(provider, config)));
    }

    /// 获取提供商节流器，未注册时以默认配置创建
    pub fn get(&self, provider: &ProviderId) -> Arc<Throttler> {
        if let Some(existing) = self.throttlers.get(provider) {
            return existing.clone();
        }
        self.throttlers
            .entry(provider.clone())
            .or_insert_with(|| {
                Arc::new(Throttler::new(provider.clone(), self.default_config.clone()))
            })
            .clone()
    }

    /// 所有提供商的指标快照
    #[must_use]
    pub fn metrics_snapshot(&self) -> HashMap<ProviderId, ThrottleMetrics> {
        self.throttlers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metrics()))
            .collect()
    }

    /// 清零所有节流指标
    pub fn reset_metrics(&self) {
        for entry in &self.throttlers {
            entry.value().reset_metrics();
        }
    }
}
