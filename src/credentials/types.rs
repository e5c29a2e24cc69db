//! # 凭据生命周期类型定义

use crate::types::ProviderId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// API 密钥用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyKind {
    /// 主密钥，请求流水线默认注入
    #[default]
    Primary,
    /// 次级密钥
    Secondary,
    /// 备用密钥
    Backup,
    /// 测试密钥
    Testing,
}

impl ApiKeyKind {
    /// 用途标签
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Backup => "backup",
            Self::Testing => "testing",
        }
    }
}

/// API 密钥生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyStatus {
    /// 当前生效
    Active,
    /// 已停用
    Inactive,
    /// 轮换中（重叠窗口内仍然有效）
    Rotating,
    /// 已过硬过期时间
    Expired,
    /// 已确认泄露
    Compromised,
}

impl ApiKeyStatus {
    /// 状态标签
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Rotating => "rotating",
            Self::Expired => "expired",
            Self::Compromised => "compromised",
        }
    }
}

impl fmt::Display for ApiKeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一把提供商 API 密钥
///
/// 不变式：同一 (provider, kind) 同时至多一把 Active 密钥；
/// 轮换期间恰好一把 Rotating 与一把新 Active 在重叠窗口内共存。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// 密钥ID
    pub id: String,
    /// 所属提供商
    pub provider: ProviderId,
    /// 用途
    pub kind: ApiKeyKind,
    /// 生命周期状态
    pub status: ApiKeyStatus,
    /// 密钥明文（仅驻留内存，落盘时加密）
    pub value: String,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 硬过期时间
    pub expires_at: Option<DateTime<Utc>>,
    /// 最近使用时间
    pub last_used_at: Option<DateTime<Utc>>,
    /// 轮换重叠窗口截止时间（Rotating 状态时设置）
    pub deactivate_after: Option<DateTime<Utc>>,
    /// 使用计数
    pub usage_count: u64,
    /// 轮换计数
    pub rotation_count: u32,
}

impl ApiKey {
    /// 创建新的活跃密钥
    pub fn new<V: Into<String>>(
        provider: ProviderId,
        value: V,
        kind: ApiKeyKind,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider,
            kind,
            status: ApiKeyStatus::Active,
            value: value.into(),
            created_at: Utc::now(),
            expires_at,
            last_used_at: None,
            deactivate_after: None,
            usage_count: 0,
            rotation_count: 0,
        }
    }

    /// 密钥年龄（天）
    #[must_use]
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }

    /// 距硬过期的天数
    #[must_use]
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at.map(|expires| (expires - now).num_days())
    }

    /// 是否已过硬过期时间
    #[must_use]
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }
}

/// 密钥轮换策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RotationPolicy {
    /// 轮换周期（天）
    #[serde(default = "default_rotation_interval_days")]
    pub rotation_interval_days: i64,
    /// 过期前提前预警（天）
    #[serde(default = "default_warning_days")]
    pub warning_days: i64,
    /// 新旧密钥重叠窗口（天）
    #[serde(default = "default_overlap_days")]
    pub overlap_days: i64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            rotation_interval_days: default_rotation_interval_days(),
            warning_days: default_warning_days(),
            overlap_days: default_overlap_days(),
        }
    }
}

const fn default_rotation_interval_days() -> i64 {
    90
}

const fn default_warning_days() -> i64 {
    14
}

const fn default_overlap_days() -> i64 {
    2
}

impl RotationPolicy {
    /// 密钥是否到达轮换条件
    ///
    /// 任一条件成立即到期：年龄达到轮换周期、距过期不足预警天数、已泄露。
    #[must_use]
    pub fn rotation_due(&self, key: &ApiKey, now: DateTime<Utc>) -> Option<RotationReason> {
        if key.status == ApiKeyStatus::Compromised {
            return Some(RotationReason::Compromised);
        }
        if key.age_days(now) >= self.rotation_interval_days {
            return Some(RotationReason::AgeExceeded);
        }
        if let Some(days_left) = key.days_until_expiry(now)
            && days_left <= self.warning_days
        {
            return Some(RotationReason::ExpiryApproaching);
        }
        None
    }
}

/// 轮换触发原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationReason {
    /// 年龄达到轮换周期
    AgeExceeded,
    /// 接近硬过期
    ExpiryApproaching,
    /// 已泄露
    Compromised,
}

impl RotationReason {
    /// 原因标签
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AgeExceeded => "age_exceeded",
            Self::ExpiryApproaching => "expiry_approaching",
            Self::Compromised => "compromised",
        }
    }
}

/// 审计操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    /// 创建密钥
    CreateKey,
    /// 轮换密钥
    RotateKey,
    /// 状态变更
    UpdateStatus,
    /// 删除密钥
    DeleteKey,
    /// 后台生命周期清扫
    LifecycleSweep,
}

/// 只追加的审计记录
///
/// 创建后不可变，仅按保留策略从头部裁剪。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// 记录ID
    pub id: String,
    /// 发生时间
    pub timestamp: DateTime<Utc>,
    /// 操作类型
    pub operation: AuditOperation,
    /// 操作者
    pub actor: String,
    /// 目标密钥ID
    pub key_id: String,
    /// 所属提供商
    pub provider: ProviderId,
    /// 变更前状态
    pub before_status: Option<ApiKeyStatus>,
    /// 变更后状态
    pub after_status: Option<ApiKeyStatus>,
    /// 补充说明
    pub detail: Option<String>,
}

impl AuditRecord {
    /// 创建审计记录
    pub fn new(
        operation: AuditOperation,
        actor: &str,
        key: &ApiKey,
        before_status: Option<ApiKeyStatus>,
        detail: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            operation,
            actor: actor.to_string(),
            key_id: key.id.clone(),
            provider: key.provider.clone(),
            before_status,
            after_status: Some(key.status),
            detail,
        }
    }
}

/// 待轮换条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationDueEntry {
    /// 密钥ID
    pub key_id: String,
    /// 所属提供商
    pub provider: ProviderId,
    /// 触发原因
    pub reason: RotationReason,
}

/// 即将过期预警
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryWarning {
    /// 密钥ID
    pub key_id: String,
    /// 所属提供商
    pub provider: ProviderId,
    /// 剩余天数
    pub days_left: i64,
}

/// 密钥健康报告
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyHealthReport {
    /// 密钥总数
    pub total: usize,
    /// 按状态计数
    pub by_status: HashMap<String, usize>,
    /// 待轮换列表
    pub rotation_due: Vec<RotationDueEntry>,
    /// 过期预警列表
    pub expiry_warnings: Vec<ExpiryWarning>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key_with_age(days: i64) -> ApiKey {
        let mut key = ApiKey::new("powerschool".into(), "sk-test", ApiKeyKind::Primary, None);
        key.created_at = Utc::now() - Duration::days(days);
        key
    }

    #[test]
    fn test_rotation_due_by_age() {
        let policy = RotationPolicy::default();
        let now = Utc::now();

        assert_eq!(policy.rotation_due(&key_with_age(10), now), None);
        assert_eq!(
            policy.rotation_due(&key_with_age(90), now),
            Some(RotationReason::AgeExceeded)
        );
    }

    #[test]
    fn test_rotation_due_by_expiry_warning() {
        let policy = RotationPolicy::default();
        let now = Utc::now();

        let mut key = key_with_age(1);
        key.expires_at = Some(now + Duration::days(7));
        assert_eq!(
            policy.rotation_due(&key, now),
            Some(RotationReason::ExpiryApproaching)
        );
    }

    #[test]
    fn test_rotation_due_by_compromise() {
        let policy = RotationPolicy::default();
        let now = Utc::now();

        let mut key = key_with_age(1);
        key.status = ApiKeyStatus::Compromised;
        assert_eq!(
            policy.rotation_due(&key, now),
            Some(RotationReason::Compromised)
        );
    }

    #[test]
    fn test_expiry_check() {
        let now = Utc::now();
        let mut key = key_with_age(0);
        assert!(!key.is_past_expiry(now));

        key.expires_at = Some(now - Duration::hours(1));
        assert!(key.is_past_expiry(now));
    }
}
