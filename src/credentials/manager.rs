//! # API 密钥生命周期管理器
//!
//! 管理每个提供商的密钥池：创建、取用、轮换、状态变更、删除与健康报告。
//! 所有变更先追加审计记录再落盘；持久化失败只降级为日志告警，
//! 内存状态保持权威直至下次成功保存。

use super::store::{CredentialStore, RotationConfigFile};
use super::types::{
    ApiKey, ApiKeyKind, ApiKeyStatus, AuditOperation, AuditRecord, ExpiryWarning, KeyHealthReport,
    RotationDueEntry, RotationPolicy,
};
use crate::error::{GatewayError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::types::ProviderId;
use crate::{ldebug, lerror, linfo, lwarn};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// 审计记录中默认的操作者
const SYSTEM_ACTOR: &str = "gateway";

/// 生命周期清扫结果
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    /// 重叠窗口结束后停用的密钥
    pub deactivated: Vec<String>,
    /// 过硬过期时间后标记过期的密钥
    pub expired: Vec<String>,
}

/// API 密钥管理器
pub struct ApiKeyManager {
    store: CredentialStore,
    keys: RwLock<HashMap<String, ApiKey>>,
    audit: Mutex<Vec<AuditRecord>>,
    rotation: RwLock<RotationConfigFile>,
    /// 同一提供商的并发轮换在此串行
    rotation_locks: DashMap<ProviderId, Arc<Mutex<()>>>,
}

impl ApiKeyManager {
    /// 创建密钥管理器
    #[must_use]
    pub fn new(store: CredentialStore) -> Self {
        Self {
            store,
            keys: RwLock::new(HashMap::new()),
            audit: Mutex::new(Vec::new()),
            rotation: RwLock::new(RotationConfigFile::default()),
            rotation_locks: DashMap::new(),
        }
    }

    /// 加载三个持久化工件
    ///
    /// 每个工件独立加载：单个工件失败记录告警并使用默认值，不影响其余工件。
    pub async fn load(&self) -> Result<()> {
        match self.store.load_keys() {
            Ok(loaded) => {
                let mut keys = self.keys.write().await;
                *keys = loaded.into_iter().map(|k| (k.id.clone(), k)).collect();
                linfo!(
                    "system",
                    LogStage::Startup,
                    LogComponent::Credentials,
                    "key_store_loaded",
                    "Key store loaded",
                    key_count = keys.len()
                );
            }
            Err(err) => {
                lwarn!(
                    "system",
                    LogStage::Startup,
                    LogComponent::Credentials,
                    "key_store_load_failed",
                    "Key store unreadable, starting with empty key set",
                    error = %err
                );
            }
        }

        match self.store.load_rotation_config() {
            Ok(config) => {
                *self.rotation.write().await = config;
            }
            Err(err) => {
                lwarn!(
                    "system",
                    LogStage::Startup,
                    LogComponent::Credentials,
                    "rotation_config_load_failed",
                    "Rotation config unreadable, using defaults",
                    error = %err
                );
            }
        }

        match self.store.load_audit() {
            Ok(records) => {
                *self.audit.lock().await = records;
            }
            Err(err) => {
                lwarn!(
                    "system",
                    LogStage::Startup,
                    LogComponent::Credentials,
                    "audit_log_load_failed",
                    "Audit log unreadable, starting empty",
                    error = %err
                );
            }
        }

        Ok(())
    }

    /// 创建新密钥
    ///
    /// 同一 (provider, kind) 已存在活跃密钥时拒绝，保持唯一活跃不变式；
    /// 替换活跃密钥应使用 `rotate_key`。
    pub async fn create_key(
        &self,
        provider: ProviderId,
        value: &str,
        kind: ApiKeyKind,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKey> {
        let key = {
            let mut keys = self.keys.write().await;
            let conflict = keys.values().any(|k| {
                k.provider == provider && k.kind == kind && k.status == ApiKeyStatus::Active
            });
            if conflict {
                return Err(GatewayError::credential(format!(
                    "提供商 {provider} 已存在活跃的 {} 密钥，请使用轮换",
                    kind.as_str()
                )));
            }

            let key = ApiKey::new(provider, value, kind, expires_at);
            keys.insert(key.id.clone(), key.clone());
            key
        };

        self.append_audit(AuditRecord::new(
            AuditOperation::CreateKey,
            SYSTEM_ACTOR,
            &key,
            None,
            None,
        ))
        .await;
        self.persist_keys().await;

        linfo!(
            "system",
            LogStage::Credentials,
            LogComponent::Credentials,
            "key_created",
            "API key created",
            key_id = %key.id,
            provider = %key.provider,
            kind = key.kind.as_str()
        );
        Ok(key)
    }

    /// 获取提供商当前活跃的主密钥并记录使用
    pub async fn get_active_key(&self, provider: &ProviderId) -> Option<ApiKey> {
        self.get_active_key_of(provider, ApiKeyKind::Primary).await
    }

    /// 获取指定用途的活跃密钥并记录使用
    pub async fn get_active_key_of(
        &self,
        provider: &ProviderId,
        kind: ApiKeyKind,
    ) -> Option<ApiKey> {
        let mut keys = self.keys.write().await;
        let key = keys.values_mut().find(|k| {
            k.provider == *provider && k.kind == kind && k.status == ApiKeyStatus::Active
        })?;
        key.last_used_at = Some(Utc::now());
        key.usage_count += 1;
        Some(key.clone())
    }

    /// 轮换提供商主密钥
    ///
    /// 总是先创建新密钥（活跃密钥零空窗），旧密钥转入 Rotating 并在
    /// 重叠窗口结束后由后台清扫停用。上一次轮换尚在重叠窗口内时拒绝，
    /// `force` 可立即终结上一窗口并继续。
    pub async fn rotate_key(
        &self,
        provider: &ProviderId,
        new_value: &str,
        force: bool,
    ) -> Result<(ApiKey, Option<ApiKey>)> {
        let lock = self
            .rotation_locks
            .entry(provider.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _serialized = lock.lock().await;

        let policy = self.policy_for(provider).await;
        let now = Utc::now();

        let (new_key, old_key, audits) = {
            let mut keys = self.keys.write().await;

            let in_flight: Vec<String> = keys
                .values()
                .filter(|k| {
                    k.provider == *provider
                        && k.kind == ApiKeyKind::Primary
                        && k.status == ApiKeyStatus::Rotating
                })
                .map(|k| k.id.clone())
                .collect();
            if !in_flight.is_empty() && !force {
                return Err(GatewayError::credential(format!(
                    "提供商 {provider} 存在未完成的轮换重叠窗口，可用 force 终结"
                )));
            }

            let mut audits = Vec::new();

            // force 路径：立即终结上一重叠窗口
            for id in in_flight {
                if let Some(stale) = keys.get_mut(&id) {
                    let before = stale.status;
                    stale.status = ApiKeyStatus::Inactive;
                    stale.deactivate_after = None;
                    audits.push(AuditRecord::new(
                        AuditOperation::UpdateStatus,
                        SYSTEM_ACTOR,
                        stale,
                        Some(before),
                        Some("forced end of rotation overlap".to_string()),
                    ));
                }
            }

            let old_id = keys
                .values()
                .find(|k| {
                    k.provider == *provider
                        && k.kind == ApiKeyKind::Primary
                        && k.status == ApiKeyStatus::Active
                })
                .map(|k| k.id.clone());

            // 新密钥先行创建并立即生效
            let mut new_key = ApiKey::new(provider.clone(), new_value, ApiKeyKind::Primary, None);
            new_key.rotation_count = 0;

            let old_key = old_id.and_then(|id| {
                keys.get_mut(&id).map(|old| {
                    let before = old.status;
                    old.status = ApiKeyStatus::Rotating;
                    old.deactivate_after = Some(now + Duration::days(policy.overlap_days));
                    old.rotation_count += 1;
                    new_key.rotation_count = old.rotation_count;
                    audits.push(AuditRecord::new(
                        AuditOperation::RotateKey,
                        SYSTEM_ACTOR,
                        old,
                        Some(before),
                        Some(format!("superseded by {}", new_key.id)),
                    ));
                    old.clone()
                })
            });

            keys.insert(new_key.id.clone(), new_key.clone());
            audits.push(AuditRecord::new(
                AuditOperation::RotateKey,
                SYSTEM_ACTOR,
                &new_key,
                None,
                old_key
                    .as_ref()
                    .map(|old| format!("replaces {}", old.id)),
            ));

            (new_key, old_key, audits)
        };

        for record in audits {
            self.append_audit(record).await;
        }
        self.persist_keys().await;

        linfo!(
            "system",
            LogStage::Credentials,
            LogComponent::Credentials,
            "key_rotated",
            "API key rotated",
            provider = %provider,
            new_key_id = %new_key.id,
            old_key_id = %old_key.as_ref().map_or_else(|| "none".to_string(), |k| k.id.clone()),
            overlap_days = policy.overlap_days
        );

        Ok((new_key, old_key))
    }

    /// 更新密钥状态
    ///
    /// 未知密钥返回 `Ok(false)`，不打断调用方。
    pub async fn update_key_status(
        &self,
        key_id: &str,
        status: ApiKeyStatus,
        reason: Option<&str>,
    ) -> Result<bool> {
        let record = {
            let mut keys = self.keys.write().await;
            let Some(key) = keys.get_mut(key_id) else {
                ldebug!(
                    "system",
                    LogStage::Credentials,
                    LogComponent::Credentials,
                    "key_not_found",
                    "Status update for unknown key id",
                    key_id = key_id
                );
                return Ok(false);
            };
            let before = key.status;
            key.status = status;
            if status != ApiKeyStatus::Rotating {
                key.deactivate_after = None;
            }
            AuditRecord::new(
                AuditOperation::UpdateStatus,
                SYSTEM_ACTOR,
                key,
                Some(before),
                reason.map(std::string::ToString::to_string),
            )
        };

        self.append_audit(record).await;
        self.persist_keys().await;
        Ok(true)
    }

    /// 删除密钥
    ///
    /// 轮换从不删除密钥；删除是独立的显式操作，必被审计。
    pub async fn delete_key(&self, key_id: &str) -> Result<bool> {
        let record = {
            let mut keys = self.keys.write().await;
            let Some(key) = keys.remove(key_id) else {
                return Ok(false);
            };
            AuditRecord::new(
                AuditOperation::DeleteKey,
                SYSTEM_ACTOR,
                &key,
                Some(key.status),
                None,
            )
        };

        self.append_audit(record).await;
        self.persist_keys().await;

        linfo!(
            "system",
            LogStage::Credentials,
            LogComponent::Credentials,
            "key_deleted",
            "API key deleted",
            key_id = key_id
        );
        Ok(true)
    }

    /// 密钥健康报告：按状态计数、待轮换列表、过期预警
    pub async fn check_key_health(&self) -> KeyHealthReport {
        let now = Utc::now();
        let keys = self.keys.read().await;
        let rotation = self.rotation.read().await;

        let mut report = KeyHealthReport {
            total: keys.len(),
            ..KeyHealthReport::default()
        };

        for key in keys.values() {
            *report
                .by_status
                .entry(key.status.as_str().to_string())
                .or_insert(0) += 1;

            let policy = rotation
                .providers
                .get(key.provider.as_str())
                .copied()
                .unwrap_or(rotation.default);

            if matches!(key.status, ApiKeyStatus::Active | ApiKeyStatus::Compromised)
                && let Some(reason) = policy.rotation_due(key, now)
            {
                report.rotation_due.push(RotationDueEntry {
                    key_id: key.id.clone(),
                    provider: key.provider.clone(),
                    reason,
                });
            }

            if key.status == ApiKeyStatus::Active
                && let Some(days_left) = key.days_until_expiry(now)
                && days_left <= policy.warning_days
            {
                report.expiry_warnings.push(ExpiryWarning {
                    key_id: key.id.clone(),
                    provider: key.provider.clone(),
                    days_left,
                });
            }
        }

        report
    }

    /// 生命周期清扫
    ///
    /// Rotating 密钥过重叠窗口转入 Inactive；Active 密钥过硬过期时间转入
    /// Expired。由后台任务周期调用。
    pub async fn sweep_lifecycle(&self) -> Result<SweepOutcome> {
        let now = Utc::now();
        let mut outcome = SweepOutcome::default();
        let mut records = Vec::new();

        {
            let mut keys = self.keys.write().await;
            for key in keys.values_mut() {
                match key.status {
                    ApiKeyStatus::Rotating
                        if key.deactivate_after.is_some_and(|at| now >= at) =>
                    {
                        let before = key.status;
                        key.status = ApiKeyStatus::Inactive;
                        key.deactivate_after = None;
                        outcome.deactivated.push(key.id.clone());
                        records.push(AuditRecord::new(
                            AuditOperation::LifecycleSweep,
                            SYSTEM_ACTOR,
                            key,
                            Some(before),
                            Some("rotation overlap elapsed".to_string()),
                        ));
                    }
                    ApiKeyStatus::Active if key.is_past_expiry(now) => {
                        let before = key.status;
                        key.status = ApiKeyStatus::Expired;
                        outcome.expired.push(key.id.clone());
                        records.push(AuditRecord::new(
                            AuditOperation::LifecycleSweep,
                            SYSTEM_ACTOR,
                            key,
                            Some(before),
                            Some("hard expiry passed".to_string()),
                        ));
                    }
                    _ => {}
                }
            }
        }

        if !records.is_empty() {
            for record in records {
                self.append_audit(record).await;
            }
            self.persist_keys().await;
        }

        Ok(outcome)
    }

    /// 最近 N 条审计记录（新在前）
    pub async fn recent_audit(&self, limit: usize) -> Vec<AuditRecord> {
        let audit = self.audit.lock().await;
        audit.iter().rev().take(limit).cloned().collect()
    }

    /// 提供商的轮换策略
    pub async fn policy_for(&self, provider: &ProviderId) -> RotationPolicy {
        let rotation = self.rotation.read().await;
        rotation
            .providers
            .get(provider.as_str())
            .copied()
            .unwrap_or(rotation.default)
    }

    /// 覆盖提供商的轮换策略并落盘
    pub async fn set_policy(&self, provider: &ProviderId, policy: RotationPolicy) {
        {
            let mut rotation = self.rotation.write().await;
            rotation
                .providers
                .insert(provider.as_str().to_string(), policy);
        }
        let snapshot = self.rotation.read().await.clone();
        if let Err(err) = self.store.save_rotation_config(&snapshot) {
            lerror!(
                "system",
                LogStage::Credentials,
                LogComponent::Credentials,
                "rotation_config_save_failed",
                "Rotation config save failed, in-memory policy remains authoritative",
                error = %err
            );
        }
    }

    /// 追加审计记录并落盘
    async fn append_audit(&self, record: AuditRecord) {
        let snapshot = {
            let mut audit = self.audit.lock().await;
            audit.push(record);
            let max = self.store.audit_max_entries();
            if audit.len() > max {
                let overflow = audit.len() - max;
                audit.drain(0..overflow);
            }
            audit.clone()
        };

        if let Err(err) = self.store.save_audit(&snapshot) {
            lerror!(
                "system",
                LogStage::Credentials,
                LogComponent::Audit,
                "audit_save_failed",
                "Audit log save failed, in-memory records remain authoritative",
                error = %err
            );
        }
    }

    /// 保存密钥存储；失败只降级为日志
    async fn persist_keys(&self) {
        let snapshot: Vec<ApiKey> = {
            let keys = self.keys.read().await;
            keys.values().cloned().collect()
        };

        if let Err(err) = self.store.save_keys(&snapshot) {
            lerror!(
                "system",
                LogStage::Credentials,
                LogComponent::Credentials,
                "key_store_save_failed",
                "Key store save failed, in-memory keys remain authoritative",
                error = %err
            );
        }
    }
}
